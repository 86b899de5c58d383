//! Boundary to the cluster resource manager.
//!
//! The controller only ever talks to a [`ClusterGateway`]: it submits job
//! steps, asks which hosts the allocation holds and tears steps down again.
//! [`crate::slurm::SlurmGateway`] and [`crate::local::LocalGateway`] are the
//! two implementations.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::{Child, Command};

/// One process of a job step, with its own environment and log sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// A group of processes launched together on a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStep {
    /// Short name used for logging and as the step name.
    pub name: String,
    /// Pin the step to this host. `None` lets the resource manager choose.
    pub host: Option<String>,
    /// GPUs the step needs on its node.
    pub gpus: usize,
    pub tasks: Vec<TaskSpec>,
}

impl JobStep {
    /// Shell script that starts every task in the background and waits for
    /// all of them.
    #[must_use]
    pub fn render_script(&self) -> String {
        let mut script = String::new();
        for task in &self.tasks {
            script.push('(');
            for (key, value) in &task.env {
                script.push_str(&format!("export {key}={}; ", shell_quote(value)));
            }
            script.push_str(&task.command);
            script.push_str(&format!(
                ") > {} 2> {} &\n",
                shell_quote(&task.stdout.to_string_lossy()),
                shell_quote(&task.stderr.to_string_lossy())
            ));
        }
        script.push_str("wait\n");
        script
    }
}

/// Quote `s` for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Operations the repetition needs from the cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Launch a job step and return once it is started. The step keeps
    /// running until it exits or [`Self::kill_all_job_steps`] is called.
    async fn submit(&self, step: &JobStep) -> Result<(), GatewayError>;

    /// Hosts of the current allocation, in allocation order.
    async fn job_hosts(&self) -> Result<Vec<String>, GatewayError>;

    /// Run a short command on `host` and return its stdout.
    async fn run_on_host(&self, host: &str, command: &str) -> Result<String, GatewayError>;

    /// Terminate every step still running in the allocation.
    async fn kill_all_job_steps(&self) -> Result<(), GatewayError>;

    /// Identifier of the allocation, if there is one.
    fn job_id(&self) -> Option<String>;
}

/// Errors from the cluster gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{command} exited with {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("no cluster allocation: {0}")]
    NoAllocation(String),
}

/// Processes started by a gateway, so they can be torn down later.
#[derive(Default)]
pub(crate) struct ChildSet {
    children: Mutex<Vec<(String, Child)>>,
}

impl ChildSet {
    const STOP_GRACE: Duration = Duration::from_secs(10);

    /// Spawn `cmd` detached in its own process group and keep track of it.
    pub(crate) fn spawn(&self, name: &str, mut cmd: Command) -> Result<(), GatewayError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let child = cmd
            .spawn()
            .map_err(|e| GatewayError::Spawn(name.to_string(), e))?;

        tracing::debug!("Started step {name} (PID {:?})", child.id());
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), child));
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// SIGTERM every tracked process group, SIGKILL the ones that outlive the
    /// grace period.
    pub(crate) async fn terminate_all(&self) {
        let children =
            std::mem::take(&mut *self.children.lock().unwrap_or_else(PoisonError::into_inner));

        for (name, mut child) in children {
            let Some(pid) = child.id() else {
                // Already reaped.
                continue;
            };
            signal_group(pid, libc::SIGTERM);
            if tokio::time::timeout(Self::STOP_GRACE, child.wait())
                .await
                .is_err()
            {
                tracing::warn!("Step {name} ignored SIGTERM, killing (PID {pid})");
                signal_group(pid, libc::SIGKILL);
                let _ = child.wait().await;
            }
        }
    }
}

pub(crate) fn signal_group(pid: u32, signal: i32) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;
    // SAFETY: kill only sends a signal; a stale group id fails with ESRCH.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// Run `cmd` to completion and return its stdout.
pub(crate) async fn capture(mut cmd: Command, label: &str) -> Result<String, GatewayError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| GatewayError::Spawn(label.to_string(), e))?;

    if !output.status.success() {
        return Err(GatewayError::CommandFailed {
            command: label.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(command: &str, env: &[(&str, &str)], log: &str) -> TaskSpec {
        TaskSpec {
            command: command.to_string(),
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            stdout: PathBuf::from(format!("/logs/{log}.out")),
            stderr: PathBuf::from(format!("/logs/{log}.err")),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_single_task() {
        let step = JobStep {
            name: "scheduler".to_string(),
            host: None,
            gpus: 0,
            tasks: vec![task(
                "dask scheduler --scheduler-file /rep/s.json",
                &[("CUDA_VISIBLE_DEVICES", "")],
                "scheduler",
            )],
        };
        assert_eq!(
            step.render_script(),
            "(export CUDA_VISIBLE_DEVICES=''; dask scheduler --scheduler-file /rep/s.json) \
             > '/logs/scheduler.out' 2> '/logs/scheduler.err' &\nwait\n"
        );
    }

    #[test]
    fn test_render_backgrounds_every_task() {
        let step = JobStep {
            name: "workers-0".to_string(),
            host: Some("node01".to_string()),
            gpus: 2,
            tasks: vec![
                task("dask worker", &[("ROCR_VISIBLE_DEVICES", "0")], "worker_0_0"),
                task("dask worker", &[("ROCR_VISIBLE_DEVICES", "1")], "worker_0_1"),
            ],
        };
        let script = step.render_script();
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("ROCR_VISIBLE_DEVICES='0'"));
        assert!(lines[0].ends_with('&'));
        assert!(lines[1].contains("ROCR_VISIBLE_DEVICES='1'"));
        assert!(lines[1].contains("worker_0_1.err"));
        assert_eq!(lines[2], "wait");
    }

    #[tokio::test]
    async fn test_capture_reports_failure() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = capture(cmd, "boom").await.unwrap_err();
        match err {
            GatewayError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_all_stops_process_group() {
        let set = ChildSet::default();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 3600 & wait"]);
        set.spawn("sleeper", cmd).unwrap();
        assert_eq!(set.len(), 1);

        set.terminate_all().await;
        assert_eq!(set.len(), 0);
    }
}
