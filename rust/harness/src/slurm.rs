//! Slurm implementation of the cluster gateway.
//!
//! Steps are launched with `srun` inside the current allocation, hosts come
//! from `scontrol show hostnames`, and leftover steps are cancelled with
//! `scancel`.

use std::env;

use async_trait::async_trait;
use tokio::process::Command;

use crate::gateway::{ChildSet, ClusterGateway, GatewayError, JobStep, capture};

pub struct SlurmGateway {
    job_id: Option<String>,
    nodelist: Option<String>,
    children: ChildSet,
}

impl SlurmGateway {
    /// Read the allocation from `SLURM_JOB_ID` and `SLURM_JOB_NODELIST`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            job_id: env::var("SLURM_JOB_ID").ok(),
            nodelist: env::var("SLURM_JOB_NODELIST").ok(),
            children: ChildSet::default(),
        }
    }

    /// `srun` arguments for a step, without the command itself.
    #[must_use]
    pub fn srun_args(step: &JobStep) -> Vec<String> {
        let mut args = vec![
            "--nodes=1".to_string(),
            "--ntasks=1".to_string(),
            "--overlap".to_string(),
            format!("--job-name={}", step.name),
        ];
        if let Some(ref host) = step.host {
            args.push(format!("--nodelist={host}"));
        }
        if step.gpus > 0 {
            args.push(format!("--gpus-per-node={}", step.gpus));
        }
        args
    }
}

#[async_trait]
impl ClusterGateway for SlurmGateway {
    async fn submit(&self, step: &JobStep) -> Result<(), GatewayError> {
        let args = Self::srun_args(step);
        tracing::debug!("srun {} bash -c <{} tasks>", args.join(" "), step.tasks.len());

        let mut cmd = Command::new("srun");
        cmd.args(&args).arg("bash").arg("-c").arg(step.render_script());
        self.children.spawn(&step.name, cmd)
    }

    async fn job_hosts(&self) -> Result<Vec<String>, GatewayError> {
        let nodelist = self
            .nodelist
            .as_ref()
            .ok_or_else(|| GatewayError::NoAllocation("SLURM_JOB_NODELIST not set".into()))?;

        let mut cmd = Command::new("scontrol");
        cmd.args(["show", "hostnames", nodelist]);
        let stdout = capture(cmd, "scontrol show hostnames").await?;

        let hosts = parse_lines(&stdout);
        if hosts.is_empty() {
            return Err(GatewayError::NoAllocation(format!(
                "nodelist '{nodelist}' expanded to no hosts"
            )));
        }
        Ok(hosts)
    }

    async fn run_on_host(&self, host: &str, command: &str) -> Result<String, GatewayError> {
        let nodelist = format!("--nodelist={host}");
        let mut cmd = Command::new("srun");
        cmd.args([
            "--nodes=1",
            "--ntasks=1",
            "--overlap",
            nodelist.as_str(),
            "bash",
            "-c",
            command,
        ]);
        capture(cmd, &format!("srun on {host}")).await
    }

    async fn kill_all_job_steps(&self) -> Result<(), GatewayError> {
        self.children.terminate_all().await;

        let Some(ref job_id) = self.job_id else {
            return Ok(());
        };

        let mut cmd = Command::new("squeue");
        cmd.args(["--noheader", "--steps", "--jobs", job_id, "--format=%i"]);
        let stdout = capture(cmd, "squeue --steps").await?;

        let steps = numbered_steps(&stdout);
        if steps.is_empty() {
            return Ok(());
        }

        tracing::info!("Cancelling {} job steps", steps.len());
        let mut cmd = Command::new("scancel");
        cmd.arg("--quiet").args(&steps);
        capture(cmd, "scancel").await?;
        Ok(())
    }

    fn job_id(&self) -> Option<String> {
        self.job_id.clone()
    }
}

fn parse_lines(s: &str) -> Vec<String> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Step ids such as `1234.0`, skipping the `batch` and `extern` steps that
/// hold the allocation itself.
fn numbered_steps(squeue_output: &str) -> Vec<String> {
    parse_lines(squeue_output)
        .into_iter()
        .filter(|id| {
            id.rsplit_once('.').is_some_and(|(_, step)| {
                !step.is_empty() && step.bytes().all(|b| b.is_ascii_digit())
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::gateway::TaskSpec;

    #[test]
    fn test_srun_args_pinned_gpu_step() {
        let step = JobStep {
            name: "workers-1".to_string(),
            host: Some("frontier00042".to_string()),
            gpus: 8,
            tasks: vec![TaskSpec {
                command: "dask worker".to_string(),
                env: vec![],
                stdout: PathBuf::from("/w.out"),
                stderr: PathBuf::from("/w.err"),
            }],
        };
        let args = SlurmGateway::srun_args(&step);
        assert!(args.contains(&"--nodes=1".to_string()));
        assert!(args.contains(&"--job-name=workers-1".to_string()));
        assert!(args.contains(&"--nodelist=frontier00042".to_string()));
        assert!(args.contains(&"--gpus-per-node=8".to_string()));
    }

    #[test]
    fn test_srun_args_unpinned_cpu_step() {
        let step = JobStep {
            name: "scheduler".to_string(),
            host: None,
            gpus: 0,
            tasks: vec![],
        };
        let args = SlurmGateway::srun_args(&step);
        assert!(!args.iter().any(|a| a.starts_with("--nodelist")));
        assert!(!args.iter().any(|a| a.starts_with("--gpus")));
    }

    #[test]
    fn test_numbered_steps() {
        let out = "1234.batch\n1234.extern\n1234.0\n 1234.1 \n\n";
        assert_eq!(numbered_steps(out), vec!["1234.0", "1234.1"]);
        assert!(numbered_steps("").is_empty());
    }

    #[test]
    fn test_parse_hostnames() {
        assert_eq!(parse_lines("node1\nnode2\n"), vec!["node1", "node2"]);
    }
}
