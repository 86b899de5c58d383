//! Telemetry consumer and its backing stores.
//!
//! When a scenario runs with monitoring, the stores and the consumer come up
//! on the first allocated host before the scheduler starts, and the consumer
//! is stopped after the client finishes. The merged settings file is handed
//! to child processes through their environment; nothing is stored in the
//! harness's own environment.

use std::{
    fs::File,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use exp_config::MonitoringParams;
#[cfg(test)]
use mockall::automock;
use serde_json::{Value, json};
use tokio::process::{Child, Command};

use crate::{
    config::JOB_OUTPUT_FILE,
    controller::RepetitionResult,
    gateway::{
        ClusterGateway, GatewayError, JobStep, TaskSpec, capture, shell_quote, signal_group,
    },
    pause::countdown,
};

/// Name of the merged settings file inside the repetition directory.
pub const SETTINGS_FILE: &str = "monitoring_settings.yaml";

/// Inputs for starting monitoring for one repetition.
#[derive(Debug, Clone)]
pub struct MonitoringRequest {
    pub params: MonitoringParams,
    pub hosts: Vec<String>,
    pub rep_dir: PathBuf,
    pub job_id: String,
    pub cluster_job_id: Option<String>,
    pub varying_param_key: String,
}

/// A started consumer plus the settings it was started with.
///
/// Stopping takes the session by value, so it can only be stopped once.
#[derive(Debug)]
pub struct MonitoringSession {
    pub host: String,
    pub settings: Value,
    pub settings_path: PathBuf,
    settings_env_var: String,
    stop_timeout: Duration,
    consumer: Option<Child>,
}

impl MonitoringSession {
    /// A session with no consumer process attached.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        settings: Value,
        settings_path: impl Into<PathBuf>,
        settings_env_var: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            settings,
            settings_path: settings_path.into(),
            settings_env_var: settings_env_var.into(),
            stop_timeout: Duration::from_secs(60),
            consumer: None,
        }
    }

    /// Environment entry pointing a child process at the settings file.
    #[must_use]
    pub fn settings_env(&self) -> (String, String) {
        (
            self.settings_env_var.clone(),
            self.settings_path.to_string_lossy().into_owned(),
        )
    }
}

/// Starts and stops monitoring around a repetition.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn start(&self, request: &MonitoringRequest)
    -> Result<MonitoringSession, MonitoringError>;

    async fn stop(&self, session: MonitoringSession) -> Result<(), MonitoringError>;

    /// Hand the written record of a monitored repetition to the telemetry
    /// side. `record.workflow_result` is the loaded client result.
    async fn persist(
        &self,
        params: &MonitoringParams,
        record: &RepetitionResult,
    ) -> Result<(), MonitoringError>;
}

/// Runs the stores as job steps on the monitoring host and the consumer as a
/// local subprocess.
pub struct MonitoringCoordinator {
    gateway: Arc<dyn ClusterGateway>,
}

impl MonitoringCoordinator {
    #[must_use]
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    async fn start_store(
        &self,
        name: &'static str,
        command: &str,
        host: &str,
        rep_dir: &Path,
    ) -> Result<(), MonitoringError> {
        tracing::info!("Starting {name} on {host}");
        let step = JobStep {
            name: name.to_string(),
            host: Some(host.to_string()),
            gpus: 0,
            tasks: vec![TaskSpec {
                command: command.to_string(),
                env: vec![],
                stdout: rep_dir.join(format!("{name}.out")),
                stderr: rep_dir.join(format!("{name}.err")),
            }],
        };
        self.gateway
            .submit(&step)
            .await
            .map_err(|source| MonitoringError::Store { store: name, source })
    }
}

#[async_trait]
impl Monitor for MonitoringCoordinator {
    async fn start(
        &self,
        request: &MonitoringRequest,
    ) -> Result<MonitoringSession, MonitoringError> {
        let params = &request.params;
        let host = request.hosts.first().ok_or(MonitoringError::NoHosts)?.clone();
        tracing::info!("Monitoring host: {host}");

        let settings = render_settings(request, &host)?;
        let settings_path = request.rep_dir.join(SETTINGS_FILE);
        let yaml = serde_yaml::to_string(&settings)
            .map_err(|e| MonitoringError::Settings(settings_path.clone(), e.to_string()))?;
        tokio::fs::write(&settings_path, yaml)
            .await
            .map_err(|e| MonitoringError::Io(settings_path.clone(), e))?;

        if let Some(ref kill) = params.kill_stores_command
            && let Err(e) = self.gateway.run_on_host(&host, kill).await
        {
            tracing::warn!("Failed to stop stale stores on {host}: {e}");
        }
        countdown(
            "store shutdown",
            Duration::from_secs(params.store_settle_secs),
        )
        .await;

        self.start_store(
            "primary-store",
            &params.primary_store_start_command,
            &host,
            &request.rep_dir,
        )
        .await?;

        if params.start_secondary_store {
            let command = params
                .secondary_store_start_command
                .as_deref()
                .ok_or(MonitoringError::MissingSecondaryCommand)?;
            self.start_store("secondary-store", command, &host, &request.rep_dir)
                .await?;
        }

        let consumer_log = request.rep_dir.join("consumer.log");
        let log = File::create(&consumer_log)
            .map_err(|e| MonitoringError::Io(consumer_log.clone(), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| MonitoringError::Io(consumer_log.clone(), e))?;

        let consumer = Command::new("bash")
            .arg("-c")
            .arg(&params.consumer_command)
            .env(&params.settings_env_var, &settings_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(MonitoringError::Consumer)?;
        tracing::info!("Consumer started (PID {:?})", consumer.id());

        Ok(MonitoringSession {
            host,
            settings,
            settings_path,
            settings_env_var: params.settings_env_var.clone(),
            stop_timeout: Duration::from_secs(params.consumer_stop_timeout_secs),
            consumer: Some(consumer),
        })
    }

    async fn stop(&self, session: MonitoringSession) -> Result<(), MonitoringError> {
        let Some(mut consumer) = session.consumer else {
            return Ok(());
        };
        let Some(pid) = consumer.id() else {
            tracing::warn!("Consumer already exited before stop");
            return Ok(());
        };

        tracing::info!("Stopping consumer (PID {pid})");
        signal_group(pid, libc::SIGTERM);

        match tokio::time::timeout(session.stop_timeout, consumer.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Consumer stopped ({status})");
                Ok(())
            }
            Ok(Err(e)) => Err(MonitoringError::Consumer(e)),
            Err(_) => {
                signal_group(pid, libc::SIGKILL);
                let _ = consumer.wait().await;
                Err(MonitoringError::StopTimeout(session.stop_timeout.as_secs()))
            }
        }
    }

    async fn persist(
        &self,
        params: &MonitoringParams,
        record: &RepetitionResult,
    ) -> Result<(), MonitoringError> {
        let Some(ref command) = params.persist_command else {
            tracing::debug!("No persist_command configured");
            return Ok(());
        };

        let job_output = record.rep_dir.join(JOB_OUTPUT_FILE);
        let line = format!(
            "{command} {} {}",
            shell_quote(&record.rep_dir.to_string_lossy()),
            shell_quote(&job_output.to_string_lossy())
        );
        tracing::info!(
            "Persisting monitoring data (workflow result {})",
            if record.workflow_result.is_some() { "present" } else { "absent" }
        );

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&line)
            .env(&params.settings_env_var, record.rep_dir.join(SETTINGS_FILE));
        let output = capture(cmd, command)
            .await
            .map_err(MonitoringError::Persist)?;
        if !output.trim().is_empty() {
            tracing::info!("{}", output.trim());
        }
        Ok(())
    }
}

/// Merge two JSON values, with `overlay` values taking precedence.
#[must_use]
pub fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_values(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Values that differ per repetition.
fn repetition_overrides(request: &MonitoringRequest, host: &str) -> Value {
    let mut overrides = json!({
        "mq": { "host": host },
        "kv_db": { "host": host },
        "experiment": {
            "job_id": request.job_id,
            "cluster_job_id": request.cluster_job_id,
            "varying_param_key": request.varying_param_key,
            "rep_dir": request.rep_dir,
        },
    });
    if request.params.start_secondary_store {
        overrides["mongodb"] = json!({ "host": host });
    }
    overrides
}

/// Base settings template merged with per-repetition values, then with the
/// configured overrides.
pub fn render_settings(request: &MonitoringRequest, host: &str) -> Result<Value, MonitoringError> {
    let path = &request.params.base_settings_path;
    let content =
        std::fs::read_to_string(path).map_err(|e| MonitoringError::Io(path.clone(), e))?;
    let base: Value = serde_yaml::from_str(&content)
        .map_err(|e| MonitoringError::Settings(path.clone(), e.to_string()))?;

    let merged = merge_values(&base, &repetition_overrides(request, host));
    Ok(merge_values(
        &merged,
        &Value::Object(request.params.settings_overrides.clone()),
    ))
}

/// Errors from starting or stopping monitoring.
#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("no hosts to run monitoring on")]
    NoHosts,
    #[error("failed to read/write {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("invalid monitoring settings {0}: {1}")]
    Settings(PathBuf, String),
    #[error("failed to start {store}: {source}")]
    Store {
        store: &'static str,
        source: GatewayError,
    },
    #[error("start_secondary_store is set but secondary_store_start_command is missing")]
    MissingSecondaryCommand,
    #[error("consumer process error: {0}")]
    Consumer(std::io::Error),
    #[error("consumer did not stop within {0}s")]
    StopTimeout(u64),
    #[error("failed to persist monitoring data: {0}")]
    Persist(GatewayError),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Map;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::gateway::MockClusterGateway;

    const BASE_SETTINGS: &str = r"
project:
  debug: false
mq:
  host: placeholder
  port: 6379
kv_db:
  host: placeholder
experiment:
  user: exp
";

    fn request(dir: &TempDir, secondary: bool) -> MonitoringRequest {
        let base = dir.path().join("base_settings.yaml");
        std::fs::write(&base, BASE_SETTINGS).unwrap();
        let rep_dir = dir.path().join("0");
        std::fs::create_dir_all(&rep_dir).unwrap();

        MonitoringRequest {
            params: MonitoringParams {
                base_settings_path: base,
                scheduler_preload: None,
                primary_store_start_command: "redis-server".to_string(),
                start_secondary_store: secondary,
                secondary_store_start_command: Some("mongod".to_string()),
                kill_stores_command: Some("pkill redis-server".to_string()),
                consumer_command: "sleep 60".to_string(),
                persist_command: None,
                settings_env_var: "FLOWCEPT_SETTINGS_PATH".to_string(),
                client_flag: "--with-flowcept".to_string(),
                store_settle_secs: 0,
                consumer_stop_timeout_secs: 10,
                settings_overrides: Map::new(),
            },
            hosts: vec!["node1".to_string(), "node2".to_string()],
            rep_dir,
            job_id: "job-1".to_string(),
            cluster_job_id: Some("4242".to_string()),
            varying_param_key: "small".to_string(),
        }
    }

    #[test]
    fn test_merge_values() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": [1, 2], "c": "keep"});
        let overlay = json!({"a": {"y": 3, "z": 4}, "b": [9]});
        assert_eq!(
            merge_values(&base, &overlay),
            json!({"a": {"x": 1, "y": 3, "z": 4}, "b": [9], "c": "keep"})
        );
    }

    #[test]
    fn test_render_settings() {
        let dir = tempdir().unwrap();
        let mut req = request(&dir, true);
        req.params
            .settings_overrides
            .insert("project".to_string(), json!({"debug": true}));

        let settings = render_settings(&req, "node1").unwrap();
        assert_eq!(settings["mq"]["host"], "node1");
        assert_eq!(settings["mq"]["port"], 6379);
        assert_eq!(settings["kv_db"]["host"], "node1");
        assert_eq!(settings["mongodb"]["host"], "node1");
        assert_eq!(settings["experiment"]["user"], "exp");
        assert_eq!(settings["experiment"]["job_id"], "job-1");
        assert_eq!(settings["experiment"]["cluster_job_id"], "4242");
        assert_eq!(settings["project"]["debug"], true);
    }

    #[test]
    fn test_render_settings_without_secondary_store() {
        let dir = tempdir().unwrap();
        let settings = render_settings(&request(&dir, false), "node1").unwrap();
        assert!(settings.get("mongodb").is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempdir().unwrap();
        let req = request(&dir, true);

        let submitted = Arc::new(Mutex::new(Vec::new()));
        let record = submitted.clone();
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_run_on_host()
            .times(1)
            .returning(|_, _| Ok(String::new()));
        gateway.expect_submit().times(2).returning(move |step| {
            record.lock().unwrap().push(step.clone());
            Ok(())
        });

        let coordinator = MonitoringCoordinator::new(Arc::new(gateway));
        let session = coordinator.start(&req).await.unwrap();

        assert_eq!(session.host, "node1");
        assert_eq!(session.settings["mq"]["host"], "node1");
        assert_eq!(session.settings_path, req.rep_dir.join(SETTINGS_FILE));
        let written = std::fs::read_to_string(&session.settings_path).unwrap();
        assert!(written.contains("node1"));
        assert_eq!(
            session.settings_env(),
            (
                "FLOWCEPT_SETTINGS_PATH".to_string(),
                session.settings_path.to_string_lossy().into_owned()
            )
        );

        {
            let steps = submitted.lock().unwrap();
            let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["primary-store", "secondary-store"]);
            assert!(steps.iter().all(|s| s.host.as_deref() == Some("node1")));
        }

        coordinator.stop(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_store_cleanup_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let req = request(&dir, false);

        let mut gateway = MockClusterGateway::new();
        gateway.expect_run_on_host().returning(|_, _| {
            Err(GatewayError::CommandFailed {
                command: "pkill".to_string(),
                status: Some(1),
                stderr: String::new(),
            })
        });
        gateway.expect_submit().times(1).returning(|_| Ok(()));

        let coordinator = MonitoringCoordinator::new(Arc::new(gateway));
        let session = coordinator.start(&req).await.unwrap();
        coordinator.stop(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let req = request(&dir, true);

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_run_on_host()
            .returning(|_, _| Ok(String::new()));
        gateway.expect_submit().times(1).returning(|_| {
            Err(GatewayError::NoAllocation("gone".to_string()))
        });

        let coordinator = MonitoringCoordinator::new(Arc::new(gateway));
        let err = coordinator.start(&req).await.unwrap_err();
        assert!(matches!(
            err,
            MonitoringError::Store {
                store: "primary-store",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_secondary_command() {
        let dir = tempdir().unwrap();
        let mut req = request(&dir, true);
        req.params.secondary_store_start_command = None;

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_run_on_host()
            .returning(|_, _| Ok(String::new()));
        gateway.expect_submit().times(1).returning(|_| Ok(()));

        let coordinator = MonitoringCoordinator::new(Arc::new(gateway));
        let err = coordinator.start(&req).await.unwrap_err();
        assert!(matches!(err, MonitoringError::MissingSecondaryCommand));
    }

    #[tokio::test]
    async fn test_no_hosts() {
        let dir = tempdir().unwrap();
        let mut req = request(&dir, false);
        req.hosts.clear();

        let coordinator = MonitoringCoordinator::new(Arc::new(MockClusterGateway::new()));
        let err = coordinator.start(&req).await.unwrap_err();
        assert!(matches!(err, MonitoringError::NoHosts));
    }

    #[tokio::test]
    async fn test_stop_without_consumer() {
        let session = MonitoringSession::new("node1", json!({}), "/tmp/s.yaml", "SETTINGS");
        let coordinator = MonitoringCoordinator::new(Arc::new(MockClusterGateway::new()));
        coordinator.stop(session).await.unwrap();
    }

    fn record(rep_dir: &Path, workflow_result: Option<Value>) -> RepetitionResult {
        let now = chrono::Utc::now();
        RepetitionResult {
            job_id: "job-1".to_string(),
            cluster_job_id: None,
            rep_no: 0,
            varying_param_key: "small".to_string(),
            proj_dir: rep_dir.to_path_buf(),
            job_dir: rep_dir.to_path_buf(),
            rep_dir: rep_dir.to_path_buf(),
            hosts: vec!["node1".to_string()],
            node_count: 1,
            gpus_per_node: 1,
            outcome: crate::controller::Outcome::Passed,
            failure: None,
            started_at: now,
            client_started_at: Some(now),
            client_finished_at: Some(now),
            finished_at: now,
            client_duration_secs: Some(0.0),
            total_duration_secs: 0.0,
            workflow_result,
            with_monitoring: true,
            monitoring_settings: Some(json!({})),
        }
    }

    #[tokio::test]
    async fn test_persist_runs_command_with_paths() {
        let dir = tempdir().unwrap();
        let mut req = request(&dir, false);
        let script = dir.path().join("persist.sh");
        std::fs::write(
            &script,
            "echo \"$1|$2|$FLOWCEPT_SETTINGS_PATH\" > \"$1/persisted.txt\"\n",
        )
        .unwrap();
        req.params.persist_command = Some(format!("bash {}", script.display()));

        // Persisting never goes through the cluster.
        let coordinator = MonitoringCoordinator::new(Arc::new(MockClusterGateway::new()));
        coordinator
            .persist(&req.params, &record(&req.rep_dir, Some(json!({"n": 1}))))
            .await
            .unwrap();

        let persisted = std::fs::read_to_string(req.rep_dir.join("persisted.txt")).unwrap();
        let rep_dir = req.rep_dir.display();
        assert_eq!(
            persisted.trim(),
            format!("{rep_dir}|{rep_dir}/job_output.json|{rep_dir}/{SETTINGS_FILE}")
        );
    }

    #[tokio::test]
    async fn test_persist_without_command_is_noop() {
        let dir = tempdir().unwrap();
        let req = request(&dir, false);
        let coordinator = MonitoringCoordinator::new(Arc::new(MockClusterGateway::new()));
        coordinator
            .persist(&req.params, &record(&req.rep_dir, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_persist_failure() {
        let dir = tempdir().unwrap();
        let mut req = request(&dir, false);
        req.params.persist_command = Some("false".to_string());

        let coordinator = MonitoringCoordinator::new(Arc::new(MockClusterGateway::new()));
        let err = coordinator
            .persist(&req.params, &record(&req.rep_dir, None))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitoringError::Persist(_)));
    }
}
