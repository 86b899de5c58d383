//! Loading the experiment document and deriving per-repetition specs.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use exp_config::{ExperimentConfig, MonitoringParams};
use serde_json::{Map, Value};

use crate::readiness::PollPolicy;

/// Announcement file the scheduler writes once it accepts connections.
pub const SCHEDULER_FILE: &str = "scheduler_info.json";
/// Optional result document written by the client.
pub const WORKFLOW_RESULT_FILE: &str = "workflow_result.json";
/// Final record of a repetition.
pub const JOB_OUTPUT_FILE: &str = "job_output.json";

/// Load an experiment document. Files ending in `.toml` are read as TOML,
/// everything else as YAML.
pub fn load_experiment(path: impl AsRef<Path>) -> Result<ExperimentConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;

    if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    } else {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Directory holding every repetition of a job.
#[must_use]
pub fn job_dir(proj_dir: &Path, job_id: &str) -> PathBuf {
    proj_dir.join("exps").join(job_id)
}

/// Fixed waits of a repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Scheduler announcement wait.
    pub probe: PollPolicy,
    /// Before monitoring and scheduler start.
    pub pre_launch: Duration,
    /// After the scheduler is ready, before workers launch.
    pub post_scheduler: Duration,
    /// After all workers are submitted.
    pub worker_grace: Duration,
    /// After the client exits.
    pub client_settle: Duration,
}

impl Timings {
    /// No fixed waits, default probe policy.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            probe: PollPolicy::default(),
            pre_launch: Duration::ZERO,
            post_scheduler: Duration::ZERO,
            worker_grace: Duration::ZERO,
            client_settle: Duration::ZERO,
        }
    }
}

/// Everything one repetition needs, resolved from the document.
#[derive(Debug, Clone)]
pub struct RepetitionSpec {
    pub job_id: String,
    pub rep_no: usize,
    pub varying_param_key: String,
    pub proj_dir: PathBuf,
    pub job_dir: PathBuf,
    pub rep_dir: PathBuf,
    pub scheduler_file: PathBuf,
    pub node_count: usize,
    pub gpus_per_node: usize,
    /// Vendor tag as written in the document; validated by the planner.
    pub gpu_type: String,
    pub scheduler_command: String,
    pub worker_command: String,
    pub client_command: String,
    pub workflow_params: Map<String, Value>,
    /// Present exactly when the scenario runs with monitoring.
    pub monitoring: Option<MonitoringParams>,
    pub timings: Timings,
}

impl RepetitionSpec {
    pub fn from_config(
        config: &ExperimentConfig,
        varying_param_key: &str,
        job_id: &str,
        rep_no: usize,
    ) -> Result<Self, ConfigError> {
        let scenario = config
            .scenario(varying_param_key)
            .ok_or_else(|| ConfigError::UnknownScenario(varying_param_key.to_string()))?;
        let sp = &config.static_params;

        let monitoring = if scenario.with_monitoring {
            let params = sp.monitoring.clone().ok_or_else(|| {
                ConfigError::MonitoringNotConfigured(varying_param_key.to_string())
            })?;
            Some(params)
        } else {
            None
        };

        if sp.scheduler_poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }

        let job_dir = job_dir(&sp.proj_dir, job_id);
        let rep_dir = job_dir.join(rep_no.to_string());

        Ok(Self {
            job_id: job_id.to_string(),
            rep_no,
            varying_param_key: varying_param_key.to_string(),
            proj_dir: sp.proj_dir.clone(),
            scheduler_file: rep_dir.join(SCHEDULER_FILE),
            job_dir,
            rep_dir,
            node_count: scenario.nnodes,
            gpus_per_node: sp.n_gpus_per_node,
            gpu_type: sp.gpu_type.clone(),
            scheduler_command: sp.scheduler_command.clone(),
            worker_command: sp.worker_command.clone(),
            client_command: sp.client_command.clone(),
            workflow_params: scenario.workflow_params.clone(),
            monitoring,
            timings: Timings {
                probe: PollPolicy::new(
                    Duration::from_secs(sp.scheduler_poll_interval_secs),
                    Duration::from_secs(sp.scheduler_wait_timeout_secs),
                ),
                pre_launch: Duration::from_secs(sp.pre_launch_delay_secs),
                post_scheduler: Duration::from_secs(sp.post_scheduler_delay_secs),
                worker_grace: Duration::from_secs(sp.workers_startup_wait_secs),
                client_settle: Duration::from_secs(sp.client_settle_secs),
            },
        })
    }

    #[must_use]
    pub fn with_monitoring(&self) -> bool {
        self.monitoring.is_some()
    }

    #[must_use]
    pub fn worker_logs_dir(&self) -> PathBuf {
        self.rep_dir.join("worker_logs")
    }

    #[must_use]
    pub fn workflow_result_path(&self) -> PathBuf {
        self.rep_dir.join(WORKFLOW_RESULT_FILE)
    }

    #[must_use]
    pub fn job_output_path(&self) -> PathBuf {
        self.rep_dir.join(JOB_OUTPUT_FILE)
    }

    #[must_use]
    pub fn client_log_path(&self) -> PathBuf {
        self.rep_dir.join("client.log")
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("no scenario '{0}' in varying_params")]
    UnknownScenario(String),
    #[error("scenario '{0}' enables monitoring but static_params.monitoring is missing")]
    MonitoringNotConfigured(String),
    #[error("scheduler_poll_interval_secs must be at least 1")]
    ZeroPollInterval,
}
