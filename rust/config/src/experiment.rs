//! The experiment configuration document.
//!
//! A document has a `static_params` section shared by every scenario and a
//! `varying_params` table keyed by scenario name.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ClusterKind;

/// Top-level experiment configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub static_params: StaticParams,
    #[serde(default)]
    pub varying_params: BTreeMap<String, VaryingParams>,
}

impl ExperimentConfig {
    /// Look up the parameters of one scenario.
    #[must_use]
    pub fn scenario(&self, key: &str) -> Option<&VaryingParams> {
        self.varying_params.get(key)
    }
}

/// Parameters shared by every scenario of the experiment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticParams {
    /// Project directory; job output lands under `<proj_dir>/exps/<job_id>`.
    pub proj_dir: PathBuf,
    /// Accelerator vendor tag, `amd` or `nvidia`. Validated when planning.
    pub gpu_type: String,
    /// Workers started on each node, one per GPU.
    pub n_gpus_per_node: usize,
    /// Grace period after all workers are submitted.
    #[serde(default = "default_workers_startup_wait")]
    pub workers_startup_wait_secs: u64,
    /// Client command template with `$[<key>_val]` placeholders.
    pub client_command: String,
    /// Scheduler command; `--scheduler-file <path>` is appended.
    #[serde(default = "default_scheduler_command")]
    pub scheduler_command: String,
    /// Worker command; `--scheduler-file <path>` is appended.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    #[serde(default)]
    pub cluster: ClusterKind,
    /// How long to wait for the scheduler file before failing the repetition.
    #[serde(default = "default_scheduler_wait_timeout")]
    pub scheduler_wait_timeout_secs: u64,
    /// Interval between scheduler file checks. Must be at least 1.
    #[serde(default = "default_scheduler_poll_interval")]
    pub scheduler_poll_interval_secs: u64,
    /// Pause after the client exits so its result file can land.
    #[serde(default = "default_client_settle")]
    pub client_settle_secs: u64,
    /// Pause between host discovery and the first launch.
    #[serde(default = "default_pre_launch_delay")]
    pub pre_launch_delay_secs: u64,
    /// Pause between the scheduler becoming ready and the worker launch.
    #[serde(default = "default_post_scheduler_delay")]
    pub post_scheduler_delay_secs: u64,
    /// Required by scenarios with `with_monitoring = true`.
    #[serde(default)]
    pub monitoring: Option<MonitoringParams>,
}

/// Settings for the telemetry consumer and its backing stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringParams {
    /// YAML settings template merged with per-repetition values.
    pub base_settings_path: PathBuf,
    /// Script passed to the scheduler with `--preload`.
    #[serde(default)]
    pub scheduler_preload: Option<PathBuf>,
    pub primary_store_start_command: String,
    #[serde(default)]
    pub start_secondary_store: bool,
    #[serde(default)]
    pub secondary_store_start_command: Option<String>,
    /// Run on the monitoring host before the stores start.
    #[serde(default)]
    pub kill_stores_command: Option<String>,
    pub consumer_command: String,
    /// Run after the record is written, with the repetition dir and the
    /// `job_output.json` path as arguments, to check and persist the
    /// captured telemetry.
    #[serde(default)]
    pub persist_command: Option<String>,
    #[serde(default = "default_settings_env_var")]
    pub settings_env_var: String,
    #[serde(default = "default_client_flag")]
    pub client_flag: String,
    #[serde(default = "default_store_settle")]
    pub store_settle_secs: u64,
    #[serde(default = "default_consumer_stop_timeout")]
    pub consumer_stop_timeout_secs: u64,
    /// Extra values merged over the template after the per-repetition ones.
    #[serde(default)]
    pub settings_overrides: Map<String, Value>,
}

/// Parameters of one scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaryingParams {
    /// Worker nodes; one job step per node.
    pub nnodes: usize,
    /// Repetitions run by one job.
    #[serde(default = "default_nreps")]
    pub nreps: usize,
    #[serde(default)]
    pub with_monitoring: bool,
    /// Passed to the client as JSON through `$[workflow-params_val]`.
    #[serde(default)]
    pub workflow_params: Map<String, Value>,
}

fn default_workers_startup_wait() -> u64 {
    30
}

fn default_scheduler_command() -> String {
    "dask scheduler --no-dashboard --no-show".to_string()
}

fn default_worker_command() -> String {
    "dask worker --nthreads 1 --nworkers 1 --no-dashboard".to_string()
}

fn default_scheduler_wait_timeout() -> u64 {
    160
}

fn default_scheduler_poll_interval() -> u64 {
    3
}

fn default_client_settle() -> u64 {
    15
}

fn default_pre_launch_delay() -> u64 {
    2
}

fn default_post_scheduler_delay() -> u64 {
    3
}

fn default_settings_env_var() -> String {
    "FLOWCEPT_SETTINGS_PATH".to_string()
}

fn default_client_flag() -> String {
    "--with-flowcept".to_string()
}

fn default_store_settle() -> u64 {
    6
}

fn default_consumer_stop_timeout() -> u64 {
    60
}

fn default_nreps() -> usize {
    1
}
