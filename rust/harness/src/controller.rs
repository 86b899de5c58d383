//! Drives one experiment repetition.
//!
//! A repetition moves through these phases:
//!
//! ```text
//! Init -> MonitoringStarting? -> SchedulerLaunching -> SchedulerProbing
//!      -> SchedulerReady | SchedulerTimeout
//!      -> WorkersLaunching -> ClientRunning -> MonitoringStopping?
//!      -> ResultCollection (record written, then handed to monitoring) -> Done
//! ```
//!
//! A scheduler timeout ends the repetition as failed without launching
//! workers or the client. Any other failure is returned as a
//! [`RepetitionError`]. A started monitoring session is stopped on every path.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use exp_config::AcceleratorVendor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    client::{ClientError, ClientRequest, ClientRun, WorkflowClient, workflow_params_arg},
    config::RepetitionSpec,
    gateway::{ClusterGateway, GatewayError, JobStep, TaskSpec, shell_quote},
    monitoring::{Monitor, MonitoringError, MonitoringRequest, MonitoringSession},
    pause::countdown,
    planner::{self, LaunchPlan, PlanError},
    readiness::Readiness,
};

/// Phases of a repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Planning, directory setup and host discovery.
    Init,
    /// Stores and consumer coming up; only with monitoring.
    MonitoringStarting,
    /// Scheduler step submitted.
    SchedulerLaunching,
    /// Waiting for the scheduler file.
    SchedulerProbing,
    /// Scheduler file seen.
    SchedulerReady,
    /// Scheduler file never appeared; terminal.
    SchedulerTimeout,
    /// One step per node submitted, then the startup grace.
    WorkersLaunching,
    /// Client workflow running.
    ClientRunning,
    /// Consumer being stopped; only with monitoring.
    MonitoringStopping,
    /// Reading the client result and writing the record.
    ResultCollection,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::MonitoringStarting => "monitoring start",
            Self::SchedulerLaunching => "scheduler launch",
            Self::SchedulerProbing => "scheduler probe",
            Self::SchedulerReady => "scheduler ready",
            Self::SchedulerTimeout => "scheduler timeout",
            Self::WorkersLaunching => "worker launch",
            Self::ClientRunning => "client run",
            Self::MonitoringStopping => "monitoring stop",
            Self::ResultCollection => "result collection",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The client ran to completion.
    Passed,
    /// The repetition stopped early; see [`RepetitionResult::failure`].
    Failed,
}

/// Why a repetition that produced a record failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    /// Phase the repetition stopped in.
    pub phase: Phase,
    pub message: String,
    /// Time spent waiting before giving up, for timeouts.
    pub waited_secs: Option<f64>,
}

/// Final record of a repetition, written once to `job_output.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepetitionResult {
    /// Job identifier given on the command line.
    pub job_id: String,
    /// Resource manager job id, e.g. `SLURM_JOB_ID`.
    pub cluster_job_id: Option<String>,
    /// Zero-based repetition number.
    pub rep_no: usize,
    /// Scenario key under `varying_params`.
    pub varying_param_key: String,
    pub proj_dir: PathBuf,
    /// `<proj_dir>/exps/<job_id>`.
    pub job_dir: PathBuf,
    /// `<job_dir>/<rep_no>`.
    pub rep_dir: PathBuf,
    /// Hosts of the allocation, in resource manager order.
    pub hosts: Vec<String>,
    pub node_count: usize,
    pub gpus_per_node: usize,
    pub outcome: Outcome,
    /// Set when `outcome` is [`Outcome::Failed`].
    pub failure: Option<Failure>,
    /// After the plan was validated, before host discovery.
    pub started_at: DateTime<Utc>,
    /// Client timestamps; absent when the client never ran.
    pub client_started_at: Option<DateTime<Utc>>,
    pub client_finished_at: Option<DateTime<Utc>>,
    /// Just before the record is written.
    pub finished_at: DateTime<Utc>,
    pub client_duration_secs: Option<f64>,
    /// From `started_at` to `finished_at`.
    pub total_duration_secs: f64,
    /// Contents of `workflow_result.json`, if the client wrote one.
    pub workflow_result: Option<Value>,
    pub with_monitoring: bool,
    /// Merged settings the consumer ran with; null without monitoring.
    pub monitoring_settings: Option<Value>,
}

impl RepetitionResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}

/// How far the launch sequence got.
enum Executed {
    Client(ClientRun),
    SchedulerTimeout { elapsed: Duration },
}

/// Sequences gateway, monitoring and client calls for a repetition.
pub struct RepetitionController {
    gateway: Arc<dyn ClusterGateway>,
    monitor: Arc<dyn Monitor>,
    client: Arc<dyn WorkflowClient>,
}

impl RepetitionController {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        monitor: Arc<dyn Monitor>,
        client: Arc<dyn WorkflowClient>,
    ) -> Self {
        Self {
            gateway,
            monitor,
            client,
        }
    }

    /// Run one repetition.
    ///
    /// Returns a result for repetitions that reached a verdict, including a
    /// scheduler timeout. The record is also written to the repetition
    /// directory.
    pub async fn run(&self, spec: &RepetitionSpec) -> Result<RepetitionResult, RepetitionError> {
        // Validated before anything is launched.
        let plan = planner::plan(
            spec.node_count,
            spec.gpus_per_node,
            &spec.gpu_type,
            &spec.worker_logs_dir(),
        )?;

        for dir in [&spec.rep_dir, &spec.worker_logs_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| RepetitionError::Io(dir.clone(), e))?;
        }

        tracing::info!(
            "Repetition {} of job {} ({}): {} nodes x {} GPUs ({}), monitoring {}",
            spec.rep_no,
            spec.job_id,
            spec.varying_param_key,
            spec.node_count,
            spec.gpus_per_node,
            plan.vendor(),
            if spec.with_monitoring() { "on" } else { "off" }
        );

        tracing::info!("Killing old job steps");
        if let Err(e) = self.gateway.kill_all_job_steps().await {
            tracing::warn!("Failed to kill old job steps: {e}");
        }

        let outcome = self.run_phases(spec, &plan).await;

        tracing::info!("Killing all running job steps");
        if let Err(e) = self.gateway.kill_all_job_steps().await {
            tracing::warn!("Failed to kill job steps: {e}");
        }

        match outcome {
            Ok(ref result) => {
                enter(spec, Phase::Done);
                tracing::info!(
                    "Repetition {} finished: {:?} in {:.1}s",
                    spec.rep_no,
                    result.outcome,
                    result.total_duration_secs
                );
            }
            Err(ref e) => {
                tracing::error!("Repetition {} failed during {}: {e}", spec.rep_no, e.phase());
            }
        }
        outcome
    }

    async fn run_phases(
        &self,
        spec: &RepetitionSpec,
        plan: &LaunchPlan,
    ) -> Result<RepetitionResult, RepetitionError> {
        let started_at = Utc::now();
        let cluster_job_id = self.gateway.job_id();
        let hosts = self
            .gateway
            .job_hosts()
            .await
            .map_err(|source| RepetitionError::Gateway {
                phase: Phase::Init,
                source,
            })?;
        tracing::info!("Job hosts: {}", hosts.join(", "));

        countdown("pre-launch", spec.timings.pre_launch).await;

        let session = match spec.monitoring {
            Some(ref params) => {
                enter(spec, Phase::MonitoringStarting);
                let request = MonitoringRequest {
                    params: params.clone(),
                    hosts: hosts.clone(),
                    rep_dir: spec.rep_dir.clone(),
                    job_id: spec.job_id.clone(),
                    cluster_job_id: cluster_job_id.clone(),
                    varying_param_key: spec.varying_param_key.clone(),
                };
                Some(self.monitor.start(&request).await?)
            }
            None => None,
        };

        let executed = self.execute(spec, plan, &hosts, session.as_ref()).await;

        let monitoring_settings = session.as_ref().map(|s| s.settings.clone());
        if let Some(session) = session {
            enter(spec, Phase::MonitoringStopping);
            if let Err(e) = self.monitor.stop(session).await {
                tracing::warn!("Failed to stop monitoring cleanly: {e}");
            }
        }

        let executed = executed?;

        enter(spec, Phase::ResultCollection);
        let mut result = RepetitionResult {
            job_id: spec.job_id.clone(),
            cluster_job_id,
            rep_no: spec.rep_no,
            varying_param_key: spec.varying_param_key.clone(),
            proj_dir: spec.proj_dir.clone(),
            job_dir: spec.job_dir.clone(),
            rep_dir: spec.rep_dir.clone(),
            hosts,
            node_count: spec.node_count,
            gpus_per_node: spec.gpus_per_node,
            outcome: Outcome::Passed,
            failure: None,
            started_at,
            client_started_at: None,
            client_finished_at: None,
            finished_at: started_at,
            client_duration_secs: None,
            total_duration_secs: 0.0,
            workflow_result: None,
            with_monitoring: spec.with_monitoring(),
            monitoring_settings,
        };

        match executed {
            Executed::Client(run) => {
                result.client_started_at = Some(run.started_at);
                result.client_finished_at = Some(run.finished_at);
                result.client_duration_secs = Some(seconds_between(run.started_at, run.finished_at));
                result.workflow_result = read_workflow_result(&spec.workflow_result_path());
            }
            Executed::SchedulerTimeout { elapsed } => {
                result.outcome = Outcome::Failed;
                result.failure = Some(Failure {
                    phase: Phase::SchedulerTimeout,
                    message: format!(
                        "{} not found after {:.1}s",
                        spec.scheduler_file.display(),
                        elapsed.as_secs_f64()
                    ),
                    waited_secs: Some(elapsed.as_secs_f64()),
                });
            }
        }

        result.finished_at = Utc::now();
        result.total_duration_secs = seconds_between(started_at, result.finished_at);

        write_record(&spec.job_output_path(), &result)?;

        // Only a monitored run that reached the client has telemetry to keep.
        let monitored = result.monitoring_settings.is_some() && result.client_started_at.is_some();
        if monitored
            && let Some(params) = spec.monitoring.as_ref()
            && let Err(e) = self.monitor.persist(params, &result).await
        {
            tracing::warn!("Failed to persist monitoring data: {e}");
        }

        Ok(result)
    }

    async fn execute(
        &self,
        spec: &RepetitionSpec,
        plan: &LaunchPlan,
        hosts: &[String],
        session: Option<&MonitoringSession>,
    ) -> Result<Executed, RepetitionError> {
        enter(spec, Phase::SchedulerLaunching);
        let step = scheduler_step(spec, plan.vendor());
        self.gateway
            .submit(&step)
            .await
            .map_err(|source| RepetitionError::Gateway {
                phase: Phase::SchedulerLaunching,
                source,
            })?;

        enter(spec, Phase::SchedulerProbing);
        let readiness = spec.timings.probe.await_path(&spec.scheduler_file).await;
        if let Readiness::TimedOut { elapsed } = readiness {
            enter(spec, Phase::SchedulerTimeout);
            tracing::error!(
                "Scheduler did not announce itself within {:.1}s, skipping workers and client",
                elapsed.as_secs_f64()
            );
            return Ok(Executed::SchedulerTimeout { elapsed });
        }
        enter(spec, Phase::SchedulerReady);
        countdown("scheduler settle", spec.timings.post_scheduler).await;

        enter(spec, Phase::WorkersLaunching);
        let steps = plan.node_steps(&spec.worker_command, &spec.scheduler_file, hosts);
        for step in &steps {
            self.gateway
                .submit(step)
                .await
                .map_err(|source| RepetitionError::Gateway {
                    phase: Phase::WorkersLaunching,
                    source,
                })?;
        }
        tracing::info!(
            "Done starting {} workers on {} nodes",
            plan.len(),
            steps.len()
        );
        countdown("worker startup", spec.timings.worker_grace).await;

        enter(spec, Phase::ClientRunning);
        let request = client_request(spec, session);
        let run = self.client.invoke(&request).await?;
        tracing::info!("Workflow done");

        Ok(Executed::Client(run))
    }
}

fn enter(spec: &RepetitionSpec, phase: Phase) {
    tracing::info!("[{} rep {}] {phase}", spec.job_id, spec.rep_no);
}

/// The single scheduler process, with every accelerator hidden.
fn scheduler_step(spec: &RepetitionSpec, vendor: AcceleratorVendor) -> JobStep {
    let mut command = spec.scheduler_command.clone();
    if let Some(preload) = spec
        .monitoring
        .as_ref()
        .and_then(|m| m.scheduler_preload.as_ref())
    {
        command.push_str(&format!(
            " --preload {}",
            shell_quote(&preload.to_string_lossy())
        ));
    }
    command.push_str(&format!(
        " --scheduler-file {}",
        shell_quote(&spec.scheduler_file.to_string_lossy())
    ));

    JobStep {
        name: "scheduler".to_string(),
        host: None,
        gpus: 0,
        tasks: vec![TaskSpec {
            command,
            env: vec![(
                vendor.visibility_var().to_string(),
                vendor.cleared_value().to_string(),
            )],
            stdout: spec.rep_dir.join("scheduler.out"),
            stderr: spec.rep_dir.join("scheduler.err"),
        }],
    }
}

fn client_request(spec: &RepetitionSpec, session: Option<&MonitoringSession>) -> ClientRequest {
    let mut placeholders = BTreeMap::from([
        (
            "rep-dir".to_string(),
            spec.rep_dir.to_string_lossy().into_owned(),
        ),
        (
            "scheduler-file".to_string(),
            spec.scheduler_file.to_string_lossy().into_owned(),
        ),
    ]);
    if let Some(params) = workflow_params_arg(&spec.workflow_params) {
        placeholders.insert("workflow-params".to_string(), params);
    }

    let mut extra_args = Vec::new();
    let mut env = Vec::new();
    if let (Some(session), Some(params)) = (session, spec.monitoring.as_ref()) {
        extra_args.push(params.client_flag.clone());
        env.push(session.settings_env());
    }

    ClientRequest {
        command_template: spec.client_command.clone(),
        placeholders,
        extra_args,
        env,
        log_path: spec.client_log_path(),
        settle: spec.timings.client_settle,
    }
}

/// The client's result document. A missing or unreadable file is a null
/// result.
fn read_workflow_result(path: &Path) -> Option<Value> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unparsable {}: {e}", path.display());
            None
        }
    }
}

fn write_record(path: &Path, result: &RepetitionResult) -> Result<(), RepetitionError> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| RepetitionError::Record(path.to_path_buf(), e.to_string()))?;
    std::fs::write(path, json).map_err(|e| RepetitionError::Record(path.to_path_buf(), e.to_string()))?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// Errors that abort a repetition.
#[derive(Debug, thiserror::Error)]
pub enum RepetitionError {
    #[error("invalid configuration: {0}")]
    Plan(#[from] PlanError),
    #[error("failed to create {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("cluster call failed during {phase}: {source}")]
    Gateway {
        phase: Phase,
        #[source]
        source: GatewayError,
    },
    #[error("monitoring failed to start: {0}")]
    Monitoring(#[from] MonitoringError),
    #[error("client workflow failed: {0}")]
    Client(#[from] ClientError),
    #[error("failed to write result record {0}: {1}")]
    Record(PathBuf, String),
}

impl RepetitionError {
    /// Phase the repetition was in when it failed.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Plan(_) | Self::Io(..) => Phase::Init,
            Self::Gateway { phase, .. } => *phase,
            Self::Monitoring(_) => Phase::MonitoringStarting,
            Self::Client(_) => Phase::ClientRunning,
            Self::Record(..) => Phase::ResultCollection,
        }
    }
}
