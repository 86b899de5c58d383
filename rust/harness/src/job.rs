//! Runs every repetition of one scenario and keeps the job ledger.

use std::path::{Path, PathBuf};

use chrono::Utc;
use exp_config::ExperimentConfig;

use crate::{
    config::{self, ConfigError, RepetitionSpec},
    controller::RepetitionController,
    planner::{self, PlanError},
    state::{JobLedger, LedgerError},
};

/// Marker written to the job dir once every repetition has finished.
pub const SUCCESS_MARKER: &str = "SUCCESS";

/// Outcome of a whole job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Path of the `SUCCESS` marker.
    pub marker: PathBuf,
}

impl JobSummary {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.passed == self.total
    }
}

/// Runs the repetitions of a job one after another.
pub struct JobRunner {
    controller: RepetitionController,
}

impl JobRunner {
    #[must_use]
    pub fn new(controller: RepetitionController) -> Self {
        Self { controller }
    }

    /// Run `nreps` repetitions of scenario `varying_param_key`.
    ///
    /// Configuration problems abort before anything is launched. A failed
    /// repetition is recorded and the next one still runs. The `SUCCESS`
    /// marker is written once the last repetition has finished, whatever
    /// the outcomes; callers check [`JobSummary::failed`].
    pub async fn run(
        &self,
        config: &ExperimentConfig,
        job_id: &str,
        varying_param_key: &str,
    ) -> Result<JobSummary, JobError> {
        let specs = repetition_specs(config, job_id, varying_param_key)?;
        let job_dir = config::job_dir(&config.static_params.proj_dir, job_id);
        std::fs::create_dir_all(&job_dir).map_err(|e| JobError::Io(job_dir.clone(), e))?;

        let ledger = JobLedger::for_job_dir(&job_dir);
        ledger.initialize(job_id, varying_param_key, specs.len())?;

        tracing::info!(
            "Job {job_id}: {} repetitions of '{varying_param_key}' in {}",
            specs.len(),
            job_dir.display()
        );

        let mut summary = JobSummary {
            job_id: job_id.to_string(),
            total: specs.len(),
            passed: 0,
            failed: 0,
            marker: job_dir.join(SUCCESS_MARKER),
        };

        for spec in &specs {
            ledger.mark_started(spec.rep_no)?;

            match self.controller.run(spec).await {
                Ok(result) if result.passed() => {
                    ledger.mark_passed(spec.rep_no, &spec.job_output_path())?;
                    summary.passed += 1;
                }
                Ok(result) => {
                    let message = result.failure.map_or_else(
                        || "repetition failed".to_string(),
                        |f| format!("{}: {}", f.phase, f.message),
                    );
                    tracing::error!("Repetition {} failed: {message}", spec.rep_no);
                    ledger.mark_failed(spec.rep_no, &message, Some(&spec.job_output_path()))?;
                    summary.failed += 1;
                }
                Err(e) => {
                    let message = format!("{}: {e}", e.phase());
                    ledger.mark_failed(spec.rep_no, &message, None)?;
                    summary.failed += 1;
                }
            }
        }

        write_success_marker(&job_dir)?;
        if !summary.all_passed() {
            tracing::warn!(
                "Job {job_id}: {} of {} repetitions failed",
                summary.failed,
                summary.total
            );
        }

        Ok(summary)
    }
}

/// Build and validate the spec of every repetition up front.
pub fn repetition_specs(
    config: &ExperimentConfig,
    job_id: &str,
    varying_param_key: &str,
) -> Result<Vec<RepetitionSpec>, JobError> {
    let scenario = config
        .scenario(varying_param_key)
        .ok_or_else(|| ConfigError::UnknownScenario(varying_param_key.to_string()))?;
    if scenario.nreps == 0 {
        return Err(JobError::NoRepetitions(varying_param_key.to_string()));
    }

    let specs = (0..scenario.nreps)
        .map(|rep| RepetitionSpec::from_config(config, varying_param_key, job_id, rep))
        .collect::<Result<Vec<_>, _>>()?;

    // Every repetition shares the grid, so checking the first is enough.
    if let Some(first) = specs.first() {
        planner::plan(
            first.node_count,
            first.gpus_per_node,
            &first.gpu_type,
            &first.worker_logs_dir(),
        )?;
    }

    Ok(specs)
}

/// Write the run-complete marker holding the current UTC time.
pub fn write_success_marker(job_dir: &Path) -> Result<PathBuf, JobError> {
    let path = job_dir.join(SUCCESS_MARKER);
    let stamp = Utc::now().format("%Y-%m-%d %H-%M-%S%.3f").to_string();
    std::fs::write(&path, &stamp).map_err(|e| JobError::Io(path.clone(), e))?;
    tracing::info!("Wrote {} ({stamp})", path.display());
    Ok(path)
}

/// Errors that abort a whole job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Plan(#[from] PlanError),
    #[error("scenario '{0}' has nreps = 0")]
    NoRepetitions(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
