//! Experiment harness CLI
//!
//! Runs the repetitions of one scenario of an experiment configuration.

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use exp_config::ClusterKind;
use exp_harness::{
    ClusterGateway, JobLedger, JobRunner, LocalGateway, MonitoringCoordinator,
    RepetitionController, RepetitionStatus, ShellClient, SlurmGateway,
    config::{self, load_experiment},
    job::repetition_specs,
    planner,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "exp-harness", about = "Experiment repetition harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every repetition of a scenario
    Run {
        /// Job identifier, used as the directory name under <proj_dir>/exps
        #[arg(long)]
        job_id: String,

        /// Path to the experiment configuration (YAML, or TOML by extension)
        #[arg(long)]
        conf: PathBuf,

        /// Scenario key under varying_params
        #[arg(long)]
        varying_param_key: String,

        /// Override static_params.cluster
        #[arg(long, value_enum)]
        cluster: Option<ClusterKind>,
    },

    /// Print the worker launch plan without launching anything
    Plan {
        #[arg(long)]
        conf: PathBuf,

        #[arg(long)]
        varying_param_key: String,
    },

    /// Show the repetition status of a job
    Status {
        #[arg(long)]
        conf: PathBuf,

        #[arg(long)]
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            job_id,
            conf,
            varying_param_key,
            cluster,
        } => {
            let mut experiment = load_experiment(&conf)?;
            if let Some(cluster) = cluster {
                experiment.static_params.cluster = cluster;
            }

            let gateway: Arc<dyn ClusterGateway> = match experiment.static_params.cluster {
                ClusterKind::Slurm => Arc::new(SlurmGateway::from_env()),
                ClusterKind::Local => Arc::new(LocalGateway::new()),
            };
            let monitor = Arc::new(MonitoringCoordinator::new(gateway.clone()));
            let controller = RepetitionController::new(gateway, monitor, Arc::new(ShellClient));

            let summary = JobRunner::new(controller)
                .run(&experiment, &job_id, &varying_param_key)
                .await?;

            println!();
            println!("=== Job {} Complete ===", summary.job_id);
            println!("Total: {}", summary.total);
            println!("Passed: {}", summary.passed);
            println!("Failed: {}", summary.failed);
            println!("Marker: {}", summary.marker.display());

            if !summary.all_passed() {
                return Err(format!("{} repetitions failed", summary.failed).into());
            }
        }

        Commands::Plan {
            conf,
            varying_param_key,
        } => {
            let experiment = load_experiment(&conf)?;
            let specs = repetition_specs(&experiment, "plan", &varying_param_key)?;
            let Some(spec) = specs.first() else {
                return Ok(());
            };
            let plan = planner::plan(
                spec.node_count,
                spec.gpus_per_node,
                &spec.gpu_type,
                &spec.worker_logs_dir(),
            )?;

            println!("=== Launch Plan: {varying_param_key} ===");
            println!(
                "{} nodes x {} GPUs ({}), {} repetitions, monitoring {}",
                plan.node_count(),
                spec.gpus_per_node,
                plan.vendor(),
                specs.len(),
                if spec.with_monitoring() { "on" } else { "off" }
            );
            println!("Scheduler: {}", spec.scheduler_command);
            println!();
            for worker in plan.workers() {
                println!(
                    "  node {} gpu {}: {}={}",
                    worker.node, worker.gpu, worker.visibility_var, worker.gpu
                );
            }
        }

        Commands::Status { conf, job_id } => {
            let experiment = load_experiment(&conf)?;
            let job_dir = config::job_dir(&experiment.static_params.proj_dir, &job_id);
            let ledger = JobLedger::for_job_dir(&job_dir);
            let state = ledger.load()?;

            if state.repetitions.is_empty() {
                println!("No repetitions recorded for job {job_id}.");
                return Ok(());
            }

            println!(
                "=== Job {} ({}) ===",
                state.job_id, state.varying_param_key
            );
            println!();

            for (rep, entry) in &state.repetitions {
                let status = match entry.status {
                    RepetitionStatus::Pending => "PENDING",
                    RepetitionStatus::Running => "RUNNING",
                    RepetitionStatus::Passed => "PASSED",
                    RepetitionStatus::Failed => "FAILED",
                };

                print!("rep {rep}: {status}");
                if let Some(started) = &entry.started_at {
                    print!(" [started {started}]");
                }
                if let Some(finished) = &entry.finished_at {
                    print!(" [finished {finished}]");
                }
                println!();

                if let Some(output) = &entry.output {
                    println!("  Output: {}", output.display());
                }
                for error in &entry.errors {
                    println!("  Error: {error}");
                }
            }

            println!();
            println!(
                "Passed: {}, Failed: {}",
                state.count(RepetitionStatus::Passed),
                state.count(RepetitionStatus::Failed)
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_cluster_override() {
        let cli = Cli::try_parse_from([
            "exp-harness",
            "run",
            "--job-id",
            "j1",
            "--conf",
            "exp.yaml",
            "--varying-param-key",
            "small",
            "--cluster",
            "local",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run {
                cluster: Some(ClusterKind::Local),
                ..
            }
        ));

        assert!(
            Cli::try_parse_from([
                "exp-harness",
                "run",
                "--job-id",
                "j1",
                "--conf",
                "exp.yaml",
                "--varying-param-key",
                "small",
                "--cluster",
                "pbs",
            ])
            .is_err()
        );
    }
}
