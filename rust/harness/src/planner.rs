//! Worker launch planning.
//!
//! Every node runs one worker per local GPU, and each worker sees exactly one
//! device through the vendor's visibility variable.

use std::path::{Path, PathBuf};

use exp_config::AcceleratorVendor;

use crate::gateway::{JobStep, TaskSpec, shell_quote};

/// Launch descriptor for a single worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub node: usize,
    pub gpu: usize,
    pub visibility_var: &'static str,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl WorkerLaunch {
    /// Environment restricting the worker to its device.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(self.visibility_var.to_string(), self.gpu.to_string())]
    }

    fn to_task(&self, worker_command: &str, scheduler_file: &Path) -> TaskSpec {
        TaskSpec {
            command: format!(
                "{worker_command} --scheduler-file {}",
                shell_quote(&scheduler_file.to_string_lossy())
            ),
            env: self.env(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

/// All workers of a repetition, node-major then GPU-minor.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    vendor: AcceleratorVendor,
    gpus_per_node: usize,
    workers: Vec<WorkerLaunch>,
}

impl LaunchPlan {
    #[must_use]
    pub fn vendor(&self) -> AcceleratorVendor {
        self.vendor
    }

    #[must_use]
    pub fn workers(&self) -> &[WorkerLaunch] {
        &self.workers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.workers.len() / self.gpus_per_node
    }

    /// Workers grouped by node.
    pub fn nodes(&self) -> impl Iterator<Item = &[WorkerLaunch]> {
        self.workers.chunks(self.gpus_per_node)
    }

    /// One job step per node carrying all of that node's workers.
    ///
    /// Node `i` is pinned to `hosts[i]` when the allocation has that many
    /// hosts; otherwise the resource manager places it.
    #[must_use]
    pub fn node_steps(
        &self,
        worker_command: &str,
        scheduler_file: &Path,
        hosts: &[String],
    ) -> Vec<JobStep> {
        self.nodes()
            .enumerate()
            .map(|(node, workers)| JobStep {
                name: format!("workers-{node}"),
                host: hosts.get(node).cloned(),
                gpus: workers.len(),
                tasks: workers
                    .iter()
                    .map(|w| w.to_task(worker_command, scheduler_file))
                    .collect(),
            })
            .collect()
    }
}

/// Build the launch plan for `node_count` nodes with `gpus_per_node` GPUs.
///
/// Worker logs go to `<worker_logs>/worker_<node>_<gpu>.{out,err}`.
pub fn plan(
    node_count: usize,
    gpus_per_node: usize,
    vendor_tag: &str,
    worker_logs: &Path,
) -> Result<LaunchPlan, PlanError> {
    let vendor: AcceleratorVendor = vendor_tag.parse().map_err(PlanError::UnknownVendor)?;
    if node_count == 0 {
        return Err(PlanError::NoNodes);
    }
    if gpus_per_node == 0 {
        return Err(PlanError::NoGpus);
    }

    let visibility_var = vendor.visibility_var();
    let workers = (0..node_count)
        .flat_map(|node| (0..gpus_per_node).map(move |gpu| (node, gpu)))
        .map(|(node, gpu)| WorkerLaunch {
            node,
            gpu,
            visibility_var,
            stdout: worker_logs.join(format!("worker_{node}_{gpu}.out")),
            stderr: worker_logs.join(format!("worker_{node}_{gpu}.err")),
        })
        .collect();

    Ok(LaunchPlan {
        vendor,
        gpus_per_node,
        workers,
    })
}

/// Errors that make a launch plan impossible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("{0}")]
    UnknownVendor(String),
    #[error("node count must be at least 1")]
    NoNodes,
    #[error("GPUs per node must be at least 1")]
    NoGpus,
}
