#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! Experiment harness
//!
//! Brings up a scheduler and one worker per GPU on a cluster allocation, runs
//! the client workflow against them, optionally wraps the run in a monitoring
//! session, and records the result of every repetition.

pub mod client;
pub mod config;
pub mod controller;
pub mod gateway;
pub mod job;
pub mod local;
pub mod monitoring;
pub mod pause;
pub mod planner;
pub mod readiness;
pub mod slurm;
pub mod state;

pub use client::{ShellClient, WorkflowClient};
pub use config::RepetitionSpec;
pub use controller::{RepetitionController, RepetitionResult};
pub use gateway::ClusterGateway;
pub use job::{JobRunner, JobSummary};
pub use local::LocalGateway;
pub use monitoring::{Monitor, MonitoringCoordinator};
pub use slurm::SlurmGateway;
pub use state::{JobLedger, RepetitionStatus};
