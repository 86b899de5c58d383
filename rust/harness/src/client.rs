//! Client workflow invocation.
//!
//! The client command comes from configuration as a template with
//! `$[<key>_val]` placeholders. It runs to completion while the scheduler and
//! workers are up.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::pause::countdown;

const TAIL_LINES: usize = 20;

/// Replace every `$[<key>_val]` token with the value of `key`.
///
/// Tokens without a matching key are left untouched.
#[must_use]
pub fn substitute_placeholders(template: &str, placeholders: &BTreeMap<String, String>) -> String {
    placeholders
        .iter()
        .fold(template.to_string(), |command, (key, value)| {
            command.replace(&format!("$[{key}_val]"), value)
        })
}

/// Placeholder tokens still present in `command`.
#[must_use]
pub fn unmatched_placeholders(command: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = command;
    while let Some(start) = rest.find("$[") {
        let candidate = &rest[start..];
        // A nested `$[` starts the real token.
        let close = candidate.find(']').unwrap_or(candidate.len());
        if let Some(inner) = candidate[2..close].find("$[") {
            rest = &candidate[2 + inner..];
            continue;
        }
        match candidate.find(']') {
            Some(end) if candidate[..end].ends_with("_val") => {
                found.push(candidate[..=end].to_string());
                rest = &candidate[end + 1..];
            }
            _ => rest = &candidate[2..],
        }
    }
    found
}

/// The `workflow-params` placeholder value: single-quoted JSON, or `None`
/// when the scenario has no workflow parameters.
#[must_use]
pub fn workflow_params_arg(params: &Map<String, Value>) -> Option<String> {
    if params.is_empty() {
        return None;
    }
    Some(format!("'{}'", Value::Object(params.clone())))
}

/// Everything needed to run the client once.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub command_template: String,
    pub placeholders: BTreeMap<String, String>,
    /// Appended to the command after substitution.
    pub extra_args: Vec<String>,
    /// Set on the client process only.
    pub env: Vec<(String, String)>,
    /// Combined stdout and stderr of the client are written here.
    pub log_path: PathBuf,
    /// Pause after a successful run before returning.
    pub settle: Duration,
}

impl ClientRequest {
    /// The command line that will be executed.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut command = substitute_placeholders(&self.command_template, &self.placeholders);
        for arg in &self.extra_args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }
}

/// Timing and output of a finished client run.
#[derive(Debug, Clone)]
pub struct ClientRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: String,
}

/// Runs the client workflow.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn invoke(&self, request: &ClientRequest) -> Result<ClientRun, ClientError>;
}

/// Runs the client through `bash -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellClient;

#[async_trait]
impl WorkflowClient for ShellClient {
    async fn invoke(&self, request: &ClientRequest) -> Result<ClientRun, ClientError> {
        let command = request.command_line();
        let unmatched = unmatched_placeholders(&command);
        if !unmatched.is_empty() {
            tracing::warn!("Client command has unmatched placeholders: {unmatched:?}");
        }
        tracing::info!("Starting the client: {command}");

        let started_at = Utc::now();
        let output = Command::new("bash")
            .arg("-c")
            .arg(&command)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(ClientError::Spawn)?;
        let finished_at = Utc::now();

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if let Err(e) = tokio::fs::write(&request.log_path, &combined).await {
            tracing::warn!(
                "Failed to write client log {}: {e}",
                request.log_path.display()
            );
        }

        if !output.status.success() {
            return Err(ClientError::Failed {
                status: output.status.code(),
                tail: tail(&combined, TAIL_LINES),
            });
        }

        tracing::info!(
            "Client finished in {:.1}s",
            (finished_at - started_at).num_milliseconds() as f64 / 1000.0
        );
        countdown("client settle", request.settle).await;

        Ok(ClientRun {
            started_at,
            finished_at,
            output: combined,
        })
    }
}

fn tail(output: &str, n: usize) -> String {
    let lines: Vec<_> = output.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Errors from running the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to spawn client: {0}")]
    Spawn(std::io::Error),
    #[error("client exited with {status:?}:\n{tail}")]
    Failed { status: Option<i32>, tail: String },
}
