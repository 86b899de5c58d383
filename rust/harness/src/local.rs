//! Single-host gateway: every step runs on the machine the harness runs on.

use async_trait::async_trait;
use tokio::process::Command;

use crate::gateway::{ChildSet, ClusterGateway, GatewayError, JobStep, capture};

#[derive(Default)]
pub struct LocalGateway {
    children: ChildSet,
}

impl LocalGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterGateway for LocalGateway {
    async fn submit(&self, step: &JobStep) -> Result<(), GatewayError> {
        if let Some(ref host) = step.host {
            tracing::debug!("Ignoring host {host} for local step {}", step.name);
        }
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(step.render_script());
        self.children.spawn(&step.name, cmd)
    }

    async fn job_hosts(&self) -> Result<Vec<String>, GatewayError> {
        Ok(vec!["localhost".to_string()])
    }

    async fn run_on_host(&self, _host: &str, command: &str) -> Result<String, GatewayError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        capture(cmd, command).await
    }

    async fn kill_all_job_steps(&self) -> Result<(), GatewayError> {
        self.children.terminate_all().await;
        Ok(())
    }

    fn job_id(&self) -> Option<String> {
        None
    }
}
