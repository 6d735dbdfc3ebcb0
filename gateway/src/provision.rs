//! The provisioning/termination capability is, per spec §9's design notes,
//! an opaque external interface: `Provision(node_spec)` / `Terminate(node_id,
//! reason)`. AMI building, cloud API calls, and the shell scripts that
//! actually bring a backend up or down are out of scope — this module only
//! defines the seam the gateway calls through and a couple of concrete,
//! minimal implementations of it.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("provisioning command failed: {0}")]
    CommandFailed(String),

    #[error("provisioning command timed out")]
    Timeout,

    #[error("failed to spawn provisioning command: {0}")]
    Spawn(#[from] std::io::Error),
}

#[async_trait]
pub trait ProvisioningCapability: Send + Sync {
    async fn provision(&self, backend: &str) -> Result<(), ProvisionError>;
    async fn terminate(&self, backend: &str, reason: &str) -> Result<(), ProvisionError>;
}

/// Default capability when no external command is configured. Logs and
/// succeeds immediately — suitable for local development against an
/// already-running backend, where "provisioning" is a no-op.
pub struct NullProvisioner;

#[async_trait]
impl ProvisioningCapability for NullProvisioner {
    async fn provision(&self, backend: &str) -> Result<(), ProvisionError> {
        warn!(backend, "no provisioning capability configured, treating provision as a no-op");
        Ok(())
    }

    async fn terminate(&self, backend: &str, reason: &str) -> Result<(), ProvisionError> {
        warn!(backend, reason, "no provisioning capability configured, treating terminate as a no-op");
        Ok(())
    }
}

/// Shells out to operator-supplied scripts (cloud-provisioning glue is out
/// of scope; this just invokes whatever command the deployment configured).
/// The backend name is passed as the script's sole argument.
pub struct ShellProvisioner {
    pub provision_cmd: Option<String>,
    pub terminate_cmd: Option<String>,
    pub command_timeout: Duration,
}

impl ShellProvisioner {
    async fn run(&self, cmd: &str, backend: &str, extra: Option<&str>) -> Result<(), ProvisionError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).arg("--").arg(backend);
        if let Some(extra) = extra {
            command.arg(extra);
        }
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = command.spawn()?;
        let output = timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ProvisionError::Timeout)??;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::CommandFailed(format!(
                "exit status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

#[async_trait]
impl ProvisioningCapability for ShellProvisioner {
    async fn provision(&self, backend: &str) -> Result<(), ProvisionError> {
        match &self.provision_cmd {
            Some(cmd) => {
                info!(backend, "invoking provision capability");
                self.run(cmd, backend, None).await
            }
            None => NullProvisioner.provision(backend).await,
        }
    }

    async fn terminate(&self, backend: &str, reason: &str) -> Result<(), ProvisionError> {
        match &self.terminate_cmd {
            Some(cmd) => {
                info!(backend, reason, "invoking terminate capability");
                self.run(cmd, backend, Some(reason)).await
            }
            None => NullProvisioner.terminate(backend, reason).await,
        }
    }
}
