//! Deployment side effects behind a trait so the routes can be tested

use crate::DeployError;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

#[async_trait]
pub trait DeployExecutor: Send + Sync {
    /// Pull the latest changes into `repo`. Returns the command output.
    async fn pull(&self, repo: &Path) -> Result<String, DeployError>;

    /// Restart the container serving the site. Returns the command output.
    async fn restart(&self, service: &str) -> Result<String, DeployError>;
}

/// Runs `git pull` and `docker restart`.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

async fn run(command: &mut Command) -> Result<String, String> {
    let output = command.output().await.map_err(|e| e.to_string())?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{}: {}", output.status, stderr.trim()))
    }
}

#[async_trait]
impl DeployExecutor for ShellExecutor {
    async fn pull(&self, repo: &Path) -> Result<String, DeployError> {
        run(Command::new("git").arg("pull").current_dir(repo))
            .await
            .map_err(DeployError::Pull)
    }

    async fn restart(&self, service: &str) -> Result<String, DeployError> {
        run(Command::new("docker").arg("restart").arg(service))
            .await
            .map_err(DeployError::Restart)
    }
}
