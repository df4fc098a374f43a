//! Deployment tool invocation
//!
//! Runs the external configuration-management tool against the generated
//! connectivity artifacts: a per-host reachability probe first, then the
//! playbook itself. The tool's exit code is surfaced verbatim so callers
//! can propagate it as the process result.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::{debug, info};

use crate::connectivity::INVENTORY_FILE;
use crate::Result;

/// Runs the deployment tool from the directory holding the connectivity
/// artifacts
#[derive(Debug, Clone)]
pub struct Deployer {
    workdir: PathBuf,
    playbook: PathBuf,
}

impl Deployer {
    /// Create a deployer rooted at `workdir`, the directory containing the
    /// generated inventory and SSH profile.
    pub fn new(workdir: PathBuf, playbook: PathBuf) -> Self {
        Self { workdir, playbook }
    }

    /// Probe one inventory target for reachability.
    ///
    /// Returns `Ok(true)` when the target answers, `Ok(false)` when it does
    /// not yet. An error means the tool itself could not be started.
    pub async fn probe(&self, target: &str) -> Result<bool> {
        debug!(target, "probing reachability");
        let status = Command::new("ansible")
            .arg(target)
            .arg("-i")
            .arg(INVENTORY_FILE)
            .arg("-m")
            .arg("ping")
            .arg("-o")
            .current_dir(&self.workdir)
            .status()
            .await?;
        Ok(status.success())
    }

    /// Run the playbook against the full inventory, returning the tool's
    /// exit code unchanged.
    pub async fn run(&self) -> Result<i32> {
        info!(playbook = %self.playbook.display(), "running playbook");
        let status = Command::new("ansible-playbook")
            .arg("-i")
            .arg(INVENTORY_FILE)
            .arg(&self.playbook)
            .current_dir(&self.workdir)
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}
