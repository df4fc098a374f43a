//! Unconditional fleet teardown
//!
//! Teardown runs on every exit path, success or failure, and must make
//! progress past individual step failures: a resource that cannot be
//! deleted is logged and skipped so the remaining resources still get
//! their chance. Ordering follows resource dependencies, instances first,
//! then the key pair, then the network in reverse-allocation order.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::network::{NetworkAllocation, NetworkProvisioner};
use crate::provider::{CloudProvider, Fleet, InstanceState};

/// Number of termination polls before giving up on instance shutdown
pub const DEFAULT_TERMINATION_POLLS: u32 = 40;

/// Delay between termination polls
pub const DEFAULT_TERMINATION_INTERVAL: Duration = Duration::from_secs(3);

/// Drives teardown of instances, key material and network resources
#[derive(Debug, Clone)]
pub struct TeardownSequencer {
    /// Upper bound on termination polls
    pub termination_polls: u32,
    /// Delay between termination polls
    pub poll_interval: Duration,
}

impl Default for TeardownSequencer {
    fn default() -> Self {
        Self {
            termination_polls: DEFAULT_TERMINATION_POLLS,
            poll_interval: DEFAULT_TERMINATION_INTERVAL,
        }
    }
}

impl TeardownSequencer {
    /// Tear down everything the run allocated.
    ///
    /// Never fails: each step logs and continues on error. Instances are
    /// terminated and awaited first because the network cannot be released
    /// while instances still occupy it.
    pub async fn teardown(
        &self,
        provider: &dyn CloudProvider,
        fleet: &Fleet,
        allocation: &NetworkAllocation,
        key_name: &str,
        dry_run: bool,
    ) {
        info!(deployment = %allocation.deployment, "tearing down fleet");

        self.terminate_fleet(provider, fleet, dry_run).await;

        if let Err(err) = provider.delete_key_pair(key_name, dry_run).await {
            warn!(key = key_name, %err, "failed to delete key pair");
        }

        NetworkProvisioner
            .release(provider, allocation, dry_run)
            .await;

        info!(deployment = %allocation.deployment, "teardown complete");
    }

    async fn terminate_fleet(&self, provider: &dyn CloudProvider, fleet: &Fleet, dry_run: bool) {
        let ids = fleet.instance_ids();
        if ids.is_empty() {
            return;
        }

        if let Err(err) = provider.terminate_instances(&ids, dry_run).await {
            warn!(%err, "failed to request instance termination");
            return;
        }
        info!(count = ids.len(), "instance termination requested");

        let mut remaining = ids;
        for _ in 0..self.termination_polls {
            let mut alive = Vec::new();
            for id in &remaining {
                match provider.describe_instance(id, dry_run).await {
                    Ok(status) if status.state == InstanceState::Terminated => {}
                    Ok(_) => alive.push(id.clone()),
                    Err(err) => {
                        // Treat an unknown instance as gone, anything else
                        // as still pending.
                        warn!(instance = %id, %err, "termination status check failed");
                    }
                }
            }
            if alive.is_empty() {
                info!("all instances terminated");
                return;
            }
            remaining = alive;
            tokio::time::sleep(self.poll_interval).await;
        }

        error!(
            instances = ?remaining,
            "instances did not terminate in time, resources may require manual cleanup"
        );
    }
}
