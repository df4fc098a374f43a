//! Concurrent instance-readiness tracking
//!
//! The readiness tracker polls every launched instance until the whole fleet
//! is running, or aborts the run the moment any instance leaves the
//! pending/running path. The bastion is special-cased: its instance is
//! awaited first, because nothing else can be validated as reachable until
//! the proxy hop exists.
//!
//! After the bastion is up, remaining instances are refreshed in round-robin;
//! a round is abandoned at the first instance still found pending, since the
//! rest are unlikely to have changed state yet, and the tracker sleeps before
//! the next round.
//!
//! The first time an instance is observed running, a readiness notification
//! is dispatched exactly once for it onto a bounded worker pool, so handler
//! latency never serializes behind the polling loop. The tracker drains the
//! pool before returning: when [`ReadinessTracker::wait_ready`] completes
//! successfully, every instance is running and every notification handler has
//! finished.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::provider::{CloudProvider, Fleet, InstanceState};
use crate::topology::Topology;
use crate::{Error, Result};

/// Delay between polling rounds
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Number of notification handlers allowed to run concurrently
pub const DEFAULT_POOL_SIZE: usize = 5;

/// A readiness notification for one instance
///
/// Carries the bastion's resolved public address explicitly, so handlers
/// never reach into shared state that the polling loop may still be mutating.
#[derive(Debug, Clone)]
pub struct ReadyEvent {
    /// Name of the cluster the instance belongs to
    pub role: String,
    /// Cloud-assigned instance identifier
    pub instance: String,
    /// Index of the owning cluster in the fleet topology
    pub cluster: usize,
    /// Index of the instance within its cluster
    pub index: usize,
    /// The instance's private address
    pub private_ip: String,
    /// Public address of the bastion proxying traffic to this instance
    pub bastion_public_ip: String,
}

/// Handler invoked once per instance on its first transition to running
#[async_trait]
pub trait ReadinessNotifier: Send + Sync + 'static {
    /// Called exactly once per instance, on the bounded notification pool
    async fn instance_ready(&self, event: ReadyEvent);
}

/// Notifier that logs each instance's availability
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl ReadinessNotifier for LogNotifier {
    async fn instance_ready(&self, event: ReadyEvent) {
        info!(
            role = %event.role,
            instance = %event.instance,
            address = %event.private_ip,
            bastion = %event.bastion_public_ip,
            "instance available through bastion"
        );
    }
}

/// Polls a fleet until every instance is running
#[derive(Debug, Clone, Copy)]
pub struct ReadinessTracker {
    /// Delay between polling rounds
    pub poll_interval: Duration,
    /// Concurrency bound of the notification pool
    pub pool_size: usize,
}

impl Default for ReadinessTracker {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl ReadinessTracker {
    /// Wait until every instance in the fleet is running, dispatching one
    /// readiness notification per instance as it comes up.
    ///
    /// Fails with [`Error::InstanceFailure`] as soon as any instance is
    /// observed outside the pending/running states; the caller routes that
    /// through teardown. Instance records are mutated only here, by the
    /// coordinating loop; handlers receive owned copies of the data they
    /// need.
    pub async fn wait_ready(
        &self,
        provider: &dyn CloudProvider,
        topology: &Topology,
        fleet: &mut Fleet,
        notifier: Arc<dyn ReadinessNotifier>,
        dry_run: bool,
    ) -> Result<()> {
        let bastion_public_ip = self.await_bastion(provider, fleet, dry_run).await?;
        info!(bastion = %bastion_public_ip, "bastion is running");

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut notified: HashSet<(usize, usize)> = HashSet::new();

        let mut pending = true;
        while pending {
            pending = false;
            'round: for ci in 0..fleet.clusters.len() {
                for ii in 0..fleet.clusters[ci].len() {
                    if fleet.clusters[ci][ii].state == InstanceState::Pending {
                        let record = &mut fleet.clusters[ci][ii];
                        let status = provider.describe_instance(&record.id, dry_run).await?;
                        let reason = status.state_reason.clone();
                        record.observe(status);
                        if !record.state.is_provisioning() {
                            return Err(Error::instance_failure(
                                record.id.clone(),
                                reason.unwrap_or_else(|| record.state.to_string()),
                            ));
                        }
                    }
                    match fleet.clusters[ci][ii].state.clone() {
                        InstanceState::Pending => {
                            // The rest of this round is unlikely to have
                            // changed state yet; refresh it next round.
                            pending = true;
                            break 'round;
                        }
                        InstanceState::Running => {
                            if notified.insert((ci, ii)) {
                                let record = &fleet.clusters[ci][ii];
                                let private_ip = record.private_ip.clone().ok_or_else(|| {
                                    Error::provision(format!(
                                        "instance {} is running without a private address",
                                        record.id
                                    ))
                                })?;
                                let event = ReadyEvent {
                                    role: topology.clusters()[ci].name.clone(),
                                    instance: record.id.clone(),
                                    cluster: ci,
                                    index: ii,
                                    private_ip,
                                    bastion_public_ip: bastion_public_ip.clone(),
                                };
                                let notifier = notifier.clone();
                                let semaphore = semaphore.clone();
                                handlers.spawn(async move {
                                    let _permit = semaphore.acquire_owned().await;
                                    notifier.instance_ready(event).await;
                                });
                            }
                        }
                        other => {
                            return Err(Error::instance_failure(
                                fleet.clusters[ci][ii].id.clone(),
                                other.to_string(),
                            ));
                        }
                    }
                }
            }
            if pending {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        // Phase boundary: every dispatched handler must finish before the
        // pipeline advances past readiness.
        debug!(handlers = handlers.len(), "draining notification pool");
        while let Some(result) = handlers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "readiness notification handler panicked");
            }
        }

        info!(instances = fleet.len(), "fleet is ready");
        Ok(())
    }

    /// Poll the bastion instance until it is running, returning its public
    /// address. Nothing else is polled until the proxy hop exists.
    async fn await_bastion(
        &self,
        provider: &dyn CloudProvider,
        fleet: &mut Fleet,
        dry_run: bool,
    ) -> Result<String> {
        let record = fleet
            .clusters
            .get_mut(0)
            .and_then(|c| c.get_mut(0))
            .ok_or_else(|| Error::provision("fleet has no bastion instance"))?;

        loop {
            let status = provider.describe_instance(&record.id, dry_run).await?;
            let reason = status.state_reason.clone();
            record.observe(status);
            match record.state {
                InstanceState::Pending => {
                    debug!(instance = %record.id, "bastion still pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
                InstanceState::Running => break,
                _ => {
                    return Err(Error::instance_failure(
                        record.id.clone(),
                        reason.unwrap_or_else(|| record.state.to_string()),
                    ));
                }
            }
        }

        record
            .public_ip
            .clone()
            .ok_or_else(|| Error::provision("bastion is running without a public address"))
    }
}
