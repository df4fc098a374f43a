//! End-to-end run orchestration
//!
//! Wires the pipeline together: key pair, network, launch, readiness,
//! connectivity, probe, playbook. Whatever happens after allocation begins,
//! teardown runs. An interrupt signal aborts the pipeline mid-flight and
//! still tears down everything allocated so far.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::connectivity::ConnectivityProfile;
use crate::deploy::Deployer;
use crate::launch::{ensure_key_pair, launch_fleet};
use crate::network::{NetworkAllocation, NetworkProvisioner};
use crate::provider::{CloudProvider, Fleet};
use crate::readiness::{LogNotifier, ReadinessTracker};
use crate::teardown::TeardownSequencer;
use crate::topology::Topology;
use crate::{Error, Result};

/// Number of reachability probes before a target is declared unreachable.
/// Generous on purpose: instances routinely take minutes after entering the
/// running state before they answer over SSH.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 900;

/// Delay between reachability probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Settings for a single orchestrated run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Deployment name, used for resource tagging and the key pair
    pub deployment: String,
    /// Path to the playbook; its parent directory receives the generated
    /// connectivity artifacts
    pub playbook: PathBuf,
    /// Validate requests against the provider without creating anything
    pub dry_run: bool,
    /// Pause for operator input after the playbook, before teardown
    pub wait_before_teardown: bool,
}

/// Drives one provision, deploy and teardown cycle
pub struct Orchestrator {
    provider: Arc<dyn CloudProvider>,
    config: RunConfig,
    /// Readiness polling settings, adjustable for fast tests
    pub readiness: ReadinessTracker,
    /// Teardown settings, adjustable for fast tests
    pub teardown: TeardownSequencer,
    /// Upper bound on reachability probes per target
    pub probe_attempts: u32,
    /// Delay between reachability probes
    pub probe_interval: Duration,
}

impl Orchestrator {
    /// Create an orchestrator with default polling cadence.
    pub fn new(provider: Arc<dyn CloudProvider>, config: RunConfig) -> Self {
        Self {
            provider,
            config,
            readiness: ReadinessTracker::default(),
            teardown: TeardownSequencer::default(),
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Run the full cycle and return the process exit code.
    ///
    /// Teardown is unconditional once allocation begins. A non-zero playbook
    /// exit is not an error here, the code is returned so the caller can
    /// exit with it.
    pub async fn run(&self, topology: Topology) -> Result<i32> {
        let topology = topology.with_bastion();
        let mut allocation = NetworkAllocation::new(&self.config.deployment);
        let mut fleet = Fleet::default();

        let outcome = tokio::select! {
            res = self.pipeline(&topology, &mut allocation, &mut fleet) => res,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, abandoning the run");
                Err(Error::provision("run interrupted"))
            }
        };

        if self.config.wait_before_teardown && outcome.is_ok() {
            info!("press enter to tear down the fleet");
            let mut line = String::new();
            let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
        }

        self.teardown
            .teardown(
                self.provider.as_ref(),
                &fleet,
                &allocation,
                &self.config.deployment,
                self.config.dry_run,
            )
            .await;

        match outcome {
            Ok(code) => Ok(code),
            Err(Error::Deployment(code)) => Ok(code),
            Err(err) => Err(err),
        }
    }

    async fn pipeline(
        &self,
        topology: &Topology,
        allocation: &mut NetworkAllocation,
        fleet: &mut Fleet,
    ) -> Result<i32> {
        let provider = self.provider.as_ref();
        let dry_run = self.config.dry_run;

        let key = ensure_key_pair(provider, &self.config.deployment, dry_run).await?;
        NetworkProvisioner
            .allocate(provider, topology, allocation, dry_run)
            .await?;
        launch_fleet(provider, topology, allocation, &key.name, fleet, dry_run).await?;

        if dry_run {
            info!("dry run complete, all requests validated");
            return Ok(0);
        }

        self.readiness
            .wait_ready(provider, topology, fleet, Arc::new(LogNotifier), dry_run)
            .await?;

        let workdir = self
            .config
            .playbook
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let profile = ConnectivityProfile::generate(topology, fleet)?;
        profile.write(&workdir, &key).await?;

        let playbook = self
            .config
            .playbook
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.playbook.clone());
        let deployer = Deployer::new(workdir, playbook);

        self.await_reachable(&deployer, crate::BASTION_NAME).await?;
        self.await_reachable(&deployer, "all").await?;

        let code = deployer.run().await?;
        if code != 0 {
            return Err(Error::Deployment(code));
        }
        Ok(0)
    }

    async fn await_reachable(&self, deployer: &Deployer, target: &str) -> Result<()> {
        for _ in 0..self.probe_attempts {
            if deployer.probe(target).await? {
                info!(target, "reachable");
                return Ok(());
            }
            tokio::time::sleep(self.probe_interval).await;
        }
        Err(Error::provision(format!(
            "target {target} never became reachable"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::provider::mock::MockCloud;
    use crate::readiness::ReadinessTracker;

    fn topology() -> Topology {
        Topology::load(
            r#"{"clusters": [{"name": "workers", "count": 2, "internet": false}]}"#,
            &HashMap::new(),
        )
        .unwrap()
    }

    fn orchestrator(cloud: Arc<MockCloud>, dry_run: bool) -> Orchestrator {
        let mut orchestrator = Orchestrator::new(
            cloud,
            RunConfig {
                deployment: "test".to_string(),
                playbook: PathBuf::from("deploy/playbook.yml"),
                dry_run,
                wait_before_teardown: false,
            },
        );
        orchestrator.readiness = ReadinessTracker {
            poll_interval: Duration::from_millis(1),
            ..ReadinessTracker::default()
        };
        orchestrator.teardown = TeardownSequencer {
            termination_polls: 5,
            poll_interval: Duration::from_millis(1),
        };
        orchestrator
    }

    #[tokio::test]
    async fn dry_run_validates_without_creating_resources() {
        let cloud = Arc::new(MockCloud::new());
        let code = orchestrator(cloud.clone(), true)
            .run(topology())
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(cloud.alive_resources().is_empty());
        assert_eq!(cloud.live_instances(), 0);
    }

    #[tokio::test]
    async fn instance_failure_aborts_and_tears_down() {
        let cloud = Arc::new(MockCloud::new());
        // Second launched instance (first worker) never comes up
        cloud.fail_instance(1, "Insufficient capacity");

        let err = orchestrator(cloud.clone(), false)
            .run(topology())
            .await
            .unwrap_err();

        match err {
            Error::InstanceFailure { reason, .. } => {
                assert_eq!(reason, "Insufficient capacity");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cloud.alive_resources().is_empty());
        assert_eq!(cloud.live_instances(), 0);
        assert!(!cloud.key_pair_exists("test"));
    }

    #[tokio::test]
    async fn launch_failure_mid_fleet_terminates_earlier_instances() {
        let cloud = Arc::new(MockCloud::new());
        // The bastion launches, the workers cluster request is refused
        cloud.fail_launch_call(1);

        let err = orchestrator(cloud.clone(), false)
            .run(topology())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provision(_)));
        // The bastion launched before the failure must not outlive the run
        assert_eq!(cloud.live_instances(), 0);
        assert!(cloud.alive_resources().is_empty());
        assert!(!cloud.key_pair_exists("test"));
    }

    #[tokio::test]
    async fn network_failure_tears_down_partial_state() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_creation_of("rtb");

        let err = orchestrator(cloud.clone(), false)
            .run(topology())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provision(_)));
        // The vpc, gateway and anything else created before the failure is
        // released again.
        assert!(cloud.alive_resources().is_empty());
        assert!(!cloud.key_pair_exists("test"));
    }
}
