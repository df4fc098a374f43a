//! Cloud provider abstraction layer
//!
//! This module defines the boundary to the cloud's resource-management API as
//! a trait of create/describe/delete verbs over networks, subnets, gateways,
//! route tables, security groups, key pairs, and compute instances. The
//! orchestrator drives the whole pipeline through [`CloudProvider`], so the
//! pipeline can run unchanged against the in-memory [`MockCloud`] in tests.
//!
//! Every mutating operation takes a `dry_run` flag that validates the request
//! without changing provider state; the orchestrator threads its `--dry-run`
//! setting through every call site uniformly.

pub mod mock;

pub use mock::MockCloud;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{Error, Result};

/// Lifecycle state of a compute instance, as observed by polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Requested but not yet running
    Pending,
    /// Running and addressable
    Running,
    /// Left the provisioning path; fatal to the run
    Failed,
    /// Terminated, either by the run or by the provider
    Terminated,
    /// Any other provider-reported state; treated as fatal while waiting for
    /// readiness
    Other(String),
}

impl InstanceState {
    /// Returns true if the instance is on the normal provisioning path
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Point-in-time view of an instance returned by a describe call
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    /// Current lifecycle state
    pub state: InstanceState,
    /// Private address, once assigned
    pub private_ip: Option<String>,
    /// Public address, for instances launched with one
    pub public_ip: Option<String>,
    /// Provider-reported reason for a terminal state
    pub state_reason: Option<String>,
}

/// One launched instance, tracked from launch to teardown
///
/// Records are mutated only by the readiness tracker (state refresh) and the
/// teardown sequencer (terminal state); they are never removed from a fleet.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    /// Cloud-assigned identifier
    pub id: String,
    /// Index of the owning cluster within the fleet topology
    pub cluster: usize,
    /// Index of this instance within its cluster
    pub index: usize,
    /// Last observed lifecycle state
    pub state: InstanceState,
    /// Private address, known once the instance is running
    pub private_ip: Option<String>,
    /// Public address, present only for internet-reachable clusters
    pub public_ip: Option<String>,
}

impl InstanceRecord {
    /// Fold a describe result into this record
    pub fn observe(&mut self, status: InstanceStatus) {
        self.state = status.state;
        if status.private_ip.is_some() {
            self.private_ip = status.private_ip;
        }
        if status.public_ip.is_some() {
            self.public_ip = status.public_ip;
        }
    }
}

/// All instance records for a run, grouped by cluster index
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    /// Per-cluster instance records, ordered by cluster index
    pub clusters: Vec<Vec<InstanceRecord>>,
}

impl Fleet {
    /// The bastion instance: first instance of the first cluster
    pub fn bastion(&self) -> Option<&InstanceRecord> {
        self.clusters.first().and_then(|c| c.first())
    }

    /// Iterate over every instance record in cluster order
    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.clusters.iter().flatten()
    }

    /// All instance identifiers in cluster order
    pub fn instance_ids(&self) -> Vec<String> {
        self.iter().map(|r| r.id.clone()).collect()
    }

    /// Total number of instances
    pub fn len(&self) -> usize {
        self.clusters.iter().map(Vec::len).sum()
    }

    /// Returns true if no instances have been launched
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A TCP ingress rule for a security group
#[derive(Debug, Clone)]
pub struct IngressRule {
    /// First port in the authorized range
    pub from_port: u16,
    /// Last port in the authorized range
    pub to_port: u16,
    /// Source CIDR the rule admits traffic from
    pub cidr: String,
}

impl IngressRule {
    /// Authorize a single TCP port from the given source CIDR
    pub fn port(port: u16, cidr: impl Into<String>) -> Self {
        Self {
            from_port: port,
            to_port: port,
            cidr: cidr.into(),
        }
    }

    /// Authorize all TCP ports from the given source CIDR
    pub fn all_ports(cidr: impl Into<String>) -> Self {
        Self {
            from_port: 1,
            to_port: 65535,
            cidr: cidr.into(),
        }
    }
}

/// A request to launch the instances of one cluster
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Subnet the instances attach to
    pub subnet: String,
    /// Security group governing the instances' traffic
    pub security_group: String,
    /// Machine image identifier
    pub image: String,
    /// Instance type
    pub itype: String,
    /// Exact number of instances to launch
    pub count: u32,
    /// Name of the key pair installed on the instances
    pub key_name: String,
    /// Whether to associate a public address
    pub public_ip: bool,
    /// Terminate rather than stop on instance-initiated shutdown, so a lost
    /// orchestrator still eventually stops billing
    pub terminate_on_shutdown: bool,
}

/// Generated key pair for a run
///
/// The private key bytes exist only for the run's lifetime: written once to a
/// restricted-permission file and deleted from the provider during teardown.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// Provider-side key pair name
    pub name: String,
    /// Private key in PEM form
    pub private_key: String,
}

/// Boundary to the cloud's resource-management API
///
/// All operations are observed as blocking round trips from the coordinating
/// flow of control; repeated attempts happen only through the polling loops in
/// the readiness tracker and teardown sequencer, never by retrying a failed
/// mutation.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create an isolated virtual network with the given CIDR block
    async fn create_vpc(&self, cidr: &str, dry_run: bool) -> Result<String>;

    /// Delete a virtual network; fails while any resource still references it
    async fn delete_vpc(&self, vpc: &str, dry_run: bool) -> Result<()>;

    /// Create a subnet inside a network
    async fn create_subnet(&self, vpc: &str, cidr: &str, dry_run: bool) -> Result<String>;

    /// Delete a subnet
    async fn delete_subnet(&self, subnet: &str, dry_run: bool) -> Result<()>;

    /// Create an internet gateway, initially detached
    async fn create_internet_gateway(&self, dry_run: bool) -> Result<String>;

    /// Attach a gateway to a network
    async fn attach_internet_gateway(&self, gateway: &str, vpc: &str, dry_run: bool)
        -> Result<()>;

    /// Detach a gateway from a network; required before deletion
    async fn detach_internet_gateway(&self, gateway: &str, vpc: &str, dry_run: bool)
        -> Result<()>;

    /// Delete a detached gateway
    async fn delete_internet_gateway(&self, gateway: &str, dry_run: bool) -> Result<()>;

    /// Create a route table inside a network
    async fn create_route_table(&self, vpc: &str, dry_run: bool) -> Result<String>;

    /// Add a route for a destination CIDR through a gateway
    async fn create_route(
        &self,
        route_table: &str,
        dest_cidr: &str,
        gateway: &str,
        dry_run: bool,
    ) -> Result<()>;

    /// Associate a route table with a subnet, returning the association id
    async fn associate_route_table(
        &self,
        route_table: &str,
        subnet: &str,
        dry_run: bool,
    ) -> Result<String>;

    /// Remove a route-table association; required before the table is deleted
    async fn disassociate_route_table(&self, association: &str, dry_run: bool) -> Result<()>;

    /// Delete a route table with no remaining associations
    async fn delete_route_table(&self, route_table: &str, dry_run: bool) -> Result<()>;

    /// Create a security group inside a network
    async fn create_security_group(
        &self,
        vpc: &str,
        name: &str,
        description: &str,
        dry_run: bool,
    ) -> Result<String>;

    /// Authorize inbound TCP traffic on a security group
    async fn authorize_ingress(&self, group: &str, rule: &IngressRule, dry_run: bool)
        -> Result<()>;

    /// Delete a security group
    async fn delete_security_group(&self, group: &str, dry_run: bool) -> Result<()>;

    /// Generate a key pair; fails if a key pair with this name already exists
    async fn create_key_pair(&self, name: &str, dry_run: bool) -> Result<KeyMaterial>;

    /// Delete a key pair by name
    async fn delete_key_pair(&self, name: &str, dry_run: bool) -> Result<()>;

    /// Tag a set of resources with a key/value pair
    async fn create_tags(
        &self,
        resources: &[String],
        key: &str,
        value: &str,
        dry_run: bool,
    ) -> Result<()>;

    /// Launch instances, configured to self-terminate on shutdown so a lost
    /// orchestrator still eventually stops billing. Returns one id per
    /// instance, all in the pending state.
    async fn run_instances(&self, request: &LaunchRequest, dry_run: bool) -> Result<Vec<String>>;

    /// Observe the current state and addresses of an instance
    async fn describe_instance(&self, id: &str, dry_run: bool) -> Result<InstanceStatus>;

    /// Request termination of a set of instances
    async fn terminate_instances(&self, ids: &[String], dry_run: bool) -> Result<()>;
}

/// Supported cloud provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Amazon Web Services
    Aws,
    /// In-memory provider for tests and local pipeline exercises
    Mock,
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "mock" => Ok(Self::Mock),
            _ => Err(Error::config(format!(
                "invalid provider '{s}', expected one of: aws, mock"
            ))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Create a provider instance for the given provider kind
pub fn create_provider(kind: ProviderKind) -> Result<Arc<dyn CloudProvider>> {
    match kind {
        ProviderKind::Mock => Ok(Arc::new(MockCloud::new())),
        ProviderKind::Aws => Err(Error::provision(
            "AWS provider not yet implemented".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_display_matches_provider_vocabulary() {
        assert_eq!(InstanceState::Pending.to_string(), "pending");
        assert_eq!(InstanceState::Running.to_string(), "running");
        assert_eq!(InstanceState::Terminated.to_string(), "terminated");
        assert_eq!(
            InstanceState::Other("shutting-down".to_string()).to_string(),
            "shutting-down"
        );
    }

    #[test]
    fn only_pending_and_running_are_provisioning_states() {
        assert!(InstanceState::Pending.is_provisioning());
        assert!(InstanceState::Running.is_provisioning());
        assert!(!InstanceState::Failed.is_provisioning());
        assert!(!InstanceState::Terminated.is_provisioning());
        assert!(!InstanceState::Other("stopping".to_string()).is_provisioning());
    }

    #[test]
    fn observe_keeps_known_addresses() {
        let mut record = InstanceRecord {
            id: "i-1".to_string(),
            cluster: 0,
            index: 0,
            state: InstanceState::Pending,
            private_ip: Some("10.0.0.4".to_string()),
            public_ip: None,
        };

        // A describe without addresses must not erase what we already know
        record.observe(InstanceStatus {
            state: InstanceState::Running,
            private_ip: None,
            public_ip: Some("203.0.113.9".to_string()),
            state_reason: None,
        });

        assert_eq!(record.state, InstanceState::Running);
        assert_eq!(record.private_ip.as_deref(), Some("10.0.0.4"));
        assert_eq!(record.public_ip.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn fleet_bastion_is_first_instance_of_first_cluster() {
        let fleet = Fleet {
            clusters: vec![
                vec![InstanceRecord {
                    id: "i-hq".to_string(),
                    cluster: 0,
                    index: 0,
                    state: InstanceState::Pending,
                    private_ip: None,
                    public_ip: None,
                }],
                vec![],
            ],
        };
        assert_eq!(fleet.bastion().map(|r| r.id.as_str()), Some("i-hq"));
        assert_eq!(fleet.len(), 1);
    }

    #[test]
    fn ingress_rule_helpers() {
        let ssh = IngressRule::port(22, "0.0.0.0/0");
        assert_eq!((ssh.from_port, ssh.to_port), (22, 22));

        let all = IngressRule::all_ports("10.0.0.0/16");
        assert_eq!((all.from_port, all.to_port), (1, 65535));
        assert_eq!(all.cidr, "10.0.0.0/16");
    }

    #[test]
    fn provider_factory_rejects_unimplemented_kinds() {
        assert!(create_provider(ProviderKind::Mock).is_ok());
        assert!(create_provider(ProviderKind::Aws).is_err());

        let kind: ProviderKind = "mock".parse().unwrap();
        assert_eq!(kind, ProviderKind::Mock);
        assert!("openstack".parse::<ProviderKind>().is_err());
    }
}
