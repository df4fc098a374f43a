//! Network and security-boundary allocation
//!
//! One run owns one isolated virtual network carved into a `/24` subnet per
//! cluster, a route table giving internet-reachable subnets a default route
//! through a gateway, and one security group per cluster. The intra-network
//! rule admits all TCP traffic between instances; each exposed port is
//! additionally opened to any source.
//!
//! Allocation does not roll back: whatever was created before a failure stays
//! in the [`NetworkAllocation`] and is reconciled by the teardown sequencer.
//! Release is the mirror image, deleting resources in dependency order and
//! logging (rather than propagating) each individual deletion failure.

use tracing::{info, warn};

use crate::provider::{CloudProvider, IngressRule};
use crate::topology::Topology;
use crate::{Error, Result, RESOURCE_TAG_KEY};

/// CIDR block of the run's virtual network
pub const NETWORK_CIDR: &str = "10.0.0.0/16";

/// Destination CIDR of the default route through the internet gateway
pub const ANYWHERE: &str = "0.0.0.0/0";

/// The `/24` block assigned to a cluster, derived from its index.
///
/// The `/16` network is partitioned into at most 256 non-overlapping `/24`
/// subnets, so no two clusters can share an address block.
pub fn subnet_cidr(cluster_index: usize) -> Result<String> {
    if cluster_index > 255 {
        return Err(Error::provision(format!(
            "cluster index {cluster_index} exceeds the 256-subnet partition"
        )));
    }
    Ok(format!("10.0.{cluster_index}.0/24"))
}

/// Network resources owned by one run
///
/// Fields are optional or partially filled because allocation can stop at any
/// point; teardown walks whatever is present.
#[derive(Debug, Clone, Default)]
pub struct NetworkAllocation {
    /// Deployment name, used for resource tagging and the key-pair name
    pub deployment: String,
    /// The virtual network
    pub vpc: Option<String>,
    /// The internet gateway, attached to the network
    pub gateway: Option<String>,
    /// Route table with the default route to the gateway
    pub route_table: Option<String>,
    /// Route-table association ids for internet-reachable subnets
    pub associations: Vec<String>,
    /// Per-cluster subnet ids, ordered by cluster index
    pub subnets: Vec<String>,
    /// Per-cluster security group ids, ordered by cluster index
    pub security_groups: Vec<String>,
}

impl NetworkAllocation {
    /// Create an empty allocation for the given deployment name
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            ..Self::default()
        }
    }

    /// Every allocated resource id, for tagging
    fn resource_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        ids.extend(self.vpc.clone());
        ids.extend(self.gateway.clone());
        ids.extend(self.route_table.clone());
        ids.extend(self.subnets.iter().cloned());
        ids.extend(self.security_groups.iter().cloned());
        ids
    }
}

/// Allocates and releases a run's network resources
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkProvisioner;

impl NetworkProvisioner {
    /// Allocate the network for a fleet topology (bastion included), filling
    /// `allocation` as resources are created.
    ///
    /// On failure the partially-filled allocation is left as-is for the
    /// teardown sequencer; nothing is rolled back here.
    pub async fn allocate(
        &self,
        provider: &dyn CloudProvider,
        topology: &Topology,
        allocation: &mut NetworkAllocation,
        dry_run: bool,
    ) -> Result<()> {
        let deployment = allocation.deployment.clone();
        info!(deployment = %deployment, cidr = NETWORK_CIDR, "allocating network");

        let vpc = provider.create_vpc(NETWORK_CIDR, dry_run).await?;
        allocation.vpc = Some(vpc.clone());

        let gateway = provider.create_internet_gateway(dry_run).await?;
        allocation.gateway = Some(gateway.clone());
        provider
            .attach_internet_gateway(&gateway, &vpc, dry_run)
            .await?;

        let route_table = provider.create_route_table(&vpc, dry_run).await?;
        allocation.route_table = Some(route_table.clone());
        provider
            .create_route(&route_table, ANYWHERE, &gateway, dry_run)
            .await?;

        for (index, cluster) in topology.clusters().iter().enumerate() {
            let cidr = subnet_cidr(index)?;
            let subnet = provider.create_subnet(&vpc, &cidr, dry_run).await?;
            info!(cluster = %cluster.name, subnet = %subnet, cidr = %cidr, "subnet created");
            allocation.subnets.push(subnet.clone());

            if cluster.attrs.internet {
                let association = provider
                    .associate_route_table(&route_table, &subnet, dry_run)
                    .await?;
                allocation.associations.push(association);
            }
        }

        for cluster in topology.clusters() {
            let group = provider
                .create_security_group(
                    &vpc,
                    &format!("{deployment}-{}", cluster.name),
                    &format!("{} traffic in {deployment}", cluster.name),
                    dry_run,
                )
                .await?;
            allocation.security_groups.push(group.clone());

            provider
                .authorize_ingress(&group, &IngressRule::all_ports(NETWORK_CIDR), dry_run)
                .await?;
            for &port in &cluster.attrs.expose {
                provider
                    .authorize_ingress(&group, &IngressRule::port(port, ANYWHERE), dry_run)
                    .await?;
            }
            info!(
                cluster = %cluster.name,
                group = %group,
                exposed = cluster.attrs.expose.len(),
                "security group created"
            );
        }

        provider
            .create_tags(
                &allocation.resource_ids(),
                RESOURCE_TAG_KEY,
                &deployment,
                dry_run,
            )
            .await?;

        info!(deployment = %deployment, "network allocation complete");
        Ok(())
    }

    /// Delete everything in the allocation, in dependency order.
    ///
    /// Associations and the route table go before the gateway; the gateway is
    /// detached before deletion; the network itself goes last. Each deletion
    /// failure is logged and skipped so one stuck resource never blocks the
    /// rest.
    pub async fn release(
        &self,
        provider: &dyn CloudProvider,
        allocation: &NetworkAllocation,
        dry_run: bool,
    ) {
        info!(deployment = %allocation.deployment, "releasing network resources");

        for association in &allocation.associations {
            log_failure(
                "disassociate route table",
                association,
                provider.disassociate_route_table(association, dry_run).await,
            );
        }
        if let Some(route_table) = &allocation.route_table {
            log_failure(
                "delete route table",
                route_table,
                provider.delete_route_table(route_table, dry_run).await,
            );
        }
        if let Some(gateway) = &allocation.gateway {
            if let Some(vpc) = &allocation.vpc {
                log_failure(
                    "detach gateway",
                    gateway,
                    provider.detach_internet_gateway(gateway, vpc, dry_run).await,
                );
            }
            log_failure(
                "delete gateway",
                gateway,
                provider.delete_internet_gateway(gateway, dry_run).await,
            );
        }
        for subnet in &allocation.subnets {
            log_failure(
                "delete subnet",
                subnet,
                provider.delete_subnet(subnet, dry_run).await,
            );
        }
        for group in &allocation.security_groups {
            log_failure(
                "delete security group",
                group,
                provider.delete_security_group(group, dry_run).await,
            );
        }
        if let Some(vpc) = &allocation.vpc {
            log_failure("delete network", vpc, provider.delete_vpc(vpc, dry_run).await);
        }
    }
}

fn log_failure<T>(operation: &str, resource: &str, result: Result<T>) {
    if let Err(e) = result {
        warn!(
            operation = operation,
            resource = resource,
            error = %e,
            "teardown step failed, continuing"
        );
    }
}
