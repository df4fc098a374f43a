//! Instance launch requests
//!
//! Launches the instances of each cluster against the subnets and security
//! groups allocated by the network provisioner. Launch requests are not
//! retried: a failed request is a provision error, and whatever was already
//! launched is handed to the teardown sequencer.

use tracing::info;

use crate::network::NetworkAllocation;
use crate::provider::{
    CloudProvider, Fleet, InstanceRecord, InstanceState, KeyMaterial, LaunchRequest,
};
use crate::topology::{Cluster, Topology};
use crate::{Error, Result};

/// Launch one cluster's instances on its subnet and security group.
///
/// Requests exactly `cluster.attrs.count` instances, set to terminate on
/// instance-initiated shutdown, and returns one pending record per instance.
pub async fn launch_cluster(
    provider: &dyn CloudProvider,
    cluster: &Cluster,
    cluster_index: usize,
    subnet: &str,
    security_group: &str,
    key_name: &str,
    dry_run: bool,
) -> Result<Vec<InstanceRecord>> {
    let request = LaunchRequest {
        subnet: subnet.to_string(),
        security_group: security_group.to_string(),
        image: cluster.attrs.image.clone(),
        itype: cluster.attrs.itype.clone(),
        count: cluster.attrs.count,
        key_name: key_name.to_string(),
        public_ip: cluster.attrs.internet,
        terminate_on_shutdown: true,
    };

    let ids = provider.run_instances(&request, dry_run).await?;
    info!(
        cluster = %cluster.name,
        count = ids.len(),
        image = %cluster.attrs.image,
        itype = %cluster.attrs.itype,
        "instances requested"
    );

    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(index, id)| InstanceRecord {
            id,
            cluster: cluster_index,
            index,
            state: InstanceState::Pending,
            private_ip: None,
            public_ip: None,
        })
        .collect())
}

/// Launch every cluster in the fleet topology, in index order, filling
/// `fleet` as each cluster's records arrive.
///
/// On failure the records of clusters launched before the error stay in
/// `fleet`, so the teardown sequencer terminates them even when a later
/// cluster never came up.
pub async fn launch_fleet(
    provider: &dyn CloudProvider,
    topology: &Topology,
    allocation: &NetworkAllocation,
    key_name: &str,
    fleet: &mut Fleet,
    dry_run: bool,
) -> Result<()> {
    for (index, cluster) in topology.clusters().iter().enumerate() {
        let subnet = allocation
            .subnets
            .get(index)
            .ok_or_else(|| Error::provision(format!("no subnet for cluster '{}'", cluster.name)))?;
        let group = allocation.security_groups.get(index).ok_or_else(|| {
            Error::provision(format!("no security group for cluster '{}'", cluster.name))
        })?;

        let records =
            launch_cluster(provider, cluster, index, subnet, group, key_name, dry_run).await?;
        fleet.clusters.push(records);
    }
    Ok(())
}

/// Create the run's key pair, recovering from a leftover key of the same name.
///
/// A key pair from an earlier run with the same deployment name makes the
/// create call conflict; the leftover is deleted and the key re-created once.
pub async fn ensure_key_pair(
    provider: &dyn CloudProvider,
    name: &str,
    dry_run: bool,
) -> Result<KeyMaterial> {
    match provider.create_key_pair(name, dry_run).await {
        Ok(material) => Ok(material),
        Err(e) => {
            info!(key = %name, error = %e, "key pair creation conflicted, re-creating");
            provider.delete_key_pair(name, dry_run).await?;
            provider.create_key_pair(name, dry_run).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::network::NetworkProvisioner;
    use crate::provider::MockCloud;

    async fn provisioned(
        mock: &MockCloud,
        source: &str,
    ) -> (Topology, NetworkAllocation) {
        let topology = Topology::load(source, &HashMap::new())
            .unwrap()
            .with_bastion();
        let mut allocation = NetworkAllocation::new("test");
        NetworkProvisioner
            .allocate(mock, &topology, &mut allocation, false)
            .await
            .unwrap();
        (topology, allocation)
    }

    #[tokio::test]
    async fn launches_count_instances_per_cluster() {
        let mock = MockCloud::new();
        let (topology, allocation) =
            provisioned(&mock, r#"{"clusters": [{"name": "workers", "count": 3}]}"#).await;
        let key = ensure_key_pair(&mock, "test", false).await.unwrap();

        let mut fleet = Fleet::default();
        launch_fleet(&mock, &topology, &allocation, &key.name, &mut fleet, false)
            .await
            .unwrap();

        assert_eq!(fleet.clusters.len(), 2);
        assert_eq!(fleet.clusters[0].len(), 1); // bastion
        assert_eq!(fleet.clusters[1].len(), 3);
        assert!(fleet.iter().all(|r| r.state == InstanceState::Pending));
        assert!(fleet.iter().all(|r| r.private_ip.is_none()));

        let record = &fleet.clusters[1][2];
        assert_eq!(record.cluster, 1);
        assert_eq!(record.index, 2);
    }

    #[tokio::test]
    async fn key_pair_conflict_is_recovered_once() {
        let mock = MockCloud::new();
        mock.seed_key_pair("salvo");

        let key = ensure_key_pair(&mock, "salvo", false).await.unwrap();
        assert_eq!(key.name, "salvo");
        assert!(key.private_key.contains("PRIVATE KEY"));
        assert!(mock.key_pair_exists("salvo"));
    }

    #[tokio::test]
    async fn launch_failure_is_not_retried() {
        let mock = MockCloud::new();
        let (topology, allocation) =
            provisioned(&mock, r#"{"clusters": [{"name": "workers"}]}"#).await;
        mock.fail_creation_of("instance");
        let key = ensure_key_pair(&mock, "test", false).await.unwrap();

        let mut fleet = Fleet::default();
        let err = launch_fleet(&mock, &topology, &allocation, &key.name, &mut fleet, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provision error"));
        assert!(fleet.is_empty());
        assert_eq!(mock.live_instances(), 0);
    }

    #[tokio::test]
    async fn partial_launch_is_kept_for_teardown() {
        let mock = MockCloud::new();
        let (topology, allocation) = provisioned(
            &mock,
            r#"{"clusters": [{"name": "workers", "count": 2, "internet": false}]}"#,
        )
        .await;
        // The bastion launches, the workers cluster does not
        mock.fail_launch_call(1);
        let key = ensure_key_pair(&mock, "test", false).await.unwrap();

        let mut fleet = Fleet::default();
        let err = launch_fleet(&mock, &topology, &allocation, &key.name, &mut fleet, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provision error"));

        // The bastion record survives the failure for the teardown sequencer
        assert_eq!(fleet.clusters.len(), 1);
        assert_eq!(fleet.len(), 1);
        assert_eq!(mock.live_instances(), 1);
    }
}
