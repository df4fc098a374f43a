//! Declarative cluster topology model
//!
//! A topology describes the clusters to provision for one run: each cluster is
//! a named, homogeneous group of instances sharing an image, instance type,
//! count, and network-exposure policy. Topologies are parsed from a JSON
//! document of the form:
//!
//! ```json
//! {
//!   "clusters": [
//!     { "name": "workers", "count": 4, "internet": false },
//!     { "name": "frontend", "internet": true, "expose": [80, 443] }
//!   ]
//! }
//! ```
//!
//! Attribute values may be indirected through a parameter table supplied at
//! load time: a string value prefixed with `$` is replaced by the named
//! parameter before type validation, so `"count": "$workers"` with
//! `--set workers:8` launches eight instances.
//!
//! The bastion cluster (named [`BASTION_NAME`]) is never part of a loaded
//! topology; the orchestrator prepends it via [`Topology::with_bastion`].

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result, BASTION_NAME};

/// Default machine image (Ubuntu Server 14.04 LTS)
pub const DEFAULT_IMAGE: &str = "ami-d05e75b8";

/// Default instance type
pub const DEFAULT_INSTANCE_TYPE: &str = "t2.nano";

/// Raw shape of a topology document
#[derive(Debug, Deserialize)]
struct TopologyDoc {
    clusters: Vec<serde_json::Map<String, Value>>,
}

/// An ordered, immutable sequence of cluster descriptors
#[derive(Debug, Clone)]
pub struct Topology {
    clusters: Vec<Cluster>,
}

impl Topology {
    /// Parse and validate a topology document.
    ///
    /// Fails with a config error if any cluster uses the reserved bastion
    /// name, if a cluster name is duplicated, if an attribute key is
    /// unrecognized, if a `$`-prefixed value references an undefined
    /// parameter, if an exposed-port set is declared on a cluster that is not
    /// internet-reachable, or if an instance count is zero.
    ///
    /// The returned topology never contains the bastion; callers prepend it
    /// with [`Topology::with_bastion`].
    pub fn load(source: &str, parameters: &HashMap<String, String>) -> Result<Self> {
        let doc: TopologyDoc = serde_json::from_str(source)
            .map_err(|e| Error::config(format!("invalid topology document: {e}")))?;

        let mut seen = HashSet::new();
        let mut clusters = Vec::with_capacity(doc.clusters.len());
        for spec in &doc.clusters {
            let name = spec
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::config("cluster is missing a 'name' string"))?;

            if name == BASTION_NAME {
                return Err(Error::config(format!(
                    "cluster name '{BASTION_NAME}' is reserved for the bastion"
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(Error::config(format!("duplicate cluster name '{name}'")));
            }

            clusters.push(Cluster::from_spec(name, spec, parameters)?);
        }

        debug!(clusters = clusters.len(), "topology loaded");
        Ok(Self { clusters })
    }

    /// Build the fleet topology for a run by prepending the synthesized
    /// bastion cluster at index 0.
    pub fn with_bastion(self) -> Self {
        let mut clusters = Vec::with_capacity(self.clusters.len() + 1);
        clusters.push(Cluster::bastion());
        clusters.extend(self.clusters);
        Self { clusters }
    }

    /// The cluster descriptors, in declaration order
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Number of clusters in the topology
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Returns true if the topology has no clusters
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Total number of instances across all clusters
    pub fn instance_count(&self) -> u32 {
        self.clusters.iter().map(|c| c.attrs.count).sum()
    }
}

/// A named, homogeneous group of compute instances
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Cluster name, unique within a topology
    pub name: String,
    /// Validated cluster attributes
    pub attrs: ClusterAttrs,
}

/// Typed cluster attributes with defaults applied
///
/// Attributes are validated at construction: unknown keys and values of the
/// wrong shape are rejected when the topology is loaded, not at first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAttrs {
    /// Ports opened to inbound traffic from any source. A cluster may expose
    /// ports only if it is internet-reachable.
    pub expose: BTreeSet<u16>,
    /// Whether instances get a public address and a route to the internet
    pub internet: bool,
    /// Machine image identifier
    pub image: String,
    /// Instance type
    pub itype: String,
    /// Number of instances to launch, at least 1
    pub count: u32,
}

impl Default for ClusterAttrs {
    fn default() -> Self {
        Self {
            expose: BTreeSet::new(),
            internet: true,
            image: DEFAULT_IMAGE.to_string(),
            itype: DEFAULT_INSTANCE_TYPE.to_string(),
            count: 1,
        }
    }
}

impl Cluster {
    /// The synthesized bastion cluster: a single internet-reachable instance
    /// exposing SSH, acting as the sole proxy hop into the private network.
    pub fn bastion() -> Self {
        Self {
            name: BASTION_NAME.to_string(),
            attrs: ClusterAttrs {
                expose: BTreeSet::from([22]),
                internet: true,
                ..ClusterAttrs::default()
            },
        }
    }

    /// Returns true if this is the synthesized bastion cluster
    pub fn is_bastion(&self) -> bool {
        self.name == BASTION_NAME
    }

    /// Build a cluster from a raw attribute map, applying defaults and
    /// resolving `$`-prefixed parameter references.
    fn from_spec(
        name: &str,
        spec: &serde_json::Map<String, Value>,
        parameters: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut attrs = ClusterAttrs::default();

        for (key, value) in spec {
            let value = resolve(name, value, parameters)?;
            match key.as_str() {
                "name" => {}
                "expose" => attrs.expose = parse_ports(name, &value, parameters)?,
                "internet" => attrs.internet = parse_bool(name, "internet", &value)?,
                "image" => attrs.image = parse_string(name, "image", &value)?,
                "itype" => attrs.itype = parse_string(name, "itype", &value)?,
                "count" => attrs.count = parse_count(name, &value)?,
                other => {
                    return Err(Error::config(format!(
                        "cluster '{name}': unknown attribute '{other}'"
                    )));
                }
            }
        }

        if !attrs.expose.is_empty() && !attrs.internet {
            return Err(Error::config(format!(
                "cluster '{name}' exposes ports but is not internet-reachable"
            )));
        }
        if attrs.count == 0 {
            return Err(Error::config(format!(
                "cluster '{name}': instance count must be at least 1"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            attrs,
        })
    }
}

/// Replace a `$`-prefixed string value with its entry in the parameter table
fn resolve(cluster: &str, value: &Value, parameters: &HashMap<String, String>) -> Result<Value> {
    match value.as_str() {
        Some(s) if s.starts_with('$') => {
            let key = s.trim_start_matches('$');
            let param = parameters.get(key).ok_or_else(|| {
                Error::config(format!("cluster '{cluster}': undefined parameter '{key}'"))
            })?;
            Ok(Value::String(param.clone()))
        }
        _ => Ok(value.clone()),
    }
}

fn parse_string(cluster: &str, key: &str, value: &Value) -> Result<String> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        Error::config(format!("cluster '{cluster}': '{key}' must be a string"))
    })
}

fn parse_bool(cluster: &str, key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        // Parameter substitutions arrive as strings
        Value::String(s) => s.parse().map_err(|_| {
            Error::config(format!("cluster '{cluster}': '{key}' must be a boolean"))
        }),
        _ => Err(Error::config(format!(
            "cluster '{cluster}': '{key}' must be a boolean"
        ))),
    }
}

fn parse_count(cluster: &str, value: &Value) -> Result<u32> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::config(format!(
            "cluster '{cluster}': 'count' must be a non-negative integer"
        ))
    })
}

fn parse_port(cluster: &str, value: &Value) -> Result<u16> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::config(format!(
            "cluster '{cluster}': 'expose' entries must be port numbers"
        ))
    })
}

fn parse_ports(
    cluster: &str,
    value: &Value,
    parameters: &HashMap<String, String>,
) -> Result<BTreeSet<u16>> {
    let entries = value.as_array().ok_or_else(|| {
        Error::config(format!(
            "cluster '{cluster}': 'expose' must be an array of ports"
        ))
    })?;
    entries
        .iter()
        .map(|v| {
            let v = resolve(cluster, v, parameters)?;
            parse_port(cluster, &v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_params() -> HashMap<String, String> {
        HashMap::new()
    }

    fn load(source: &str) -> Result<Topology> {
        Topology::load(source, &no_params())
    }

    #[test]
    fn loads_clusters_with_defaults() {
        let topology = load(r#"{"clusters": [{"name": "workers"}]}"#).unwrap();

        assert_eq!(topology.len(), 1);
        let cluster = &topology.clusters()[0];
        assert_eq!(cluster.name, "workers");
        assert_eq!(cluster.attrs, ClusterAttrs::default());
        assert!(cluster.attrs.internet);
        assert!(cluster.attrs.expose.is_empty());
        assert_eq!(cluster.attrs.count, 1);
    }

    #[test]
    fn overrides_are_type_checked() {
        let topology = load(
            r#"{"clusters": [
                {"name": "web", "internet": true, "expose": [80, 443], "count": 3,
                 "image": "ami-12345678", "itype": "m4.large"}
            ]}"#,
        )
        .unwrap();

        let attrs = &topology.clusters()[0].attrs;
        assert_eq!(attrs.expose, BTreeSet::from([80, 443]));
        assert_eq!(attrs.count, 3);
        assert_eq!(attrs.image, "ami-12345678");
        assert_eq!(attrs.itype, "m4.large");

        let err = load(r#"{"clusters": [{"name": "web", "count": "lots"}]}"#).unwrap_err();
        assert!(err.to_string().contains("count"));

        let err = load(r#"{"clusters": [{"name": "web", "internet": 7}]}"#).unwrap_err();
        assert!(err.to_string().contains("internet"));
    }

    #[test]
    fn rejects_reserved_bastion_name() {
        let err = load(r#"{"clusters": [{"name": "hq"}]}"#).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err =
            load(r#"{"clusters": [{"name": "a"}, {"name": "a"}]}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_unknown_attribute_at_load_time() {
        let err = load(r#"{"clusters": [{"name": "a", "flavour": "large"}]}"#).unwrap_err();
        assert!(err.to_string().contains("unknown attribute 'flavour'"));
    }

    #[test]
    fn rejects_zero_count_at_load_time() {
        let err = load(r#"{"clusters": [{"name": "a", "count": 0}]}"#).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn exposed_ports_require_internet_reachability() {
        let err = load(
            r#"{"clusters": [{"name": "a", "internet": false, "expose": [80]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not internet-reachable"));

        // An empty expose set is fine on a private cluster
        load(r#"{"clusters": [{"name": "a", "internet": false, "expose": []}]}"#).unwrap();
    }

    #[test]
    fn parameter_references_are_resolved() {
        let params = HashMap::from([
            ("workers".to_string(), "8".to_string()),
            ("img".to_string(), "ami-deadbeef".to_string()),
        ]);
        let topology = Topology::load(
            r#"{"clusters": [{"name": "a", "count": "$workers", "image": "$img"}]}"#,
            &params,
        )
        .unwrap();

        let attrs = &topology.clusters()[0].attrs;
        assert_eq!(attrs.count, 8);
        assert_eq!(attrs.image, "ami-deadbeef");
    }

    #[test]
    fn undefined_parameter_is_a_load_error() {
        let err = load(r#"{"clusters": [{"name": "a", "count": "$missing"}]}"#).unwrap_err();
        assert!(err.to_string().contains("undefined parameter 'missing'"));
    }

    #[test]
    fn load_never_produces_the_bastion() {
        let topology = load(r#"{"clusters": [{"name": "a"}, {"name": "b"}]}"#).unwrap();
        assert!(topology.clusters().iter().all(|c| !c.is_bastion()));

        let fleet = topology.with_bastion();
        assert_eq!(fleet.len(), 3);
        assert!(fleet.clusters()[0].is_bastion());
        assert_eq!(fleet.clusters()[1].name, "a");
        assert_eq!(fleet.clusters()[2].name, "b");
    }

    #[test]
    fn bastion_exposes_ssh_only() {
        let bastion = Cluster::bastion();
        assert!(bastion.attrs.internet);
        assert_eq!(bastion.attrs.expose, BTreeSet::from([22]));
        assert_eq!(bastion.attrs.count, 1);
    }

    #[test]
    fn instance_count_sums_all_clusters() {
        let topology = load(
            r#"{"clusters": [{"name": "a", "count": 2}, {"name": "b", "count": 3}]}"#,
        )
        .unwrap();
        assert_eq!(topology.instance_count(), 5);
        assert_eq!(topology.with_bastion().instance_count(), 6);
    }
}
