//! Volley - ephemeral fleet provisioning for single-shot, multi-worker computations
//!
//! Volley provisions an isolated network of cloud instances (a "salvo") for one
//! multi-worker run, establishes a bastion-proxied connectivity chain between
//! them, hands off to a configuration-management tool to push and run the
//! workload, and tears every allocated resource back down regardless of how the
//! run ended.
//!
//! # Pipeline
//!
//! A run moves through these phases in order, with teardown executing on every
//! exit path:
//!
//! 1. [`topology`] - parse and validate the declarative cluster description
//! 2. [`network`] - allocate the isolated network, subnets, and security groups
//! 3. [`launch`] - request the compute instances for each cluster
//! 4. [`readiness`] - poll every instance until the whole fleet is running
//! 5. [`connectivity`] - derive the bastion-proxied inventory and SSH profile
//! 6. [`deploy`] - probe reachability, then run the deployment tool
//! 7. [`teardown`] - terminate instances and delete network resources
//!
//! # Modules
//!
//! - [`topology`] - declarative cluster topology model
//! - [`provider`] - cloud provider abstraction (create/describe/delete verbs)
//! - [`network`] - network and security-boundary allocation
//! - [`launch`] - instance launch requests
//! - [`readiness`] - concurrent instance-readiness tracking
//! - [`connectivity`] - inventory and SSH profile generation
//! - [`deploy`] - deployment-tool invocation boundary
//! - [`teardown`] - all-paths resource teardown
//! - [`orchestrator`] - the coordinating pipeline
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod connectivity;
pub mod deploy;
pub mod error;
pub mod launch;
pub mod network;
pub mod orchestrator;
pub mod provider;
pub mod readiness;
pub mod teardown;
pub mod topology;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the synthesized bastion cluster, always at index 0 of a fleet
/// topology. User-supplied clusters may not use this name.
pub const BASTION_NAME: &str = "hq";

/// Tag key applied to every cloud resource created for a run, with the
/// deployment name as the value. Used to identify leftovers for manual cleanup.
pub const RESOURCE_TAG_KEY: &str = "volley";
