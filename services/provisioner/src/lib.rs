//! Fleet Provisioner Library
//!
//! The provisioner locates the best node agent in a fleet it has no directory
//! of, asks it to allocate a service instance, and relays bind/unbind and
//! unprovision requests to the owning node. All communication goes over the
//! bus; there are no persistent connections to nodes.
//!
//! ## Provisioning flow
//!
//! ```text
//! provision_service(plan)
//!   DISCOVERING  publish {svc}.discover, collect replies in a Barrier
//!                sized to the live node count (2s window)
//!   SELECTING    score every announcement, pick the first maximum;
//!                nothing scored > 0 => NoAvailableNode
//!   REQUESTING   request {svc}.provision.{node} with a 2s guard timer
//!   FULFILLED    cache the handle, return it
//!   FAILED       every other path, returned as a ProvisionError
//! ```
//!
//! ## Modules
//!
//! - `barrier`: collects a bounded, time-limited set of concurrent replies
//! - `registry`: recently-announced nodes, used to size the barrier
//! - `scoring`: the `NodeScorer` hook and best-node selection
//! - `handles`: in-memory cache of provisioned handles
//! - `provisioner`: the coordinator tying it all together
//! - `worker`: announce listener and registry sweep loops

pub mod barrier;
pub mod config;
pub mod error;
pub mod handles;
pub mod provisioner;
pub mod registry;
pub mod scoring;
pub mod worker;

pub use barrier::Barrier;
pub use config::ProvisionerConfig;
pub use error::ProvisionError;
pub use handles::{BindingHandle, HandleCache, ProvisionedHandle};
pub use provisioner::Provisioner;
pub use registry::NodeRegistry;
pub use scoring::{select_best_node, AvailableMemoryScorer, NodeScorer};
