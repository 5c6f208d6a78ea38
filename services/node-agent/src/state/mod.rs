//! Local state persistence for node agent.
//!
//! This module provides SQLite-based storage for:
//! - Node state (the persisted node id)
//! - Instance records (plan, port, memory, pid, launch spec, credentials)
//! - Binding records (per-application credentials)
//!
//! The state store enables the agent to recover its instances and resource
//! accounting after restarts.

mod store;

pub use store::{BindingRecord, InstanceRecord, StateStore, StateStoreError};
