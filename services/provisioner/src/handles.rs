//! Provisioned handle cache.
//!
//! Handles live in memory only; after a provisioner restart the surrounding
//! system re-seeds them through [`HandleCache::update_handles`].

use std::collections::HashMap;

use fleet_id::{BindingId, HandleId, InstanceId, NodeId};
use fleet_messages::{Fields, ProvisionResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The record returned to the caller after a successful provision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedHandle {
    /// The instance id, used as the service id by callers.
    pub service_id: InstanceId,

    /// Everything the node returned, including `node_id`.
    pub configuration: Fields,

    /// Connection fields handed to applications.
    pub credentials: Fields,
}

impl ProvisionedHandle {
    pub fn from_response(response: ProvisionResponse) -> Self {
        let mut configuration = response.connection.clone();
        configuration.insert(
            "instance_id".to_string(),
            Value::String(response.instance_id.to_string()),
        );
        configuration.insert(
            "node_id".to_string(),
            Value::String(response.node_id.to_string()),
        );

        Self {
            service_id: response.instance_id,
            configuration,
            credentials: response.connection,
        }
    }

    /// The node owning this instance, read from the node-supplied data.
    pub fn node_id(&self) -> Option<NodeId> {
        self.configuration
            .get("node_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// The record returned after a successful bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingHandle {
    pub service_id: HandleId,
    pub instance_id: InstanceId,
    pub binding_id: BindingId,
    pub application_id: String,
    pub configuration: Fields,
    pub credentials: Fields,
}

/// In-memory map of provisioned handles keyed by instance id.
#[derive(Debug, Default)]
pub struct HandleCache {
    handles: HashMap<InstanceId, ProvisionedHandle>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a handle.
    pub fn insert(&mut self, handle: ProvisionedHandle) {
        self.handles.insert(handle.service_id, handle);
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<&ProvisionedHandle> {
        self.handles.get(instance_id)
    }

    pub fn remove(&mut self, instance_id: &InstanceId) -> Option<ProvisionedHandle> {
        self.handles.remove(instance_id)
    }

    /// Merge externally supplied handles. Only unknown ids are added;
    /// nothing is removed or replaced. Returns the number added.
    pub fn update_handles(&mut self, handles: impl IntoIterator<Item = ProvisionedHandle>) -> usize {
        let mut added = 0;
        for handle in handles {
            if let std::collections::hash_map::Entry::Vacant(entry) =
                self.handles.entry(handle.service_id)
            {
                entry.insert(handle);
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
