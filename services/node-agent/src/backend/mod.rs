//! Backend hooks.
//!
//! A [`Backend`] supplies everything service-specific: how much memory a plan
//! gets, what process to launch, which credentials to hand out and what score
//! inputs to announce. The agent owns resources, persistence and the bus.
//!
//! Hook methods are synchronous and may block (e.g. shelling out to an admin
//! tool); the agent always calls them on tokio's blocking pool.

use std::path::PathBuf;

use fleet_id::InstanceId;
use fleet_messages::Fields;
use serde_json::json;
use thiserror::Error;

use crate::process::LaunchSpec;
use crate::state::{BindingRecord, InstanceRecord};

mod daemon;
mod mock;

pub use daemon::ProcessBackend;
pub use mock::MockBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("plan not offered: {0}")]
    InvalidPlan(String),

    #[error("backend failed: {0}")]
    Failed(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the agent has reserved for a new instance before calling the backend.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub instance_id: InstanceId,
    pub plan: String,
    pub port: Option<u16>,
    pub memory_mb: u64,
    pub workdir: PathBuf,
    pub host: String,
}

/// The backend's answer to a provision request.
#[derive(Debug, Clone, Default)]
pub struct InstanceSetup {
    /// Connection fields returned to the provisioner and stored with the record.
    pub credentials: Fields,

    /// Process to launch, if the backend runs one per instance.
    pub launch: Option<LaunchSpec>,
}

/// Current node capacity, handed to [`Backend::announcement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub available_memory_mb: u64,
    pub capacity_mb: u64,
    pub free_ports: usize,
}

/// Service-specific behavior plugged into the node agent.
pub trait Backend: Send + Sync + 'static {
    /// Memory allocated to an instance of `plan`, in MB.
    fn memory_for_plan(&self, plan: &str) -> Result<u64, BackendError>;

    /// Whether instances need a port from the node's pool.
    fn uses_port(&self) -> bool {
        true
    }

    /// Prepare a new instance.
    fn provision(&self, request: &InstanceRequest) -> Result<InstanceSetup, BackendError>;

    /// Clean up service-side state after the process has been stopped.
    fn unprovision(
        &self,
        _record: &InstanceRecord,
        _bindings: &[BindingRecord],
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Credentials for one application's binding.
    fn bind(
        &self,
        record: &InstanceRecord,
        application_id: &str,
        binding_options: &str,
    ) -> Result<Fields, BackendError>;

    /// Revoke one application's binding.
    fn unbind(&self, _record: &InstanceRecord, _binding: &BindingRecord) -> Result<(), BackendError> {
        Ok(())
    }

    /// Score inputs announced to provisioners.
    fn announcement(&self, capacity: &Capacity) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            "available_memory".to_string(),
            json!(capacity.available_memory_mb),
        );
        fields
    }
}
