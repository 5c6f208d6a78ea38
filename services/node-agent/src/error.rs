//! Node agent errors and their wire mapping.

use fleet_bus::BusError;
use fleet_id::InstanceId;
use fleet_messages::{ErrorKind, ErrorPayload, MessageError};
use thiserror::Error;

use crate::backend::BackendError;
use crate::process::ProcessError;
use crate::resources::ResourceError;
use crate::state::StateStoreError;

/// Why a node-side request failed. Every variant maps to a wire
/// [`ErrorKind`], so requesters always get an explicit failure reply.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("malformed request: {0}")]
    Malformed(#[from] MessageError),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("no binding for {application_id} on {instance_id}")]
    BindingNotFound {
        instance_id: InstanceId,
        application_id: String,
    },

    #[error("resource exhausted: {0}")]
    Resource(#[from] ResourceError),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("persistence error: {0}")]
    Store(#[from] StateStoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Malformed(_) => ErrorKind::MalformedRequest,
            AgentError::InstanceNotFound(_) | AgentError::BindingNotFound { .. } => {
                ErrorKind::NotFound
            }
            AgentError::Resource(_) => ErrorKind::ResourceExhausted,
            AgentError::Process(_) => ErrorKind::ProcessSpawnFailure,
            AgentError::Store(_) => ErrorKind::PersistenceFailure,
            AgentError::Backend(BackendError::InvalidPlan(_)) => ErrorKind::InvalidPlan,
            AgentError::Backend(_) | AgentError::Bus(_) => ErrorKind::BackendFailure,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.kind(), self.to_string())
    }
}
