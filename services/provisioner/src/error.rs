//! Provisioner error types.

use std::time::Duration;

use fleet_bus::BusError;
use fleet_id::{InstanceId, NodeId};
use fleet_messages::{ErrorKind, ErrorPayload, MessageError};
use thiserror::Error;

/// Result type for provisioner operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Why a provisioner operation failed. Nothing is retried: callers re-invoke.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The bus rejected a publish or subscribe; the operation was lost.
    #[error("bus error: {0}")]
    TransientBus(#[from] BusError),

    /// No node scored above zero within the discovery window.
    #[error("no available node")]
    NoAvailableNode,

    /// The node did not reply before the guard timer fired.
    #[error("node {node_id} did not reply within {timeout:?}")]
    RemoteTimeout { node_id: NodeId, timeout: Duration },

    /// The node replied with an explicit failure.
    #[error("node {node_id} reported {kind}: {message}")]
    Remote {
        node_id: NodeId,
        kind: ErrorKind,
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] MessageError),

    /// No cached handle exists for the instance.
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    /// The cached handle does not say which node owns the instance.
    #[error("handle for {0} does not name its node")]
    MissingNode(InstanceId),
}

impl ProvisionError {
    pub(crate) fn remote(node_id: NodeId, payload: ErrorPayload) -> Self {
        ProvisionError::Remote {
            node_id,
            kind: payload.error,
            message: payload.message,
        }
    }

    /// The node-reported error kind, if the node replied with a failure.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            ProvisionError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
