//! Wire payload definitions.
//!
//! Backend-specific data (score inputs, connection fields, credentials)
//! travels as flattened JSON objects next to the fixed fields, so a node
//! announcing `{"id": "node_..", "available_memory": 3840}` decodes into an
//! [`Announcement`] whose `score_inputs` holds `available_memory`.

use bytes::Bytes;
use fleet_id::{BindingId, InstanceId, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::MessageError;

/// Free-form backend fields (score inputs, connection details, credentials).
pub type Fields = Map<String, Value>;

/// Binding options used when a request does not name any.
pub const DEFAULT_BINDING_OPTIONS: &str = "all";

fn default_binding_options() -> String {
    DEFAULT_BINDING_OPTIONS.to_string()
}

// =============================================================================
// Discovery
// =============================================================================

/// A node's self-reported capacity, sent on discover and on the announce timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: NodeId,

    #[serde(flatten)]
    pub score_inputs: Fields,
}

impl Announcement {
    pub fn new(id: NodeId, score_inputs: Fields) -> Self {
        Self { id, score_inputs }
    }

    /// The announced `available_memory` score input, if present and numeric.
    pub fn available_memory(&self) -> Option<f64> {
        self.score_inputs
            .get("available_memory")
            .and_then(Value::as_f64)
    }
}

// =============================================================================
// Provisioning
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub plan: String,
}

/// Successful provision reply: ids plus backend connection fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub instance_id: InstanceId,
    pub node_id: NodeId,

    #[serde(flatten)]
    pub connection: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprovisionRequest {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprovisionResponse {
    pub instance_id: InstanceId,
    pub unprovisioned: bool,
}

// =============================================================================
// Binding
// =============================================================================

/// Identifies one binding: re-binding with the same key is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingKey {
    pub instance_id: InstanceId,
    pub application_id: String,
    #[serde(default = "default_binding_options")]
    pub binding_options: String,
}

impl BindingKey {
    pub fn new(instance_id: InstanceId, application_id: impl Into<String>) -> Self {
        Self {
            instance_id,
            application_id: application_id.into(),
            binding_options: default_binding_options(),
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.binding_options = options.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindResponse {
    pub binding_id: BindingId,
    pub instance_id: InstanceId,
    pub application_id: String,

    #[serde(flatten)]
    pub credentials: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindResponse {
    pub instance_id: InstanceId,
    pub application_id: String,
    pub unbound: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure categories a node reports back to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No free port or not enough memory.
    ResourceExhausted,
    /// The backing process could not be started.
    ProcessSpawnFailure,
    /// The instance store rejected a write.
    PersistenceFailure,
    /// The referenced instance or binding does not exist.
    NotFound,
    /// The request payload could not be decoded.
    MalformedRequest,
    /// The backend hook failed.
    BackendFailure,
    /// The plan is not offered by this node.
    InvalidPlan,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ProcessSpawnFailure => "process_spawn_failure",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::BackendFailure => "backend_failure",
            ErrorKind::InvalidPlan => "invalid_plan",
        };
        write!(f, "{}", s)
    }
}

/// Explicit failure reply. Nodes never drop a request that has a reply subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

/// A reply that is either an [`ErrorPayload`] or the success payload `T`.
///
/// The error shape is tried first: success payloads never carry an `error`
/// field, while flattened success payloads would otherwise swallow errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Err(ErrorPayload),
    Ok(T),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, ErrorPayload> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(err) => Err(err),
        }
    }
}

impl<T> From<Result<T, ErrorPayload>> for Reply<T> {
    fn from(result: Result<T, ErrorPayload>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(err) => Reply::Err(err),
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a payload as JSON bytes.
pub fn encode<T: Serialize>(payload: &T) -> Result<Bytes, MessageError> {
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

/// Decodes a JSON payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, MessageError> {
    if payload.is_empty() {
        return Err(MessageError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}
