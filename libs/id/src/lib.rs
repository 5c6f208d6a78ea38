//! # fleet-id
//!
//! Typed identifiers shared by the provisioner and node agents.
//!
//! Every identifier is rendered as `{prefix}_{ulid}`:
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D` names a node agent and is embedded in
//!   its bus subjects (`kv.provision.node_...`)
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` names a provisioned service instance
//! - `bind_...` names a per-application binding record
//! - `hdl_...` names a provisioner-side service handle
//!
//! The prefix keeps ids from being mixed up across resource types; the ULID
//! part gives 80 bits of randomness, so ids are globally unique without any
//! coordination between nodes.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
