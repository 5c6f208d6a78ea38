//! # fleet-messages
//!
//! The wire contract between provisioners and node agents.
//!
//! ## Subjects
//!
//! All subjects live under a per-service namespace (`{svc}`):
//!
//! | Subject                     | Direction                         |
//! |-----------------------------|-----------------------------------|
//! | `{svc}.discover`            | provisioner → all nodes, reply    |
//! | `{svc}.announce`            | node → provisioners (unsolicited) |
//! | `{svc}.provision.{node}`    | provisioner → one node, reply     |
//! | `{svc}.unprovision.{node}`  | provisioner → one node            |
//! | `{svc}.bind.{node}`         | provisioner → one node, reply     |
//! | `{svc}.unbind.{node}`       | provisioner → one node, reply     |
//!
//! ## Payloads
//!
//! Payloads are JSON. Replies are either the success payload or an
//! [`ErrorPayload`]; [`Reply`] decodes both shapes.

mod error;
mod payloads;
mod subjects;

pub use error::MessageError;
pub use payloads::*;
pub use subjects::Subjects;
