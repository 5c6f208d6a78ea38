//! Fleet Node Agent Library
//!
//! The node agent runs on each worker host. It answers discovery with its
//! current capacity, provisions service instances (port, memory, a detached
//! backing process and a durable record), binds applications to them and
//! tears them down again. On restart it recovers every persisted instance
//! before it starts listening.
//!
//! ## Architecture
//!
//! ```text
//! NodeAgent
//! ├── StateStore          (SQLite: node id, instances, bindings)
//! ├── Resources           (free-port pool + memory ledger)
//! ├── ProcessSupervisor   (detached processes: start / is_alive / stop)
//! ├── Backend             (service-specific hooks, run on the blocking pool)
//! └── loops               (one per subscribed subject + the announce loop)
//! ```
//!
//! ## Modules
//!
//! - `agent`: bus handlers and the provision/unprovision/bind/unbind flows
//! - `backend`: the `Backend` hook trait, `ProcessBackend` and `MockBackend`
//! - `process`: detached process supervision
//! - `recovery`: startup recovery
//! - `resources`: port pool and memory ledger
//! - `state`: local SQLite state persistence

pub mod agent;
pub mod announce;
pub mod backend;
pub mod config;
pub mod error;
pub mod process;
pub mod recovery;
pub mod resources;
pub mod state;

// Re-export commonly used types
pub use agent::{NodeAgent, RunningAgent};
pub use backend::{Backend, MockBackend, ProcessBackend};
pub use config::Config;
pub use error::AgentError;
pub use recovery::RecoveryReport;
