//! permsync - incremental permission propagation
//!
//! Keeps source-tagged grants in sync with declarative rules by replaying
//! an append-only audit trail. All modules are public for integrators and
//! tests.

pub mod audit;
pub mod authz;
pub mod cursors;
pub mod engine;
pub mod entities;
pub mod errors;
pub mod grants;
pub mod jobs;
pub mod lock;
pub mod rules;
pub mod scheduler;
pub mod settings;
pub mod storage;

pub use engine::{ensure_owner_permissions, RunReport};
pub use errors::SyncError;
pub use scheduler::{ChangeSignal, Propagator};
