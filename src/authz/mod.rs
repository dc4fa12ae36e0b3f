//! Read-side authorization against the Grant Store.

pub mod engine;
pub mod types;

pub use engine::user_has_all_permissions;
pub use types::{RequiredPermission, ResourceKeys};
