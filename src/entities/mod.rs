pub mod audit_event;
pub mod engine_lock;
pub mod group;
pub mod group_membership;
pub mod group_permission;
pub mod permission;
pub mod permission_cursor;
pub mod propagation_run;
pub mod user_permission;

pub use audit_event::Entity as AuditEvent;
pub use engine_lock::Entity as EngineLock;
pub use group::Entity as Group;
pub use group_membership::Entity as GroupMembership;
pub use group_permission::Entity as GroupPermission;
pub use permission::Entity as Permission;
pub use permission_cursor::Entity as PermissionCursor;
pub use propagation_run::Entity as PropagationRun;
pub use user_permission::Entity as UserPermission;
