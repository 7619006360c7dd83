//! Roles ("hats") and the routing table between them.

mod command;
mod registry;
mod role;

pub use command::{CommandRole, EMIT_MARKER, PassthroughRole};
pub use registry::{RoleRegistry, UNTARGETED_KINDS};
pub use role::{Role, RoleContext, RoleOutput};
