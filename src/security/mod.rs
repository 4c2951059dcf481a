//! Access Gate
//!
//! Every protected object carries an [`ObjectProtection`]. Callers pass an
//! [`AccessContext`] to each operation and the protection decides whether the
//! requested [`AccessType`] is granted, either through the access control
//! list or through an enabled privilege.

mod access;
mod protection;

pub use access::{
    AccessContext, AccessType, Identity, Privilege, PrivilegeSet, Role, PUBLIC_NAME, SYSTEM_NAME,
};
pub use protection::ObjectProtection;
