//! Access Levels, Privileges and Subjects

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Access Type
// =============================================================================

/// Totally ordered access level: `View < Use < Change < Control`
///
/// Holding a level implies holding every lower level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessType {
    /// Read the object
    View,
    /// Link other objects to the object
    Use,
    /// Modify the object's data
    Change,
    /// Delete the object and edit its access control list
    Control,
}

impl AccessType {
    pub const ALL: [AccessType; 4] = [
        AccessType::View,
        AccessType::Use,
        AccessType::Change,
        AccessType::Control,
    ];

    /// Check if this level satisfies `requested`
    #[inline]
    pub fn has_access(self, requested: AccessType) -> bool {
        self >= requested
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessType::View => "VIEW",
            AccessType::Use => "USE",
            AccessType::Change => "CHANGE",
            AccessType::Control => "CONTROL",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VIEW" => Ok(AccessType::View),
            "USE" => Ok(AccessType::Use),
            "CHANGE" => Ok(AccessType::Change),
            "CONTROL" => Ok(AccessType::Control),
            _ => Err(Error::InvalidName {
                kind: "access type",
                name: s.to_string(),
                reason: "expected one of VIEW, USE, CHANGE, CONTROL".into(),
            }),
        }
    }
}

// =============================================================================
// Privileges
// =============================================================================

/// Privileges that override object-level access control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// VIEW access to every object
    ObjView,
    /// USE access to every object
    ObjUse,
    /// CHANGE access to every object
    ObjChange,
    /// CONTROL access to every object
    ObjControl,
    /// Change the owner of any object
    ObjOwner,
    /// All privileges
    SysAll,
}

impl Privilege {
    pub fn bits(self) -> u64 {
        match self {
            Privilege::ObjView => 0x1,
            Privilege::ObjUse => 0x2,
            Privilege::ObjChange => 0x4,
            Privilege::ObjControl => 0x8,
            Privilege::ObjOwner => 0x10,
            Privilege::SysAll => 0xFFFF_FFFF_FFFF_FFFF,
        }
    }
}

/// Privilege limit of a subject and the subset currently enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrivilegeSet {
    limit: u64,
    enabled: u64,
}

impl PrivilegeSet {
    /// No privileges at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Privileges up to `limit`, none enabled yet
    pub fn with_limit(limit: &[Privilege]) -> Self {
        Self {
            limit: limit.iter().fold(0, |acc, p| acc | p.bits()),
            enabled: 0,
        }
    }

    /// Every privilege enabled
    pub fn all() -> Self {
        Self {
            limit: Privilege::SysAll.bits(),
            enabled: Privilege::SysAll.bits(),
        }
    }

    /// Enable privileges within the limit
    pub fn enable(&mut self, privileges: &[Privilege]) -> Result<()> {
        for privilege in privileges {
            if self.limit & privilege.bits() != privilege.bits() {
                return Err(Error::AccessDenied {
                    object: format!("privilege {:?}", privilege),
                    requested: AccessType::Control,
                });
            }
            self.enabled |= privilege.bits();
        }
        Ok(())
    }

    pub fn disable(&mut self, privileges: &[Privilege]) {
        for privilege in privileges {
            self.enabled &= !privilege.bits();
        }
    }

    pub fn has_privilege(&self, privilege: Privilege) -> bool {
        let effective = self.enabled & self.limit;
        effective & privilege.bits() == privilege.bits()
    }

    /// Highest access level granted by the enabled object privileges
    pub fn access_override(&self) -> Option<AccessType> {
        [
            (Privilege::ObjControl, AccessType::Control),
            (Privilege::ObjChange, AccessType::Change),
            (Privilege::ObjUse, AccessType::Use),
            (Privilege::ObjView, AccessType::View),
        ]
        .into_iter()
        .find(|(privilege, _)| self.has_privilege(*privilege))
        .map(|(_, access)| access)
    }
}

// =============================================================================
// Subjects
// =============================================================================

macro_rules! subject_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Subject names are case-insensitive and stored upper-cased
            pub fn new(name: impl AsRef<str>) -> Self {
                Self(name.as_ref().to_ascii_uppercase())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

subject_name!(
    /// Authenticated identity of a subject
    Identity
);

subject_name!(
    /// Role a subject acts in; access control lists grant levels to roles
    Role
);

pub const SYSTEM_NAME: &str = "SYSTEM";
pub const PUBLIC_NAME: &str = "PUBLIC";

impl Identity {
    pub fn system() -> Self {
        Self::new(SYSTEM_NAME)
    }

    pub fn public() -> Self {
        Self::new(PUBLIC_NAME)
    }
}

impl Role {
    pub fn system() -> Self {
        Self::new(SYSTEM_NAME)
    }

    pub fn public() -> Self {
        Self::new(PUBLIC_NAME)
    }
}

// =============================================================================
// Access Context
// =============================================================================

/// Subject on whose behalf an operation runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub identity: Identity,
    pub role: Role,
    pub privileges: PrivilegeSet,
}

impl AccessContext {
    pub fn new(identity: Identity, role: Role, privileges: PrivilegeSet) -> Self {
        Self {
            identity,
            role,
            privileges,
        }
    }

    /// Context of the controller itself, with every privilege enabled
    pub fn system() -> Self {
        Self::new(Identity::system(), Role::system(), PrivilegeSet::all())
    }

    /// Unprivileged context
    pub fn public() -> Self {
        Self::new(Identity::public(), Role::public(), PrivilegeSet::none())
    }

    /// Same subject acting in a different role
    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }
}

impl fmt::Display for AccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_type_ordering() {
        assert!(AccessType::View < AccessType::Use);
        assert!(AccessType::Use < AccessType::Change);
        assert!(AccessType::Change < AccessType::Control);

        for held in AccessType::ALL {
            for requested in AccessType::ALL {
                assert_eq!(held.has_access(requested), held >= requested);
            }
        }
    }

    #[test]
    fn test_access_type_parse() {
        assert_eq!("control".parse::<AccessType>().unwrap(), AccessType::Control);
        assert_eq!(AccessType::Use.to_string(), "USE");
        assert!("ADMIN".parse::<AccessType>().is_err());
    }

    #[test]
    fn test_privilege_limit() {
        let mut privs = PrivilegeSet::with_limit(&[Privilege::ObjView, Privilege::ObjUse]);
        assert_eq!(privs.access_override(), None);

        privs.enable(&[Privilege::ObjUse]).unwrap();
        assert_eq!(privs.access_override(), Some(AccessType::Use));
        assert!(privs.enable(&[Privilege::ObjControl]).is_err());

        privs.disable(&[Privilege::ObjUse]);
        assert_eq!(privs.access_override(), None);
    }

    #[test]
    fn test_system_context() {
        let ctx = AccessContext::system();
        assert!(ctx.privileges.has_privilege(Privilege::ObjOwner));
        assert_eq!(ctx.privileges.access_override(), Some(AccessType::Control));

        let public = AccessContext::public();
        assert_eq!(public.privileges.access_override(), None);
        assert_eq!(public.role, Role::new("public"));
    }
}
