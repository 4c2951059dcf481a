//! Checked Names
//!
//! Names keep the spelling they were created with for display, but compare,
//! hash and order on an upper-cased canonical value.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Character rules of one name kind
struct NameRules {
    kind: &'static str,
    min_len: usize,
    max_len: usize,
    first: fn(char) -> bool,
    inner: fn(char) -> bool,
}

fn is_alpha_or_underscore(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_alnum(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_hostname_char(c: char) -> bool {
    is_name_char(c) || c == '.'
}

fn is_free_space_char(c: char) -> bool {
    is_hostname_char(c) || c == ':'
}

fn check_name(rules: &NameRules, name: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidName {
        kind: rules.kind,
        name: name.to_string(),
        reason,
    };

    let len = name.chars().count();
    if len < rules.min_len || len > rules.max_len {
        return Err(invalid(format!(
            "length {} not within {}..={}",
            len, rules.min_len, rules.max_len
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !(rules.first)(first) {
            return Err(invalid(format!("invalid first character '{}'", first)));
        }
    }
    if let Some(bad) = chars.find(|c| !(rules.inner)(*c)) {
        return Err(invalid(format!("invalid character '{}'", bad)));
    }
    Ok(())
}

macro_rules! checked_name {
    (
        $(#[$meta:meta])*
        $name:ident {
            kind: $kind:literal,
            len: $min:literal..=$max:literal,
            first: $first:expr,
            inner: $inner:expr $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            display: String,
            value: String,
        }

        impl $name {
            const RULES: NameRules = NameRules {
                kind: $kind,
                min_len: $min,
                max_len: $max,
                first: $first,
                inner: $inner,
            };

            pub fn new(name: impl AsRef<str>) -> Result<Self> {
                let name = name.as_ref();
                check_name(&Self::RULES, name)?;
                Ok(Self {
                    display: name.to_string(),
                    value: name.to_ascii_uppercase(),
                })
            }

            /// Name as it was given
            pub fn display_name(&self) -> &str {
                &self.display
            }

            /// Upper-cased canonical value
            pub fn value(&self) -> &str {
                &self.value
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.value == other.value
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.value.hash(state)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.value.cmp(&other.value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.display)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.display)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.display
            }
        }
    };
}

checked_name!(
    /// Host name of a cluster node
    NodeName {
        kind: "node name",
        len: 2..=253,
        first: is_alnum,
        inner: is_hostname_char,
    }
);

checked_name!(
    /// Name of a resource definition and its resources
    ResourceName {
        kind: "resource name",
        len: 3..=48,
        first: is_alpha_or_underscore,
        inner: is_name_char,
    }
);

checked_name!(
    /// Name of a storage pool definition and its pools
    StorPoolName {
        kind: "storage pool name",
        len: 3..=48,
        first: is_alpha_or_underscore,
        inner: is_name_char,
    }
);

checked_name!(
    /// Name of a snapshot definition
    SnapshotName {
        kind: "snapshot name",
        len: 3..=48,
        first: is_alpha_or_underscore,
        inner: is_name_char,
    }
);

checked_name!(
    KeyValueStoreName {
        kind: "key value store name",
        len: 3..=48,
        first: is_alpha_or_underscore,
        inner: is_name_char,
    }
);

checked_name!(
    /// Name of a network interface of a node
    NetInterfaceName {
        kind: "network interface name",
        len: 2..=32,
        first: is_alpha_or_underscore,
        inner: is_name_char,
    }
);

checked_name!(
    /// Name of a free space tracker, shared by the pools reporting the same
    /// backing capacity
    FreeSpaceMgrName {
        kind: "free space manager name",
        len: 3..=303,
        first: is_alnum,
        inner: is_free_space_char,
    }
);

impl FreeSpaceMgrName {
    /// Default tracker name of a pool that does not share capacity:
    /// `<node>:<pool>`
    pub fn for_stor_pool(node: &NodeName, stor_pool: &StorPoolName) -> Self {
        let display = format!("{}:{}", node.display_name(), stor_pool.display_name());
        Self {
            value: display.to_ascii_uppercase(),
            display,
        }
    }

    /// Check if this is the default `<node>:<pool>` name of a pool
    pub fn is_default_for(&self, node: &NodeName, stor_pool: &StorPoolName) -> bool {
        *self == Self::for_stor_pool(node, stor_pool)
    }
}
