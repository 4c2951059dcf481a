//! Bounded Numbers

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! bounded_number {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $min:literal..=$max:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        pub struct $name(i32);

        impl $name {
            pub const MIN: i32 = $min;
            pub const MAX: i32 = $max;

            pub fn new(value: i32) -> Result<Self> {
                if (Self::MIN..=Self::MAX).contains(&value) {
                    Ok(Self(value))
                } else {
                    Err(Error::ValueOutOfRange {
                        kind: $kind,
                        value: value as i64,
                        min: Self::MIN as i64,
                        max: Self::MAX as i64,
                    })
                }
            }

            pub fn value(self) -> i32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<i32> for $name {
            type Error = Error;

            fn try_from(value: i32) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for i32 {
            fn from(number: $name) -> i32 {
                number.0
            }
        }
    };
}

bounded_number!(
    /// Number of a volume inside a resource
    VolumeNumber, "volume number", 0..=65535
);

bounded_number!(
    /// Device minor number of a replicated volume
    MinorNumber, "minor number", 0..=1048575
);

bounded_number!(TcpPortNumber, "TCP port", 1..=65535);

bounded_number!(
    /// Replication peer id of a resource, unique within its definition
    DrbdNodeId, "DRBD node id", 0..=31
);
