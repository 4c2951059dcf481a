//! Identifier Allocators
//!
//! One range-search algorithm serves both global pools: replication minor
//! numbers and TCP ports.

mod dynamic;
mod range;

pub use dynamic::DynamicNumberPool;
pub use range::get_free_number;

/// Name of the minor number pool
pub const MINOR_NUMBER_POOL: &str = "minor number";

/// Name of the TCP port pool
pub const TCP_PORT_POOL: &str = "TCP port";
