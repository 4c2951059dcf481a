//! Controller Configuration
//!
//! Number pool ranges and channel sizing, loaded from YAML.

use crate::error::{Error, Result};
use crate::identifier::{MinorNumber, TcpPortNumber};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Inclusive integer range of a number pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberRange {
    pub start: i32,
    pub end: i32,
}

impl NumberRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            (self.end as i64 - self.start as i64 + 1) as u64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, what: &str, min: i32, max: i32) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Configuration(format!(
                "{} range {}..={} is empty",
                what, self.start, self.end
            )));
        }
        if self.start < min || self.end > max {
            return Err(Error::Configuration(format!(
                "{} range {}..={} exceeds {}..={}",
                what, self.start, self.end, min, max
            )));
        }
        Ok(())
    }
}

/// Configuration of the metadata core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Replication minor numbers handed out to volume definitions
    pub minor_range: NumberRange,
    /// TCP ports handed out to resource definitions
    pub tcp_port_range: NumberRange,
    /// Capacity of the committed event broadcast channel
    pub event_channel_capacity: usize,
    /// Peer slots of new resource definitions
    pub default_peer_slots: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            minor_range: NumberRange::new(1000, 49999),
            tcp_port_range: NumberRange::new(7000, 7999),
            event_channel_capacity: 1024,
            default_peer_slots: 7,
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading configuration");
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        self.minor_range
            .validate("minor number", MinorNumber::MIN, MinorNumber::MAX)?;
        self.tcp_port_range
            .validate("TCP port", TcpPortNumber::MIN, TcpPortNumber::MAX)?;
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration(
                "event_channel_capacity must be positive".into(),
            ));
        }
        if self.default_peer_slots == 0 || self.default_peer_slots > 31 {
            return Err(Error::Configuration(format!(
                "default_peer_slots {} not within 1..=31",
                self.default_peer_slots
            )));
        }
        Ok(())
    }
}
