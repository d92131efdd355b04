//! Core addressing and configuration types.

use std::fmt;

use clap::ValueEnum;
use serde::Serialize;

use crate::error::{TmError, TmResult};

/// Number of device ports addressed by the reference deployment.
pub const MAX_DEV_PORTS: u32 = 256;

/// Number of consecutive device ports sharing one pipe.
pub const PORTS_PER_PIPE: u32 = 128;

/// Number of logical egress queues per port.
pub const QUEUES_PER_PORT: u32 = 8;

/// A flat device port number in `[0, MAX_DEV_PORTS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DevicePort(u32);

impl DevicePort {
    /// Creates a device port, rejecting values outside the port space.
    pub fn new(port: u32) -> TmResult<Self> {
        if port >= MAX_DEV_PORTS {
            return Err(TmError::invalid_argument(
                "--dev-port",
                format!("{} is outside [0, {})", port, MAX_DEV_PORTS),
            ));
        }
        Ok(Self(port))
    }

    /// Returns the raw port number.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the pipe this port belongs to.
    pub const fn pipe(&self) -> u32 {
        self.0 / PORTS_PER_PIPE
    }

    /// Iterates every device port in the port space.
    pub fn all() -> impl Iterator<Item = DevicePort> {
        (0..MAX_DEV_PORTS).map(DevicePort)
    }
}

impl fmt::Display for DevicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical queue index in `[0, QUEUES_PER_PORT)` as used by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LogicalQueue(u32);

impl LogicalQueue {
    /// Creates a logical queue index, rejecting values outside `0..8`.
    pub fn new(queue: u32) -> TmResult<Self> {
        if queue >= QUEUES_PER_PORT {
            return Err(TmError::invalid_argument(
                "--queue",
                format!("{} is outside [0, {})", queue, QUEUES_PER_PORT),
            ));
        }
        Ok(Self(queue))
    }

    /// Returns the raw index.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the index for slice access.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Iterates all logical queues in order.
    pub fn all() -> impl Iterator<Item = LogicalQueue> {
        (0..QUEUES_PER_PORT).map(LogicalQueue)
    }
}

impl fmt::Display for LogicalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware queue key used by the queue-scoped TM tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QueueKey(pub u32);

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where shaping is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// TM port level.
    #[default]
    Port,
    /// TM queue level.
    Queue,
}

impl Scope {
    /// Returns the CLI spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Port => "port",
            Scope::Queue => "queue",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum Mode {
    /// Configure a shaping rate.
    Apply,
    /// Disable shaping on one target, or on every port.
    Reset,
    /// Poll counters and emit telemetry rows.
    #[default]
    Watch,
}

impl Mode {
    /// Returns the CLI spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Apply => "apply",
            Mode::Reset => "reset",
            Mode::Watch => "watch",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port-group addressing of a device port, read from `tf1.tm.port.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortGroupMapping {
    /// Port group id, negative when unresolved.
    pub pg_id: i64,
    /// Port number inside the port group, negative when unknown.
    pub pg_port_nr: i64,
    /// Logical queue to TM queue key map (at most 8 entries, may be empty).
    pub egress_qid_queues: Vec<i64>,
}

impl PortGroupMapping {
    /// Mapping returned when the port configuration has no usable data.
    pub fn unresolved() -> Self {
        Self {
            pg_id: -1,
            pg_port_nr: -1,
            egress_qid_queues: Vec::new(),
        }
    }

    /// Returns true if the port group id is usable.
    pub fn is_resolved(&self) -> bool {
        self.pg_id_key().is_some()
    }

    /// Returns the port group id as a table key, if resolved.
    pub fn pg_id_key(&self) -> Option<u32> {
        u32::try_from(self.pg_id).ok()
    }
}

/// What a shaping operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapingTarget {
    /// The device port.
    pub dev_port: DevicePort,
    /// Port or queue level.
    pub scope: Scope,
    /// Logical queue, only meaningful for queue scope.
    pub queue: LogicalQueue,
}

impl ShapingTarget {
    /// Creates a port-scoped target.
    pub fn port(dev_port: DevicePort) -> Self {
        Self {
            dev_port,
            scope: Scope::Port,
            queue: LogicalQueue(0),
        }
    }

    /// Creates a queue-scoped target.
    pub fn queue(dev_port: DevicePort, queue: LogicalQueue) -> Self {
        Self {
            dev_port,
            scope: Scope::Queue,
            queue,
        }
    }
}

/// Shaping state of one port or queue as read back from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShapingConfig {
    /// Port or queue level.
    pub scope: Scope,
    /// Whether the shaper is enabled.
    pub enabled: bool,
    /// Configured rate in hardware units.
    pub max_rate_units: u64,
}

impl ShapingConfig {
    /// Returns the configured rate in bits per second.
    pub fn rate_bps(&self) -> u64 {
        crate::rate::from_hardware_units(self.max_rate_units)
    }
}

impl fmt::Display for ShapingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scope={} enabled={} max_rate={} units (~{} bps)",
            self.scope,
            self.enabled,
            self.max_rate_units,
            self.rate_bps()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_port_pipe() {
        assert_eq!(DevicePort::new(0).unwrap().pipe(), 0);
        assert_eq!(DevicePort::new(127).unwrap().pipe(), 0);
        assert_eq!(DevicePort::new(128).unwrap().pipe(), 1);
        assert_eq!(DevicePort::new(255).unwrap().pipe(), 1);
    }

    #[test]
    fn test_device_port_bounds() {
        assert!(DevicePort::new(256).is_err());
        assert_eq!(DevicePort::all().count(), 256);
    }

    #[test]
    fn test_logical_queue_bounds() {
        assert!(LogicalQueue::new(7).is_ok());
        assert!(LogicalQueue::new(8).is_err());
        let all: Vec<u32> = LogicalQueue::all().map(|q| q.as_u32()).collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_scope_and_mode_parse() {
        assert_eq!(Scope::from_str("queue", false).unwrap(), Scope::Queue);
        assert!(Scope::from_str("pipe", false).is_err());
        assert_eq!(Mode::from_str("reset", false).unwrap(), Mode::Reset);
        assert_eq!(Mode::default(), Mode::Watch);
        assert_eq!(Scope::default().to_string(), "port");
    }

    #[test]
    fn test_mapping_resolution() {
        assert!(!PortGroupMapping::unresolved().is_resolved());
        let mapping = PortGroupMapping {
            pg_id: 3,
            pg_port_nr: 1,
            egress_qid_queues: vec![],
        };
        assert_eq!(mapping.pg_id_key(), Some(3));
    }

    #[test]
    fn test_shaping_config_rate() {
        let cfg = ShapingConfig {
            scope: Scope::Port,
            enabled: true,
            max_rate_units: 10_000_000,
        };
        assert_eq!(cfg.rate_bps(), 10_000_000_000);
    }
}
