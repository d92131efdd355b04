//! TM counter reads and monotonic-counter deltas.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::control_plane::{ControlPlane, TableKey};
use crate::error::TmResult;
use crate::tables::TableId;
use crate::types::{DevicePort, QueueKey};

/// What a counter read addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterScope {
    /// `tf1.tm.counter.eg_port` of a device port.
    EgressPort(DevicePort),
    /// `port.port_stat` of a device port.
    PortStat(DevicePort),
    /// `tf1.tm.counter.queue` of a TM queue.
    Queue {
        /// Port group id.
        pg_id: u32,
        /// Hardware queue key.
        queue: QueueKey,
    },
}

impl CounterScope {
    fn address(&self) -> (TableId, TableKey) {
        match *self {
            CounterScope::EgressPort(port) => (TableId::EgressPortCounter, TableKey::DevPort(port)),
            CounterScope::PortStat(port) => (TableId::PortStat, TableKey::DevPort(port)),
            CounterScope::Queue { pg_id, queue } => {
                (TableId::QueueCounter, TableKey::Queue { pg_id, queue })
            }
        }
    }
}

/// Counter values of one scope at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSample {
    /// What was read.
    pub scope: CounterScope,
    /// Field name to value.
    pub values: BTreeMap<String, u64>,
    /// When the read completed.
    pub read_at: DateTime<Utc>,
}

impl CounterSample {
    /// Returns a counter value; absent fields read as 0.
    pub fn get(&self, field: &str) -> u64 {
        self.values.get(field).copied().unwrap_or(0)
    }
}

/// Reads the counters of `scope` from hardware.
pub async fn read_counters(cp: &dyn ControlPlane, scope: CounterScope) -> TmResult<CounterSample> {
    let (table, key) = scope.address();
    let entry = cp.get(table, &key, true).await?;
    let values = entry
        .data
        .iter()
        .filter_map(|(name, value)| value.as_counter().map(|v| (name.clone(), v)))
        .collect();
    debug!(table = %table, key = %key, ?values, "Read counters");
    Ok(CounterSample {
        scope,
        values,
        read_at: Utc::now(),
    })
}

/// Returns `current - previous`, or 0 if the counter went backwards.
pub fn delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Tracks the previous reading of one cumulative counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaTracker {
    previous: Option<u64>,
}

impl DeltaTracker {
    /// Creates a tracker with no baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `current` and returns the delta against the previous reading.
    ///
    /// The first observation has no baseline and yields 0.
    pub fn observe(&mut self, current: u64) -> u64 {
        let d = self.previous.map_or(0, |prev| delta(prev, current));
        self.previous = Some(current);
        d
    }

    /// Returns the last recorded reading.
    pub fn previous(&self) -> Option<u64> {
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPort, SimSwitch};
    use crate::tables::fields;

    #[test]
    fn test_delta_never_negative() {
        assert_eq!(delta(100, 130), 30);
        assert_eq!(delta(130, 125), 0);
        assert_eq!(delta(0, 0), 0);
        assert_eq!(delta(u64::MAX, 0), 0);
    }

    #[test]
    fn test_delta_tracker_sequence() {
        let mut tracker = DeltaTracker::new();
        let deltas: Vec<u64> = [100, 130, 125, 140].iter().map(|&v| tracker.observe(v)).collect();
        assert_eq!(deltas, vec![0, 30, 0, 15]);
        assert_eq!(tracker.previous(), Some(140));
    }

    #[tokio::test]
    async fn test_read_counters_missing_fields_are_zero() {
        let sim = SimSwitch::new();
        sim.add_port(7, SimPort::new(1, 3));
        sim.set_egress_drops(7, &[42]);

        let port = DevicePort::new(7).unwrap();
        let sample = read_counters(&sim, CounterScope::EgressPort(port)).await.unwrap();
        assert_eq!(sample.get(fields::DROP_COUNT_PACKETS), 42);
        assert_eq!(sample.get(fields::USAGE_CELLS), 0);
        assert_eq!(sample.get(fields::WATERMARK_CELLS), 0);
        assert_eq!(sim.reads_from_software(), 0);
    }

    #[tokio::test]
    async fn test_read_port_stat() {
        let sim = SimSwitch::new();
        sim.add_port(7, SimPort::new(1, 3));
        sim.set_port_rates(7, 9_000, 8_000);

        let port = DevicePort::new(7).unwrap();
        let sample = read_counters(&sim, CounterScope::PortStat(port)).await.unwrap();
        assert_eq!(sample.get(fields::RX_RATE), 9_000);
        assert_eq!(sample.get(fields::TX_RATE), 8_000);
    }
}
