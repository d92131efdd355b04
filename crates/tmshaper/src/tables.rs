//! Table addresses and field names used by tmshaper.
//!
//! These match the BF-RT object tree exposed by the Tofino SDE under
//! `tf1.tm` and `port`.

use std::fmt;

/// A fixed table address in the control-plane object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    /// Per-port TM configuration (port group id, queue map).
    PortCfg,
    /// Per-port scheduler configuration (shaping enable flag).
    PortSchedCfg,
    /// Per-port shaping parameters.
    PortSchedShaping,
    /// Per-queue scheduler configuration (shaping enable flag).
    QueueSchedCfg,
    /// Per-queue shaping parameters.
    QueueSchedShaping,
    /// Egress port TM counters.
    EgressPortCounter,
    /// Queue TM counters.
    QueueCounter,
    /// MAC-level port statistics (rates).
    PortStat,
}

impl TableId {
    /// Returns the dotted table path in the object tree.
    pub fn path(&self) -> &'static str {
        match self {
            TableId::PortCfg => "tf1.tm.port.cfg",
            TableId::PortSchedCfg => "tf1.tm.port.sched_cfg",
            TableId::PortSchedShaping => "tf1.tm.port.sched_shaping",
            TableId::QueueSchedCfg => "tf1.tm.queue.sched_cfg",
            TableId::QueueSchedShaping => "tf1.tm.queue.sched_shaping",
            TableId::EgressPortCounter => "tf1.tm.counter.eg_port",
            TableId::QueueCounter => "tf1.tm.counter.queue",
            TableId::PortStat => "port.port_stat",
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Key field names.
pub mod keys {
    /// Device port key of port-scoped tables.
    pub const DEV_PORT: &str = "dev_port";

    /// Device port key of `port.port_stat` (positional in BF-RT python).
    pub const STAT_DEV_PORT: &str = "$DEV_PORT";

    /// Port group key of queue-scoped tables.
    pub const PG_ID: &str = "pg_id";

    /// Queue key of queue-scoped tables.
    pub const PG_QUEUE: &str = "pg_queue";
}

/// Data field names.
pub mod fields {
    /// Port group id in `tf1.tm.port.cfg`.
    pub const PG_ID: &str = "pg_id";

    /// Port number within the port group.
    pub const PG_PORT_NR: &str = "pg_port_nr";

    /// Logical queue to TM queue key map.
    pub const EGRESS_QID_QUEUES: &str = "egress_qid_queues";

    /// Shaping enable flag in the sched_cfg tables.
    pub const MAX_RATE_ENABLE: &str = "max_rate_enable";

    /// Shaping rate unit selector.
    pub const UNIT: &str = "unit";

    /// Shaping provisioning mode.
    pub const PROVISIONING: &str = "provisioning";

    /// Shaping rate in hardware units.
    pub const MAX_RATE: &str = "max_rate";

    /// Drop counter (packets).
    pub const DROP_COUNT_PACKETS: &str = "drop_count_packets";

    /// Current buffer usage (cells).
    pub const USAGE_CELLS: &str = "usage_cells";

    /// Peak buffer usage (cells).
    pub const WATERMARK_CELLS: &str = "watermark_cells";

    /// Receive rate from `port.port_stat`.
    pub const RX_RATE: &str = "$RX_RATE";

    /// Transmit rate from `port.port_stat`.
    pub const TX_RATE: &str = "$TX_RATE";
}

/// Values written to the shaping tables.
pub mod values {
    /// Rate unit: bits per second (encoded by the SDE in 1 kbps steps).
    pub const UNIT_BPS: &str = "BPS";

    /// Provisioning: never exceed the configured rate.
    pub const PROVISIONING_UPPER: &str = "UPPER";
}
