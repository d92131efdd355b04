//! Tofino traffic-manager shaping controller and drop telemetry monitor.
//!
//! This crate implements `tmshaper`, which configures rate limits on TM
//! egress ports or queues and polls TM counters into a per-interval
//! time series of usage, watermark and drop metrics.
//!
//! # Responsibilities
//!
//! - Enable shaping at a given rate on one port or queue (`apply`)
//! - Disable shaping on one target, or sweep all 256 device ports (`reset`)
//! - Sample egress-port and queue counters, computing drop deltas and
//!   attributing port drops to queues (`watch`)
//! - Translate between flat device ports and `(pg_id, pg_queue)` TM keys
//!
//! # Tables
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | tf1.tm.port.cfg | dev_port | Port group mapping and qid map |
//! | tf1.tm.port.sched_cfg | dev_port | Port shaper enable flag |
//! | tf1.tm.port.sched_shaping | dev_port | Port shaper rate |
//! | tf1.tm.queue.sched_cfg | pg_id, pg_queue | Queue shaper enable flag |
//! | tf1.tm.queue.sched_shaping | pg_id, pg_queue | Queue shaper rate |
//! | tf1.tm.counter.eg_port | dev_port | Egress port drops, usage, watermark |
//! | tf1.tm.counter.queue | pg_id, pg_queue | Queue drops, usage, watermark |
//! | port.port_stat | $DEV_PORT | MAC RX/TX rates |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sonic_tmshaper::{BridgeClient, ShapingController, ShapingTarget, DevicePort};
//!
//! let cp = Arc::new(BridgeClient::new("bfshell-bridge"));
//! let ctrl = ShapingController::new(cp);
//! let report = ctrl.apply(ShapingTarget::port(DevicePort::new(10)?), 10_000_000_000).await?;
//! ```

pub mod bridge;
pub mod config;
pub mod control_plane;
pub mod counters;
pub mod error;
pub mod rate;
pub mod resolver;
pub mod sampling;
pub mod shaping;
pub mod sim;
pub mod sink;
pub mod tables;
pub mod types;

pub use bridge::BridgeClient;
pub use config::{Action, Args, Backend, RunConfig};
pub use control_plane::{ControlPlane, FieldMap, FieldValue, TableEntry, TableKey};
pub use error::{TmError, TmResult};
pub use rate::RateRequest;
pub use sampling::{run_watch, OutputFormat, QueueSelection, StopCondition, WatchOptions, WatchSummary};
pub use shaping::{ApplyReport, ResetReport, ResetSummary, ShapingController, SkipReason};
pub use sim::{SimPort, SimSwitch};
pub use sink::{LogFileOptions, OutputSink};
pub use types::{DevicePort, LogicalQueue, Mode, PortGroupMapping, QueueKey, Scope, ShapingTarget};
