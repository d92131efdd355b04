//! SamplingLoop - the watch-mode telemetry poller.
//!
//! Each iteration reads the egress-port counters, the port MAC rates and
//! one or eight queue counters, turns the cumulative drop counters into
//! per-interval deltas, and emits one row through the [`OutputSink`].
//!
//! All reads of an iteration complete before any baseline moves, so a
//! failed read drops the whole row and leaves the next delta computed
//! against the last good sample.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use clap::ValueEnum;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::control_plane::ControlPlane;
use crate::counters::{read_counters, CounterSample, CounterScope, DeltaTracker};
use crate::error::{TmError, TmResult};
use crate::resolver::{self, map_queue_key};
use crate::sink::OutputSink;
use crate::tables::fields;
use crate::types::{DevicePort, LogicalQueue, PortGroupMapping, QueueKey, QUEUES_PER_PORT};

/// Pause after a counter clear before the first sample.
pub const CLEAR_SETTLE: Duration = Duration::from_millis(100);

/// Column header of single-queue rows.
pub const SINGLE_QUEUE_HEADER: &str = "time\tdev_port\tqueue\t\
    egress_drop\td_egress_drop\tegress_usage\tegress_wm\t\
    queue_drop\td_queue_drop\tqueue_usage\tqueue_wm\t\
    rx_rate\ttx_rate";

/// Column header of all-queues rows.
pub const ALL_QUEUES_HEADER: &str = "time\tdev_port\t\
    egress_drop\td_egress_drop\tegress_usage\tegress_wm\t\
    rx_rate\ttx_rate\t\
    q_drop[0-7]\td_q_drop[0-7]\tsum_d_q_drop\td_unattributed\t\
    q_usage[0-7]\tq_wm[0-7]";

/// Row encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Tab-separated columns with a header line.
    #[default]
    Tsv,
    /// One JSON object per row.
    Json,
}

/// Which queues a watch run samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSelection {
    /// One logical queue.
    Single(LogicalQueue),
    /// All eight logical queues, with drop attribution.
    All,
}

/// When a watch run stops on its own. Whichever bound is hit first wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopCondition {
    /// Total run time.
    pub duration: Option<Duration>,
    /// Number of sampling attempts.
    pub iterations: Option<u64>,
}

impl StopCondition {
    /// Runs until cancelled.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Returns true if neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.duration.is_none() && self.iterations.is_none()
    }

    fn iterations_reached(&self, attempts: u64) -> bool {
        self.iterations.is_some_and(|limit| attempts >= limit)
    }

    /// Returns true once either bound has been reached.
    pub fn reached(&self, elapsed: Duration, attempts: u64) -> bool {
        self.duration.is_some_and(|limit| elapsed >= limit) || self.iterations_reached(attempts)
    }
}

/// Parameters of a watch run.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Port to monitor.
    pub dev_port: DevicePort,
    /// Queue or queues to monitor.
    pub queues: QueueSelection,
    /// Polling interval.
    pub interval: Duration,
    /// Stop bounds.
    pub stop: StopCondition,
    /// Clear TM counters once before the first sample.
    pub clear_counters: bool,
    /// Row encoding.
    pub format: OutputFormat,
}

impl WatchOptions {
    /// Single-queue watch with a 1 s interval and no bounds.
    pub fn new(dev_port: DevicePort, queues: QueueSelection) -> Self {
        Self {
            dev_port,
            queues,
            interval: Duration::from_secs(1),
            stop: StopCondition::unbounded(),
            clear_counters: false,
            format: OutputFormat::Tsv,
        }
    }
}

/// Port-level drops split between queues and the unexplained residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribution {
    /// Sum of per-queue drop deltas.
    pub sum_queue_drops: u64,
    /// Port drops not accounted for by any queue, never negative.
    pub unattributed: u64,
}

/// Attributes an egress drop delta across the per-queue drop deltas.
pub fn attribute(d_egress_drop: u64, d_queue_drops: &[u64]) -> Attribution {
    let sum_queue_drops = d_queue_drops
        .iter()
        .fold(0u64, |acc, &d| acc.saturating_add(d));
    Attribution {
        sum_queue_drops,
        unattributed: d_egress_drop.saturating_sub(sum_queue_drops),
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn bracket_list(values: &[u64]) -> String {
    let items: Vec<String> = values.iter().map(u64::to_string).collect();
    format!("[{}]", items.join(","))
}

/// One single-queue telemetry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleQueueRecord {
    /// Sample time, seconds since the epoch.
    pub time: f64,
    pub dev_port: DevicePort,
    /// Logical queue index.
    pub queue: u32,
    pub egress_drop: u64,
    pub d_egress_drop: u64,
    pub egress_usage: u64,
    pub egress_wm: u64,
    pub queue_drop: u64,
    pub d_queue_drop: u64,
    pub queue_usage: u64,
    pub queue_wm: u64,
    pub rx_rate: u64,
    pub tx_rate: u64,
}

impl fmt::Display for SingleQueueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.time,
            self.dev_port,
            self.queue,
            self.egress_drop,
            self.d_egress_drop,
            self.egress_usage,
            self.egress_wm,
            self.queue_drop,
            self.d_queue_drop,
            self.queue_usage,
            self.queue_wm,
            self.rx_rate,
            self.tx_rate
        )
    }
}

/// One all-queues telemetry row. Lists are in logical queue order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllQueuesRecord {
    /// Sample time, seconds since the epoch.
    pub time: f64,
    pub dev_port: DevicePort,
    pub egress_drop: u64,
    pub d_egress_drop: u64,
    pub egress_usage: u64,
    pub egress_wm: u64,
    pub rx_rate: u64,
    pub tx_rate: u64,
    pub q_drop: Vec<u64>,
    pub d_q_drop: Vec<u64>,
    pub sum_d_q_drop: u64,
    pub d_unattributed: u64,
    pub q_usage: Vec<u64>,
    pub q_wm: Vec<u64>,
}

impl fmt::Display for AllQueuesRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.time,
            self.dev_port,
            self.egress_drop,
            self.d_egress_drop,
            self.egress_usage,
            self.egress_wm,
            self.rx_rate,
            self.tx_rate,
            bracket_list(&self.q_drop),
            bracket_list(&self.d_q_drop),
            self.sum_d_q_drop,
            self.d_unattributed,
            bracket_list(&self.q_usage),
            bracket_list(&self.q_wm)
        )
    }
}

/// A row produced by one sampling iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WatchRecord {
    Single(SingleQueueRecord),
    AllQueues(AllQueuesRecord),
}

impl WatchRecord {
    /// Encodes the row.
    pub fn render(&self, format: OutputFormat) -> TmResult<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
            OutputFormat::Tsv => Ok(match self {
                WatchRecord::Single(r) => r.to_string(),
                WatchRecord::AllQueues(r) => r.to_string(),
            }),
        }
    }
}

/// Run-scoped state of a watch: addressing plus delta baselines.
#[derive(Debug)]
pub struct SamplingSession {
    dev_port: DevicePort,
    pg_id: u32,
    selection: QueueSelection,
    egress_qid_queues: Vec<i64>,
    queues: Vec<(LogicalQueue, QueueKey)>,
    egress: DeltaTracker,
    queue_trackers: Vec<DeltaTracker>,
}

impl SamplingSession {
    /// Builds a session for `dev_port` from its resolved mapping.
    pub fn new(
        dev_port: DevicePort,
        mapping: &PortGroupMapping,
        selection: QueueSelection,
    ) -> TmResult<Self> {
        let pg_id = mapping
            .pg_id_key()
            .ok_or_else(|| TmError::resolution(dev_port.as_u32()))?;
        let queues: Vec<(LogicalQueue, QueueKey)> = match selection {
            QueueSelection::Single(q) => vec![(q, map_queue_key(q, &mapping.egress_qid_queues))],
            QueueSelection::All => LogicalQueue::all()
                .map(|q| (q, map_queue_key(q, &mapping.egress_qid_queues)))
                .collect(),
        };
        Ok(Self {
            dev_port,
            pg_id,
            selection,
            egress_qid_queues: mapping.egress_qid_queues.clone(),
            queue_trackers: vec![DeltaTracker::new(); queues.len()],
            queues,
            egress: DeltaTracker::new(),
        })
    }

    /// Returns the TM queue keys sampled, in logical order.
    pub fn queue_keys(&self) -> Vec<QueueKey> {
        self.queues.iter().map(|&(_, key)| key).collect()
    }

    /// Column header for this session's rows.
    pub fn header(&self) -> &'static str {
        match self.selection {
            QueueSelection::Single(_) => SINGLE_QUEUE_HEADER,
            QueueSelection::All => ALL_QUEUES_HEADER,
        }
    }

    /// Comment line describing the logical to TM queue mapping, printed in
    /// all-queues mode when the port carries a qid map.
    pub fn qid_map_line(&self) -> Option<String> {
        if self.selection != QueueSelection::All || self.egress_qid_queues.is_empty() {
            return None;
        }
        let keys: Vec<String> = self.queues.iter().map(|(_, k)| k.to_string()).collect();
        Some(format!(
            "# egress_qid_queues (logical 0-{} -> tm key): [{}]",
            QUEUES_PER_PORT - 1,
            keys.join(", ")
        ))
    }

    /// Reads every counter of one iteration and produces its row.
    ///
    /// Baselines only advance when every read succeeded.
    pub async fn sample(&mut self, cp: &dyn ControlPlane) -> TmResult<WatchRecord> {
        let time = epoch_seconds();
        let egress = read_counters(cp, CounterScope::EgressPort(self.dev_port)).await?;
        let stat = read_counters(cp, CounterScope::PortStat(self.dev_port)).await?;
        let mut queue_samples: Vec<CounterSample> = Vec::with_capacity(self.queues.len());
        for &(_, key) in &self.queues {
            let scope = CounterScope::Queue {
                pg_id: self.pg_id,
                queue: key,
            };
            queue_samples.push(read_counters(cp, scope).await?);
        }

        let egress_drop = egress.get(fields::DROP_COUNT_PACKETS);
        let d_egress_drop = self.egress.observe(egress_drop);
        let q_drop: Vec<u64> = queue_samples
            .iter()
            .map(|s| s.get(fields::DROP_COUNT_PACKETS))
            .collect();
        let d_q_drop: Vec<u64> = self
            .queue_trackers
            .iter_mut()
            .zip(&q_drop)
            .map(|(tracker, &drop)| tracker.observe(drop))
            .collect();
        let q_usage: Vec<u64> = queue_samples
            .iter()
            .map(|s| s.get(fields::USAGE_CELLS))
            .collect();
        let q_wm: Vec<u64> = queue_samples
            .iter()
            .map(|s| s.get(fields::WATERMARK_CELLS))
            .collect();

        let record = match self.selection {
            QueueSelection::Single(queue) => WatchRecord::Single(SingleQueueRecord {
                time,
                dev_port: self.dev_port,
                queue: queue.as_u32(),
                egress_drop,
                d_egress_drop,
                egress_usage: egress.get(fields::USAGE_CELLS),
                egress_wm: egress.get(fields::WATERMARK_CELLS),
                queue_drop: q_drop[0],
                d_queue_drop: d_q_drop[0],
                queue_usage: q_usage[0],
                queue_wm: q_wm[0],
                rx_rate: stat.get(fields::RX_RATE),
                tx_rate: stat.get(fields::TX_RATE),
            }),
            QueueSelection::All => {
                let attribution = attribute(d_egress_drop, &d_q_drop);
                WatchRecord::AllQueues(AllQueuesRecord {
                    time,
                    dev_port: self.dev_port,
                    egress_drop,
                    d_egress_drop,
                    egress_usage: egress.get(fields::USAGE_CELLS),
                    egress_wm: egress.get(fields::WATERMARK_CELLS),
                    rx_rate: stat.get(fields::RX_RATE),
                    tx_rate: stat.get(fields::TX_RATE),
                    q_drop,
                    d_q_drop,
                    sum_d_q_drop: attribution.sum_queue_drops,
                    d_unattributed: attribution.unattributed,
                    q_usage,
                    q_wm,
                })
            }
        };
        Ok(record)
    }
}

/// Totals of a finished watch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Sampling attempts, including failed ones.
    pub iterations: u64,
    /// Rows emitted.
    pub rows: u64,
    /// Iterations omitted because a read failed.
    pub failed_samples: u64,
    /// Whether the run ended on cancellation.
    pub cancelled: bool,
}

/// Runs the watch loop until its stop condition or cancellation.
///
/// Resolution failure of the watched port is fatal and happens before any
/// output. Inside the loop a failed read skips that row with a warning.
#[instrument(skip(cp, sink, cancel), fields(dev_port = %opts.dev_port))]
pub async fn run_watch(
    cp: &dyn ControlPlane,
    sink: &mut OutputSink,
    opts: &WatchOptions,
    cancel: &CancellationToken,
) -> TmResult<WatchSummary> {
    cp.select_pipe(opts.dev_port.pipe()).await?;
    let mapping = resolver::resolve_required(cp, opts.dev_port).await?;
    let mut session = SamplingSession::new(opts.dev_port, &mapping, opts.queues)?;

    if opts.clear_counters {
        if cp.clear_counters().await? {
            debug!("Counters cleared");
            tokio::time::sleep(CLEAR_SETTLE).await;
        } else {
            info!("Counter clear not supported by this control plane, continuing");
        }
    }

    if opts.format == OutputFormat::Tsv {
        if let Some(line) = session.qid_map_line() {
            sink.emit(&line)?;
        }
        sink.emit(session.header())?;
    }

    info!(
        pg_id = mapping.pg_id,
        queue_keys = ?session.queue_keys(),
        interval_ms = opts.interval.as_millis() as u64,
        "Watch started"
    );

    let mut summary = WatchSummary::default();
    let start = Instant::now();
    loop {
        if opts.stop.reached(start.elapsed(), summary.iterations) {
            break;
        }
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let iteration_start = Instant::now();
        // A read that never answers must not pin the loop past a cancel.
        let sampled = tokio::select! {
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break;
            }
            sampled = session.sample(cp) => sampled,
        };
        match sampled {
            Ok(record) => {
                sink.emit(&record.render(opts.format)?)?;
                summary.rows += 1;
            }
            Err(e) => {
                warn!(iteration = summary.iterations, "Skipping sample: {}", e);
                summary.failed_samples += 1;
            }
        }
        summary.iterations += 1;

        if opts.stop.iterations_reached(summary.iterations) {
            break;
        }
        let remaining = opts.interval.saturating_sub(iteration_start.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break;
            }
            _ = tokio::time::sleep(remaining) => {}
        }
    }

    info!(
        iterations = summary.iterations,
        rows = summary.rows,
        failed = summary.failed_samples,
        cancelled = summary.cancelled,
        "Watch finished"
    );
    Ok(summary)
}
