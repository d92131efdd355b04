//! ShapingController - port and queue rate limiting.
//!
//! Shaping is two independent hardware tables per scope: `sched_cfg`
//! carries the `max_rate_enable` flag and `sched_shaping` carries the rate.
//! Only those fields are ever written. Scheduler priority and weight in
//! `sched_cfg` belong to the switch control plane and are left untouched.
//!
//! Every mutation is followed by a hardware re-read so the operator sees
//! what the switch actually holds, not what was requested.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::control_plane::{ControlPlane, FieldMap, TableEntry, TableKey};
use crate::error::{TmError, TmResult};
use crate::field_map;
use crate::rate;
use crate::resolver::{self, map_queue_key};
use crate::tables::{fields, values, TableId};
use crate::types::{
    DevicePort, LogicalQueue, PortGroupMapping, QueueKey, Scope, ShapingConfig, ShapingTarget,
    MAX_DEV_PORTS, PORTS_PER_PIPE,
};

/// Tables and key addressing one shaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShaperAddress {
    scope: Scope,
    cfg_table: TableId,
    shaping_table: TableId,
    key: TableKey,
    queue_key: Option<QueueKey>,
}

impl ShaperAddress {
    fn port(dev_port: DevicePort) -> Self {
        Self {
            scope: Scope::Port,
            cfg_table: TableId::PortSchedCfg,
            shaping_table: TableId::PortSchedShaping,
            key: TableKey::DevPort(dev_port),
            queue_key: None,
        }
    }

    fn queue(pg_id: u32, queue_key: QueueKey) -> Self {
        Self {
            scope: Scope::Queue,
            cfg_table: TableId::QueueSchedCfg,
            shaping_table: TableId::QueueSchedShaping,
            key: TableKey::Queue {
                pg_id,
                queue: queue_key,
            },
            queue_key: Some(queue_key),
        }
    }

    fn for_target(target: &ShapingTarget, mapping: &PortGroupMapping) -> TmResult<Self> {
        match target.scope {
            Scope::Port => Ok(Self::port(target.dev_port)),
            Scope::Queue => {
                let pg_id = mapping
                    .pg_id_key()
                    .ok_or_else(|| TmError::resolution(target.dev_port.as_u32()))?;
                let key = map_queue_key(target.queue, &mapping.egress_qid_queues);
                Ok(Self::queue(pg_id, key))
            }
        }
    }
}

/// Hardware view of one shaper.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapingSnapshot {
    /// Decoded shaping state.
    pub config: ShapingConfig,
    /// Raw `sched_cfg` entry.
    pub sched_cfg: TableEntry,
    /// Raw `sched_shaping` entry.
    pub sched_shaping: TableEntry,
}

impl ShapingSnapshot {
    fn decode(scope: Scope, sched_cfg: TableEntry, sched_shaping: TableEntry) -> Self {
        let config = ShapingConfig {
            scope,
            enabled: sched_cfg.bool_or(fields::MAX_RATE_ENABLE, false),
            max_rate_units: u64::try_from(sched_shaping.int_or(fields::MAX_RATE, 0)).unwrap_or(0),
        };
        Self {
            config,
            sched_cfg,
            sched_shaping,
        }
    }
}

fn describe_target(target: &ShapingTarget, mapping: &PortGroupMapping) -> String {
    format!(
        "scope={} on dev_port={} (pipe={}, pg_id={}, pg_port_nr={}) queue={}",
        target.scope,
        target.dev_port,
        target.dev_port.pipe(),
        mapping.pg_id,
        mapping.pg_port_nr,
        target.queue
    )
}

fn format_qids(qids: &[i64]) -> String {
    let shown: Vec<String> = qids.iter().take(8).map(|q| q.to_string()).collect();
    format!("[{}]", shown.join(", "))
}

/// Result of a single-target apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// What was shaped.
    pub target: ShapingTarget,
    /// Port-group mapping used for addressing.
    pub mapping: PortGroupMapping,
    /// TM queue key written, for queue scope.
    pub queue_key: Option<QueueKey>,
    /// Requested rate in bits per second.
    pub rate_bps: i64,
    /// Rate written, in hardware units.
    pub rate_units: u64,
    /// State before the writes.
    pub before: ShapingSnapshot,
    /// State read back after the writes.
    pub after: ShapingSnapshot,
}

impl ApplyReport {
    /// Operator confirmation lines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Applying shaping {}",
            describe_target(&self.target, &self.mapping)
        )];
        if !self.mapping.egress_qid_queues.is_empty() {
            lines.push(format!(
                "Egress qid map (qid for queue 0-7): {}",
                format_qids(&self.mapping.egress_qid_queues)
            ));
        }
        if let Some(key) = self.queue_key {
            lines.push(format!("TM queue key: {}", key));
        }
        lines.push(format!(
            "Target max_rate: {} bps (tm units={})",
            self.rate_bps, self.rate_units
        ));
        lines.push(format!("Current sched_cfg: {}", self.before.sched_cfg));
        lines.push(format!("Current sched_shaping: {}", self.before.sched_shaping));
        lines.push(format!("New sched_cfg: {}", self.after.sched_cfg));
        lines.push(format!("New sched_shaping: {}", self.after.sched_shaping));
        lines.push(format!("Shaper now: {}", self.after.config));
        lines
    }
}

/// Result of a single-target reset.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetReport {
    /// What was reset.
    pub target: ShapingTarget,
    /// Port-group mapping used for addressing.
    pub mapping: PortGroupMapping,
    /// TM queue key written, for queue scope.
    pub queue_key: Option<QueueKey>,
    /// State read back after the write.
    pub after: ShapingSnapshot,
}

impl ResetReport {
    /// Operator confirmation lines.
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!(
                "Resetting shaping {}",
                describe_target(&self.target, &self.mapping)
            ),
            format!("New sched_cfg: {}", self.after.sched_cfg),
            format!("Shaper now: {}", self.after.config),
        ]
    }
}

/// Why a port was skipped by the global reset sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The port's pipe could not be selected.
    PipeUnavailable,
    /// The port shaping write was rejected (port absent or not configured).
    ShapingWriteRejected,
    /// `tf1.tm.port.cfg` could not be read.
    PortConfigUnreadable,
    /// The port has no port group.
    PortGroupUnresolved,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::PipeUnavailable => "pipe unavailable",
            SkipReason::ShapingWriteRejected => "shaping write rejected",
            SkipReason::PortConfigUnreadable => "port config unreadable",
            SkipReason::PortGroupUnresolved => "port group unresolved",
        };
        f.write_str(s)
    }
}

/// What the sweep did to one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortResetOutcome {
    /// Queue shapers disabled (queue scope).
    pub queues_reset: u32,
    /// Queue shaper writes that were rejected (queue scope).
    pub queue_failures: u32,
}

/// One port's result in the global sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReset {
    /// The port.
    pub dev_port: DevicePort,
    /// Outcome or skip reason.
    pub result: Result<PortResetOutcome, SkipReason>,
}

/// Aggregate result of the global sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// Ports processed.
    pub reset_count: u32,
    /// Ports skipped.
    pub skipped_count: u32,
    /// Per-port results in port order.
    pub ports: Vec<PortReset>,
}

impl ResetSummary {
    fn record(&mut self, dev_port: DevicePort, result: Result<PortResetOutcome, SkipReason>) {
        match result {
            Ok(_) => self.reset_count += 1,
            Err(reason) => {
                debug!(dev_port = %dev_port, %reason, "Skipping port");
                self.skipped_count += 1;
            }
        }
        self.ports.push(PortReset { dev_port, result });
    }

    /// Total ports attempted.
    pub fn attempted(&self) -> u32 {
        self.reset_count + self.skipped_count
    }

    /// Banner line printed before the sweep.
    pub fn banner() -> String {
        format!(
            "Resetting shaping for ALL ports (Pipe 0: 0-{}, Pipe 1: {}-{})...",
            PORTS_PER_PIPE - 1,
            PORTS_PER_PIPE,
            MAX_DEV_PORTS - 1
        )
    }

    /// Final summary line.
    pub fn line(&self) -> String {
        format!(
            "Reset completed: {} ports processed, {} ports skipped (inactive)",
            self.reset_count, self.skipped_count
        )
    }
}

/// Applies and clears TM shaping.
pub struct ShapingController {
    cp: Arc<dyn ControlPlane>,
}

impl ShapingController {
    /// Creates a controller over the given control plane.
    pub fn new(cp: Arc<dyn ControlPlane>) -> Self {
        Self { cp }
    }

    async fn snapshot(&self, addr: &ShaperAddress) -> TmResult<ShapingSnapshot> {
        let sched_cfg = self.cp.get(addr.cfg_table, &addr.key, true).await?;
        let sched_shaping = self.cp.get(addr.shaping_table, &addr.key, true).await?;
        Ok(ShapingSnapshot::decode(addr.scope, sched_cfg, sched_shaping))
    }

    async fn set_enable(&self, addr: &ShaperAddress, enabled: bool) -> TmResult<()> {
        let data = field_map! { fields::MAX_RATE_ENABLE => enabled };
        self.cp.modify(addr.cfg_table, &addr.key, &data).await
    }

    async fn set_rate(&self, addr: &ShaperAddress, units: u64) -> TmResult<()> {
        let data: FieldMap = field_map! {
            fields::UNIT => values::UNIT_BPS,
            fields::PROVISIONING => values::PROVISIONING_UPPER,
            fields::MAX_RATE => units,
        };
        self.cp.modify(addr.shaping_table, &addr.key, &data).await
    }

    /// Selects the target's pipe and resolves its port group.
    ///
    /// An unresolved port group is fatal here, before any write.
    async fn prepare(&self, target: &ShapingTarget) -> TmResult<(PortGroupMapping, ShaperAddress)> {
        self.cp.select_pipe(target.dev_port.pipe()).await?;
        let mapping = resolver::resolve_required(self.cp.as_ref(), target.dev_port).await?;
        let addr = ShaperAddress::for_target(target, &mapping)?;
        Ok((mapping, addr))
    }

    /// Enables shaping at `rate_bps` on one port or queue.
    #[instrument(skip(self), fields(dev_port = %target.dev_port, scope = %target.scope))]
    pub async fn apply(&self, target: ShapingTarget, rate_bps: i64) -> TmResult<ApplyReport> {
        let (mapping, addr) = self.prepare(&target).await?;
        let before = self.snapshot(&addr).await?;

        let rate_units = rate::to_hardware_units(rate_bps);
        info!(
            rate_bps,
            rate_units,
            queue_key = ?addr.queue_key,
            "Applying shaping"
        );

        self.set_enable(&addr, true).await?;
        self.set_rate(&addr, rate_units).await?;

        let after = self.snapshot(&addr).await?;
        if !after.config.enabled || after.config.max_rate_units != rate_units {
            warn!(
                enabled = after.config.enabled,
                max_rate = after.config.max_rate_units,
                "Shaper read-back differs from request"
            );
        }

        Ok(ApplyReport {
            target,
            mapping,
            queue_key: addr.queue_key,
            rate_bps,
            rate_units,
            before,
            after,
        })
    }

    /// Disables shaping on one port or queue.
    #[instrument(skip(self), fields(dev_port = %target.dev_port, scope = %target.scope))]
    pub async fn reset(&self, target: ShapingTarget) -> TmResult<ResetReport> {
        let (mapping, addr) = self.prepare(&target).await?;
        self.set_enable(&addr, false).await?;
        let after = self.snapshot(&addr).await?;
        info!(queue_key = ?addr.queue_key, "Shaping disabled");

        Ok(ResetReport {
            target,
            mapping,
            queue_key: addr.queue_key,
            after,
        })
    }

    /// Disables shaping on every device port (and, for queue scope, all of
    /// each port's queues). Absent ports are counted as skipped.
    #[instrument(skip(self))]
    pub async fn reset_all(&self, scope: Scope) -> ResetSummary {
        let mut summary = ResetSummary::default();
        for dev_port in DevicePort::all() {
            let result = self.reset_port(dev_port, scope).await;
            summary.record(dev_port, result);
        }
        info!(
            reset = summary.reset_count,
            skipped = summary.skipped_count,
            "Global shaping reset complete"
        );
        summary
    }

    async fn reset_port(
        &self,
        dev_port: DevicePort,
        scope: Scope,
    ) -> Result<PortResetOutcome, SkipReason> {
        self.cp
            .select_pipe(dev_port.pipe())
            .await
            .map_err(|_| SkipReason::PipeUnavailable)?;

        match scope {
            Scope::Port => {
                self.set_enable(&ShaperAddress::port(dev_port), false)
                    .await
                    .map_err(|_| SkipReason::ShapingWriteRejected)?;
                Ok(PortResetOutcome::default())
            }
            Scope::Queue => {
                let mapping = resolver::resolve(self.cp.as_ref(), dev_port)
                    .await
                    .map_err(|_| SkipReason::PortConfigUnreadable)?;
                let pg_id = mapping
                    .pg_id_key()
                    .ok_or(SkipReason::PortGroupUnresolved)?;

                let mut outcome = PortResetOutcome::default();
                for queue in LogicalQueue::all() {
                    let key = map_queue_key(queue, &mapping.egress_qid_queues);
                    match self.set_enable(&ShaperAddress::queue(pg_id, key), false).await {
                        Ok(()) => outcome.queues_reset += 1,
                        Err(_) => outcome.queue_failures += 1,
                    }
                }
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::FieldValue;
    use crate::sim::{SimPort, SimSwitch};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<SimSwitch>, ShapingController) {
        let sim = Arc::new(SimSwitch::new());
        sim.add_port(10, SimPort::new(2, 2).with_qids((16..24).collect()));
        sim.add_port(140, SimPort::new(3, 0));
        let ctrl = ShapingController::new(sim.clone());
        (sim, ctrl)
    }

    fn port(p: u32) -> DevicePort {
        DevicePort::new(p).unwrap()
    }

    #[tokio::test]
    async fn test_apply_port_two_writes() {
        let (sim, ctrl) = setup();
        let report = ctrl
            .apply(ShapingTarget::port(port(10)), 5_000_000_000)
            .await
            .unwrap();

        assert_eq!(report.rate_units, 5_000_000);
        assert!(!report.before.config.enabled);
        assert!(report.after.config.enabled);
        assert_eq!(report.after.config.max_rate_units, 5_000_000);

        let writes = sim.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].table, TableId::PortSchedCfg);
        assert_eq!(writes[0].data.len(), 1);
        assert_eq!(writes[1].table, TableId::PortSchedShaping);
        assert_eq!(
            writes[1].data.get(fields::UNIT),
            Some(&FieldValue::Text("BPS".into()))
        );
        assert_eq!(sim.reads_from_software(), 0);
    }

    #[tokio::test]
    async fn test_apply_queue_uses_mapped_key_and_keeps_priority() {
        let (sim, ctrl) = setup();
        let target = ShapingTarget::queue(port(10), LogicalQueue::new(3).unwrap());
        let report = ctrl.apply(target, 1_000_000_000).await.unwrap();

        assert_eq!(report.queue_key, Some(QueueKey(19)));
        let (cfg, shaping) = sim.queue_scheduler(10, 2, 19).unwrap();
        assert_eq!(cfg.get(fields::MAX_RATE_ENABLE), Some(&FieldValue::Bool(true)));
        assert_eq!(cfg.get("max_priority"), Some(&FieldValue::Int(0)));
        assert_eq!(cfg.get("dwrr_weight"), Some(&FieldValue::Int(1023)));
        assert_eq!(shaping.get(fields::MAX_RATE), Some(&FieldValue::Int(1_000_000)));
    }

    #[tokio::test]
    async fn test_apply_selects_pipe_of_port() {
        let (sim, ctrl) = setup();
        ctrl.apply(ShapingTarget::port(port(140)), 1_000).await.unwrap();
        assert_eq!(sim.pipe_selects(), vec![1]);
    }

    #[tokio::test]
    async fn test_apply_unresolved_port_writes_nothing() {
        let (sim, ctrl) = setup();
        sim.add_port(5, SimPort::without_port_group());
        let err = ctrl
            .apply(ShapingTarget::port(port(5)), 1_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, TmError::Resolution { dev_port: 5 }));
        assert_eq!(sim.write_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (sim, ctrl) = setup();
        let target = ShapingTarget::port(port(10));
        ctrl.apply(target, 2_000_000).await.unwrap();

        let first = ctrl.reset(target).await.unwrap();
        let second = ctrl.reset(target).await.unwrap();
        assert!(!first.after.config.enabled);
        assert_eq!(first.after, second.after);
        assert_eq!(sim.write_count(), 4);
    }

    #[tokio::test]
    async fn test_reset_all_port_scope() {
        let (sim, ctrl) = setup();
        let summary = ctrl.reset_all(Scope::Port).await;
        assert_eq!(summary.reset_count, 2);
        assert_eq!(summary.skipped_count, 254);
        assert_eq!(summary.attempted(), 256);
        assert_eq!(sim.write_count(), 2);
        assert_eq!(sim.pipe_selects().len(), 256);
        assert_eq!(
            summary.ports[0].result,
            Err(SkipReason::ShapingWriteRejected)
        );
    }

    #[tokio::test]
    async fn test_reset_all_queue_scope() {
        let (sim, ctrl) = setup();
        sim.add_port(20, SimPort::without_port_group());
        let summary = ctrl.reset_all(Scope::Queue).await;

        assert_eq!(summary.reset_count, 2);
        assert_eq!(summary.skipped_count, 254);
        let port20 = summary.ports.iter().find(|p| p.dev_port.as_u32() == 20).unwrap();
        assert_eq!(port20.result, Err(SkipReason::PortGroupUnresolved));
        let port10 = summary.ports.iter().find(|p| p.dev_port.as_u32() == 10).unwrap();
        assert_eq!(
            port10.result,
            Ok(PortResetOutcome {
                queues_reset: 8,
                queue_failures: 0
            })
        );
        assert!(sim
            .writes()
            .iter()
            .all(|w| w.table == TableId::QueueSchedCfg && w.data.len() == 1));
    }

    #[tokio::test]
    async fn test_reset_all_queue_write_failures_keep_port() {
        let (sim, ctrl) = setup();
        sim.fail_next_writes(TableId::QueueSchedCfg, 3);
        let summary = ctrl.reset_all(Scope::Queue).await;

        assert_eq!(summary.reset_count, 2);
        assert_eq!(summary.attempted(), 256);
        let port10 = summary.ports.iter().find(|p| p.dev_port.as_u32() == 10).unwrap();
        assert_eq!(
            port10.result,
            Ok(PortResetOutcome {
                queues_reset: 5,
                queue_failures: 3
            })
        );
        let port140 = summary.ports.iter().find(|p| p.dev_port.as_u32() == 140).unwrap();
        assert_eq!(
            port140.result,
            Ok(PortResetOutcome {
                queues_reset: 8,
                queue_failures: 0
            })
        );
        assert_eq!(sim.write_count(), 13);
    }

    #[test]
    fn test_summary_lines() {
        let summary = ResetSummary {
            reset_count: 128,
            skipped_count: 128,
            ports: Vec::new(),
        };
        assert_eq!(
            summary.line(),
            "Reset completed: 128 ports processed, 128 ports skipped (inactive)"
        );
        assert_eq!(
            ResetSummary::banner(),
            "Resetting shaping for ALL ports (Pipe 0: 0-127, Pipe 1: 128-255)..."
        );
    }
}
