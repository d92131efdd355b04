//! In-memory simulated traffic manager.
//!
//! [`SimSwitch`] implements [`ControlPlane`] over a small model of a
//! two-pipe Tofino: a port configuration table, port and queue scheduler
//! registers, scripted counters, and a journal of every write. It backs the
//! `--backend sim` dry-run mode and the test suite.
//!
//! Port-keyed tables only answer for ports inside the selected pipe, and
//! queue-keyed tables only for `(pg_id, pg_queue)` pairs that belong to a
//! configured port of the selected pipe, mirroring how the SDE rejects
//! out-of-pipe addressing.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::control_plane::{ControlPlane, FieldMap, FieldValue, TableEntry, TableKey};
use crate::error::{TmError, TmResult};
use crate::field_map;
use crate::resolver::map_all_queue_keys;
use crate::tables::{fields, values, TableId};
use crate::types::{MAX_DEV_PORTS, PORTS_PER_PIPE};

/// Default port shaping rate programmed by the SDE (~10 Gbps).
pub const DEFAULT_MAX_RATE_UNITS: i64 = 10_003_999;

/// Port configuration of a simulated device port.
#[derive(Debug, Clone, Default)]
pub struct SimPort {
    pg_id: Option<i64>,
    pg_port_nr: Option<i64>,
    egress_qids: Option<Vec<i64>>,
    fail_cfg_reads: bool,
}

impl SimPort {
    /// A port in port group `pg_id` at position `pg_port_nr`.
    pub fn new(pg_id: i64, pg_port_nr: i64) -> Self {
        Self {
            pg_id: Some(pg_id),
            pg_port_nr: Some(pg_port_nr),
            egress_qids: None,
            fail_cfg_reads: false,
        }
    }

    /// A port whose configuration entry carries no port-group fields.
    pub fn without_port_group() -> Self {
        Self::default()
    }

    /// Sets the `egress_qid_queues` map.
    pub fn with_qids(mut self, qids: Vec<i64>) -> Self {
        self.egress_qids = Some(qids);
        self
    }

    /// Makes every `tf1.tm.port.cfg` read of this port fail.
    pub fn failing_cfg_reads(mut self) -> Self {
        self.fail_cfg_reads = true;
        self
    }

    fn queue_keys(&self) -> Vec<u32> {
        map_all_queue_keys(self.egress_qids.as_deref().unwrap_or(&[]))
            .into_iter()
            .map(|k| k.0)
            .collect()
    }

    fn cfg_entry(&self) -> FieldMap {
        let mut data = FieldMap::new();
        if let Some(pg_id) = self.pg_id {
            data.insert(fields::PG_ID.to_string(), FieldValue::Int(pg_id));
        }
        if let Some(nr) = self.pg_port_nr {
            data.insert(fields::PG_PORT_NR.to_string(), FieldValue::Int(nr));
        }
        if let Some(qids) = &self.egress_qids {
            data.insert(
                fields::EGRESS_QID_QUEUES.to_string(),
                FieldValue::from(qids.clone()),
            );
        }
        data
    }
}

/// One recorded `modify` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Target table.
    pub table: TableId,
    /// Target key.
    pub key: TableKey,
    /// Fields written.
    pub data: FieldMap,
}

#[derive(Debug, Clone)]
struct Scheduler {
    cfg: FieldMap,
    shaping: FieldMap,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            cfg: field_map! {
                fields::MAX_RATE_ENABLE => false,
                "max_priority" => 0i64,
                "dwrr_weight" => 1023i64,
            },
            shaping: field_map! {
                fields::UNIT => values::UNIT_BPS,
                fields::PROVISIONING => values::PROVISIONING_UPPER,
                fields::MAX_RATE => DEFAULT_MAX_RATE_UNITS,
                "max_burst_size" => 4100i64,
            },
        }
    }
}

#[derive(Debug, Clone)]
enum CounterScript {
    /// Successive reads return successive frames; the last one repeats.
    Frames { frames: Vec<FieldMap>, next: usize },
    /// Drops grow by `step` on every read.
    Ramp { base: FieldMap, step: u64, reads: u64 },
}

impl CounterScript {
    fn drops(values: &[u64]) -> Self {
        CounterScript::Frames {
            frames: values
                .iter()
                .map(|&v| field_map! { fields::DROP_COUNT_PACKETS => v })
                .collect(),
            next: 0,
        }
    }

    fn read(&mut self) -> FieldMap {
        match self {
            CounterScript::Frames { frames, next } => {
                let frame = frames
                    .get(*next)
                    .or_else(|| frames.last())
                    .cloned()
                    .unwrap_or_default();
                *next += 1;
                frame
            }
            CounterScript::Ramp { base, step, reads } => {
                let mut frame = base.clone();
                frame.insert(
                    fields::DROP_COUNT_PACKETS.to_string(),
                    FieldValue::from(step.saturating_mul(*reads)),
                );
                *reads += 1;
                frame
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    selected_pipe: Option<u32>,
    ports: BTreeMap<u32, SimPort>,
    port_sched: HashMap<u32, Scheduler>,
    queue_sched: HashMap<(u32, u32, u32), Scheduler>,
    egress_counters: HashMap<u32, CounterScript>,
    queue_counters: HashMap<(u32, u32, u32), CounterScript>,
    port_stats: HashMap<u32, FieldMap>,
    failing_reads: HashMap<TableId, usize>,
    failing_writes: HashMap<TableId, usize>,
    journal: Vec<WriteRecord>,
    pipe_selects: Vec<u32>,
    software_reads: usize,
    clears: usize,
    supports_clear: bool,
}

impl SimState {
    fn check_pipe(&self, table: TableId, dev_port: u32) -> TmResult<()> {
        if !self.ports.contains_key(&dev_port) {
            return Err(TmError::control_plane(
                "get",
                table.path(),
                format!("dev_port {} is not configured", dev_port),
            ));
        }
        match self.selected_pipe {
            Some(pipe) if dev_port / PORTS_PER_PIPE != pipe => Err(TmError::control_plane(
                "get",
                table.path(),
                format!("dev_port {} is not in selected pipe {}", dev_port, pipe),
            )),
            _ => Ok(()),
        }
    }

    /// Finds the `(pipe, pg_id, key)` tuple addressed by a queue key.
    fn queue_slot(&self, table: TableId, pg_id: u32, key: u32) -> TmResult<(u32, u32, u32)> {
        let owner = self.ports.iter().find(|(dev_port, port)| {
            let in_pipe = self
                .selected_pipe
                .map_or(true, |pipe| *dev_port / PORTS_PER_PIPE == pipe);
            in_pipe && port.pg_id == Some(i64::from(pg_id)) && port.queue_keys().contains(&key)
        });
        match owner {
            Some((dev_port, _)) => Ok((dev_port / PORTS_PER_PIPE, pg_id, key)),
            None => Err(TmError::control_plane(
                "get",
                table.path(),
                format!("no queue pg_id={} pg_queue={}", pg_id, key),
            )),
        }
    }

    fn take_read_failure(&mut self, table: TableId) -> bool {
        take_pending(&mut self.failing_reads, table)
    }

    fn take_write_failure(&mut self, table: TableId) -> bool {
        take_pending(&mut self.failing_writes, table)
    }
}

fn take_pending(pending: &mut HashMap<TableId, usize>, table: TableId) -> bool {
    match pending.get_mut(&table) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

/// In-memory [`ControlPlane`] implementation.
#[derive(Debug, Default)]
pub struct SimSwitch {
    state: Mutex<SimState>,
}

impl SimSwitch {
    /// Creates an empty switch with counter clearing supported.
    pub fn new() -> Self {
        let sim = Self::default();
        sim.state.lock().supports_clear = true;
        sim
    }

    /// Creates a fully populated two-pipe switch.
    ///
    /// Four device ports share a port group; each port owns eight
    /// consecutive TM queue keys. Counters ramp on every read so a watch
    /// run shows non-zero deltas.
    pub fn reference() -> Self {
        let sim = Self::new();
        for dev_port in 0..MAX_DEV_PORTS {
            let local = dev_port % PORTS_PER_PIPE;
            let pg_port_nr = i64::from(local % 4);
            let qids = (0..8).map(|i| pg_port_nr * 8 + i).collect();
            sim.add_port(
                dev_port,
                SimPort::new(i64::from(local / 4), pg_port_nr).with_qids(qids),
            );
            let mut state = sim.state.lock();
            state.egress_counters.insert(
                dev_port,
                CounterScript::Ramp {
                    base: field_map! {
                        fields::USAGE_CELLS => 12i64,
                        fields::WATERMARK_CELLS => 480i64,
                    },
                    step: 40,
                    reads: 0,
                },
            );
        }
        sim
    }

    /// Adds (or replaces) a configured device port.
    pub fn add_port(&self, dev_port: u32, port: SimPort) {
        let mut state = self.state.lock();
        let pipe = dev_port / PORTS_PER_PIPE;
        if let Some(pg_id) = port.pg_id.and_then(|p| u32::try_from(p).ok()) {
            for key in port.queue_keys() {
                state
                    .queue_sched
                    .insert((pipe, pg_id, key), Scheduler::new());
            }
        }
        state.port_sched.insert(dev_port, Scheduler::new());
        state.ports.insert(dev_port, port);
    }

    /// Scripts successive egress-port drop counter readings.
    pub fn set_egress_drops(&self, dev_port: u32, drops: &[u64]) {
        self.state
            .lock()
            .egress_counters
            .insert(dev_port, CounterScript::drops(drops));
    }

    /// Scripts successive full egress-port counter readings.
    pub fn set_egress_counter_frames(&self, dev_port: u32, frames: Vec<FieldMap>) {
        self.state
            .lock()
            .egress_counters
            .insert(dev_port, CounterScript::Frames { frames, next: 0 });
    }

    /// Scripts successive queue drop counter readings for a TM queue key.
    pub fn set_queue_drops(&self, dev_port: u32, pg_id: u32, key: u32, drops: &[u64]) {
        self.state.lock().queue_counters.insert(
            (dev_port / PORTS_PER_PIPE, pg_id, key),
            CounterScript::drops(drops),
        );
    }

    /// Sets the MAC rate statistics of a port.
    pub fn set_port_rates(&self, dev_port: u32, rx_rate: u64, tx_rate: u64) {
        self.state.lock().port_stats.insert(
            dev_port,
            field_map! {
                fields::RX_RATE => rx_rate,
                fields::TX_RATE => tx_rate,
            },
        );
    }

    /// Makes the next `count` reads of `table` fail.
    pub fn fail_next_reads(&self, table: TableId, count: usize) {
        *self.state.lock().failing_reads.entry(table).or_insert(0) += count;
    }

    /// Makes the next `count` writes to `table` fail. Failed writes are not journaled.
    pub fn fail_next_writes(&self, table: TableId, count: usize) {
        *self.state.lock().failing_writes.entry(table).or_insert(0) += count;
    }

    /// Declares whether the platform offers a counter clear call.
    pub fn set_supports_clear(&self, supported: bool) {
        self.state.lock().supports_clear = supported;
    }

    /// Returns every write issued so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().journal.clone()
    }

    /// Returns the number of writes issued so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().journal.len()
    }

    /// Returns the pipes selected so far, in order.
    pub fn pipe_selects(&self) -> Vec<u32> {
        self.state.lock().pipe_selects.clone()
    }

    /// Returns how many reads asked for software state.
    pub fn reads_from_software(&self) -> usize {
        self.state.lock().software_reads
    }

    /// Returns how many times counters were cleared.
    pub fn clear_count(&self) -> usize {
        self.state.lock().clears
    }

    /// Returns the port scheduler config and shaping entries.
    pub fn port_scheduler(&self, dev_port: u32) -> Option<(FieldMap, FieldMap)> {
        self.state
            .lock()
            .port_sched
            .get(&dev_port)
            .map(|s| (s.cfg.clone(), s.shaping.clone()))
    }

    /// Returns the queue scheduler config and shaping entries.
    pub fn queue_scheduler(&self, dev_port: u32, pg_id: u32, key: u32) -> Option<(FieldMap, FieldMap)> {
        self.state
            .lock()
            .queue_sched
            .get(&(dev_port / PORTS_PER_PIPE, pg_id, key))
            .map(|s| (s.cfg.clone(), s.shaping.clone()))
    }
}

#[async_trait]
impl ControlPlane for SimSwitch {
    async fn get(&self, table: TableId, key: &TableKey, from_hw: bool) -> TmResult<TableEntry> {
        let mut state = self.state.lock();
        if !from_hw {
            state.software_reads += 1;
        }
        if state.take_read_failure(table) {
            return Err(TmError::control_plane("get", table.path(), "injected read failure"));
        }

        let data = match (table, *key) {
            (TableId::PortCfg, TableKey::DevPort(port)) => {
                let dev_port = port.as_u32();
                state.check_pipe(table, dev_port)?;
                let sim_port = &state.ports[&dev_port];
                if sim_port.fail_cfg_reads {
                    return Err(TmError::control_plane("get", table.path(), "entry not found"));
                }
                sim_port.cfg_entry()
            }
            (TableId::PortSchedCfg | TableId::PortSchedShaping, TableKey::DevPort(port)) => {
                let dev_port = port.as_u32();
                state.check_pipe(table, dev_port)?;
                let sched = &state.port_sched[&dev_port];
                if table == TableId::PortSchedCfg {
                    sched.cfg.clone()
                } else {
                    sched.shaping.clone()
                }
            }
            (TableId::EgressPortCounter, TableKey::DevPort(port)) => {
                let dev_port = port.as_u32();
                state.check_pipe(table, dev_port)?;
                match state.egress_counters.get_mut(&dev_port) {
                    Some(script) => script.read(),
                    None => FieldMap::new(),
                }
            }
            (TableId::PortStat, TableKey::DevPort(port)) => {
                let dev_port = port.as_u32();
                state.check_pipe(table, dev_port)?;
                state.port_stats.get(&dev_port).cloned().unwrap_or_default()
            }
            (TableId::QueueSchedCfg | TableId::QueueSchedShaping, TableKey::Queue { pg_id, queue }) => {
                let slot = state.queue_slot(table, pg_id, queue.0)?;
                let sched = state
                    .queue_sched
                    .get(&slot)
                    .ok_or_else(|| TmError::control_plane("get", table.path(), "no scheduler"))?;
                if table == TableId::QueueSchedCfg {
                    sched.cfg.clone()
                } else {
                    sched.shaping.clone()
                }
            }
            (TableId::QueueCounter, TableKey::Queue { pg_id, queue }) => {
                let slot = state.queue_slot(table, pg_id, queue.0)?;
                match state.queue_counters.get_mut(&slot) {
                    Some(script) => script.read(),
                    None => FieldMap::new(),
                }
            }
            (table, key) => {
                return Err(TmError::control_plane(
                    "get",
                    table.path(),
                    format!("key {} does not address this table", key),
                ))
            }
        };
        Ok(TableEntry::new(data))
    }

    async fn modify(&self, table: TableId, key: &TableKey, data: &FieldMap) -> TmResult<()> {
        let mut state = self.state.lock();
        if state.take_write_failure(table) {
            return Err(TmError::control_plane("mod", table.path(), "injected write failure"));
        }
        let target = match (table, *key) {
            (TableId::PortSchedCfg | TableId::PortSchedShaping, TableKey::DevPort(port)) => {
                let dev_port = port.as_u32();
                state
                    .check_pipe(table, dev_port)
                    .map_err(|e| TmError::control_plane("mod", table.path(), e.to_string()))?;
                state.port_sched.get_mut(&dev_port)
            }
            (TableId::QueueSchedCfg | TableId::QueueSchedShaping, TableKey::Queue { pg_id, queue }) => {
                let slot = state
                    .queue_slot(table, pg_id, queue.0)
                    .map_err(|e| TmError::control_plane("mod", table.path(), e.to_string()))?;
                state.queue_sched.get_mut(&slot)
            }
            _ => None,
        };
        let Some(sched) = target else {
            return Err(TmError::control_plane(
                "mod",
                table.path(),
                format!("table is read-only for key {}", key),
            ));
        };
        let entry = match table {
            TableId::PortSchedCfg | TableId::QueueSchedCfg => &mut sched.cfg,
            _ => &mut sched.shaping,
        };
        for (field, value) in data {
            entry.insert(field.clone(), value.clone());
        }
        state.journal.push(WriteRecord {
            table,
            key: *key,
            data: data.clone(),
        });
        Ok(())
    }

    async fn select_pipe(&self, pipe: u32) -> TmResult<()> {
        if pipe >= MAX_DEV_PORTS / PORTS_PER_PIPE {
            return Err(TmError::control_plane(
                "set_pipe",
                "bfrt",
                format!("pipe {} does not exist", pipe),
            ));
        }
        let mut state = self.state.lock();
        state.selected_pipe = Some(pipe);
        state.pipe_selects.push(pipe);
        Ok(())
    }

    async fn clear_counters(&self) -> TmResult<bool> {
        let mut state = self.state.lock();
        if !state.supports_clear {
            return Ok(false);
        }
        state.clears += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DevicePort, QueueKey};

    fn dp(p: u32) -> TableKey {
        TableKey::DevPort(DevicePort::new(p).unwrap())
    }

    #[tokio::test]
    async fn test_port_outside_selected_pipe_is_rejected() {
        let sim = SimSwitch::new();
        sim.add_port(130, SimPort::new(0, 2));
        sim.select_pipe(0).await.unwrap();
        assert!(sim.get(TableId::PortCfg, &dp(130), true).await.is_err());
        sim.select_pipe(1).await.unwrap();
        assert!(sim.get(TableId::PortCfg, &dp(130), true).await.is_ok());
    }

    #[tokio::test]
    async fn test_modify_merges_fields_and_journals() {
        let sim = SimSwitch::new();
        sim.add_port(4, SimPort::new(1, 0));
        let data = field_map! { fields::MAX_RATE_ENABLE => true };
        sim.modify(TableId::PortSchedCfg, &dp(4), &data).await.unwrap();

        let (cfg, _) = sim.port_scheduler(4).unwrap();
        assert_eq!(cfg.get(fields::MAX_RATE_ENABLE), Some(&FieldValue::Bool(true)));
        assert_eq!(cfg.get("dwrr_weight"), Some(&FieldValue::Int(1023)));
        assert_eq!(sim.write_count(), 1);
    }

    #[tokio::test]
    async fn test_counter_frames_repeat_last() {
        let sim = SimSwitch::new();
        sim.add_port(0, SimPort::new(0, 0));
        sim.set_egress_drops(0, &[5, 9]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let entry = sim.get(TableId::EgressPortCounter, &dp(0), true).await.unwrap();
            seen.push(entry.counter(fields::DROP_COUNT_PACKETS));
        }
        assert_eq!(seen, vec![5, 9, 9]);
    }

    #[tokio::test]
    async fn test_queue_addressing_follows_qid_map() {
        let sim = SimSwitch::new();
        sim.add_port(2, SimPort::new(0, 2).with_qids((16..24).collect()));
        let mapped = TableKey::Queue { pg_id: 0, queue: QueueKey(16) };
        let logical = TableKey::Queue { pg_id: 0, queue: QueueKey(0) };
        assert!(sim.get(TableId::QueueCounter, &mapped, true).await.is_ok());
        assert!(sim.get(TableId::QueueCounter, &logical, true).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let sim = SimSwitch::new();
        sim.add_port(0, SimPort::new(0, 0));
        sim.fail_next_reads(TableId::PortStat, 1);
        assert!(sim.get(TableId::PortStat, &dp(0), true).await.is_err());
        assert!(sim.get(TableId::PortStat, &dp(0), true).await.is_ok());

        let data = field_map! { fields::MAX_RATE_ENABLE => false };
        sim.fail_next_writes(TableId::PortSchedCfg, 1);
        assert!(sim.modify(TableId::PortSchedCfg, &dp(0), &data).await.is_err());
        assert_eq!(sim.write_count(), 0);
        sim.modify(TableId::PortSchedCfg, &dp(0), &data).await.unwrap();
        assert_eq!(sim.write_count(), 1);
    }

    #[tokio::test]
    async fn test_reference_universe() {
        let sim = SimSwitch::reference();
        sim.select_pipe(1).await.unwrap();
        let entry = sim.get(TableId::PortCfg, &dp(133), true).await.unwrap();
        assert_eq!(entry.int_or(fields::PG_ID, -1), 1);
        assert_eq!(entry.int_or(fields::PG_PORT_NR, -1), 1);
        assert!(sim.select_pipe(2).await.is_err());
    }
}
