//! Device port to port-group translation.
//!
//! TM queue tables are keyed by `(pg_id, pg_queue)` rather than by device
//! port. The mapping lives in `tf1.tm.port.cfg` and is owned by the switch
//! control plane, so it is re-read on every use instead of cached.

use tracing::{debug, instrument};

use crate::control_plane::{ControlPlane, TableKey};
use crate::error::{TmError, TmResult};
use crate::tables::{fields, TableId};
use crate::types::{DevicePort, LogicalQueue, PortGroupMapping, QueueKey};

/// Reads the port-group mapping of `dev_port` from live hardware state.
///
/// Missing fields fall back to `-1` / empty. A read failure is returned
/// to the caller, which decides whether the port's absence is fatal.
#[instrument(skip(cp), fields(dev_port = %dev_port))]
pub async fn resolve(cp: &dyn ControlPlane, dev_port: DevicePort) -> TmResult<PortGroupMapping> {
    let entry = cp
        .get(TableId::PortCfg, &TableKey::DevPort(dev_port), true)
        .await?;

    let mapping = PortGroupMapping {
        pg_id: entry.int_or(fields::PG_ID, -1),
        pg_port_nr: entry.int_or(fields::PG_PORT_NR, -1),
        egress_qid_queues: entry
            .get(fields::EGRESS_QID_QUEUES)
            .and_then(|v| v.as_int_list())
            .unwrap_or_default(),
    };
    debug!(
        pg_id = mapping.pg_id,
        pg_port_nr = mapping.pg_port_nr,
        qids = ?mapping.egress_qid_queues,
        "Resolved port group"
    );
    Ok(mapping)
}

/// Resolves an explicitly targeted port, treating `pg_id < 0` as fatal.
pub async fn resolve_required(
    cp: &dyn ControlPlane,
    dev_port: DevicePort,
) -> TmResult<PortGroupMapping> {
    let mapping = resolve(cp, dev_port).await?;
    if !mapping.is_resolved() {
        return Err(TmError::resolution(dev_port.as_u32()));
    }
    Ok(mapping)
}

/// Maps a logical queue index to the TM queue key.
///
/// Uses `egress_qid_queues[queue]` when the map covers the index and the
/// entry is a valid key; otherwise the logical index itself is the key.
pub fn map_queue_key(queue: LogicalQueue, egress_qid_queues: &[i64]) -> QueueKey {
    egress_qid_queues
        .get(queue.index())
        .and_then(|&qid| u32::try_from(qid).ok())
        .map(QueueKey)
        .unwrap_or(QueueKey(queue.as_u32()))
}

/// Maps all eight logical queues in order.
pub fn map_all_queue_keys(egress_qid_queues: &[i64]) -> Vec<QueueKey> {
    LogicalQueue::all()
        .map(|q| map_queue_key(q, egress_qid_queues))
        .collect()
}
