//! Control-plane capability interface.
//!
//! The shaping controller and sampling loop only ever need three things
//! from the switch API: read an entry, modify an entry, and select the pipe
//! subsequent calls apply to. [`ControlPlane`] exposes exactly that (plus an
//! optional counter clear); adapters such as [`crate::bridge::BridgeClient`]
//! and [`crate::sim::SimSwitch`] translate it onto a concrete transport.
//!
//! Field keys may arrive as text or as raw bytes depending on the transport.
//! Adapters normalize them with [`FieldKey::normalize`] so that everything
//! above this module sees a single `String`-keyed [`FieldMap`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TmResult;
use crate::tables::{keys, TableId};
use crate::types::{DevicePort, QueueKey};

/// A data field value as carried by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Integer above `i64::MAX` (wide counters).
    UInt(u64),
    /// Floating point (some rate statistics).
    Float(f64),
    /// Enum-like string (e.g. `"BPS"`).
    Text(String),
    /// Array field (e.g. `egress_qid_queues`).
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Interprets the value as a signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Bool(b) => Some(i64::from(*b)),
            FieldValue::Int(i) => Some(*i),
            FieldValue::UInt(u) => i64::try_from(*u).ok(),
            FieldValue::Float(f) if f.is_finite() => Some(*f as i64),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interprets the value as a non-negative counter, clamping negatives to 0.
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(u) => Some(*u),
            other => other.as_i64().map(|v| u64::try_from(v).unwrap_or(0)),
        }
    }

    /// Interprets the value as a boolean flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            other => other.as_i64().map(|v| v != 0),
        }
    }

    /// Interprets the value as a list of integers.
    ///
    /// Elements that are not integers become `-1` so positions are kept.
    pub fn as_int_list(&self) -> Option<Vec<i64>> {
        match self {
            FieldValue::List(items) => Some(
                items
                    .iter()
                    .map(|item| item.as_i64().unwrap_or(-1))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::UInt(u) => write!(f, "{}", u),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Text(s) => write!(f, "'{}'", s),
            FieldValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => FieldValue::Int(i),
            Err(_) => FieldValue::UInt(v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<Vec<i64>> for FieldValue {
    fn from(v: Vec<i64>) -> Self {
        FieldValue::List(v.into_iter().map(FieldValue::Int).collect())
    }
}

/// Field name to value map with normalized (text) keys.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Builds a [`FieldMap`] from name/value pairs.
#[macro_export]
macro_rules! field_map {
    ($($field:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::control_plane::FieldMap::new();
        $(map.insert($field.to_string(), $crate::control_plane::FieldValue::from($value));)*
        map
    }};
}

/// A field key as it may arrive from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldKey {
    /// Text key.
    Text(String),
    /// Raw byte key (UTF-8 encoded name).
    Bytes(Vec<u8>),
}

impl FieldKey {
    /// Returns the key as plain text.
    pub fn normalize(self) -> String {
        match self {
            FieldKey::Text(s) => s,
            FieldKey::Bytes(b) => match String::from_utf8(b) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            },
        }
    }
}

/// Key of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// Port-scoped tables.
    DevPort(DevicePort),
    /// Queue-scoped tables.
    Queue {
        /// Port group id.
        pg_id: u32,
        /// Hardware queue key.
        queue: QueueKey,
    },
}

impl TableKey {
    /// Returns the key fields as they are named in `table`.
    pub fn key_fields(&self, table: TableId) -> Vec<(&'static str, u32)> {
        match *self {
            TableKey::DevPort(port) if table == TableId::PortStat => {
                vec![(keys::STAT_DEV_PORT, port.as_u32())]
            }
            TableKey::DevPort(port) => vec![(keys::DEV_PORT, port.as_u32())],
            TableKey::Queue { pg_id, queue } => {
                vec![(keys::PG_ID, pg_id), (keys::PG_QUEUE, queue.0)]
            }
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::DevPort(port) => write!(f, "dev_port={}", port),
            TableKey::Queue { pg_id, queue } => write!(f, "pg_id={}, pg_queue={}", pg_id, queue),
        }
    }
}

/// A table entry read from the control plane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableEntry {
    /// Data fields with normalized keys.
    pub data: FieldMap,
}

impl TableEntry {
    /// Creates an entry from already normalized data.
    pub fn new(data: FieldMap) -> Self {
        Self { data }
    }

    /// Creates an entry from transport key/value pairs, normalizing keys.
    pub fn from_raw_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (FieldKey, FieldValue)>,
    {
        Self {
            data: pairs
                .into_iter()
                .map(|(k, v)| (k.normalize(), v))
                .collect(),
        }
    }

    /// Returns a field, if present.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.data.get(field)
    }

    /// Returns an integer field or `default`.
    pub fn int_or(&self, field: &str, default: i64) -> i64 {
        self.get(field).and_then(FieldValue::as_i64).unwrap_or(default)
    }

    /// Returns a counter field, treating absence as 0.
    pub fn counter(&self, field: &str) -> u64 {
        self.get(field).and_then(FieldValue::as_counter).unwrap_or(0)
    }

    /// Returns a boolean field or `default`.
    pub fn bool_or(&self, field: &str, default: bool) -> bool {
        self.get(field).and_then(FieldValue::as_bool).unwrap_or(default)
    }
}

impl fmt::Display for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.data.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}': {}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Capabilities required from the switch control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Reads one entry. `from_hw` requests hardware truth rather than the
    /// software shadow.
    async fn get(&self, table: TableId, key: &TableKey, from_hw: bool) -> TmResult<TableEntry>;

    /// Writes the given data fields of one entry, leaving others untouched.
    async fn modify(&self, table: TableId, key: &TableKey, data: &FieldMap) -> TmResult<()>;

    /// Selects the pipe subsequent calls are addressed to.
    async fn select_pipe(&self, pipe: u32) -> TmResult<()>;

    /// Clears TM counters. Returns `false` if the platform has no clear call.
    async fn clear_counters(&self) -> TmResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        let entry = TableEntry::from_raw_pairs(vec![
            (FieldKey::Bytes(b"pg_id".to_vec()), FieldValue::Int(4)),
            (FieldKey::Text("pg_port_nr".to_string()), FieldValue::Int(2)),
        ]);
        assert_eq!(entry.int_or("pg_id", -1), 4);
        assert_eq!(entry.int_or("pg_port_nr", -1), 2);
        assert_eq!(entry.int_or("missing", -1), -1);
    }

    #[test]
    fn test_counter_defaults_to_zero() {
        let entry = TableEntry::new(field_map! { "drop_count_packets" => -3i64 });
        assert_eq!(entry.counter("drop_count_packets"), 0);
        assert_eq!(entry.counter("usage_cells"), 0);
    }

    #[test]
    fn test_field_value_conversions() {
        assert_eq!(FieldValue::Text("12".into()).as_i64(), Some(12));
        assert_eq!(FieldValue::Float(3.9).as_i64(), Some(3));
        assert_eq!(FieldValue::UInt(u64::MAX).as_counter(), Some(u64::MAX));
        assert_eq!(FieldValue::Text("True".into()).as_bool(), Some(true));
        assert_eq!(FieldValue::Int(0).as_bool(), Some(false));
        let list = FieldValue::List(vec![FieldValue::Int(8), FieldValue::Text("x".into())]);
        assert_eq!(list.as_int_list(), Some(vec![8, -1]));
    }

    #[test]
    fn test_untagged_deserialize() {
        let v: FieldValue = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(v.as_int_list(), Some(vec![1, 2, 3]));
        let v: FieldValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, FieldValue::Bool(true));
        let v: FieldValue = serde_json::from_str("18446744073709551615").unwrap();
        assert_eq!(v, FieldValue::UInt(u64::MAX));
        let k: FieldKey = serde_json::from_str("[112, 103]").unwrap();
        assert_eq!(k.normalize(), "pg");
    }

    #[test]
    fn test_key_fields() {
        let port = DevicePort::new(9).unwrap();
        assert_eq!(
            TableKey::DevPort(port).key_fields(TableId::PortStat),
            vec![("$DEV_PORT", 9)]
        );
        assert_eq!(
            TableKey::DevPort(port).key_fields(TableId::PortSchedCfg),
            vec![("dev_port", 9)]
        );
        let q = TableKey::Queue {
            pg_id: 2,
            queue: QueueKey(17),
        };
        assert_eq!(q.key_fields(TableId::QueueCounter), vec![("pg_id", 2), ("pg_queue", 17)]);
    }

    #[test]
    fn test_entry_display() {
        let entry = TableEntry::new(field_map! {
            "max_rate_enable" => true,
            "unit" => "BPS",
        });
        assert_eq!(entry.to_string(), "{'max_rate_enable': true, 'unit': 'BPS'}");
    }
}
