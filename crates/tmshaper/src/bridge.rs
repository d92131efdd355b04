//! Control-plane adapter over an external bfrt bridge process.
//!
//! The vendor switch API is only reachable from inside the SDE's python
//! shell, so the real transport is a helper process that owns that API and
//! speaks line-delimited JSON on stdin/stdout. One request line yields one
//! response line:
//!
//! ```text
//! -> {"op":"get","table":"tf1.tm.port.cfg","key":{"dev_port":10},"from_hw":true}
//! <- {"ok":true,"data":[["pg_id",2],["pg_port_nr",1]]}
//! -> {"op":"mod","table":"tf1.tm.port.sched_cfg","key":{"dev_port":10},"data":{"max_rate_enable":true}}
//! <- {"ok":true}
//! -> {"op":"set_pipe","pipe":0}
//! <- {"ok":true}
//! -> {"op":"clear_counters"}
//! <- {"ok":true,"supported":false}
//! ```
//!
//! Entry data may come back as an object or as `[key, value]` pairs whose
//! keys are either strings or UTF-8 byte arrays; both are normalized here.
//! The process is spawned through `/bin/sh -c` on first use and respawned
//! after it dies.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::control_plane::{ControlPlane, FieldKey, FieldMap, FieldValue, TableEntry, TableKey};
use crate::error::{TmError, TmResult};
use crate::tables::TableId;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Get {
        table: &'static str,
        key: BTreeMap<&'static str, u32>,
        from_hw: bool,
    },
    Mod {
        table: &'static str,
        key: BTreeMap<&'static str, u32>,
        data: &'a FieldMap,
    },
    SetPipe {
        pipe: u32,
    },
    ClearCounters,
}

impl Request<'_> {
    fn op(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Mod { .. } => "mod",
            Request::SetPipe { .. } => "set_pipe",
            Request::ClearCounters => "clear_counters",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Request::Get { table, .. } | Request::Mod { table, .. } => *table,
            Request::SetPipe { .. } | Request::ClearCounters => "bfrt",
        }
    }
}

fn encode_key(table: TableId, key: &TableKey) -> BTreeMap<&'static str, u32> {
    key.key_fields(table).into_iter().collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseData {
    Pairs(Vec<(FieldKey, FieldValue)>),
    Map(BTreeMap<String, FieldValue>),
}

#[derive(Debug, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    data: Option<ResponseData>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    supported: Option<bool>,
}

impl Response {
    fn parse(line: &str) -> TmResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| {
            TmError::protocol(format!("unparsable response {:?}: {}", line.trim(), e))
        })
    }

    fn into_entry(self) -> TableEntry {
        match self.data {
            Some(ResponseData::Pairs(pairs)) => TableEntry::from_raw_pairs(pairs),
            Some(ResponseData::Map(map)) => TableEntry::new(map),
            None => TableEntry::default(),
        }
    }
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeProcess {
    fn spawn(command: &str) -> TmResult<Self> {
        debug!(command = %command, "Spawning control-plane bridge");
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TmError::bridge_unavailable(format!("cannot spawn {:?}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TmError::bridge_unavailable("bridge stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TmError::bridge_unavailable("bridge stdout not captured"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn roundtrip(&mut self, line: &str) -> TmResult<String> {
        let io_err = |e: std::io::Error| TmError::bridge_unavailable(e.to_string());
        self.stdin.write_all(line.as_bytes()).await.map_err(io_err)?;
        self.stdin.write_all(b"\n").await.map_err(io_err)?;
        self.stdin.flush().await.map_err(io_err)?;

        let mut response = String::new();
        let n = self.stdout.read_line(&mut response).await.map_err(io_err)?;
        if n == 0 {
            let status = self.child.try_wait().ok().flatten();
            return Err(TmError::bridge_unavailable(match status {
                Some(status) => format!("bridge exited ({})", status),
                None => "bridge closed its output".to_string(),
            }));
        }
        Ok(response)
    }
}

/// [`ControlPlane`] backed by a bridge subprocess.
pub struct BridgeClient {
    command: String,
    process: Mutex<Option<BridgeProcess>>,
}

impl BridgeClient {
    /// Creates a client; the bridge is spawned on the first call.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            process: Mutex::new(None),
        }
    }

    async fn call(&self, request: &Request<'_>) -> TmResult<Response> {
        let line = serde_json::to_string(request)?;
        let mut guard = self.process.lock().await;
        // Held outside the slot while a request is in flight: if the call is
        // dropped midway the process goes with it and the next call respawns.
        let mut process = match guard.take() {
            Some(process) => process,
            None => BridgeProcess::spawn(&self.command)?,
        };

        debug!(request = %line, "bridge request");
        let raw = match process.roundtrip(&line).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Control-plane bridge lost: {}", e);
                return Err(e);
            }
        };
        *guard = Some(process);
        drop(guard);
        debug!(response = %raw.trim_end(), "bridge response");

        let response = Response::parse(&raw)?;
        if !response.ok {
            return Err(TmError::control_plane(
                request.op(),
                request.table(),
                response
                    .error
                    .clone()
                    .unwrap_or_else(|| "request rejected".to_string()),
            ));
        }
        Ok(response)
    }

    /// Stops the bridge process if it is running.
    pub async fn shutdown(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            drop(process.stdin);
            if let Err(e) = process.child.kill().await {
                debug!("Bridge already gone: {}", e);
            }
        }
    }
}

#[async_trait]
impl ControlPlane for BridgeClient {
    #[instrument(skip(self), level = "debug")]
    async fn get(&self, table: TableId, key: &TableKey, from_hw: bool) -> TmResult<TableEntry> {
        let request = Request::Get {
            table: table.path(),
            key: encode_key(table, key),
            from_hw,
        };
        Ok(self.call(&request).await?.into_entry())
    }

    #[instrument(skip(self, data), level = "debug")]
    async fn modify(&self, table: TableId, key: &TableKey, data: &FieldMap) -> TmResult<()> {
        let request = Request::Mod {
            table: table.path(),
            key: encode_key(table, key),
            data,
        };
        self.call(&request).await.map(|_| ())
    }

    async fn select_pipe(&self, pipe: u32) -> TmResult<()> {
        self.call(&Request::SetPipe { pipe }).await.map(|_| ())
    }

    async fn clear_counters(&self) -> TmResult<bool> {
        let response = self.call(&Request::ClearCounters).await?;
        Ok(response.supported.unwrap_or(true))
    }
}
