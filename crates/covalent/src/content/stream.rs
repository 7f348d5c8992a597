//! `CoStream` and `BinaryStream`.
//!
//! A stream is a set of per-session feeds; each change `{"op": "push",
//! "item"}` appends one item to the writer's session. A binary stream is a
//! stream whose items are `start`, `chunk` and `end` records.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};

use covalent_core::{AgentId, CoValueId, SessionId, TransactionId};
use covalent_perms::ValidTransactions;

use crate::error::{NodeError, Result};

/// One pushed item.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub tx_id: TransactionId,
    pub made_at: u64,
    pub value: Value,
}

/// Projection of a stream value.
#[derive(Debug, Clone, Default)]
pub struct CoStream {
    id: Option<CoValueId>,
    sessions: BTreeMap<SessionId, Vec<StreamItem>>,
    has_unavailable: bool,
}

impl CoStream {
    pub fn from_transactions(id: CoValueId, txs: &ValidTransactions) -> Self {
        let mut sessions: BTreeMap<SessionId, Vec<StreamItem>> = BTreeMap::new();
        for tx in &txs.transactions {
            for change in &tx.changes {
                if change.get("op").and_then(Value::as_str) != Some("push") {
                    continue;
                }
                sessions
                    .entry(tx.tx_id.session_id.clone())
                    .or_default()
                    .push(StreamItem {
                        tx_id: tx.tx_id.clone(),
                        made_at: tx.made_at,
                        value: change.get("item").cloned().unwrap_or(Value::Null),
                    });
            }
        }
        Self {
            id: Some(id),
            sessions,
            has_unavailable: !txs.unavailable.is_empty(),
        }
    }

    pub fn id(&self) -> Option<CoValueId> {
        self.id
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, Vec<StreamItem>> {
        &self.sessions
    }

    pub fn session_items(&self, session: &SessionId) -> &[StreamItem] {
        self.sessions.get(session).map(Vec::as_slice).unwrap_or_default()
    }

    /// Items from every session of `agent`, oldest first.
    pub fn items_by(&self, agent: &AgentId) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self
            .sessions
            .iter()
            .filter(|(session, _)| session.agent() == agent)
            .flat_map(|(_, items)| items.iter())
            .collect();
        items.sort_by(|a, b| (a.made_at, &a.tx_id).cmp(&(b.made_at, &b.tx_id)));
        items
    }

    /// Latest item pushed by `agent`.
    pub fn last_item_by(&self, agent: &AgentId) -> Option<&StreamItem> {
        self.items_by(agent).pop()
    }

    /// All items across sessions, oldest first.
    pub fn all_items(&self) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self.sessions.values().flatten().collect();
        items.sort_by(|a, b| (a.made_at, &a.tx_id).cmp(&(b.made_at, &b.tx_id)));
        items
    }

    pub fn len(&self) -> usize {
        self.sessions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_unavailable(&self) -> bool {
        self.has_unavailable
    }
}

pub(crate) fn push_op(item: Value) -> Value {
    json!({"op": "push", "item": item})
}

/// Metadata from a binary stream's `start` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub mime_type: String,
    pub total_size: Option<u64>,
    pub file_name: Option<String>,
}

/// Projection of a binary stream.
#[derive(Debug, Clone, Default)]
pub struct BinaryStream {
    info: Option<BinaryInfo>,
    chunks: Vec<Bytes>,
    finished: bool,
}

impl BinaryStream {
    /// Reads records in push order. Records before `start` or after `end`
    /// are ignored, as are chunks that are not valid hex.
    pub fn from_stream(stream: &CoStream) -> Self {
        let mut out = Self::default();
        for item in stream.all_items() {
            match item.value.get("type").and_then(Value::as_str) {
                Some("start") if out.info.is_none() => {
                    out.info = Some(BinaryInfo {
                        mime_type: item
                            .value
                            .get("mimeType")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        total_size: item.value.get("totalSizeBytes").and_then(Value::as_u64),
                        file_name: item.value.get("fileName").and_then(Value::as_str).map(str::to_string),
                    });
                }
                Some("chunk") if out.info.is_some() && !out.finished => {
                    let decoded = item
                        .value
                        .get("chunk")
                        .and_then(Value::as_str)
                        .and_then(|hex_str| hex::decode(hex_str).ok());
                    match decoded {
                        Some(chunk) => out.chunks.push(Bytes::from(chunk)),
                        None => tracing::warn!(tx = %item.tx_id, "skipping malformed binary chunk"),
                    }
                }
                Some("end") if out.info.is_some() => out.finished = true,
                _ => {}
            }
        }
        out
    }

    pub fn info(&self) -> Option<&BinaryInfo> {
        self.info.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn received_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// The complete payload, once `end` has been written.
    pub fn bytes(&self) -> Result<Bytes> {
        if !self.finished {
            return Err(NodeError::InvalidOperation("binary stream is not finished".into()));
        }
        let mut out = BytesMut::with_capacity(self.received_len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }
}

pub(crate) fn binary_start(mime_type: &str, total_size: usize, file_name: Option<&str>) -> Value {
    let mut start = json!({
        "type": "start",
        "mimeType": mime_type,
        "totalSizeBytes": total_size,
    });
    if let (Some(name), Some(obj)) = (file_name, start.as_object_mut()) {
        obj.insert("fileName".into(), json!(name));
    }
    start
}

pub(crate) fn binary_chunk(chunk: &[u8]) -> Value {
    json!({"type": "chunk", "chunk": hex::encode(chunk)})
}

pub(crate) fn binary_end() -> Value {
    json!({"type": "end"})
}
