//! `CoMap`: a last-writer-wins map.
//!
//! Changes are `{"op": "set", "key", "value"}` and `{"op": "del", "key"}`.
//! For each key the change of the latest `(madeAt, txId)` wins.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use covalent_core::{CoValueId, TransactionId};
use covalent_perms::ValidTransactions;

/// The state of one key as seen by the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Value(Value),
    /// Never set, or deleted.
    Absent,
    /// A transaction the reader cannot decrypt may have written this key
    /// after the latest readable write.
    Unavailable,
}

impl Field {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// One write to a key.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEdit {
    pub tx_id: TransactionId,
    pub made_at: u64,
    /// `None` for deletions.
    pub value: Option<Value>,
}

/// Projection of a map value.
#[derive(Debug, Clone, Default)]
pub struct CoMap {
    id: Option<CoValueId>,
    history: BTreeMap<String, Vec<MapEdit>>,
    latest_unavailable: Option<(u64, TransactionId)>,
}

impl CoMap {
    pub fn from_transactions(id: CoValueId, txs: &ValidTransactions) -> Self {
        let mut map = Self {
            id: Some(id),
            ..Self::default()
        };
        for tx in &txs.transactions {
            for change in &tx.changes {
                let Some(key) = change.get("key").and_then(Value::as_str) else {
                    continue;
                };
                let value = match change.get("op").and_then(Value::as_str) {
                    Some("set") => Some(change.get("value").cloned().unwrap_or(Value::Null)),
                    Some("del") => None,
                    _ => continue,
                };
                map.history.entry(key.to_string()).or_default().push(MapEdit {
                    tx_id: tx.tx_id.clone(),
                    made_at: tx.made_at,
                    value,
                });
            }
        }
        map.latest_unavailable = txs
            .unavailable
            .iter()
            .map(|tx| (tx.made_at, tx.tx_id.clone()))
            .max();
        map
    }

    pub fn id(&self) -> Option<CoValueId> {
        self.id
    }

    /// Current state of `key`.
    pub fn get(&self, key: &str) -> Field {
        let latest = self.last_edit(key);
        if let Some(hidden) = &self.latest_unavailable {
            let newer = match latest {
                Some(edit) => (edit.made_at, &edit.tx_id) < (hidden.0, &hidden.1),
                None => true,
            };
            if newer {
                return Field::Unavailable;
            }
        }
        match latest.and_then(|edit| edit.value.clone()) {
            Some(value) => Field::Value(value),
            None => Field::Absent,
        }
    }

    /// Current value of `key`, if readable and set.
    pub fn value(&self, key: &str) -> Option<Value> {
        match self.get(key) {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn last_edit(&self, key: &str) -> Option<&MapEdit> {
        self.history.get(key)?.last()
    }

    /// Every readable write to `key`, oldest first.
    pub fn edits(&self, key: &str) -> &[MapEdit] {
        self.history.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Keys whose latest readable write is a set.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.history
            .iter()
            .filter(|(_, edits)| edits.last().is_some_and(|e| e.value.is_some()))
            .map(|(key, _)| key.as_str())
    }

    pub fn has_unavailable(&self) -> bool {
        self.latest_unavailable.is_some()
    }

    /// Readable keys and values as a JSON object.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for key in self.keys() {
            if let Field::Value(v) = self.get(key) {
                out.insert(key.to_string(), v);
            }
        }
        Value::Object(out)
    }
}

pub(crate) fn set_op(key: &str, value: Value) -> Value {
    json!({"op": "set", "key": key, "value": value})
}

pub(crate) fn del_op(key: &str) -> Value {
    json!({"op": "del", "key": key})
}
