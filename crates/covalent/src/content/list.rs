//! `CoList`: a replicated growable array.
//!
//! Every insertion is addressed by its [`OpId`]. Changes:
//!
//! - `{"op": "app", "value", "after": <OpId> | "start"}`
//! - `{"op": "pre", "value", "before": <OpId> | "end"}`
//! - `{"op": "del", "insertion": <OpId>}`
//!
//! Insertions after the same anchor are ordered newest first; insertions
//! before the same anchor oldest first. Deleted items keep their place so
//! later insertions can still anchor on them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use covalent_core::{CoValueId, TransactionId};
use covalent_perms::ValidTransactions;

/// Address of one insertion: a transaction and a change within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub tx: TransactionId,
    pub change: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Anchor {
    Start,
    End,
    Op(OpId),
}

/// A visible list item.
#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    pub op: OpId,
    pub value: Value,
    pub made_at: u64,
}

#[derive(Debug)]
struct Insertion {
    value: Value,
    made_at: u64,
    deleted: bool,
    predecessors: Vec<OpId>,
    successors: Vec<OpId>,
}

enum Visit {
    Enter(OpId),
    Emit(OpId),
}

/// Projection of a list value.
#[derive(Debug, Clone, Default)]
pub struct CoList {
    id: Option<CoValueId>,
    items: Vec<ListItem>,
    has_unavailable: bool,
}

impl CoList {
    pub fn from_transactions(id: CoValueId, txs: &ValidTransactions) -> Self {
        let mut insertions: HashMap<OpId, Insertion> = HashMap::new();
        // (op, anchor, is_after) in log order
        let mut links: Vec<(OpId, Value, bool)> = Vec::new();
        let mut deletions: Vec<OpId> = Vec::new();

        for tx in &txs.transactions {
            for (idx, change) in tx.changes.iter().enumerate() {
                let op = OpId {
                    tx: tx.tx_id.clone(),
                    change: idx as u32,
                };
                match change.get("op").and_then(Value::as_str) {
                    Some("app") | Some("pre") => {
                        let is_after = change.get("op").and_then(Value::as_str) == Some("app");
                        let anchor = change
                            .get(if is_after { "after" } else { "before" })
                            .cloned()
                            .unwrap_or(Value::Null);
                        insertions.insert(
                            op.clone(),
                            Insertion {
                                value: change.get("value").cloned().unwrap_or(Value::Null),
                                made_at: tx.made_at,
                                deleted: false,
                                predecessors: Vec::new(),
                                successors: Vec::new(),
                            },
                        );
                        links.push((op, anchor, is_after));
                    }
                    Some("del") => match change.get("insertion").cloned().map(serde_json::from_value::<OpId>) {
                        Some(Ok(target)) => deletions.push(target),
                        _ => debug!(list = %id, "deletion without a valid target skipped"),
                    },
                    _ => {}
                }
            }
        }

        let mut after_start: Vec<OpId> = Vec::new();
        let mut before_end: Vec<OpId> = Vec::new();
        for (op, anchor, is_after) in links {
            match parse_anchor(&anchor) {
                Some(Anchor::Start) if is_after => after_start.insert(0, op),
                Some(Anchor::End) if !is_after => before_end.push(op),
                Some(Anchor::Op(target)) if target != op && insertions.contains_key(&target) => {
                    if let Some(anchor) = insertions.get_mut(&target) {
                        if is_after {
                            anchor.successors.insert(0, op);
                        } else {
                            anchor.predecessors.push(op);
                        }
                    }
                }
                _ => {
                    debug!(list = %id, "insertion with unknown anchor skipped");
                    insertions.remove(&op);
                }
            }
        }
        for target in deletions {
            if let Some(insertion) = insertions.get_mut(&target) {
                insertion.deleted = true;
            }
        }

        let mut items = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<Visit> = Vec::new();
        for op in after_start.into_iter().chain(before_end).rev() {
            stack.push(Visit::Enter(op));
        }
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(op) => {
                    if !visited.insert(op.clone()) {
                        continue;
                    }
                    let Some(insertion) = insertions.get(&op) else {
                        continue;
                    };
                    for succ in insertion.successors.iter().rev() {
                        stack.push(Visit::Enter(succ.clone()));
                    }
                    stack.push(Visit::Emit(op));
                    for pred in insertion.predecessors.iter().rev() {
                        stack.push(Visit::Enter(pred.clone()));
                    }
                }
                Visit::Emit(op) => {
                    if let Some(insertion) = insertions.get(&op).filter(|i| !i.deleted) {
                        items.push(ListItem {
                            value: insertion.value.clone(),
                            made_at: insertion.made_at,
                            op,
                        });
                    }
                }
            }
        }

        Self {
            id: Some(id),
            items,
            has_unavailable: !txs.unavailable.is_empty(),
        }
    }

    pub fn id(&self) -> Option<CoValueId> {
        self.id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index).map(|item| &item.value)
    }

    pub fn items(&self) -> &[ListItem] {
        &self.items
    }

    pub fn values(&self) -> Vec<Value> {
        self.items.iter().map(|item| item.value.clone()).collect()
    }

    pub fn op_at(&self, index: usize) -> Option<&OpId> {
        self.items.get(index).map(|item| &item.op)
    }

    /// True if some insertions could not be decrypted; the list may be incomplete.
    pub fn has_unavailable(&self) -> bool {
        self.has_unavailable
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.values())
    }
}

fn parse_anchor(anchor: &Value) -> Option<Anchor> {
    match anchor.as_str() {
        Some("start") => Some(Anchor::Start),
        Some("end") => Some(Anchor::End),
        Some(_) => None,
        None => serde_json::from_value(anchor.clone()).ok().map(Anchor::Op),
    }
}

pub(crate) fn append_op(value: Value, after: Option<&OpId>) -> Value {
    let after = after.map_or_else(|| json!("start"), |op| json!(op));
    json!({"op": "app", "value": value, "after": after})
}

pub(crate) fn prepend_op(value: Value, before: Option<&OpId>) -> Value {
    let before = before.map_or_else(|| json!("end"), |op| json!(op));
    json!({"op": "pre", "value": value, "before": before})
}

pub(crate) fn delete_op(target: &OpId) -> Value {
    json!({"op": "del", "insertion": target})
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, SessionId};
    use covalent_perms::DecryptedTransaction;

    struct Log {
        session: SessionId,
        txs: Vec<DecryptedTransaction>,
    }

    impl Log {
        fn new() -> Self {
            Self {
                session: SessionId::new_random(AgentSecret::generate().id()),
                txs: Vec::new(),
            }
        }

        fn push(&mut self, change: Value) -> OpId {
            let tx_id = TransactionId::new(self.session.clone(), self.txs.len() as u64);
            self.txs.push(DecryptedTransaction {
                tx_id: tx_id.clone(),
                made_at: self.txs.len() as u64 + 1,
                changes: vec![change],
            });
            OpId { tx: tx_id, change: 0 }
        }

        fn list(&self) -> CoList {
            let txs = ValidTransactions {
                transactions: self.txs.clone(),
                unavailable: vec![],
            };
            CoList::from_transactions(CoValueId([2; 20]), &txs)
        }
    }

    #[test]
    fn test_append_chain_keeps_order() {
        let mut log = Log::new();
        let a = log.push(append_op(json!("a"), None));
        let b = log.push(append_op(json!("b"), Some(&a)));
        log.push(append_op(json!("c"), Some(&b)));
        assert_eq!(log.list().values(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_concurrent_appends_after_same_anchor_newest_first() {
        let mut log = Log::new();
        let a = log.push(append_op(json!("a"), None));
        log.push(append_op(json!("x"), Some(&a)));
        log.push(append_op(json!("y"), Some(&a)));
        assert_eq!(log.list().values(), vec![json!("a"), json!("y"), json!("x")]);
    }

    #[test]
    fn test_prepend_and_delete() {
        let mut log = Log::new();
        let a = log.push(append_op(json!("a"), None));
        let z = log.push(prepend_op(json!("z"), None));
        log.push(prepend_op(json!("before-a"), Some(&a)));
        assert_eq!(
            log.list().values(),
            vec![json!("before-a"), json!("a"), json!("z")]
        );
        log.push(delete_op(&a));
        let list = log.list();
        assert_eq!(list.values(), vec![json!("before-a"), json!("z")]);
        assert_eq!(list.op_at(1), Some(&z));
    }

    #[test]
    fn test_deleted_item_still_anchors() {
        let mut log = Log::new();
        let a = log.push(append_op(json!("a"), None));
        log.push(delete_op(&a));
        log.push(append_op(json!("b"), Some(&a)));
        assert_eq!(log.list().values(), vec![json!("b")]);
    }

    #[test]
    fn test_unknown_anchor_is_skipped() {
        let mut log = Log::new();
        let ghost = OpId {
            tx: TransactionId::new(log.session.clone(), 99),
            change: 0,
        };
        log.push(append_op(json!("orphan"), Some(&ghost)));
        log.push(append_op(json!("a"), None));
        assert_eq!(log.list().values(), vec![json!("a")]);
    }
}
