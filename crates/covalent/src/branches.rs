//! Branches: forked lineages of a value that can be merged back.
//!
//! A branch is its own CoValue whose header names the source and the
//! source's known state at fork time. Reading a branch shows the source's
//! transactions up to that point plus the branch's own. Merging copies the
//! branch's own transactions into the source and records a `merged` marker
//! so the next merge only copies what came after.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value};
use tracing::debug;

use covalent_core::{CoValueHeader, CoValueId, SessionId, TransactionId};
use covalent_perms::Engine;

use crate::content::OpId;
use crate::error::{NodeError, Result};
use crate::node::{LocalNode, NodeInner, NodeState};

const MERGED_OP: &str = "merged";

/// List change fields that address other insertions.
const OP_REFERENCE_FIELDS: [&str; 3] = ["after", "before", "insertion"];

impl LocalNode {
    /// Fork `source` into a new branch called `name`.
    pub fn create_branch(&self, source: &CoValueId, name: &str) -> Result<CoValueId> {
        self.inner.update(|inner, state, _| {
            let header = NodeInner::available_header(state, source)?;
            if header.is_group_like() {
                return Err(NodeError::InvalidOperation("groups cannot be branched".into()));
            }
            if header.branch_source().is_some() {
                return Err(NodeError::InvalidOperation(format!("{source} is already a branch")));
            }
            if let Some(group) = header.owner_group() {
                inner.require_writer(state, &group)?;
            }
            let forked_at = state
                .registry
                .get(source)
                .map(|core| core.known_state().sessions)
                .unwrap_or_default();
            let branch = inner.insert_value(state, CoValueHeader::branch_of(*source, &header, name, &forked_at));
            debug!(source = %source, branch = %branch, name, "created branch");
            Ok(branch)
        })
    }

    /// Copy the branch's transactions made since the last merge into its
    /// source. Returns how many transactions were copied.
    pub fn merge_branch(&self, branch: &CoValueId) -> Result<usize> {
        self.inner.update(|inner, state, batch| {
            let header = NodeInner::available_header(state, branch)?;
            let source = header
                .branch_source()
                .ok_or_else(|| NodeError::InvalidOperation(format!("{branch} is not a branch")))?;
            NodeInner::available_header(state, &source)?;

            let own = Engine::new(&state.registry).valid_transactions(branch, &inner.agent);
            if !own.unavailable.is_empty() {
                return Err(NodeError::Unauthorized(format!(
                    "{} transactions of {branch} cannot be read",
                    own.unavailable.len()
                )));
            }
            let merged_until = last_merge(inner, state, &source, branch)?;
            let pending: Vec<_> = own
                .transactions
                .into_iter()
                .filter(|tx| tx.tx_id.tx_index >= merged_until.get(&tx.tx_id.session_id).copied().unwrap_or(0))
                .collect();

            let mut copied: HashMap<TransactionId, TransactionId> = HashMap::new();
            for tx in &pending {
                let changes = tx.changes.iter().map(|change| remap_op_references(change, &copied)).collect();
                let new_id = inner.write_content(state, batch, &source, changes)?;
                copied.insert(tx.tx_id.clone(), new_id);
            }

            let until = state
                .registry
                .get(branch)
                .map(|core| core.known_state().sessions)
                .unwrap_or_default();
            inner.write_content(
                state,
                batch,
                &source,
                vec![json!({"op": MERGED_OP, "branch": branch.to_string(), "until": until})],
            )?;
            debug!(branch = %branch, source = %source, copied = pending.len(), "merged branch");
            Ok(pending.len())
        })
    }
}

/// Per-session transaction counts of `branch` recorded by the latest merge
/// marker in `source`.
fn last_merge(
    inner: &NodeInner,
    state: &NodeState,
    source: &CoValueId,
    branch: &CoValueId,
) -> Result<BTreeMap<SessionId, u64>> {
    let branch_ref = branch.to_string();
    let txs = inner.valid_transactions_in(state, source)?;
    let latest = txs
        .transactions
        .iter()
        .rev()
        .flat_map(|tx| tx.changes.iter())
        .find(|change| {
            change.get("op").and_then(Value::as_str) == Some(MERGED_OP)
                && change.get("branch").and_then(Value::as_str) == Some(branch_ref.as_str())
        });
    Ok(latest
        .and_then(|marker| marker.get("until"))
        .and_then(|until| serde_json::from_value(until.clone()).ok())
        .unwrap_or_default())
}

/// Point list op references at the copies of transactions merged earlier.
fn remap_op_references(change: &Value, copied: &HashMap<TransactionId, TransactionId>) -> Value {
    let mut change = change.clone();
    let Some(fields) = change.as_object_mut() else {
        return change;
    };
    for field in OP_REFERENCE_FIELDS {
        let Some(op) = fields
            .get(field)
            .and_then(|value| serde_json::from_value::<OpId>(value.clone()).ok())
        else {
            continue;
        };
        if let Some(new_tx) = copied.get(&op.tx) {
            let remapped = OpId {
                tx: new_tx.clone(),
                change: op.change,
            };
            fields.insert(field.to_string(), json!(remapped));
        }
    }
    change
}
