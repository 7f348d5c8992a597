//! CONTENT payloads: the unit of transfer between peers and storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Signature;
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, SessionId};
use crate::known_state::KnownState;
use crate::transaction::Transaction;

/// Scheduling priority of a message. Affects ordering only, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// New transactions for one session, starting after `after` known ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewContent {
    pub after: u64,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the hash of transactions `0..after + new_transactions.len()`.
    pub last_signature: Signature,
}

/// A piece of content for one CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContentMessage {
    pub id: CoValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: Priority,
    pub new: BTreeMap<SessionId, SessionNewContent>,
    /// Set on the first piece of a multi-piece transfer: the sender's session
    /// counts once every piece has arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<BTreeMap<SessionId, u64>>,
}

impl NewContentMessage {
    pub fn new(id: CoValueId, header: Option<CoValueHeader>, priority: Priority) -> Self {
        Self {
            id,
            header,
            priority,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// No header and no transactions.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.values().all(|s| s.new_transactions.is_empty())
    }

    /// Number of transactions carried.
    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    /// What the sender of this message has, at least: the header and every
    /// session up to the end of the carried transactions.
    pub fn implied_known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .new
                .iter()
                .map(|(session, piece)| (session.clone(), piece.after + piece.new_transactions.len() as u64))
                .collect(),
        }
    }
}
