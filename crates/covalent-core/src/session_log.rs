//! Per-session hash-chained transaction logs.
//!
//! A session log keeps the transactions of one session in append order
//! together with a streaming hash over all of them. The last signature always
//! covers the full sequence. Whenever the payload written since the previous
//! in-between signature grows past [`MAX_RECOMMENDED_TX_SIZE`], the signature
//! of that append is also kept in `signature_after`, so the log can later be
//! sent in verifiable pieces.

use std::collections::BTreeMap;

use crate::crypto::{Hash, Signature, StreamingHash};
use crate::transaction::Transaction;

/// Payload size after which a session records an in-between signature.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Where a session log stood, so later appends can be rolled back.
#[derive(Debug, Clone)]
pub struct SessionHead {
    len: usize,
    streaming_hash: StreamingHash,
    last_hash: Option<Hash>,
    last_signature: Option<Signature>,
    size_since_signature: usize,
}

/// The verified transaction log of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    streaming_hash: StreamingHash,
    last_hash: Option<Hash>,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<usize, Signature>,
    size_since_signature: usize,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Hash of the full transaction sequence.
    pub fn last_hash(&self) -> Option<&Hash> {
        self.last_hash.as_ref()
    }

    /// Signature over [`SessionLog::last_hash`].
    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// In-between signature covering transactions `0..=idx`.
    pub fn signature_after(&self, idx: usize) -> Option<&Signature> {
        self.signature_after.get(&idx)
    }

    pub fn signatures_after(&self) -> &BTreeMap<usize, Signature> {
        &self.signature_after
    }

    /// Hash the log would have after appending `new`, and the hasher state that
    /// produced it.
    pub fn expected_hash_after(&self, new: &[Transaction]) -> (Hash, StreamingHash) {
        let mut hasher = self.streaming_hash.clone();
        for tx in new {
            hasher.update(&tx.hash_bytes());
        }
        (hasher.digest(), hasher)
    }

    /// Append already-verified transactions.
    ///
    /// `hash` and `hasher` must come from [`SessionLog::expected_hash_after`]
    /// for exactly these transactions.
    pub fn append(&mut self, new: Vec<Transaction>, hash: Hash, hasher: StreamingHash, signature: Signature) {
        if new.is_empty() {
            return;
        }
        self.size_since_signature += new.iter().map(Transaction::payload_len).sum::<usize>();
        self.transactions.extend(new);
        self.streaming_hash = hasher;
        self.last_hash = Some(hash);
        self.last_signature = Some(signature);

        if self.size_since_signature > MAX_RECOMMENDED_TX_SIZE {
            self.signature_after.insert(self.transactions.len() - 1, signature);
            self.size_since_signature = 0;
        }
    }

    pub fn head(&self) -> SessionHead {
        SessionHead {
            len: self.transactions.len(),
            streaming_hash: self.streaming_hash.clone(),
            last_hash: self.last_hash,
            last_signature: self.last_signature,
            size_since_signature: self.size_since_signature,
        }
    }

    /// Drop everything appended since `head` was taken from this log.
    pub fn rewind(&mut self, head: SessionHead) {
        if head.len >= self.transactions.len() {
            return;
        }
        self.transactions.truncate(head.len);
        self.signature_after.retain(|idx, _| *idx < head.len);
        self.streaming_hash = head.streaming_hash;
        self.last_hash = head.last_hash;
        self.last_signature = head.last_signature;
        self.size_since_signature = head.size_since_signature;
    }

    /// Smallest in-between signature index at or after `from`.
    pub fn next_signature_index(&self, from: usize) -> Option<usize> {
        self.signature_after.range(from..).next().map(|(idx, _)| *idx)
    }
}
