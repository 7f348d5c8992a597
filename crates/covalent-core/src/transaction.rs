//! Transactions: the unit appended to a session log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{Encrypted, KeyId, KeySecret};
use crate::error::{CoreError, Result};
use crate::ids::{CoValueId, TransactionId};

/// A plaintext transaction. `changes` is the JSON encoding of an array of changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustingTransaction {
    pub made_at: u64,
    pub changes: String,
}

/// A transaction whose changes are encrypted under a group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateTransaction {
    pub made_at: u64,
    pub key_used: KeyId,
    pub encrypted_changes: Encrypted,
}

/// A single entry in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "lowercase")]
pub enum Transaction {
    Trusting(TrustingTransaction),
    Private(PrivateTransaction),
}

impl Transaction {
    /// Author-claimed creation time (Unix ms).
    pub fn made_at(&self) -> u64 {
        match self {
            Self::Trusting(tx) => tx.made_at,
            Self::Private(tx) => tx.made_at,
        }
    }

    /// Size of the payload, used to decide where to place in-between signatures
    /// and how to split content messages.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Trusting(tx) => tx.changes.len(),
            Self::Private(tx) => tx.encrypted_changes.encoded_len(),
        }
    }

    /// Bytes fed into the session's streaming hash.
    pub fn hash_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private(_))
    }

    /// Build a plaintext transaction.
    pub fn trusting(made_at: u64, changes: &[Value]) -> Result<Self> {
        Ok(Self::Trusting(TrustingTransaction {
            made_at,
            changes: serde_json::to_string(changes)?,
        }))
    }

    /// Build an encrypted transaction for position `tx_id` of `co_value`.
    pub fn private(
        made_at: u64,
        changes: &[Value],
        key_id: KeyId,
        key: &KeySecret,
        co_value: &CoValueId,
        tx_id: &TransactionId,
    ) -> Result<Self> {
        let plaintext = serde_json::to_vec(changes)?;
        let encrypted_changes = key.encrypt(&plaintext, &ChangesNonce::new(co_value, tx_id))?;
        Ok(Self::Private(PrivateTransaction {
            made_at,
            key_used: key_id,
            encrypted_changes,
        }))
    }
}

impl PrivateTransaction {
    /// Decrypt the changes string. Returns the raw JSON text, which may still
    /// fail to parse.
    pub fn decrypt(&self, key: &KeySecret, co_value: &CoValueId, tx_id: &TransactionId) -> Result<String> {
        let bytes = key.decrypt(&self.encrypted_changes, &ChangesNonce::new(co_value, tx_id))?;
        String::from_utf8(bytes).map_err(|e| CoreError::Decryption(e.to_string()))
    }
}

/// Nonce material for encrypted changes: unique per transaction position.
#[derive(Serialize)]
struct ChangesNonce<'a> {
    #[serde(rename = "in")]
    co_value: &'a CoValueId,
    tx: &'a TransactionId,
}

impl<'a> ChangesNonce<'a> {
    fn new(co_value: &'a CoValueId, tx: &'a TransactionId) -> Self {
        Self { co_value, tx }
    }
}

/// Parse a changes string into a JSON array. Non-array JSON is an error.
pub fn parse_changes(changes: &str) -> Result<Vec<Value>> {
    Ok(serde_json::from_str(changes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{new_random_key, AgentSecret};
    use crate::ids::SessionId;
    use serde_json::json;

    #[test]
    fn test_trusting_json_shape() {
        let tx = Transaction::trusting(5, &[json!({"op": "set", "key": "a", "value": 1})]).unwrap();
        let json = serde_json::to_value(&tx).unwrap();

        assert_eq!(json["privacy"], "trusting");
        assert_eq!(json["made_at"], 5);
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_private_roundtrip() {
        let (key_id, key) = new_random_key();
        let co = CoValueId([1u8; 20]);
        let session = SessionId::new_random(AgentSecret::generate().id());
        let tx_id = TransactionId::new(session, 0);

        let tx = Transaction::private(9, &[json!({"op": "set"})], key_id, &key, &co, &tx_id).unwrap();
        let Transaction::Private(private) = &tx else {
            panic!("expected private transaction");
        };

        let plain = private.decrypt(&key, &co, &tx_id).unwrap();
        assert_eq!(parse_changes(&plain).unwrap(), vec![json!({"op": "set"})]);

        let other_pos = TransactionId::new(tx_id.session_id.clone(), 1);
        assert!(private.decrypt(&key, &co, &other_pos).is_err());

        let back: Transaction = serde_json::from_str(&serde_json::to_string(&tx).unwrap()).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_parse_changes_rejects_non_arrays() {
        assert!(parse_changes("{\"op\":\"set\"}").is_err());
        assert!(parse_changes("not json").is_err());
        assert_eq!(parse_changes("[]").unwrap(), Vec::<Value>::new());
    }
}
