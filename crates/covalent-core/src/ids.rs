//! Identifiers: CoValue ids, session ids, transaction ids and peer ids.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::AgentId;
use crate::encoding::{prefixed_hex, string_serde};
use crate::error::CoreError;

/// Content-addressed id of a CoValue: the first 20 bytes of the Blake3 hash
/// of its header's JSON encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoValueId(pub [u8; 20]);

prefixed_hex!(CoValueId, "co_", 20);

impl CoValueId {
    /// Derive an id from the canonical bytes of a header.
    pub fn from_header_bytes(bytes: &[u8]) -> Self {
        let digest = blake3::hash(bytes);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest.as_bytes()[..20]);
        Self(id)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

/// One agent's append-only sub-log within a CoValue.
///
/// String form: `<agentId>_session_<hex suffix>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    agent: AgentId,
    suffix: String,
}

impl SessionId {
    /// A new session for `agent` with a random suffix.
    pub fn new_random(agent: AgentId) -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            agent,
            suffix: hex::encode(bytes),
        }
    }

    /// The agent that signs this session.
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// The random suffix distinguishing sessions of the same agent.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

/// Create a new random session for `agent`.
pub fn new_random_session_id(agent: AgentId) -> SessionId {
    SessionId::new_random(agent)
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_{}", self.agent, self.suffix)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:?}/{})", self.agent, self.suffix)
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, suffix) = s
            .rsplit_once("_session_")
            .ok_or_else(|| CoreError::InvalidEncoding(format!("not a session id: {s:?}")))?;
        if suffix.is_empty() || suffix.contains('_') {
            return Err(CoreError::InvalidEncoding(format!("bad session suffix in {s:?}")));
        }
        Ok(Self {
            agent: agent.parse()?,
            suffix: suffix.to_string(),
        })
    }
}

string_serde!(SessionId);

/// Position of a transaction: its session and index within that session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub session_id: SessionId,
    pub tx_index: u64,
}

impl TransactionId {
    pub fn new(session_id: SessionId, tx_index: u64) -> Self {
        Self { session_id, tx_index }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.tx_index)
    }
}

/// Identifier of a connected peer (or of the storage pseudo-peer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    const STORAGE: &'static str = "@storage";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The pseudo-peer used to track storage load state.
    pub fn storage() -> Self {
        Self(Self::STORAGE.to_string())
    }

    pub fn is_storage(&self) -> bool {
        self.0 == Self::STORAGE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
