//! CoValue headers.
//!
//! A header is immutable and fully determines the CoValue's id. Two headers
//! that serialize identically name the same CoValue, which is why uniqueness
//! is part of the header.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content_message::Priority;
use crate::crypto::AgentId;
use crate::ids::{CoValueId, SessionId};

/// The kind of data structure a CoValue materializes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoValueType {
    Map,
    List,
    Stream,
    BinaryStream,
    Group,
    Account,
}

impl CoValueType {
    /// Groups and accounts interpret their own log as an access-control map.
    pub fn is_group_like(&self) -> bool {
        matches!(self, Self::Group | Self::Account)
    }
}

/// Access-control mode of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The CoValue is a group; its log is validated against its own roles.
    Group { initial_admin: AgentId },
    /// Writes are validated against the roles of the owning group.
    OwnedByGroup { group: CoValueId },
    /// Every correctly signed transaction is valid.
    UnsafeAllowAll,
}

/// The immutable header of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub kind: CoValueType,
    pub ruleset: Ruleset,
    pub meta: Option<Value>,
    pub uniqueness: Value,
    pub created_at: Option<u64>,
}

impl CoValueHeader {
    /// Header for a new group administered by `initial_admin`.
    pub fn group(initial_admin: AgentId) -> Self {
        Self {
            kind: CoValueType::Group,
            ruleset: Ruleset::Group { initial_admin },
            meta: None,
            uniqueness: random_uniqueness(),
            created_at: Some(now_millis()),
        }
    }

    /// Header for an agent's account. Accounts are deterministic per agent.
    pub fn account(agent: AgentId) -> Self {
        Self {
            kind: CoValueType::Account,
            ruleset: Ruleset::Group { initial_admin: agent },
            meta: None,
            uniqueness: Value::String(agent.to_string()),
            created_at: None,
        }
    }

    /// Header for a value owned by `group`.
    pub fn owned_by(kind: CoValueType, group: CoValueId, meta: Option<Value>) -> Self {
        Self {
            kind,
            ruleset: Ruleset::OwnedByGroup { group },
            meta,
            uniqueness: random_uniqueness(),
            created_at: Some(now_millis()),
        }
    }

    /// Header for a value without access control.
    pub fn unsafe_allow_all(kind: CoValueType, meta: Option<Value>) -> Self {
        Self {
            kind,
            ruleset: Ruleset::UnsafeAllowAll,
            meta,
            uniqueness: random_uniqueness(),
            created_at: Some(now_millis()),
        }
    }

    /// Header for a branch of `source`, forked at `forked_at`.
    pub fn branch_of(
        source_id: CoValueId,
        source: &CoValueHeader,
        name: &str,
        forked_at: &BTreeMap<SessionId, u64>,
    ) -> Self {
        let meta = serde_json::json!({
            "source": source_id,
            "branch": name,
            "forkedAt": forked_at,
        });
        Self {
            kind: source.kind,
            ruleset: source.ruleset.clone(),
            meta: Some(meta),
            uniqueness: random_uniqueness(),
            created_at: Some(now_millis()),
        }
    }

    /// The content-addressed id of this header.
    pub fn id(&self) -> CoValueId {
        CoValueId::from_header_bytes(&self.canonical_bytes())
    }

    /// JSON encoding used for hashing. Struct fields serialize in declaration
    /// order and `serde_json` maps are sorted, so the encoding is stable.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The group this value is owned by, if any.
    pub fn owner_group(&self) -> Option<CoValueId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(*group),
            _ => None,
        }
    }

    /// The initial admin of a group-like value.
    pub fn initial_admin(&self) -> Option<AgentId> {
        match &self.ruleset {
            Ruleset::Group { initial_admin } => Some(*initial_admin),
            _ => None,
        }
    }

    pub fn is_group_like(&self) -> bool {
        self.kind.is_group_like()
    }

    /// The value this one was branched from.
    pub fn branch_source(&self) -> Option<CoValueId> {
        self.meta
            .as_ref()?
            .get("source")?
            .as_str()?
            .parse()
            .ok()
    }

    /// Name of the branch, if this value is one.
    pub fn branch_name(&self) -> Option<&str> {
        self.meta.as_ref()?.get("branch")?.as_str()
    }

    /// Known state of the source at the time the branch was created.
    pub fn branch_forked_at(&self) -> Option<BTreeMap<SessionId, u64>> {
        let forked = self.meta.as_ref()?.get("forkedAt")?;
        serde_json::from_value(forked.clone()).ok()
    }

    /// Sync priority for content of this value.
    pub fn priority(&self) -> Priority {
        match self.kind {
            CoValueType::Group | CoValueType::Account => Priority::High,
            CoValueType::BinaryStream => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

fn random_uniqueness() -> Value {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    Value::String(hex::encode(bytes))
}

/// Get current time in milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
