//! Group map keys.
//!
//! A group's content is a map whose keys encode what an entry means:
//!
//! | Key | Value |
//! |---|---|
//! | `<agentId>` / `everyone` | role |
//! | `readKey` | current read key id |
//! | `<keyId>_for_<agentId>` | key sealed to an agent |
//! | `<keyId>_for_everyone` | key secret in plaintext |
//! | `<keyId>_for_<keyId>` | key encrypted with another key |
//! | `writeKeyFor_<principal>` | id of a writeOnly member's write key |
//! | `parent_<groupId>` | `extend`, a delegated role, or `revoked` |
//! | `child_<groupId>` | `extend` or `revoked` |

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use covalent_core::{AgentId, CoValueId, KeyId};

pub const EVERYONE: &str = "everyone";
/// Stands for the acting agent in caller input. Never a group key.
pub const ME: &str = "me";
pub const READ_KEY: &str = "readKey";
const WRITE_KEY_PREFIX: &str = "writeKeyFor_";
const PARENT_PREFIX: &str = "parent_";
const CHILD_PREFIX: &str = "child_";
const FOR: &str = "_for_";

/// Who a role is granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Principal {
    Agent(AgentId),
    Everyone,
}

impl Principal {
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(agent) => Some(agent),
            Self::Everyone => None,
        }
    }

    /// Parse caller input, resolving `me` to the acting agent.
    pub fn parse_for(s: &str, me: AgentId) -> Result<Self, covalent_core::CoreError> {
        if s == ME {
            Ok(Self::Agent(me))
        } else {
            s.parse()
        }
    }
}

impl From<AgentId> for Principal {
    fn from(agent: AgentId) -> Self {
        Self::Agent(agent)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(agent) => agent.fmt(f),
            Self::Everyone => f.write_str(EVERYONE),
        }
    }
}

impl FromStr for Principal {
    type Err = covalent_core::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == EVERYONE {
            Ok(Self::Everyone)
        } else {
            s.parse().map(Self::Agent)
        }
    }
}

/// Recipient of a key revelation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealedTo {
    Agent(AgentId),
    Everyone,
    Key(KeyId),
}

/// How a child group relates to a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentLink {
    /// Members inherit their parent role.
    Extend,
    /// Members holding any parent role get this role in the child.
    Delegate(crate::Role),
    /// The link has been removed.
    Revoked,
}

impl ParentLink {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "extend" => Some(Self::Extend),
            "revoked" => Some(Self::Revoked),
            role => match role.parse::<crate::Role>() {
                Ok(role) if role.can_read() || role == crate::Role::WriteOnly => Some(Self::Delegate(role)),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extend => "extend",
            Self::Delegate(role) => role.as_str(),
            Self::Revoked => "revoked",
        }
    }
}

/// A parsed group map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupField {
    Member(Principal),
    ReadKey,
    WriteKeyFor(Principal),
    Revelation { key: KeyId, to: RevealedTo },
    Parent(CoValueId),
    Child(CoValueId),
    Other(String),
}

impl GroupField {
    pub fn parse(key: &str) -> Self {
        if key == READ_KEY {
            return Self::ReadKey;
        }
        if let Ok(principal) = key.parse::<Principal>() {
            return Self::Member(principal);
        }
        if let Some(rest) = key.strip_prefix(WRITE_KEY_PREFIX) {
            if let Ok(principal) = rest.parse() {
                return Self::WriteKeyFor(principal);
            }
        }
        if let Some(rest) = key.strip_prefix(PARENT_PREFIX) {
            if let Ok(id) = rest.parse() {
                return Self::Parent(id);
            }
        }
        if let Some(rest) = key.strip_prefix(CHILD_PREFIX) {
            if let Ok(id) = rest.parse() {
                return Self::Child(id);
            }
        }
        if let Some((revealed, to)) = key.split_once(FOR) {
            if let Ok(revealed) = revealed.parse::<KeyId>() {
                let to = if to == EVERYONE {
                    Some(RevealedTo::Everyone)
                } else if let Ok(agent) = to.parse() {
                    Some(RevealedTo::Agent(agent))
                } else {
                    to.parse().ok().map(RevealedTo::Key)
                };
                if let Some(to) = to {
                    return Self::Revelation { key: revealed, to };
                }
            }
        }
        Self::Other(key.to_string())
    }
}

impl fmt::Display for GroupField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Member(principal) => principal.fmt(f),
            Self::ReadKey => f.write_str(READ_KEY),
            Self::WriteKeyFor(principal) => write!(f, "{WRITE_KEY_PREFIX}{principal}"),
            Self::Revelation { key, to } => match to {
                RevealedTo::Agent(agent) => write!(f, "{key}{FOR}{agent}"),
                RevealedTo::Everyone => write!(f, "{key}{FOR}{EVERYONE}"),
                RevealedTo::Key(other) => write!(f, "{key}{FOR}{other}"),
            },
            Self::Parent(id) => write!(f, "{PARENT_PREFIX}{id}"),
            Self::Child(id) => write!(f, "{CHILD_PREFIX}{id}"),
            Self::Other(key) => f.write_str(key),
        }
    }
}

/// Nonce material for a key sealed to an agent.
#[derive(Serialize)]
pub(crate) struct SealNonce<'a> {
    #[serde(rename = "in")]
    pub group: &'a CoValueId,
    pub field: &'a str,
}

/// Nonce material for a key encrypted with another key.
#[derive(Serialize)]
pub(crate) struct KeyForKeyNonce<'a> {
    #[serde(rename = "encryptedID")]
    pub encrypted_id: &'a KeyId,
    #[serde(rename = "encryptingID")]
    pub encrypting_id: &'a KeyId,
}
