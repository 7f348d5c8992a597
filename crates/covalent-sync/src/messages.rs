//! Sync protocol message types.
//!
//! Four messages travel between peers, tagged by `action`:
//!
//! - `load`: "tell me what is new since this known state"
//! - `known`: acknowledgement, or with `isCorrection` an authoritative reset
//!   of what the sender assumed about us
//! - `content`: header and/or transactions
//! - `done`: loading `id` finished without further content

use serde::{Deserialize, Serialize};

use covalent_core::{CoValueId, KnownState, NewContentMessage, Priority};

use crate::error::{Result, SyncError};

/// A KNOWN message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownMessage {
    #[serde(flatten)]
    pub known: KnownState,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_correction: bool,
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    Load(KnownState),
    Known(KnownMessage),
    Content(NewContentMessage),
    Done { id: CoValueId },
}

impl SyncMessage {
    pub fn known(known: KnownState) -> Self {
        Self::Known(KnownMessage {
            known,
            is_correction: false,
        })
    }

    pub fn correction(known: KnownState) -> Self {
        Self::Known(KnownMessage {
            known,
            is_correction: true,
        })
    }

    /// The CoValue the message is about.
    pub fn id(&self) -> CoValueId {
        match self {
            Self::Load(known) => known.id,
            Self::Known(msg) => msg.known.id,
            Self::Content(content) => content.id,
            Self::Done { id } => *id,
        }
    }

    /// Control messages go first; content keeps its own priority.
    pub fn priority(&self) -> Priority {
        match self {
            Self::Content(content) => content.priority,
            _ => Priority::High,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, Self::Content(_))
    }

    /// Encode for a text transport.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    /// Decode from a text transport.
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, SessionId};

    #[test]
    fn test_wire_shape() {
        let session = SessionId::new_random(AgentSecret::generate().id());
        let mut known = KnownState::empty(CoValueId([5; 20]));
        known.header = true;
        known.sessions.insert(session.clone(), 3);

        let json: serde_json::Value = serde_json::from_str(&SyncMessage::correction(known.clone()).to_json().unwrap()).unwrap();
        assert_eq!(json["action"], "known");
        assert_eq!(json["isCorrection"], true);
        assert_eq!(json["sessions"][session.to_string()], 3);

        let plain: serde_json::Value = serde_json::from_str(&SyncMessage::known(known.clone()).to_json().unwrap()).unwrap();
        assert!(plain.get("isCorrection").is_none());

        let load = SyncMessage::Load(known);
        assert_eq!(SyncMessage::from_json(&load.to_json().unwrap()).unwrap(), load);
    }

    #[test]
    fn test_control_messages_are_high_priority() {
        let id = CoValueId([1; 20]);
        assert_eq!(SyncMessage::Done { id }.priority(), Priority::High);
        let content = NewContentMessage::new(id, None, Priority::Low);
        assert_eq!(SyncMessage::Content(content).priority(), Priority::Low);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            SyncMessage::from_json(r#"{"action":"shout"}"#),
            Err(SyncError::InvalidMessage(_))
        ));
    }
}
