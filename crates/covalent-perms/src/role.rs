//! Roles and their precedence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PermsError;

/// A role a principal holds in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    WriteOnly,
    Revoked,
    AdminInvite,
    WriterInvite,
    ReaderInvite,
    WriteOnlyInvite,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Writer => "writer",
            Self::Reader => "reader",
            Self::WriteOnly => "writeOnly",
            Self::Revoked => "revoked",
            Self::AdminInvite => "adminInvite",
            Self::WriterInvite => "writerInvite",
            Self::ReaderInvite => "readerInvite",
            Self::WriteOnlyInvite => "writeOnlyInvite",
        }
    }

    pub fn is_invite(&self) -> bool {
        self.invited_role().is_some()
    }

    /// The role an invite of this kind grants.
    pub fn invited_role(&self) -> Option<Role> {
        match self {
            Self::AdminInvite => Some(Self::Admin),
            Self::WriterInvite => Some(Self::Writer),
            Self::ReaderInvite => Some(Self::Reader),
            Self::WriteOnlyInvite => Some(Self::WriteOnly),
            _ => None,
        }
    }

    /// The invite role that grants this role.
    pub fn invite(&self) -> Option<Role> {
        match self {
            Self::Admin => Some(Self::AdminInvite),
            Self::Writer => Some(Self::WriterInvite),
            Self::Reader => Some(Self::ReaderInvite),
            Self::WriteOnly => Some(Self::WriteOnlyInvite),
            _ => None,
        }
    }

    /// Roles that may write content into values owned by the group.
    pub fn can_write(&self) -> bool {
        matches!(self, Self::Admin | Self::Writer | Self::WriteOnly)
    }

    /// Roles that receive the group's read key.
    pub fn can_read(&self) -> bool {
        matches!(self, Self::Admin | Self::Writer | Self::Reader)
    }

    /// Roles that may be held by the `everyone` principal.
    pub fn allowed_for_everyone(&self) -> bool {
        matches!(self, Self::Writer | Self::Reader | Self::WriteOnly | Self::Revoked)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "admin" => Self::Admin,
            "writer" => Self::Writer,
            "reader" => Self::Reader,
            "writeOnly" => Self::WriteOnly,
            "revoked" => Self::Revoked,
            "adminInvite" => Self::AdminInvite,
            "writerInvite" => Self::WriterInvite,
            "readerInvite" => Self::ReaderInvite,
            "writeOnlyInvite" => Self::WriteOnlyInvite,
            other => return Err(PermsError::InvalidRole(other.to_string())),
        })
    }
}

/// Whether a role inherited from a parent group replaces `current`.
///
/// `writeOnly` and invite roles never pass through extension. `writer`
/// replaces a weaker `reader` or `writeOnly`; `reader` only fills an empty slot.
pub fn is_more_permissive_and_should_inherit(inherited: Role, current: Option<Role>) -> bool {
    match inherited {
        Role::Admin => current != Some(Role::Admin),
        Role::Writer => matches!(current, None | Some(Role::Reader) | Some(Role::WriteOnly)),
        Role::Reader => current.is_none(),
        _ => false,
    }
}
