//! Invite credentials.
//!
//! An invite is a throwaway agent that holds an invite role in a group. Its
//! secret travels out of band as `<groupId>/<role>/<agentSecret>`.

use std::fmt;
use std::str::FromStr;

use covalent_core::{AgentSecret, CoValueId};

use crate::error::PermsError;
use crate::role::Role;

/// A redeemable invite into a group.
#[derive(Clone)]
pub struct Invite {
    pub group: CoValueId,
    /// Role granted on acceptance (not the invite role itself).
    pub role: Role,
    pub secret: AgentSecret,
}

impl fmt::Display for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.role, self.secret)
    }
}

impl fmt::Debug for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invite")
            .field("group", &self.group)
            .field("role", &self.role)
            .field("agent", &self.secret.id())
            .finish()
    }
}

impl FromStr for Invite {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let (Some(group), Some(role), Some(secret)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(PermsError::InvalidInvite(format!("expected group/role/secret, got {s:?}")));
        };
        let role: Role = role.parse()?;
        if role.invite().is_none() {
            return Err(PermsError::InvalidInvite(format!("role {role} cannot be invited")));
        }
        Ok(Self {
            group: group.parse()?,
            role,
            secret: secret.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_string_round_trips() {
        let invite = Invite {
            group: CoValueId([4; 20]),
            role: Role::Writer,
            secret: AgentSecret::generate(),
        };
        let parsed: Invite = invite.to_string().parse().unwrap();
        assert_eq!(parsed.group, invite.group);
        assert_eq!(parsed.role, Role::Writer);
        assert_eq!(parsed.secret.id(), invite.secret.id());
    }

    #[test]
    fn test_rejects_non_invitable_role() {
        let s = format!("{}/revoked/{}", CoValueId([4; 20]), AgentSecret::generate());
        assert!(s.parse::<Invite>().is_err());
        assert!("garbage".parse::<Invite>().is_err());
    }
}
