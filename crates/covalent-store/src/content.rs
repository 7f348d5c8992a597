//! Applying CONTENT to a stored value, with correction detection.
//!
//! Both backends run the same steps on the [`VerifiedState`] they hold:
//! checkpoint it, apply the message in place, and roll back to the
//! checkpoint unless everything lined up. A message whose `after` offsets
//! assume more than the store holds asks the caller for a correction once.

use std::collections::HashSet;

use tracing::{debug, error};

use covalent_core::{CoValueCoreError, CoValueId, KnownState, NewContentMessage, VerifiedState};

use crate::error::Result;

/// What applying one message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Header and transactions are in the candidate state.
    Applied,
    /// The message assumed transactions (or a header) the state lacks.
    /// Carries what the state actually holds.
    NeedsCorrection(KnownState),
}

/// Apply a content message to `state`, creating it from the message header
/// if needed.
///
/// All `after` offsets are checked before anything is appended. Overlapping
/// transactions the state already holds are skipped. On a verification error
/// `state` may hold a partial append; take a [`VerifiedState::checkpoint`]
/// first to undo it.
pub fn apply_content(
    state: &mut Option<VerifiedState>,
    msg: &NewContentMessage,
) -> std::result::Result<Applied, CoValueCoreError> {
    let known = match state {
        Some(verified) => verified.known_state(),
        None => KnownState::empty(msg.id),
    };

    let new_header = match state {
        Some(_) => None,
        None => {
            let Some(header) = &msg.header else {
                return Ok(Applied::NeedsCorrection(known));
            };
            let actual = header.id();
            if actual != msg.id {
                return Err(CoValueCoreError::HeaderMismatch {
                    expected: msg.id,
                    actual,
                });
            }
            Some(header)
        }
    };

    if msg
        .new
        .iter()
        .any(|(session, piece)| piece.after > known.session_count(session))
    {
        return Ok(Applied::NeedsCorrection(known));
    }

    if let Some(header) = new_header {
        *state = Some(VerifiedState::new(header.clone()));
    }
    let Some(verified) = state.as_mut() else {
        return Ok(Applied::NeedsCorrection(known));
    };

    for (session, piece) in &msg.new {
        let held = verified.session_tx_count(session);
        let skip = (held - piece.after) as usize;
        if skip >= piece.new_transactions.len() {
            continue;
        }
        verified.try_add_transactions(
            session,
            piece.new_transactions[skip..].to_vec(),
            None,
            &piece.last_signature,
        )?;
    }

    Ok(Applied::Applied)
}

/// Apply `msg` to `state` in place, asking `on_correction` at most once for
/// content computed from what the store actually holds.
///
/// Returns whether the message was stored. On `Ok(false)` or an error every
/// append made here is rolled back, and a state created from the message
/// header is dropped again.
pub(crate) fn store_with_correction(
    state: &mut Option<VerifiedState>,
    msg: &NewContentMessage,
    on_correction: &mut (dyn FnMut(&KnownState) -> Option<Vec<NewContentMessage>> + Send),
) -> Result<bool> {
    let checkpoint = state.as_ref().map(VerifiedState::checkpoint);
    let outcome = apply_with_correction(state, msg, on_correction);
    if !matches!(outcome, Ok(true)) {
        match (checkpoint, state.as_mut()) {
            (Some(checkpoint), Some(verified)) => verified.rollback(checkpoint),
            _ => *state = None,
        }
    }
    outcome
}

fn apply_with_correction(
    state: &mut Option<VerifiedState>,
    msg: &NewContentMessage,
    on_correction: &mut (dyn FnMut(&KnownState) -> Option<Vec<NewContentMessage>> + Send),
) -> Result<bool> {
    let id = msg.id;
    let actual = match apply_content(state, msg)? {
        Applied::Applied => return Ok(has_header(id, state)),
        Applied::NeedsCorrection(actual) => actual,
    };

    debug!(id = %id, "content assumes more than stored, requesting correction");
    let Some(corrections) = on_correction(&actual) else {
        error!(id = %id, "correction callback returned no content, store failed");
        return Ok(false);
    };

    for piece in &corrections {
        if let Applied::NeedsCorrection(_) = apply_content(state, piece)? {
            error!(id = %id, "double correction requested, store failed");
            return Ok(false);
        }
    }

    Ok(has_header(id, state))
}

fn has_header(id: CoValueId, state: &Option<VerifiedState>) -> bool {
    if state.is_none() {
        error!(id = %id, "content carried no header for an unknown value");
    }
    state.is_some()
}

/// Ids reachable from `root` through `deps_of`, dependencies first.
///
/// `deps_of` returns `None` for ids the store does not hold; those are left
/// out. Cycles are cut by the visited set.
pub(crate) fn dependency_order<F>(root: CoValueId, mut deps_of: F) -> Result<Vec<CoValueId>>
where
    F: FnMut(&CoValueId) -> Result<Option<Vec<CoValueId>>>,
{
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        let Some(deps) = deps_of(&id)? else {
            continue;
        };
        stack.push((id, true));
        for dep in deps.into_iter().rev() {
            if !visited.contains(&dep) {
                stack.push((dep, false));
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, CoValueHeader, CoValueType, Priority, SessionId, Transaction};
    use serde_json::json;

    fn source(n: u64) -> VerifiedState {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for i in 0..n {
            let txs = vec![Transaction::trusting(i, &[json!({"op": "set", "key": "k", "value": i})]).unwrap()];
            let hash = state.expected_new_hash(&session, &txs);
            state.try_add_transactions(&session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
        }
        state
    }

    #[test]
    fn test_header_less_content_for_unknown_value_needs_correction() {
        let src = source(2);
        let mut pieces = src.new_content_since(None, Priority::Medium).unwrap();
        pieces[0].header = None;

        let mut state = None;
        let applied = apply_content(&mut state, &pieces[0]).unwrap();
        assert_eq!(applied, Applied::NeedsCorrection(KnownState::empty(src.id())));
        assert!(state.is_none());
    }

    #[test]
    fn test_overlapping_content_is_skipped() {
        let src = source(5);
        let all = src.new_content_since(None, Priority::Medium).unwrap();

        let mut state = None;
        apply_content(&mut state, &all[0]).unwrap();
        assert_eq!(apply_content(&mut state, &all[0]).unwrap(), Applied::Applied);
        assert_eq!(state.unwrap().known_state(), src.known_state());
    }

    #[test]
    fn test_single_correction_succeeds() {
        let src = source(4);
        let mut partial = src.known_state();
        let session = partial.sessions.keys().next().unwrap().clone();
        partial.sessions.insert(session, 2);
        let stale = src.new_content_since(Some(&partial), Priority::Medium).unwrap();

        let mut calls = 0;
        let mut state = None;
        let stored = store_with_correction(&mut state, &stale[0], &mut |actual: &KnownState| {
            calls += 1;
            src.new_content_since(Some(actual), Priority::Medium)
        })
        .unwrap();

        assert!(stored);
        assert_eq!(calls, 1);
        assert_eq!(state.unwrap().known_state(), src.known_state());
    }

    #[test]
    fn test_double_correction_is_rejected() {
        let src = source(4);
        let mut partial = src.known_state();
        let session = partial.sessions.keys().next().unwrap().clone();
        partial.sessions.insert(session, 2);
        let stale = src.new_content_since(Some(&partial), Priority::Medium).unwrap();

        let mut state = None;
        assert!(!store_with_correction(&mut state, &stale[0], &mut |_: &KnownState| Some(stale.clone())).unwrap());
        assert!(state.is_none());

        assert!(!store_with_correction(&mut state, &stale[0], &mut |_: &KnownState| None).unwrap());
        assert!(state.is_none());
    }

    #[test]
    fn test_failed_correction_rolls_back_applied_pieces() {
        let agent = AgentSecret::generate();
        let first = SessionId::new_random(agent.id());
        let second = SessionId::new_random(agent.id());
        let mut src = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        let add = |state: &mut VerifiedState, session: &SessionId, i: u64| {
            let txs = vec![Transaction::trusting(i, &[json!({"op": "set", "key": "k", "value": i})]).unwrap()];
            let hash = state.expected_new_hash(session, &txs);
            state.try_add_transactions(session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
        };
        add(&mut src, &first, 0);

        let mut state = Some(src.clone());
        let stored = state.as_ref().unwrap().known_state();
        let stored_hash = state.as_ref().unwrap().session(&first).unwrap().last_hash().copied();

        for i in 1..4 {
            add(&mut src, &first, i);
            add(&mut src, &second, i);
        }

        // First correction piece lines up, the second skips ahead in another
        // session.
        let mut lines_up = src.new_content_since(Some(&stored), Priority::Medium).unwrap().remove(0);
        lines_up.new.retain(|session, _| *session == first);
        let mut ahead = stored.clone();
        ahead.sessions.insert(second.clone(), 2);
        let skips = src.new_content_since(Some(&ahead), Priority::Medium).unwrap().remove(0);

        let mut stale = skips.clone();
        stale.new.retain(|session, _| *session == first);
        stale.new.get_mut(&first).unwrap().after = 3;
        let corrections = vec![lines_up, skips];

        let ok = store_with_correction(&mut state, &stale, &mut |_: &KnownState| Some(corrections.clone())).unwrap();
        assert!(!ok);
        let state = state.unwrap();
        assert_eq!(state.known_state(), stored);
        assert_eq!(state.session(&first).unwrap().last_hash().copied(), stored_hash);
    }

    #[test]
    fn test_invalid_content_rolls_back_other_sessions() {
        let agent = AgentSecret::generate();
        let sessions = [SessionId::new_random(agent.id()), SessionId::new_random(agent.id())];
        let mut src = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for i in 0..3 {
            for session in &sessions {
                let txs = vec![Transaction::trusting(i, &[json!({"op": "set", "key": "k", "value": i})]).unwrap()];
                let hash = src.expected_new_hash(session, &txs);
                src.try_add_transactions(session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
            }
        }

        let mut state = Some(VerifiedState::new(src.header().clone()));
        let held = state.as_ref().unwrap().known_state();

        // One session verifies, the other carries a foreign signature.
        let mut forged = src.new_content_since(None, Priority::Medium).unwrap().remove(0);
        forged.new.get_mut(&sessions[1]).unwrap().last_signature =
            AgentSecret::generate().sign(&covalent_core::Hash::of(b"forged"));

        let err = store_with_correction(&mut state, &forged, &mut |_: &KnownState| None).unwrap_err();
        assert!(matches!(err, crate::error::StoreError::InvalidContent(_)));
        assert_eq!(state.unwrap().known_state(), held);
    }

    #[test]
    fn test_dependency_order_handles_cycles() {
        let a = CoValueId([1; 20]);
        let b = CoValueId([2; 20]);
        let c = CoValueId([3; 20]);
        let missing = CoValueId([9; 20]);

        let order = dependency_order(c, |id| {
            Ok(match id {
                id if *id == a => Some(vec![b]),
                id if *id == b => Some(vec![a, missing]),
                id if *id == c => Some(vec![b]),
                _ => None,
            })
        })
        .unwrap();

        assert_eq!(order, vec![a, b, c]);
    }
}
