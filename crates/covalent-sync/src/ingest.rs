//! Applying CONTENT received from a peer to the registry.

use tracing::{debug, warn};

use covalent_core::{
    CoValueCoreError, CoValueHeader, KnownState, NewContentMessage, PeerId, Registry, UpdateBatch,
};

/// What ingesting one CONTENT message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Every session in the message lined up.
    Applied { new_transactions: bool },
    /// Some session started past what we hold, or the header is missing.
    /// Sessions that lined up were still applied. Carries our known state.
    NeedsCorrection(KnownState),
    /// Verification failed. The value is marked errored for the sender.
    /// Sessions checked before the failure stay applied.
    Errored(CoValueCoreError),
    /// The sender already sent invalid content for this value. Nothing was
    /// applied; the mark is cleared when the peer is forgotten.
    Ignored,
}

/// Apply `msg` from `from`, marking touched values in `batch`.
///
/// A value that becomes available, changes its streaming status, or is a
/// group whose log grew is marked together with its dependents, since their
/// completeness or permissions may have changed.
pub fn ingest_content(
    registry: &mut Registry,
    from: &PeerId,
    msg: &NewContentMessage,
    batch: &mut UpdateBatch,
) -> IngestOutcome {
    let id = msg.id;
    let core = registry.get_or_insert_empty(id);
    if core.is_errored_in_peer(from) {
        debug!(id = %id, peer = %from, "dropping content from peer that sent invalid content");
        return IngestOutcome::Ignored;
    }
    let was_available = core.is_available();
    let was_streaming = core.is_streaming();

    match &msg.header {
        Some(header) => {
            if let Err(err) = core.provide_header(header.clone(), Some(from)) {
                warn!(id = %id, peer = %from, error = %err, "rejected content header");
                core.mark_errored(from, err.clone());
                return IngestOutcome::Errored(err);
            }
        }
        None if !was_available => {
            debug!(id = %id, peer = %from, "content without header for unknown value");
            return IngestOutcome::NeedsCorrection(core.known_state());
        }
        None => {}
    }

    if let Some(target) = &msg.expect_content_until {
        core.expect_content_until(target);
    }

    let mut needs_correction = false;
    let mut new_transactions = false;
    let mut rejected = None;
    for (session, piece) in &msg.new {
        let held = core.session_tx_count(session);
        if piece.after > held {
            needs_correction = true;
            continue;
        }
        let skip = (held - piece.after) as usize;
        if skip >= piece.new_transactions.len() {
            continue;
        }
        match core.try_add_transactions_batched(
            session,
            piece.new_transactions[skip..].to_vec(),
            None,
            &piece.last_signature,
            batch,
        ) {
            Ok(added) => new_transactions |= added,
            Err(err) => {
                warn!(id = %id, peer = %from, error = %err, "rejected content");
                core.mark_errored(from, err.clone());
                rejected = Some(err);
                break;
            }
        }
    }

    let is_group_like = core.header().is_some_and(CoValueHeader::is_group_like);
    let affects_dependents =
        !was_available || was_streaming != core.is_streaming() || (new_transactions && is_group_like);
    let known = core.known_state();

    if affects_dependents {
        batch.mark_with_dependents(id, registry);
    }

    if let Some(err) = rejected {
        IngestOutcome::Errored(err)
    } else if needs_correction {
        debug!(id = %id, peer = %from, "content does not line up, requesting correction");
        IngestOutcome::NeedsCorrection(known)
    } else {
        IngestOutcome::Applied { new_transactions }
    }
}
