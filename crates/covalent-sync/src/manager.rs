//! The sync state machine, free of I/O.
//!
//! [`SyncManager`] turns incoming messages into registry updates and queued
//! outgoing messages. Callers own the registry, drive transports, and drain
//! each peer's outbox with [`SyncManager::pop_outgoing`].

use std::collections::BTreeMap;

use tracing::{debug, trace};

use covalent_core::{CoValueId, KnownState, PeerId, Registry, UpdateBatch};

use crate::ingest::{ingest_content, IngestOutcome};
use crate::messages::{KnownMessage, SyncMessage};
use crate::peer::{PeerRole, PeerState};

/// Per-node sync state across all peers.
#[derive(Debug, Default)]
pub struct SyncManager {
    peers: BTreeMap<PeerId, PeerState>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a peer. Server and storage peers immediately get everything
    /// already available, dependencies first.
    pub fn add_peer(&mut self, registry: &Registry, id: PeerId, role: PeerRole) {
        self.peers.insert(id.clone(), PeerState::new(id.clone(), role));
        if role != PeerRole::Client {
            for value in registry.available_ids_in_dependency_order() {
                self.send_content(registry, &id, value);
            }
        }
    }

    /// Drop a peer and forget its per-value load states.
    pub fn remove_peer(&mut self, registry: &mut Registry, id: &PeerId) -> Option<PeerState> {
        let ids: Vec<CoValueId> = registry.ids().copied().collect();
        for value in ids {
            if let Some(core) = registry.get_mut(&value) {
                core.forget_peer(id);
            }
        }
        self.peers.remove(id)
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn peers_with_role(&self, role: PeerRole) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.role() == role)
            .map(|peer| peer.id().clone())
            .collect()
    }

    pub fn pop_outgoing(&mut self, peer: &PeerId) -> Option<SyncMessage> {
        self.peers.get_mut(peer)?.pop_outgoing()
    }

    pub fn has_outgoing(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|p| p.pending_outgoing() > 0)
    }

    /// Peers with queued messages.
    pub fn peers_with_outgoing(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.pending_outgoing() > 0)
            .map(|peer| peer.id().clone())
            .collect()
    }

    /// Replace what we assume `peer` holds for one value, e.g. after a store
    /// reported its actual state.
    pub fn reset_known(&mut self, peer: &PeerId, known: KnownState) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.reset_known(known);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask `peer` for `id`. Returns false if a load from that peer is
    /// already in flight.
    pub fn request_load(&mut self, registry: &mut Registry, peer: &PeerId, id: CoValueId) -> bool {
        let Some(state) = self.peers.get_mut(peer) else {
            return false;
        };
        if state.role() == PeerRole::Storage {
            return false;
        }
        let core = registry.get_or_insert_empty(id);
        if core.is_pending_in(peer) {
            return false;
        }
        core.mark_pending(peer);
        debug!(id = %id, peer = %peer, "requesting load");
        state.enqueue(SyncMessage::Load(core.known_state()));
        true
    }

    /// Push `id` (dependencies first) to every peer that wants it.
    pub fn sync_value(&mut self, registry: &Registry, id: CoValueId) {
        let targets: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.wants(&id))
            .map(|peer| peer.id().clone())
            .collect();
        for peer in targets {
            self.send_content(registry, &peer, id);
        }
    }

    /// Queue whatever `peer` is missing of `id` and its dependencies.
    /// Returns true if anything for `id` itself was queued.
    fn send_content(&mut self, registry: &Registry, peer: &PeerId, id: CoValueId) -> bool {
        let Some(state) = self.peers.get_mut(peer) else {
            return false;
        };
        let mut sent_root = false;
        for dep in registry.with_dependencies(&id) {
            let Some(core) = registry.get(&dep).filter(|core| core.is_available()) else {
                continue;
            };
            state.mark_interested(dep);
            let Some(pieces) = core.new_content_since(state.optimistic(&dep)) else {
                continue;
            };
            trace!(id = %dep, peer = %peer, pieces = pieces.len(), "queueing content");
            for piece in pieces {
                state.combine_optimistic(&piece.implied_known_state());
                state.enqueue(SyncMessage::Content(piece));
            }
            sent_root |= dep == id;
        }
        sent_root
    }

    fn enqueue(&mut self, peer: &PeerId, msg: SyncMessage) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.enqueue(msg);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one message from `from`. Values whose content changed are
    /// marked in `batch`.
    pub fn handle_message(
        &mut self,
        registry: &mut Registry,
        from: &PeerId,
        msg: SyncMessage,
        batch: &mut UpdateBatch,
    ) {
        if !self.peers.contains_key(from) {
            debug!(peer = %from, "message from unknown peer dropped");
            return;
        }
        match msg {
            SyncMessage::Load(known) => self.handle_load(registry, from, known),
            SyncMessage::Known(known) => self.handle_known(registry, from, known),
            SyncMessage::Content(content) => {
                let id = content.id;
                if let Some(peer) = self.peers.get_mut(from) {
                    peer.mark_interested(id);
                    peer.combine_known(&content.implied_known_state());
                }
                match ingest_content(registry, from, &content, batch) {
                    // A rejected message may still have added a header or
                    // sessions that verified before the failure.
                    IngestOutcome::Applied { .. } | IngestOutcome::Errored(_) => {
                        let ours = registry.get(&id).filter(|core| core.is_available()).map(|core| core.known_state());
                        if let Some(ours) = ours {
                            self.enqueue(from, SyncMessage::known(ours));
                            self.request_missing_dependencies(registry, from, id);
                            self.sync_value(registry, id);
                        }
                    }
                    IngestOutcome::NeedsCorrection(actual) => {
                        self.enqueue(from, SyncMessage::correction(actual));
                    }
                    IngestOutcome::Ignored => {}
                }
            }
            SyncMessage::Done { id } => {
                if let Some(core) = registry.get_mut(&id) {
                    if core.is_pending_in(from) {
                        core.mark_not_found_in_peer(from);
                    }
                }
            }
        }
    }

    fn handle_load(&mut self, registry: &mut Registry, from: &PeerId, known: KnownState) {
        let id = known.id;
        if let Some(peer) = self.peers.get_mut(from) {
            peer.mark_interested(id);
            peer.reset_known(known.clone());
        }

        let ours = registry.get(&id).filter(|core| core.is_available()).map(|core| core.known_state());
        let Some(ours) = ours else {
            debug!(id = %id, peer = %from, "load for value we do not have");
            self.enqueue(from, SyncMessage::known(KnownState::empty(id)));
            for server in self.peers_with_role(PeerRole::Server) {
                if server != *from {
                    self.request_load(registry, &server, id);
                }
            }
            return;
        };

        if !self.send_content(registry, from, id) {
            self.enqueue(from, SyncMessage::known(ours.clone()));
        }
        if !known.ahead_of(&ours).is_empty() {
            self.enqueue(from, SyncMessage::Load(ours));
        }
    }

    fn handle_known(&mut self, registry: &mut Registry, from: &PeerId, msg: KnownMessage) {
        let KnownMessage { known, is_correction } = msg;
        let id = known.id;

        let wants = match self.peers.get_mut(from) {
            Some(peer) => {
                if is_correction {
                    debug!(id = %id, peer = %from, "peer corrected our assumed state");
                    peer.reset_known(known.clone());
                } else {
                    peer.combine_known(&known);
                }
                peer.wants(&id)
            }
            None => return,
        };

        let Some(core) = registry.get_mut(&id) else {
            return;
        };
        if !known.header && core.is_pending_in(from) {
            core.mark_not_found_in_peer(from);
        }
        if !core.is_available() {
            return;
        }
        let ours = core.known_state();

        if is_correction || wants {
            self.send_content(registry, from, id);
        }
        if !known.ahead_of(&ours).is_empty() {
            self.enqueue(from, SyncMessage::Load(ours));
        }
    }

    fn request_missing_dependencies(&mut self, registry: &mut Registry, from: &PeerId, id: CoValueId) {
        let missing: Vec<CoValueId> = registry
            .get(&id)
            .map(|core| core.dependencies())
            .unwrap_or_default()
            .into_iter()
            .filter(|dep| !registry.is_available(dep))
            .collect();
        for dep in missing {
            self.request_load(registry, from, dep);
        }
    }
}
