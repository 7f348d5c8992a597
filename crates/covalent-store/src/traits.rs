//! Storage trait: the abstract contract for persisting CoValues.
//!
//! A store holds verified content per CoValue and hands it back as CONTENT
//! messages. Implementations include SQLite (durable) and in-memory (tests).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use covalent_core::{CoValueId, KnownState, NewContentMessage};

use crate::error::Result;

/// The Storage trait: async interface for CoValue persistence.
///
/// # Design Notes
///
/// - **Identity-stable known states**: [`Storage::known_state`] returns the
///   same `Arc` for an id until a store call changes that value.
/// - **Dependencies first**: [`Storage::load`] emits owner groups, parent
///   groups and branch sources before the requested value.
/// - **Atomic stores**: a store either commits the whole message (plus at
///   most one round of corrections) or nothing.
#[async_trait]
pub trait Storage: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// What the store holds for `id`. Unknown ids yield an empty known state.
    async fn known_state(&self, id: &CoValueId) -> Result<Arc<KnownState>>;

    /// Stream the stored content of `id` and its dependencies.
    ///
    /// Calls `on_content` for every piece, dependencies first, then
    /// `on_done(true)`. If `id` is not stored, only `on_done(false)` is called.
    async fn load(
        &self,
        id: &CoValueId,
        on_content: &mut (dyn FnMut(NewContentMessage) + Send),
        on_done: &mut (dyn FnMut(bool) + Send),
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a content message.
    ///
    /// If the message assumes transactions the store lacks, `on_correction`
    /// is called once with the stored known state and must return the content
    /// to store instead. Returns `false`, leaving the store untouched, when
    /// the callback returns `None` or its content needs another correction.
    async fn store(
        &self,
        msg: NewContentMessage,
        on_correction: &mut (dyn for<'k> FnMut(&'k KnownState) -> Option<Vec<NewContentMessage>> + Send),
    ) -> Result<bool>;

    /// Resolve once everything in `target` is persisted for its id.
    async fn wait_for_sync(&self, target: &KnownState, timeout: Duration) -> Result<()>;

    /// Release underlying resources. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience
    // ─────────────────────────────────────────────────────────────────────────

    /// Collect everything [`Storage::load`] emits. `None` if `id` is not stored.
    async fn load_all(&self, id: &CoValueId) -> Result<Option<Vec<NewContentMessage>>> {
        let mut pieces = Vec::new();
        let mut found = false;
        self.load(id, &mut |piece| pieces.push(piece), &mut |done| found = done)
            .await?;
        Ok(found.then_some(pieces))
    }
}
