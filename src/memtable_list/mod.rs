//! # Memtable List Module
//!
//! The immutable list of sealed ("frozen") memtables and the flush-install
//! protocol that commits their contents to the durable [`Manifest`].
//!
//! ## Design Invariants
//!
//! - `current` is published via [`arc_swap::ArcSwap`]; readers obtain a
//!   cheap, lock-free [`Arc<MemtableListVersion>`] snapshot and query it
//!   without touching the list itself again.
//! - `unflushed` and `history` are each ordered newest-first; memtable ids
//!   strictly decrease front-to-back within each queue, and every id in
//!   `unflushed` is greater than every id in `history`.
//! - `flush_in_progress` lives on the memtable handle, not on the list, so
//!   two concurrent picks can never return overlapping sets.
//! - Flush results are installed into the manifest in strict memtable
//!   creation order — a completed memtable is withheld from the manifest
//!   until every older unflushed memtable has also completed.
//!
//! ## Flush-Install Protocol
//!
//! See [`MemtableList::install_memtable_flush_results`] for the full
//! state machine. In short: mark completed, walk the unflushed queue from
//! the oldest entry forward collecting a contiguous completed batch, hand
//! that batch to the manifest in one atomic record, then route each
//! committed handle into the bounded history window or the caller's
//! deferred-delete list.

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::manifest::{Manifest, ManifestError, ManifestSstEntry};
use crate::memtable::{FrozenMemtable, MemtableError, MemtableGetResult};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MemtableList`] operations.
#[derive(Debug, Error)]
pub enum MemtableListError {
    /// The manifest failed to durably record a flush install. The list's
    /// state is restored to pre-install (affected handles are re-queued).
    #[error("flush install failed: {0}")]
    InstallIo(#[from] ManifestError),

    /// A caller violated a documented precondition (e.g. installing an
    /// empty batch, or a handle not currently marked `flush_in_progress`).
    #[error("precondition violated: {0}")]
    Precondition(String),
}

// ------------------------------------------------------------------------------------------------
// Lookup result
// ------------------------------------------------------------------------------------------------

/// Result of a lookup against a [`MemtableListVersion`].
///
/// Mirrors [`MemtableGetResult`]'s shape: a definitive hit (value,
/// point tombstone, or range tombstone) versus "keep looking".
#[derive(Debug, PartialEq)]
pub enum MemtableListLookup {
    /// A definitive result was found in the scanned queue.
    Found(MemtableGetResult),
    /// No memtable in the scanned queue had an opinion about this key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// C1 — RefCounted memtable handle
// ------------------------------------------------------------------------------------------------

/// The manifest-edit descriptor recorded against a memtable handle once its
/// flush output is known: the SSTable it produced and the frozen WAL it
/// replaces.
#[derive(Debug, Clone)]
pub struct FlushEdit {
    /// The SSTable produced by flushing this memtable.
    pub sstable: ManifestSstEntry,
    /// The frozen WAL segment this memtable was backed by, now obsolete.
    pub frozen_wal_id: u64,
}

#[derive(Debug, Default)]
struct HandleState {
    flush_in_progress: bool,
    flush_completed: bool,
    edit: Option<FlushEdit>,
}

/// Shared-ownership wrapper over a frozen memtable.
///
/// `Arc`'s own strong count *is* the refcount: cloning a handle is `Ref()`,
/// and dropping the last clone is `Unref()`. List operations never let a
/// handle's terminal clone go out of scope inside a caller's lock —
/// instead, whenever a handle leaves a version, it is pushed onto the
/// caller-supplied `to_delete: &mut Vec<MemtableHandle>` so that the
/// frozen memtable's WAL-closing destructor runs only after the caller has
/// released its lock.
pub struct MemtableHandleInner {
    /// The sealed, read-only memtable this handle wraps.
    pub memtable: FrozenMemtable,
    /// Creation sequence number, strictly increasing over the engine's
    /// lifetime. Gives the strict-creation-order comparisons the install
    /// protocol and version invariants rely on.
    pub id: u64,
    state: Mutex<HandleState>,
}

/// A reference-counted handle to a frozen memtable, as stored by
/// [`MemtableListVersion`].
pub type MemtableHandle = Arc<MemtableHandleInner>;

impl MemtableHandleInner {
    /// Wraps a freshly-frozen memtable in a new handle with the given id.
    pub fn new(memtable: FrozenMemtable, id: u64) -> MemtableHandle {
        Arc::new(Self {
            memtable,
            id,
            state: Mutex::new(HandleState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HandleState> {
        self.state.lock().expect("memtable handle state lock poisoned")
    }

    /// Whether this memtable is currently picked for flushing.
    pub fn flush_in_progress(&self) -> bool {
        self.state().flush_in_progress
    }

    /// Whether this memtable's flush output has been recorded (but not
    /// necessarily installed into the manifest yet).
    pub fn flush_completed(&self) -> bool {
        self.state().flush_completed
    }

    /// The manifest-edit descriptor recorded for this memtable, if any.
    pub fn edit(&self) -> Option<FlushEdit> {
        self.state().edit.clone()
    }

    fn set_flush_in_progress(&self, value: bool) {
        self.state().flush_in_progress = value;
    }

    fn mark_completed(&self, edit: FlushEdit) {
        let mut state = self.state();
        state.flush_completed = true;
        state.edit = Some(edit);
    }

    /// Re-queues this memtable for retry after a failed install: clears
    /// `flush_completed` but leaves `flush_in_progress` (and the previously
    /// recorded edit) untouched, mirroring a straight retry of the same
    /// flush output.
    fn mark_retry(&self) {
        self.state().flush_completed = false;
    }
}

// ------------------------------------------------------------------------------------------------
// C2 — MemtableListVersion
// ------------------------------------------------------------------------------------------------

/// An immutable snapshot of the memtable list's contents.
///
/// Carries two newest-first queues: memtables not yet flushed
/// (`unflushed`), and memtables already flushed but retained for a bounded
/// post-flush read window (`history`). Mutation is always by constructing
/// a successor version; `MemtableList` publishes successors atomically.
#[derive(Clone, Default)]
pub struct MemtableListVersion {
    unflushed: Vec<MemtableHandle>,
    history: Vec<MemtableHandle>,
}

impl MemtableListVersion {
    fn empty() -> Self {
        Self::default()
    }

    /// Memtables not yet flushed, newest-first.
    pub fn unflushed(&self) -> &[MemtableHandle] {
        &self.unflushed
    }

    /// Already-flushed memtables retained for bounded-window reads,
    /// newest-first.
    pub fn history(&self) -> &[MemtableHandle] {
        &self.history
    }

    /// Scans `unflushed` newest-first for a definitive result at or below
    /// `read_seq`. Does **not** consult `history`.
    pub fn get(&self, key: &[u8], read_seq: u64) -> Result<MemtableListLookup, MemtableError> {
        Self::scan(&self.unflushed, key, read_seq)
    }

    /// Same rule as [`Self::get`], but scans `history` only.
    pub fn get_from_history(
        &self,
        key: &[u8],
        read_seq: u64,
    ) -> Result<MemtableListLookup, MemtableError> {
        Self::scan(&self.history, key, read_seq)
    }

    fn scan(
        handles: &[MemtableHandle],
        key: &[u8],
        read_seq: u64,
    ) -> Result<MemtableListLookup, MemtableError> {
        for handle in handles {
            match handle.memtable.get_at(key, read_seq)? {
                MemtableGetResult::NotFound => continue,
                found => return Ok(MemtableListLookup::Found(found)),
            }
        }
        Ok(MemtableListLookup::NotFound)
    }

    /// Returns a successor with `m` prepended to `unflushed`.
    fn add_memtable(&self, m: MemtableHandle) -> Self {
        let mut unflushed = Vec::with_capacity(self.unflushed.len() + 1);
        unflushed.push(m);
        unflushed.extend(self.unflushed.iter().cloned());
        Self {
            unflushed,
            history: self.history.clone(),
        }
    }

    /// Returns a successor with the memtable whose id matches `id` removed
    /// from `unflushed`, plus the removed handle (if present) so the
    /// caller can decide where it goes next (history or deferred-delete).
    fn remove(&self, id: u64) -> (Self, Option<MemtableHandle>) {
        let mut unflushed = self.unflushed.clone();
        let removed = unflushed
            .iter()
            .position(|h| h.id == id)
            .map(|pos| unflushed.remove(pos));
        (
            Self {
                unflushed,
                history: self.history.clone(),
            },
            removed,
        )
    }

    /// Drops oldest `history` entries exceeding `max_h`, pushing evicted
    /// handles to `to_delete`.
    fn trim_history(&self, max_h: usize, to_delete: &mut Vec<MemtableHandle>) -> Self {
        let mut history = self.history.clone();
        while history.len() > max_h {
            if let Some(evicted) = history.pop() {
                to_delete.push(evicted);
            }
        }
        Self {
            unflushed: self.unflushed.clone(),
            history,
        }
    }

    /// Returns a successor with `m` prepended to `history`, trimmed back
    /// down to `max_h` (evicting oldest entries into `to_delete`).
    fn push_history(
        &self,
        m: MemtableHandle,
        max_h: usize,
        to_delete: &mut Vec<MemtableHandle>,
    ) -> Self {
        let mut history = Vec::with_capacity(self.history.len() + 1);
        history.push(m);
        history.extend(self.history.iter().cloned());
        Self {
            unflushed: self.unflushed.clone(),
            history,
        }
        .trim_history(max_h, to_delete)
    }
}

// ------------------------------------------------------------------------------------------------
// C3 — MemtableList
// ------------------------------------------------------------------------------------------------

/// Mutable façade managing the current [`MemtableListVersion`], the flush
/// state machine, the history retention policy, and installation ordering.
///
/// All state-mutating methods assume the caller already holds whatever
/// exclusive lock serializes access to the engine (see the module-level
/// concurrency notes); `current()` and `imm_flush_needed()` may be called
/// without that lock.
pub struct MemtableList {
    current: ArcSwap<MemtableListVersion>,
    min_write_buffer_number_to_merge: usize,
    max_write_buffer_number_to_maintain: usize,
    num_flush_not_started: usize,
    flush_requested: bool,
    commit_in_progress: bool,
    imm_flush_needed: AtomicBool,
}

impl MemtableList {
    /// Creates an empty list. `min_write_buffer_number_to_merge` (M) is the
    /// not-yet-picked-memtable threshold that triggers automatic
    /// flush-pending; `max_write_buffer_number_to_maintain` (H) is the
    /// history window size (0 disables retention).
    pub fn new(min_write_buffer_number_to_merge: usize, max_write_buffer_number_to_maintain: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(MemtableListVersion::empty()),
            min_write_buffer_number_to_merge,
            max_write_buffer_number_to_maintain,
            num_flush_not_started: 0,
            flush_requested: false,
            commit_in_progress: false,
            imm_flush_needed: AtomicBool::new(false),
        }
    }

    /// Lock-free snapshot of the live version.
    pub fn current(&self) -> Arc<MemtableListVersion> {
        self.current.load_full()
    }

    /// `|current.unflushed|`.
    pub fn num_not_flushed(&self) -> usize {
        self.current.load().unflushed.len()
    }

    /// `|current.history|`.
    pub fn num_flushed(&self) -> usize {
        self.current.load().history.len()
    }

    /// Externally-observable hint that a flush should be scheduled.
    /// Advisory: the authoritative predicate is [`Self::is_flush_pending`].
    pub fn imm_flush_needed(&self) -> bool {
        self.imm_flush_needed.load(Ordering::Acquire)
    }

    fn recompute_imm_flush_needed(&self) {
        let pending_or_requested = self.num_flush_not_started > 0
            || (self.flush_requested && !self.current.load().unflushed.is_empty());
        self.imm_flush_needed.store(pending_or_requested, Ordering::Release);
    }

    /// Prepends `m` to `current.unflushed` and publishes a successor
    /// version. `to_delete` is only written to if adding a memtable
    /// somehow pushes `history` over its cap, which plain addition never
    /// does (trimming only ever removes entries on install) — it is kept
    /// on the signature for symmetry with the install path, which shares
    /// this same successor-construction machinery.
    pub fn add(&mut self, m: MemtableHandle, to_delete: &mut Vec<MemtableHandle>) {
        let id = m.id;
        let next = self
            .current
            .load()
            .add_memtable(m)
            .trim_history(self.max_write_buffer_number_to_maintain, to_delete);
        self.current.store(Arc::new(next));
        self.num_flush_not_started += 1;
        self.recompute_imm_flush_needed();
        info!(memtable_id = id, "memtable sealed and added to unflushed queue");
    }

    /// Sets the `flush_requested` latch. Combined with at least one
    /// memtable present, this makes [`Self::is_flush_pending`] true even
    /// if `num_flush_not_started` is below M.
    pub fn flush_requested(&mut self) {
        self.flush_requested = true;
        self.recompute_imm_flush_needed();
        debug!("flush explicitly requested");
    }

    /// True iff there is at least one not-yet-picked memtable AND either
    /// `num_flush_not_started >= M` or `flush_requested` is set.
    pub fn is_flush_pending(&self) -> bool {
        !self.current.load().unflushed.is_empty()
            && (self.num_flush_not_started >= self.min_write_buffer_number_to_merge
                || self.flush_requested)
    }

    /// Walks `unflushed` oldest-first, skipping memtables a concurrent
    /// pick already claimed, and marks every other one
    /// `flush_in_progress = true`. Returns the picked set in the same
    /// oldest-first order. Unconditionally clears `flush_requested`.
    ///
    /// Already-claimed entries are always a prefix starting at the oldest
    /// memtable (the install protocol only ever removes a contiguous
    /// oldest-first run), so skipping past them rather than stopping at
    /// the first one lets a later pick reach newer, still-unclaimed
    /// memtables without waiting on an in-flight install.
    pub fn pick_memtables_to_flush(&mut self) -> Vec<MemtableHandle> {
        let version = self.current.load();
        let mut picked = Vec::new();

        // `unflushed` is newest-first; iterating from the back walks
        // oldest-first, which is the order the install protocol needs.
        for handle in version.unflushed.iter().rev() {
            if handle.flush_in_progress() {
                continue;
            }
            handle.set_flush_in_progress(true);
            picked.push(Arc::clone(handle));
        }

        self.flush_requested = false;
        self.num_flush_not_started = self.num_flush_not_started.saturating_sub(picked.len());
        self.recompute_imm_flush_needed();
        debug!(picked = picked.len(), "picked memtables to flush");
        picked
    }

    /// Clears `flush_in_progress` on every element of `picked` and
    /// re-increments `num_flush_not_started` accordingly. The only
    /// cancellation primitive — used when the external flush job fails
    /// before producing an artifact.
    ///
    /// `imm_flush_needed` is unconditionally set to `true` afterward, even
    /// though `is_flush_pending()` could momentarily disagree: this
    /// matches the source engine's behavior and keeps the value purely
    /// advisory (schedulers should still consult `is_flush_pending()` under
    /// the lock before acting).
    pub fn rollback_memtable_flush(&mut self, picked: &[MemtableHandle]) {
        for handle in picked {
            handle.set_flush_in_progress(false);
        }
        self.num_flush_not_started += picked.len();
        self.imm_flush_needed.store(true, Ordering::Release);
        warn!(count = picked.len(), "rolled back flush pick");
    }

    /// Commits flush results to the manifest in strict memtable-creation
    /// order.
    ///
    /// `edits` pairs each flushed memtable handle (which must currently be
    /// `flush_in_progress`) with the [`FlushEdit`] its flush produced.
    /// Preconditions: `edits` non-empty, every handle `flush_in_progress`,
    /// and no install already in progress — violations return
    /// [`MemtableListError::Precondition`] rather than panicking.
    ///
    /// Protocol:
    /// 1. Record each edit against its handle (`flush_completed = true`).
    /// 2. Starting from the oldest memtable in the *entire* unflushed
    ///    queue, walk forward while the next entry is completed,
    ///    accumulating a batch.
    /// 3. If the batch is empty (the oldest entry hasn't completed yet),
    ///    return `Ok(())` without touching the manifest — the completed
    ///    memtables stay queued, awaiting the straggler. This is what
    ///    guarantees manifest installation order equals creation order.
    /// 4. Otherwise hand the batch to the manifest in one atomic record.
    ///    On failure, re-queue the batch for retry and propagate the
    ///    error. On success, remove the committed memtables from
    ///    `unflushed` and route each into `history` (if `H > 0` and
    ///    space allows) or `to_delete`.
    pub fn install_memtable_flush_results(
        &mut self,
        edits: &[(MemtableHandle, FlushEdit)],
        manifest: &Manifest,
        to_delete: &mut Vec<MemtableHandle>,
    ) -> Result<(), MemtableListError> {
        if edits.is_empty() {
            return Err(MemtableListError::Precondition(
                "install called with an empty edit set".into(),
            ));
        }
        if self.commit_in_progress {
            return Err(MemtableListError::Precondition(
                "an install is already in progress".into(),
            ));
        }
        for (handle, _) in edits {
            if !handle.flush_in_progress() {
                return Err(MemtableListError::Precondition(format!(
                    "memtable {} is not marked flush_in_progress",
                    handle.id
                )));
            }
        }

        self.commit_in_progress = true;
        for (handle, edit) in edits {
            handle.mark_completed(edit.clone());
        }

        let version = self.current.load_full();

        // Oldest-first walk from the tail of `unflushed`, accumulating a
        // contiguous run of completed memtables.
        let mut batch: Vec<(u64, FlushEdit)> = Vec::new();
        for handle in version.unflushed.iter().rev() {
            match handle.edit() {
                Some(edit) if handle.flush_completed() => batch.push((handle.id, edit)),
                _ => break,
            }
        }

        if batch.is_empty() {
            self.commit_in_progress = false;
            self.recompute_imm_flush_needed();
            trace!("install deferred: oldest unflushed memtable has not completed yet");
            return Ok(());
        }

        let added: Vec<ManifestSstEntry> = batch.iter().map(|(_, e)| e.sstable.clone()).collect();
        let removed_frozen_wals: Vec<u64> = batch.iter().map(|(_, e)| e.frozen_wal_id).collect();

        if let Err(err) = manifest.install_flush(added, removed_frozen_wals) {
            for (id, _) in &batch {
                if let Some(handle) = version.unflushed.iter().find(|h| h.id == *id) {
                    handle.mark_retry();
                }
            }
            self.commit_in_progress = false;
            self.recompute_imm_flush_needed();
            return Err(MemtableListError::InstallIo(err));
        }

        let mut next = (*version).clone();
        for (id, _) in &batch {
            let (after_remove, removed) = next.remove(*id);
            next = after_remove;
            if let Some(handle) = removed {
                if self.max_write_buffer_number_to_maintain == 0 {
                    to_delete.push(handle);
                } else {
                    next = next.push_history(handle, self.max_write_buffer_number_to_maintain, to_delete);
                }
            }
        }

        self.current.store(Arc::new(next));
        self.commit_in_progress = false;
        self.recompute_imm_flush_needed();
        info!(committed = batch.len(), "installed flush results");
        Ok(())
    }
}
