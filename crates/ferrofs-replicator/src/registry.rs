//! Process-wide index of in-flight replications.
//!
//! At most one replicator may service a chunk at any instant. Registering a
//! second replicator for the same chunk pre-empts the first: the entry is
//! replaced before the old replicator is cancelled, so a cancellation that
//! synchronously destroys its target can never leave the slot dangling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::op::{ChunkId, ChunkVersion};

/// Cancellation surface a registered replicator exposes.
pub trait CancelTarget: Send + Sync {
    /// Edge-triggered cancel; idempotent, may complete the target
    /// synchronously.
    fn cancel(&self);

    /// The version the replicator would finalize at: the explicit target
    /// version when set, otherwise the chunk version learned so far.
    fn effective_target_version(&self) -> ChunkVersion;
}

struct RegEntry {
    generation: u64,
    target: Arc<dyn CancelTarget>,
}

/// Ticket identifying one registration; deregistering with a stale ticket
/// is a no-op, which makes self-removal after pre-emption safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    chunk_id: ChunkId,
    generation: u64,
}

/// Index of live replicators keyed by chunk id.
#[derive(Default)]
pub struct ReplicatorRegistry {
    entries: Mutex<HashMap<ChunkId, RegEntry>>,
    next_generation: AtomicU64,
}

impl ReplicatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `target` as the replicator for `chunk_id`.
    ///
    /// Any previous entry is replaced first and then cancelled, so the
    /// cancellation cannot race the new registration out of the map. The
    /// caller must re-check its own cancelled flag afterwards: a concurrent
    /// cancel may already have claimed the new entry.
    pub fn register(&self, chunk_id: ChunkId, target: Arc<dyn CancelTarget>) -> Registration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(chunk_id, RegEntry { generation, target })
        };
        if let Some(prev) = previous {
            info!(
                chunk = chunk_id,
                "replication restarted, cancelling previous replicator"
            );
            prev.target.cancel();
        }
        Registration {
            chunk_id,
            generation,
        }
    }

    /// Removes the registration if it is still current.
    pub fn deregister(&self, registration: Registration) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&registration.chunk_id) {
            if entry.generation == registration.generation {
                entries.remove(&registration.chunk_id);
            }
        }
    }

    /// Cancels the replicator for `chunk_id` when its effective target
    /// version matches `target_version`; a negative argument matches any.
    ///
    /// Returns whether a cancel occurred.
    pub fn cancel_chunk(&self, chunk_id: ChunkId, target_version: ChunkVersion) -> bool {
        let target = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get(&chunk_id) else {
                return false;
            };
            if target_version >= 0 && entry.target.effective_target_version() != target_version {
                return false;
            }
            entries.remove(&chunk_id).map(|e| e.target)
        };
        if let Some(target) = target {
            target.cancel();
            true
        } else {
            false
        }
    }

    /// Cancels every registered replicator.
    ///
    /// The map is swapped empty first; registrations admitted during the
    /// sweep are untouched.
    pub fn cancel_all(&self) {
        let swapped = {
            let mut entries = self.entries.lock().unwrap();
            std::mem::take(&mut *entries)
        };
        for (_, entry) in swapped {
            entry.target.cancel();
        }
    }

    /// Number of live registrations.
    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
