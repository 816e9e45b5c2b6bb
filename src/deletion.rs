//! Author-authenticated deletion (NIP-09) that converges regardless of the
//! order in which targets and deletions arrive.
//!
//! Every id sits in at most one of three places: tombstoned, known (seen and
//! alive), or pending (unseen, with the pubkeys that already tried to delete
//! it).

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::event::{Event, DELETION_KIND};

#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownEvent {
    kind: u32,
    pubkey: String,
}

/// Result of one deletion attempt against one target id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// The target was tombstoned earlier; nothing changed.
    AlreadyDeleted,
    /// The target has not been seen; the attempt waits for it.
    Deferred,
    /// The target was tombstoned by this attempt.
    Deleted,
    /// Different author, or the target is itself a deletion.
    Void,
}

#[derive(Debug, Default)]
pub struct Deletions {
    deleted: HashSet<String>,
    known: HashMap<String, KnownEvent>,
    pending: HashMap<String, HashSet<String>>,
}

impl Deletions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains(id)
    }

    /// Seen and not tombstoned.
    pub fn is_known(&self, id: &str) -> bool {
        self.known.contains_key(id)
    }

    /// Unseen, with at least one deletion attempt waiting on it.
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Account for an accepted event before it reaches the store. Returns the
    /// ids tombstoned as a result, which may include `ev.id` itself.
    pub fn record_event(&mut self, ev: &Event) -> Vec<String> {
        if self.deleted.contains(&ev.id) || self.known.contains_key(&ev.id) {
            return Vec::new();
        }
        let attempts = self.pending.remove(&ev.id).unwrap_or_default();

        if ev.is_deletion() {
            self.remember(ev);
            return ev
                .deletion_targets()
                .filter(|target| self.attempt_deletion(ev, target) == DeletionOutcome::Deleted)
                .map(str::to_string)
                .collect();
        }

        if attempts.contains(&ev.pubkey) {
            debug!(id = %ev.id, "event arrived after its deletion");
            self.deleted.insert(ev.id.clone());
            return vec![ev.id.clone()];
        }
        self.remember(ev);
        Vec::new()
    }

    /// Apply `deletion` to `target`.
    ///
    /// # Panics
    ///
    /// If `deletion` is not a deletion event.
    pub fn attempt_deletion(&mut self, deletion: &Event, target: &str) -> DeletionOutcome {
        assert!(
            deletion.is_deletion(),
            "attempt_deletion called with kind {}",
            deletion.kind
        );
        if self.deleted.contains(target) {
            return DeletionOutcome::AlreadyDeleted;
        }
        let Some(known) = self.known.get(target) else {
            self.pending
                .entry(target.to_string())
                .or_default()
                .insert(deletion.pubkey.clone());
            return DeletionOutcome::Deferred;
        };
        if known.pubkey != deletion.pubkey || known.kind == DELETION_KIND {
            return DeletionOutcome::Void;
        }
        self.known.remove(target);
        self.deleted.insert(target.to_string());
        debug!(id = target, by = %deletion.id, "event tombstoned");
        DeletionOutcome::Deleted
    }

    fn remember(&mut self, ev: &Event) {
        self.known.insert(
            ev.id.clone(),
            KnownEvent {
                kind: ev.kind,
                pubkey: ev.pubkey.clone(),
            },
        );
    }
}
