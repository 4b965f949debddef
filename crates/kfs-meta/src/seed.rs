//! Monotonic identifier allocators
//!
//! Fid and chunk-id seeds are persisted in every checkpoint and must never
//! decrease across restarts; recovery ratchets them forward with
//! `ensure_at_least`.

use kfs_common::ROOT_FID;
use std::sync::atomic::{AtomicI64, Ordering};

/// Allocator handing out ever-increasing ids.
#[derive(Debug)]
pub struct UniqueId {
    next: AtomicI64,
}

impl UniqueId {
    /// Start allocating at `seed`.
    pub fn new(seed: i64) -> Self {
        Self {
            next: AtomicI64::new(seed),
        }
    }

    /// Allocator for file ids; the root fid is reserved.
    pub fn file_ids() -> Self {
        Self::new(ROOT_FID + 1)
    }

    /// Allocator for chunk ids.
    pub fn chunk_ids() -> Self {
        Self::new(1)
    }

    /// Hand out the next id.
    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to [`next_id`] would return; this is what
    /// checkpoints persist.
    pub fn seed(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Ratchet the seed forward; never moves it backward.
    pub fn ensure_at_least(&self, v: i64) {
        let _ = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if v > cur {
                    Some(v)
                } else {
                    None
                }
            });
    }
}

/// The chunk-version increment: added to every new chunk version and bumped
/// whenever an allocation fails, so a failed chunk cannot be mistaken for a
/// live replica.
#[derive(Debug)]
pub struct VersionInc {
    value: AtomicI64,
}

impl VersionInc {
    pub fn new() -> Self {
        Self {
            value: AtomicI64::new(1),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Bump after a failed allocation; returns the new value.
    pub fn bump(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Ratchet forward during recovery.
    pub fn ensure_at_least(&self, v: i64) {
        let _ = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if v > cur {
                    Some(v)
                } else {
                    None
                }
            });
    }
}

impl Default for VersionInc {
    fn default() -> Self {
        Self::new()
    }
}
