//! Chunk lease bookkeeping
//!
//! Read leases may coexist; a write lease is exclusive against both other
//! write leases and any unexpired read lease. Expiry is driven purely by
//! wall time with a 60 s default. The clerk holds chunks only by id; the
//! tree owns the entities.

use kfs_common::{ChunkId, MetaError, Result, LEASE_INTERVAL_SECS};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds; lease granularity.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseKind {
    Read,
    Write,
}

impl LeaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ_LEASE",
            Self::Write => "WRITE_LEASE",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "WRITE_LEASE" {
            Self::Write
        } else {
            Self::Read
        }
    }
}

/// A time-bounded right to read or write a chunk.
#[derive(Clone, Debug)]
pub struct Lease {
    pub chunk_id: ChunkId,
    pub lease_id: i64,
    pub kind: LeaseKind,
    pub expiry_ms: u64,
}

impl Lease {
    fn expired(&self, now: u64) -> bool {
        self.expiry_ms <= now
    }
}

/// Outcome of a write-lease request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteLeaseOutcome {
    /// An unexpired write lease already covers the chunk; no version bump.
    Existing { lease_id: i64 },
    /// A new write lease was granted; the chunk version must be bumped and
    /// the replicas notified before the caller proceeds.
    Granted { lease_id: i64 },
    /// An unexpired read lease blocks the write lease.
    Denied,
}

/// Issues and expires leases. Owned by the dispatcher; single-threaded.
pub struct LeaseClerk {
    leases: HashMap<ChunkId, Vec<Lease>>,
    next_lease_id: i64,
}

impl LeaseClerk {
    pub fn new() -> Self {
        Self {
            leases: HashMap::new(),
            next_lease_id: 1,
        }
    }

    fn issue(&mut self, chunk_id: ChunkId, kind: LeaseKind, now: u64) -> i64 {
        let lease_id = self.next_lease_id;
        self.next_lease_id += 1;
        self.leases.entry(chunk_id).or_default().push(Lease {
            chunk_id,
            lease_id,
            kind,
            expiry_ms: now + LEASE_INTERVAL_SECS * 1000,
        });
        lease_id
    }

    /// Grant a read lease. Read leases coexist; the caller has already
    /// verified the chunk exists with a live replica.
    pub fn get_read_lease(&mut self, chunk_id: ChunkId, now: u64) -> i64 {
        self.issue(chunk_id, LeaseKind::Read, now)
    }

    /// Request the single-holder write lease.
    pub fn get_write_lease(&mut self, chunk_id: ChunkId, now: u64) -> WriteLeaseOutcome {
        if let Some(leases) = self.leases.get(&chunk_id) {
            if let Some(w) = leases
                .iter()
                .find(|l| l.kind == LeaseKind::Write && !l.expired(now))
            {
                return WriteLeaseOutcome::Existing {
                    lease_id: w.lease_id,
                };
            }
            if leases
                .iter()
                .any(|l| l.kind == LeaseKind::Read && !l.expired(now))
            {
                return WriteLeaseOutcome::Denied;
            }
        }
        WriteLeaseOutcome::Granted {
            lease_id: self.issue(chunk_id, LeaseKind::Write, now),
        }
    }

    /// Grant the write lease for a chunk that has just been created; no
    /// competing lease can exist yet.
    pub fn grant_new_chunk_lease(&mut self, chunk_id: ChunkId, now: u64) -> i64 {
        self.issue(chunk_id, LeaseKind::Write, now)
    }

    /// Refresh expiry if the `(chunk, lease, kind)` tuple matches an
    /// unexpired lease.
    pub fn renew(&mut self, chunk_id: ChunkId, lease_id: i64, kind: LeaseKind, now: u64) -> Result<()> {
        let lease = self
            .leases
            .get_mut(&chunk_id)
            .and_then(|v| v.iter_mut().find(|l| l.lease_id == lease_id && l.kind == kind));
        match lease {
            Some(l) if !l.expired(now) => {
                l.expiry_ms = now + LEASE_INTERVAL_SECS * 1000;
                Ok(())
            }
            _ => Err(MetaError::LeaseExpired),
        }
    }

    /// Drop expired leases; returns how many were dropped.
    pub fn cleanup(&mut self, now: u64) -> usize {
        let mut dropped = 0;
        self.leases.retain(|_, v| {
            let before = v.len();
            v.retain(|l| !l.expired(now));
            dropped += before - v.len();
            !v.is_empty()
        });
        dropped
    }

    /// Whether an unexpired write lease covers the chunk.
    pub fn has_live_write(&self, chunk_id: ChunkId, now: u64) -> bool {
        self.leases
            .get(&chunk_id)
            .map(|v| v.iter().any(|l| l.kind == LeaseKind::Write && !l.expired(now)))
            .unwrap_or(false)
    }

    pub fn live_count(&self, now: u64) -> usize {
        self.leases
            .values()
            .map(|v| v.iter().filter(|l| !l.expired(now)).count())
            .sum()
    }
}

impl Default for LeaseClerk {
    fn default() -> Self {
        Self::new()
    }
}
