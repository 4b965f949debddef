//! Chunkserver registry and layout management
//!
//! Tracks live chunkservers, the chunk-to-server mapping (rebuilt from
//! HELLO evidence, never persisted), per-server queues of outbound RPCs,
//! and the placement policy. The replication checker runs here too: an
//! idempotent periodic scan issuing REPLICATE and DELETE directives.
//!
//! The dispatcher and the HELLO processor share this state through a
//! single mutex; server records are held by identity and looked up by
//! `ServerLocation`.

use crate::request::RequestId;
use crate::tree::{now_secs, Metatree};
use kfs_common::{ChunkId, Fid, MetaError, Result, Seq, ServerLocation};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

/// An RPC owed to a chunkserver, queued per server and drained by the
/// transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkRpc {
    Allocate {
        seq: Seq,
        fid: Fid,
        chunk_id: ChunkId,
        chunk_version: i64,
        lease_id: i64,
        servers: Vec<ServerLocation>,
    },
    Delete {
        seq: Seq,
        chunk_id: ChunkId,
    },
    Truncate {
        seq: Seq,
        chunk_id: ChunkId,
        chunk_size: i64,
    },
    Heartbeat {
        seq: Seq,
    },
    StaleNotify {
        seq: Seq,
        chunk_ids: Vec<ChunkId>,
    },
    VersChange {
        seq: Seq,
        fid: Fid,
        chunk_id: ChunkId,
        chunk_version: i64,
    },
    Replicate {
        seq: Seq,
        fid: Fid,
        chunk_id: ChunkId,
        chunk_version: i64,
        src: ServerLocation,
    },
}

impl ChunkRpc {
    pub fn seq(&self) -> Seq {
        match self {
            Self::Allocate { seq, .. }
            | Self::Delete { seq, .. }
            | Self::Truncate { seq, .. }
            | Self::Heartbeat { seq }
            | Self::StaleNotify { seq, .. }
            | Self::VersChange { seq, .. }
            | Self::Replicate { seq, .. } => *seq,
        }
    }
}

/// A queued RPC plus the suspended request waiting on its ack, if any.
#[derive(Clone, Debug)]
pub struct PendingRpc {
    pub rpc: ChunkRpc,
    pub waiter: Option<RequestId>,
}

/// What a chunkserver told us about itself, refreshed by HELLO and
/// heartbeats.
#[derive(Clone, Debug)]
pub struct ChunkServerInfo {
    pub loc: ServerLocation,
    pub total_space: i64,
    pub used_space: i64,
    pub num_chunks: i64,
    pub rack: Option<String>,
    pub last_heard: i64,
}

impl ChunkServerInfo {
    /// Placement score; lower is better.
    fn utilisation(&self) -> f64 {
        if self.total_space <= 0 {
            return 1.0;
        }
        self.used_space as f64 / self.total_space as f64
    }
}

struct ServerEntry {
    info: ChunkServerInfo,
    pending: VecDeque<PendingRpc>,
    inflight_replications: usize,
}

struct LayoutState {
    servers: HashMap<ServerLocation, ServerEntry>,
    chunk_to_servers: HashMap<ChunkId, Vec<ServerLocation>>,
}

/// Summary of one replication-checker pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    pub replications_started: u64,
    pub deletes_started: u64,
    pub blocked_on_inflight: u64,
}

/// What a server took down with it.
#[derive(Clone, Debug, Default)]
pub struct ServerDownOutcome {
    /// Chunks that lost a replica.
    pub lost_chunks: Vec<ChunkId>,
    /// Suspended requests whose queued RPCs will never be sent.
    pub orphaned_waiters: Vec<RequestId>,
}

/// The layout manager singleton; constructed once at startup and shared
/// by reference.
pub struct LayoutManager {
    state: Mutex<LayoutState>,
    rpc_seq: AtomicI64,
    max_inflight_per_server: usize,
}

impl LayoutManager {
    pub fn new(max_inflight_per_server: usize) -> Self {
        Self {
            state: Mutex::new(LayoutState {
                servers: HashMap::new(),
                chunk_to_servers: HashMap::new(),
            }),
            rpc_seq: AtomicI64::new(1),
            max_inflight_per_server,
        }
    }

    fn next_rpc_seq(&self) -> Seq {
        self.rpc_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register (or refresh) a chunkserver from its HELLO.
    pub fn register_server(&self, info: ChunkServerInfo) {
        let mut state = self.state.lock();
        info!(server = %info.loc, total = info.total_space, used = info.used_space,
              "chunkserver registered");
        match state.servers.get_mut(&info.loc) {
            Some(entry) => entry.info = info,
            None => {
                state.servers.insert(
                    info.loc.clone(),
                    ServerEntry {
                        info,
                        pending: VecDeque::new(),
                        inflight_replications: 0,
                    },
                );
            }
        }
    }

    /// Record HELLO evidence that `loc` hosts `chunk_id`.
    pub fn host_chunk(&self, loc: &ServerLocation, chunk_id: ChunkId) {
        let mut state = self.state.lock();
        let holders = state.chunk_to_servers.entry(chunk_id).or_default();
        if !holders.contains(loc) {
            holders.push(loc.clone());
        }
    }

    /// Refresh the heartbeat bookkeeping for a live server.
    pub fn heartbeat(&self, loc: &ServerLocation, total_space: i64, used_space: i64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.servers.get_mut(loc) {
            entry.info.total_space = total_space;
            entry.info.used_space = used_space;
            entry.info.last_heard = now_secs();
        }
    }

    /// Note a sign of life without new space figures.
    pub fn touch(&self, loc: &ServerLocation) {
        let mut state = self.state.lock();
        if let Some(entry) = state.servers.get_mut(loc) {
            entry.info.last_heard = now_secs();
        }
    }

    /// Queue a HEARTBEAT to every server not heard from within
    /// `max_idle_secs`. Runs on the periodic maintenance pass.
    pub fn heartbeat_idle_servers(&self, max_idle_secs: i64) -> usize {
        let mut state = self.state.lock();
        let now = now_secs();
        let idle: Vec<ServerLocation> = state
            .servers
            .values()
            .filter(|e| now - e.info.last_heard >= max_idle_secs)
            .map(|e| e.info.loc.clone())
            .collect();
        let mut sent = 0;
        for loc in idle {
            let rpc = ChunkRpc::Heartbeat {
                seq: self.next_rpc_seq(),
            };
            if Self::queue_locked(&mut state, &loc, rpc, None).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Remove a server from every chunk it hosted. Reports the chunks that
    /// lost a replica (for a replication check) and the waiters of RPCs
    /// still queued to the dead server, which must be failed.
    pub fn server_down(&self, loc: &ServerLocation) -> ServerDownOutcome {
        let mut state = self.state.lock();
        let Some(entry) = state.servers.remove(loc) else {
            return ServerDownOutcome::default();
        };
        let orphaned_waiters: Vec<RequestId> =
            entry.pending.iter().filter_map(|p| p.waiter).collect();
        let mut lost_chunks = Vec::new();
        for (chunk_id, holders) in state.chunk_to_servers.iter_mut() {
            if let Some(pos) = holders.iter().position(|l| l == loc) {
                holders.remove(pos);
                lost_chunks.push(*chunk_id);
            }
        }
        warn!(server = %loc, chunks = lost_chunks.len(), "chunkserver down");
        ServerDownOutcome {
            lost_chunks,
            orphaned_waiters,
        }
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    /// The servers currently known to host a chunk.
    pub fn get_servers(&self, chunk_id: ChunkId) -> Vec<ServerLocation> {
        self.state
            .lock()
            .chunk_to_servers
            .get(&chunk_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_chunk_mapping(&self, chunk_id: ChunkId) {
        self.state.lock().chunk_to_servers.remove(&chunk_id);
    }

    /// Placement policy: minimise utilisation, tie-break on longest idle,
    /// spread across distinct racks when rack labels are present.
    fn pick_servers(
        state: &LayoutState,
        n: usize,
        exclude: &[ServerLocation],
    ) -> Vec<ServerLocation> {
        let mut candidates: Vec<&ChunkServerInfo> = state
            .servers
            .values()
            .map(|e| &e.info)
            .filter(|info| !exclude.contains(&info.loc))
            .collect();
        candidates.sort_by(|a, b| {
            a.utilisation()
                .partial_cmp(&b.utilisation())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.last_heard.cmp(&b.last_heard))
        });

        let mut picked: Vec<ServerLocation> = Vec::with_capacity(n);
        let mut racks: Vec<&str> = Vec::new();
        for info in &candidates {
            if picked.len() >= n {
                break;
            }
            if let Some(rack) = info.rack.as_deref() {
                if racks.contains(&rack) {
                    continue;
                }
                racks.push(rack);
            }
            picked.push(info.loc.clone());
        }
        // Second pass reuses racks when there are not enough distinct ones.
        for info in &candidates {
            if picked.len() >= n {
                break;
            }
            if !picked.contains(&info.loc) {
                picked.push(info.loc.clone());
            }
        }
        picked
    }

    /// Place a new chunk and send the ALLOCATE RPC to the designated
    /// primary (the first pick). The caller suspends until the primary
    /// acks with `waiter`.
    pub fn allocate_chunk(
        &self,
        waiter: RequestId,
        fid: Fid,
        chunk_id: ChunkId,
        chunk_version: i64,
        num_replicas: u8,
        lease_id: i64,
    ) -> Result<Vec<ServerLocation>> {
        let mut state = self.state.lock();
        let servers = Self::pick_servers(&state, num_replicas as usize, &[]);
        if servers.is_empty() {
            return Err(MetaError::NoSpace {
                available: 0,
                required: num_replicas as usize,
            });
        }
        let rpc = ChunkRpc::Allocate {
            seq: self.next_rpc_seq(),
            fid,
            chunk_id,
            chunk_version,
            lease_id,
            servers: servers.clone(),
        };
        let primary = servers[0].clone();
        debug!(chunk_id, %primary, replicas = servers.len(), "allocating chunk");
        Self::queue_locked(&mut state, &primary, rpc, Some(waiter))?;
        Ok(servers)
    }

    /// Fan a CHUNK_VERS_CHANGE out to every replica. Returns how many
    /// notifications the waiter must collect; zero means no live replica.
    pub fn version_change(
        &self,
        waiter: Option<RequestId>,
        fid: Fid,
        chunk_id: ChunkId,
        chunk_version: i64,
    ) -> usize {
        let mut state = self.state.lock();
        let holders = state
            .chunk_to_servers
            .get(&chunk_id)
            .cloned()
            .unwrap_or_default();
        let mut sent = 0;
        for loc in holders {
            let rpc = ChunkRpc::VersChange {
                seq: self.next_rpc_seq(),
                fid,
                chunk_id,
                chunk_version,
            };
            if Self::queue_locked(&mut state, &loc, rpc, waiter).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Queue a DELETE to every holder and forget the mapping; used when a
    /// file is removed or a chunk is cut off by truncation.
    pub fn delete_chunk(&self, chunk_id: ChunkId) {
        let mut state = self.state.lock();
        let holders = state
            .chunk_to_servers
            .remove(&chunk_id)
            .unwrap_or_default();
        for loc in holders {
            let rpc = ChunkRpc::Delete {
                seq: self.next_rpc_seq(),
                chunk_id,
            };
            let _ = Self::queue_locked(&mut state, &loc, rpc, None);
        }
    }

    /// Queue a chunkserver-side truncation of the boundary chunk.
    pub fn truncate_chunk(&self, chunk_id: ChunkId, chunk_size: i64) {
        let mut state = self.state.lock();
        let holders = state
            .chunk_to_servers
            .get(&chunk_id)
            .cloned()
            .unwrap_or_default();
        for loc in holders {
            let rpc = ChunkRpc::Truncate {
                seq: self.next_rpc_seq(),
                chunk_id,
                chunk_size,
            };
            let _ = Self::queue_locked(&mut state, &loc, rpc, None);
        }
    }

    /// Tell a server which of the chunks it reported are unknown to the
    /// metadata tree so it can reclaim them.
    pub fn stale_notify(&self, loc: &ServerLocation, chunk_ids: Vec<ChunkId>) {
        if chunk_ids.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let rpc = ChunkRpc::StaleNotify {
            seq: self.next_rpc_seq(),
            chunk_ids,
        };
        let _ = Self::queue_locked(&mut state, loc, rpc, None);
    }

    /// Drop any mapping still held for purged dumpster chunks.
    pub fn note_dumpster_purged(&self, chunk_ids: &[ChunkId]) {
        let mut state = self.state.lock();
        for id in chunk_ids {
            state.chunk_to_servers.remove(id);
        }
    }

    fn queue_locked(
        state: &mut LayoutState,
        loc: &ServerLocation,
        rpc: ChunkRpc,
        waiter: Option<RequestId>,
    ) -> Result<()> {
        match state.servers.get_mut(loc) {
            Some(entry) => {
                entry.pending.push_back(PendingRpc { rpc, waiter });
                Ok(())
            }
            None => Err(MetaError::ServerBusy),
        }
    }

    /// Drain the outbound queue for one server; the transport formats and
    /// sends these.
    pub fn drain_pending(&self, loc: &ServerLocation) -> Vec<PendingRpc> {
        let mut state = self.state.lock();
        match state.servers.get_mut(loc) {
            Some(entry) => entry.pending.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Drain every server's queue; tests use this as the fake transport.
    pub fn drain_all_pending(&self) -> Vec<(ServerLocation, PendingRpc)> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        let locs: Vec<ServerLocation> = state.servers.keys().cloned().collect();
        for loc in locs {
            if let Some(entry) = state.servers.get_mut(&loc) {
                for rpc in entry.pending.drain(..) {
                    out.push((loc.clone(), rpc));
                }
            }
        }
        out
    }

    /// One idempotent pass over every known chunk, fixing the replica
    /// count toward what the tree owes it. In-flight replications are
    /// bounded per destination server.
    pub fn replication_check(&self, tree: &Metatree) -> ReplicationSummary {
        let mut state = self.state.lock();
        let mut summary = ReplicationSummary::default();
        let chunks: Vec<(ChunkId, Vec<ServerLocation>)> = state
            .chunk_to_servers
            .iter()
            .map(|(id, holders)| (*id, holders.clone()))
            .collect();

        for (chunk_id, holders) in chunks {
            let Some(info) = tree.chunk_lookup(chunk_id) else {
                continue;
            };
            let desired = tree.chunk_replication(chunk_id).unwrap_or(1) as usize;
            let live: Vec<ServerLocation> = holders
                .iter()
                .filter(|loc| state.servers.contains_key(loc))
                .cloned()
                .collect();

            if live.len() < desired && !live.is_empty() {
                let src = live[0].clone();
                let picks = Self::pick_servers(&state, 1, &live);
                let Some(dst) = picks.into_iter().next() else {
                    continue;
                };
                let at_capacity = state
                    .servers
                    .get(&dst)
                    .map(|e| e.inflight_replications >= self.max_inflight_per_server)
                    .unwrap_or(true);
                if at_capacity {
                    summary.blocked_on_inflight += 1;
                    continue;
                }
                let rpc = ChunkRpc::Replicate {
                    seq: self.next_rpc_seq(),
                    fid: info.fid,
                    chunk_id,
                    chunk_version: info.chunk_version,
                    src,
                };
                if Self::queue_locked(&mut state, &dst, rpc, None).is_ok() {
                    if let Some(entry) = state.servers.get_mut(&dst) {
                        entry.inflight_replications += 1;
                    }
                    summary.replications_started += 1;
                }
            } else if live.len() > desired {
                // Shed the copy on the most-utilised holder.
                let victim = live
                    .iter()
                    .max_by(|a, b| {
                        let ua = state.servers.get(a).map(|e| e.info.utilisation()).unwrap_or(0.0);
                        let ub = state.servers.get(b).map(|e| e.info.utilisation()).unwrap_or(0.0);
                        ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned();
                if let Some(victim) = victim {
                    let rpc = ChunkRpc::Delete {
                        seq: self.next_rpc_seq(),
                        chunk_id,
                    };
                    if Self::queue_locked(&mut state, &victim, rpc, None).is_ok() {
                        summary.deletes_started += 1;
                    }
                }
            }
        }
        if summary != ReplicationSummary::default() {
            debug!(?summary, "replication check pass");
        }
        summary
    }

    /// A REPLICATE acked: the destination now hosts the chunk.
    pub fn replication_done(&self, chunk_id: ChunkId, dst: &ServerLocation, success: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state.servers.get_mut(dst) {
            entry.inflight_replications = entry.inflight_replications.saturating_sub(1);
        }
        if success {
            let holders = state.chunk_to_servers.entry(chunk_id).or_default();
            if !holders.contains(dst) {
                holders.push(dst.clone());
            }
        }
    }

    /// A DELETE acked: the holder no longer has the chunk.
    pub fn replica_deleted(&self, chunk_id: ChunkId, loc: &ServerLocation) {
        let mut state = self.state.lock();
        if let Some(holders) = state.chunk_to_servers.get_mut(&chunk_id) {
            holders.retain(|l| l != loc);
            if holders.is_empty() {
                state.chunk_to_servers.remove(&chunk_id);
            }
        }
    }

    /// Server roster for the PING response.
    pub fn ping_servers(&self) -> String {
        let state = self.state.lock();
        let mut entries: Vec<String> = state
            .servers
            .values()
            .map(|e| {
                format!(
                    "{} {} {} {}",
                    e.info.loc.hostname, e.info.loc.port, e.info.total_space, e.info.used_space
                )
            })
            .collect();
        entries.sort();
        entries.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_common::ROOT_FID;

    fn server(host: &str, used: i64) -> ChunkServerInfo {
        ChunkServerInfo {
            loc: ServerLocation::new(host, 20000),
            total_space: 1000,
            used_space: used,
            num_chunks: 0,
            rack: None,
            last_heard: 0,
        }
    }

    fn layout_with_servers(used: &[(&str, i64)]) -> LayoutManager {
        let layout = LayoutManager::new(4);
        for (host, u) in used {
            layout.register_server(server(host, *u));
        }
        layout
    }

    #[test]
    fn test_placement_prefers_least_utilised() {
        let layout = layout_with_servers(&[("a", 900), ("b", 100), ("c", 500)]);
        let servers = layout
            .allocate_chunk(1, 10, 100, 1, 3, 7)
            .unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].hostname, "b");
        // The primary got the ALLOCATE.
        let pending = layout.drain_pending(&ServerLocation::new("b", 20000));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].waiter, Some(1));
        assert!(matches!(pending[0].rpc, ChunkRpc::Allocate { chunk_id: 100, .. }));
    }

    #[test]
    fn test_allocate_without_servers_fails() {
        let layout = LayoutManager::new(4);
        assert!(layout.allocate_chunk(1, 10, 100, 1, 3, 7).is_err());
    }

    #[test]
    fn test_rack_spread() {
        let layout = LayoutManager::new(4);
        for (host, rack) in [("a", "r1"), ("b", "r1"), ("c", "r2")] {
            let mut info = server(host, 100);
            info.rack = Some(rack.to_string());
            layout.register_server(info);
        }
        let servers = layout.allocate_chunk(1, 10, 100, 1, 2, 7).unwrap();
        let racks: Vec<&str> = servers
            .iter()
            .map(|s| if s.hostname == "c" { "r2" } else { "r1" })
            .collect();
        assert!(racks.contains(&"r1") && racks.contains(&"r2"));
    }

    #[test]
    fn test_server_down_reports_lost_chunks() {
        let layout = layout_with_servers(&[("a", 0), ("b", 0)]);
        let a = ServerLocation::new("a", 20000);
        let b = ServerLocation::new("b", 20000);
        layout.host_chunk(&a, 5);
        layout.host_chunk(&b, 5);
        layout.host_chunk(&a, 6);
        let down = layout.server_down(&a);
        assert_eq!(down.lost_chunks.len(), 2);
        assert!(down.orphaned_waiters.is_empty());
        assert_eq!(layout.get_servers(5), vec![b]);
    }

    #[test]
    fn test_server_down_orphans_queued_waiters() {
        let layout = layout_with_servers(&[("a", 0)]);
        let a = ServerLocation::new("a", 20000);
        layout.allocate_chunk(9, 10, 100, 1, 1, 7).unwrap();
        let down = layout.server_down(&a);
        assert_eq!(down.orphaned_waiters, vec![9]);
    }

    #[test]
    fn test_replication_check_under_replicated() {
        let tree = Metatree::default();
        let fid = tree.create(ROOT_FID, "f", 3).unwrap();
        tree.assign_chunk_id(fid, 0, 77, 1).unwrap();

        let layout = layout_with_servers(&[("a", 0), ("b", 0), ("c", 0), ("d", 0)]);
        let a = ServerLocation::new("a", 20000);
        layout.host_chunk(&a, 77);

        let summary = layout.replication_check(&tree);
        assert_eq!(summary.replications_started, 1);
        let pending = layout.drain_all_pending();
        let (dst, p) = pending
            .iter()
            .find(|(_, p)| matches!(p.rpc, ChunkRpc::Replicate { .. }))
            .unwrap();
        assert_ne!(*dst, a);
        match &p.rpc {
            ChunkRpc::Replicate { chunk_id, src, .. } => {
                assert_eq!(*chunk_id, 77);
                assert_eq!(*src, a);
            }
            _ => unreachable!(),
        }

        // Ack completes the repair.
        layout.replication_done(77, dst, true);
        assert!(layout.get_servers(77).contains(dst));
    }

    #[test]
    fn test_replication_check_over_replicated() {
        let tree = Metatree::default();
        let fid = tree.create(ROOT_FID, "f", 1).unwrap();
        tree.assign_chunk_id(fid, 0, 77, 1).unwrap();

        let layout = layout_with_servers(&[("a", 900), ("b", 100)]);
        let a = ServerLocation::new("a", 20000);
        let b = ServerLocation::new("b", 20000);
        layout.host_chunk(&a, 77);
        layout.host_chunk(&b, 77);

        let summary = layout.replication_check(&tree);
        assert_eq!(summary.deletes_started, 1);
        // The most-utilised holder sheds its copy.
        let pending = layout.drain_pending(&a);
        assert!(matches!(pending[0].rpc, ChunkRpc::Delete { chunk_id: 77, .. }));
        layout.replica_deleted(77, &a);
        assert_eq!(layout.get_servers(77), vec![b]);
    }

    #[test]
    fn test_replication_bounded_per_server() {
        let tree = Metatree::default();
        let fid = tree.create(ROOT_FID, "f", 2).unwrap();
        for i in 0..3 {
            tree.assign_chunk_id(fid, i * kfs_common::CHUNK_SIZE, 50 + i, 1)
                .unwrap();
        }
        let layout = LayoutManager::new(2);
        layout.register_server(server("a", 0));
        layout.register_server(server("b", 0));
        let a = ServerLocation::new("a", 20000);
        for i in 0..3 {
            layout.host_chunk(&a, 50 + i);
        }
        let summary = layout.replication_check(&tree);
        assert_eq!(summary.replications_started, 2);
        assert_eq!(summary.blocked_on_inflight, 1);
    }

    #[test]
    fn test_version_change_fans_out() {
        let layout = layout_with_servers(&[("a", 0), ("b", 0)]);
        let a = ServerLocation::new("a", 20000);
        let b = ServerLocation::new("b", 20000);
        layout.host_chunk(&a, 9);
        layout.host_chunk(&b, 9);
        let sent = layout.version_change(Some(42), 3, 9, 5);
        assert_eq!(sent, 2);
        for loc in [&a, &b] {
            let pending = layout.drain_pending(loc);
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].waiter, Some(42));
            assert!(matches!(
                pending[0].rpc,
                ChunkRpc::VersChange { chunk_id: 9, chunk_version: 5, .. }
            ));
        }
    }
}
