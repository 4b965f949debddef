//! Request state machine and dispatcher
//!
//! Every request is a variant of [`Body`]; handlers are total functions
//! over the enum. The dispatcher is single-threaded and owns all mutations
//! to the metadata tree: it dequeues entries in FIFO order, runs the typed
//! handler, and hands retired requests to the log writer. A handler that
//! must wait for a chunkserver RPC, a version-change fan-out, or a
//! dependent child request marks itself suspended; the awaited event
//! re-enqueues the same request at the front of the queue, and the handler
//! resumes from its recorded phase. Suspended requests are resumed exactly
//! once; double resumption is a bug and panics.

use crate::checkpoint::Checkpointer;
use crate::layout::{ChunkServerInfo, LayoutManager};
use crate::lease::{now_ms, LeaseClerk, LeaseKind, WriteLeaseOutcome};
use crate::oplog::OpLog;
use crate::seed::VersionInc;
use crate::tree::{ChunkAllocation, Dentry, Fattr, MetaKey, Metatree};
use kfs_common::config::TimerConfig;
use kfs_common::{ChunkId, ChunkOff, Fid, MetaError, Seq, ServerLocation};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Identifies an in-flight request for suspension bookkeeping.
pub type RequestId = u64;

/// A server silent this long gets a HEARTBEAT on the next maintenance
/// pass.
const HEARTBEAT_IDLE_SECS: i64 = 60;

/// Where a multi-step allocation currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocPhase {
    Start,
    WaitPrimary,
    WaitVersChange,
    Failed,
    Done,
}

/// State carried across the allocate handler's re-entry points.
#[derive(Clone, Debug)]
pub struct AllocateState {
    pub fid: Fid,
    pub offset: ChunkOff,
    pub chunk_id: ChunkId,
    pub chunk_version: i64,
    pub num_replicas: u8,
    pub lease_id: i64,
    pub servers: Vec<ServerLocation>,
    pub master: Option<ServerLocation>,
    pub phase: AllocPhase,
}

impl AllocateState {
    pub fn new(fid: Fid, offset: ChunkOff) -> Self {
        Self {
            fid,
            offset,
            chunk_id: 0,
            chunk_version: 0,
            num_replicas: 0,
            lease_id: -1,
            servers: Vec::new(),
            master: None,
            phase: AllocPhase::Start,
        }
    }
}

/// What a chunkserver announces about itself in HELLO.
#[derive(Clone, Debug)]
pub struct HelloInfo {
    pub loc: ServerLocation,
    pub total_space: i64,
    pub used_space: i64,
    pub num_chunks: i64,
    pub rack: Option<String>,
    pub chunk_ids: Vec<ChunkId>,
}

/// One chunk's layout row in a GETLAYOUT response.
#[derive(Clone, Debug)]
pub struct ChunkLayout {
    pub offset: ChunkOff,
    pub chunk_id: ChunkId,
    pub chunk_version: i64,
    pub locations: Vec<ServerLocation>,
}

/// The typed payload of a request, with room for its results.
#[derive(Clone, Debug)]
pub enum Body {
    Lookup {
        dir: Fid,
        name: String,
        result: Option<Fattr>,
    },
    LookupPath {
        root: Fid,
        path: String,
        result: Option<Fattr>,
    },
    Create {
        dir: Fid,
        name: String,
        num_replicas: u8,
        fid: Fid,
    },
    Mkdir {
        dir: Fid,
        name: String,
        fid: Fid,
    },
    Remove {
        dir: Fid,
        name: String,
    },
    Rmdir {
        dir: Fid,
        name: String,
    },
    Readdir {
        dir: Fid,
        entries: Vec<Dentry>,
    },
    Getalloc {
        fid: Fid,
        offset: ChunkOff,
        chunk_id: ChunkId,
        chunk_version: i64,
        locations: Vec<ServerLocation>,
    },
    Getlayout {
        fid: Fid,
        chunks: Vec<ChunkLayout>,
    },
    Allocate(AllocateState),
    Truncate {
        fid: Fid,
        offset: ChunkOff,
        wait_alloc: bool,
    },
    Rename {
        dir: Fid,
        old: String,
        new_path: String,
        overwrite: bool,
    },
    LeaseAcquire {
        chunk_id: ChunkId,
        lease_id: i64,
    },
    LeaseRenew {
        chunk_id: ChunkId,
        lease_id: i64,
        kind: LeaseKind,
    },
    LeaseCleanup,
    Checkpoint,
    ReplicationCheck,
    ChunkVersionInc {
        inc: i64,
    },
    Hello(HelloInfo),
    Bye {
        loc: ServerLocation,
    },
    Ping {
        servers: String,
    },
    Stats {
        stats: String,
    },
}

/// A request flowing through the dispatcher.
#[derive(Clone, Debug)]
pub struct MetaRequest {
    pub id: RequestId,
    /// Client Cseq, echoed in the response.
    pub seq: Seq,
    pub status: i32,
    pub suspended: bool,
    /// Acks this request still waits for while suspended.
    pub awaiting: usize,
    /// Synthesised children name the request to resume on completion.
    pub parent: Option<RequestId>,
    pub body: Body,
}

impl MetaRequest {
    pub fn new(id: RequestId, seq: Seq, body: Body) -> Self {
        Self {
            id,
            seq,
            status: 0,
            suspended: false,
            awaiting: 1,
            parent: None,
            body,
        }
    }

    /// Counter label, also used by STATS.
    pub fn op_name(&self) -> &'static str {
        match &self.body {
            Body::Lookup { .. } => "Lookup",
            Body::LookupPath { .. } => "Lookup Path",
            Body::Create { .. } => "Create",
            Body::Mkdir { .. } => "Mkdir",
            Body::Remove { .. } => "Remove",
            Body::Rmdir { .. } => "Rmdir",
            Body::Readdir { .. } => "Readdir",
            Body::Getalloc { .. } => "Get alloc",
            Body::Getlayout { .. } => "Get layout",
            Body::Allocate(_) => "Allocate",
            Body::Truncate { .. } => "Truncate",
            Body::Rename { .. } => "Rename",
            Body::LeaseAcquire { .. } => "Lease Acquire",
            Body::LeaseRenew { .. } => "Lease Renew",
            Body::LeaseCleanup => "Lease Cleanup",
            Body::Checkpoint => "Checkpoint",
            Body::ReplicationCheck => "Replication Checker",
            Body::ChunkVersionInc { .. } => "Chunk Version Inc",
            Body::Hello(_) => "Chunkserver Hello",
            Body::Bye { .. } => "Chunkserver Bye",
            Body::Ping { .. } => "Ping",
            Body::Stats { .. } => "Stats",
        }
    }

    /// The log record for this request, carrying `seq`; `None` for pure
    /// queries and for failed mutations.
    pub fn log_record(&self, seq: Seq) -> Option<String> {
        if self.status != 0 {
            return None;
        }
        match &self.body {
            Body::Create {
                dir,
                name,
                num_replicas,
                fid,
            } => Some(format!(
                "create/seq/{seq}/dir/{dir}/name/{name}/id/{fid}/numReplicas/{num_replicas}"
            )),
            Body::Mkdir { dir, name, fid } => {
                Some(format!("mkdir/seq/{seq}/dir/{dir}/name/{name}/id/{fid}"))
            }
            Body::Remove { dir, name } => Some(format!("remove/seq/{seq}/dir/{dir}/name/{name}")),
            Body::Rmdir { dir, name } => Some(format!("rmdir/seq/{seq}/dir/{dir}/name/{name}")),
            Body::Allocate(a) => Some(format!(
                "allocate/seq/{seq}/file/{}/offset/{}/chunkId/{}/chunkVersion/{}",
                a.fid, a.offset, a.chunk_id, a.chunk_version
            )),
            Body::Truncate { fid, offset, .. } => {
                Some(format!("truncate/seq/{seq}/file/{fid}/offset/{offset}"))
            }
            Body::Rename {
                dir,
                old,
                new_path,
                ..
            } => Some(format!("rename/seq/{seq}/dir/{dir}/old/{old}/new/{new_path}")),
            Body::ChunkVersionInc { inc } => Some(format!("chunkVersionInc/seq/{seq}/inc/{inc}")),
            _ => None,
        }
    }

    /// Whether a successful run of this op mutates the tree.
    pub fn mutates(&self) -> bool {
        matches!(
            self.body,
            Body::Create { .. }
                | Body::Mkdir { .. }
                | Body::Remove { .. }
                | Body::Rmdir { .. }
                | Body::Allocate(_)
                | Body::Truncate { .. }
                | Body::Rename { .. }
                | Body::ChunkVersionInc { .. }
        )
    }
}

/// The RPC class an ack refers to; waiterless acks still adjust layout
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcKind {
    Allocate,
    Delete,
    Truncate,
    Heartbeat,
    StaleNotify,
    VersChange,
    Replicate,
}

/// A chunkserver's reply to an outbound RPC, delivered by the transport.
#[derive(Clone, Debug)]
pub struct RpcReply {
    pub waiter: Option<RequestId>,
    pub kind: RpcKind,
    pub chunk_id: ChunkId,
    pub server: ServerLocation,
    pub status: i32,
}

/// What flows through the dispatcher queue.
#[derive(Clone, Debug)]
pub enum QueueEntry {
    Req(MetaRequest),
    RpcReply(RpcReply),
    /// The log writer confirmed durability for this retired request.
    Logged(MetaRequest),
    Shutdown,
}

/// FIFO feeding the dispatcher; resumptions jump the line via
/// `enqueue_front`.
pub struct RequestQueue {
    q: Mutex<VecDeque<QueueEntry>>,
    cv: Condvar,
    ids: AtomicU64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            ids: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    pub fn enqueue(&self, entry: QueueEntry) {
        self.q.lock().push_back(entry);
        self.cv.notify_one();
    }

    pub fn enqueue_front(&self, entry: QueueEntry) {
        self.q.lock().push_front(entry);
        self.cv.notify_one();
    }

    /// Build a request from a parsed body and queue it.
    pub fn submit(&self, seq: Seq, body: Body) -> RequestId {
        let id = self.next_id();
        self.enqueue(QueueEntry::Req(MetaRequest::new(id, seq, body)));
        id
    }

    pub fn dequeue(&self) -> QueueEntry {
        let mut q = self.q.lock();
        while q.is_empty() {
            self.cv.wait(&mut q);
        }
        q.pop_front().expect("queue non-empty")
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct Parked {
    awaiting: usize,
    req: MetaRequest,
}

/// The single-threaded request dispatcher; owns the lease clerk and all
/// tree mutations. Everything else is shared by reference.
pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    tree: Arc<Metatree>,
    layout: Arc<LayoutManager>,
    cp: Arc<Checkpointer>,
    oplog: OpLog,
    vers_inc: Arc<VersionInc>,
    leases: LeaseClerk,
    suspended: HashMap<RequestId, Parked>,
    /// Requests resumed early on a failed ack still owe this many late
    /// acks, which are swallowed instead of asserting.
    absorbed: HashMap<RequestId, usize>,
    counters: BTreeMap<&'static str, u64>,
    /// Retired requests whose responses are due, post-durability.
    out: Sender<MetaRequest>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RequestQueue>,
        tree: Arc<Metatree>,
        layout: Arc<LayoutManager>,
        cp: Arc<Checkpointer>,
        oplog: OpLog,
        vers_inc: Arc<VersionInc>,
        out: Sender<MetaRequest>,
    ) -> Self {
        Self {
            queue,
            tree,
            layout,
            cp,
            oplog,
            vers_inc,
            leases: LeaseClerk::new(),
            suspended: HashMap::new(),
            absorbed: HashMap::new(),
            counters: BTreeMap::new(),
            out,
        }
    }

    /// Consume queue entries until shutdown.
    pub fn run(&mut self) {
        info!("dispatcher running");
        loop {
            match self.queue.dequeue() {
                QueueEntry::Shutdown => break,
                entry => self.process(entry),
            }
        }
        info!("dispatcher stopped");
    }

    /// Handle one queue entry; public so tests can drive the dispatcher
    /// synchronously.
    pub fn process(&mut self, entry: QueueEntry) {
        match entry {
            QueueEntry::Req(mut r) => {
                self.handle(&mut r);
                if r.suspended {
                    self.park(r);
                } else {
                    self.retire(r);
                }
            }
            QueueEntry::Logged(r) => {
                if let Some(pid) = r.parent {
                    self.resume_from_child(pid, r.status);
                } else {
                    let _ = self.out.send(r);
                }
            }
            QueueEntry::RpcReply(rep) => match rep.waiter {
                Some(id) => self.deliver_ack(id, rep.status),
                None => match rep.kind {
                    RpcKind::Replicate => {
                        self.layout
                            .replication_done(rep.chunk_id, &rep.server, rep.status == 0)
                    }
                    RpcKind::Delete => self.layout.replica_deleted(rep.chunk_id, &rep.server),
                    RpcKind::Heartbeat => self.layout.touch(&rep.server),
                    _ => {}
                },
            },
            QueueEntry::Shutdown => {}
        }
    }

    fn park(&mut self, r: MetaRequest) {
        debug_assert!(r.suspended);
        let id = r.id;
        let awaiting = r.awaiting.max(1);
        let prev = self.suspended.insert(id, Parked { awaiting, req: r });
        assert!(prev.is_none(), "request {id} parked twice");
    }

    /// An awaited chunkserver ack arrived. The request resumes once every
    /// outstanding ack is in, or immediately on the first failure; acks
    /// trailing a failure-resume are absorbed. Anything else is a double
    /// resumption and panics.
    fn deliver_ack(&mut self, id: RequestId, status: i32) {
        if let Some(remaining) = self.absorbed.get_mut(&id) {
            *remaining -= 1;
            if *remaining == 0 {
                self.absorbed.remove(&id);
            }
            return;
        }
        let parked = self
            .suspended
            .get_mut(&id)
            .unwrap_or_else(|| panic!("ack for request {id} that is not suspended"));
        if status != 0 {
            parked.req.status = status;
            let outstanding = parked.awaiting - 1;
            parked.awaiting = 0;
            if outstanding > 0 {
                self.absorbed.insert(id, outstanding);
            }
        } else {
            parked.awaiting -= 1;
        }
        if self.suspended.get(&id).map(|p| p.awaiting) == Some(0) {
            let mut parked = self.suspended.remove(&id).expect("parked entry");
            parked.req.suspended = false;
            self.queue.enqueue_front(QueueEntry::Req(parked.req));
        }
    }

    /// A synthesised child completed (durably); wake the parent.
    fn resume_from_child(&mut self, pid: RequestId, child_status: i32) {
        let mut parked = self
            .suspended
            .remove(&pid)
            .unwrap_or_else(|| panic!("child completion for request {pid} that is not suspended"));
        if child_status != 0 {
            parked.req.status = child_status;
        }
        parked.req.suspended = false;
        self.queue.enqueue_front(QueueEntry::Req(parked.req));
    }

    /// Retire a request: count it, note the mutation for the checkpointer,
    /// and hand it to the log writer (the durability barrier).
    fn retire(&mut self, r: MetaRequest) {
        *self.counters.entry(r.op_name()).or_insert(0) += 1;
        if r.status == 0 && r.mutates() {
            self.cp.note_mutation();
        }
        self.oplog.add_pending(r);
    }

    /// Run a synthesised child inline, the way a resumed handler would.
    fn dispatch_child(&mut self, mut child: MetaRequest) {
        self.handle(&mut child);
        if child.suspended {
            self.park(child);
        } else {
            self.retire(child);
        }
    }

    fn handle(&mut self, r: &mut MetaRequest) {
        match r.body {
            Body::Lookup { .. } => self.handle_lookup(r),
            Body::LookupPath { .. } => self.handle_lookup_path(r),
            Body::Create { .. } => self.handle_create(r),
            Body::Mkdir { .. } => self.handle_mkdir(r),
            Body::Remove { .. } => self.handle_remove(r),
            Body::Rmdir { .. } => self.handle_rmdir(r),
            Body::Readdir { .. } => self.handle_readdir(r),
            Body::Getalloc { .. } => self.handle_getalloc(r),
            Body::Getlayout { .. } => self.handle_getlayout(r),
            Body::Allocate(_) => self.handle_allocate(r),
            Body::Truncate { .. } => self.handle_truncate(r),
            Body::Rename { .. } => self.handle_rename(r),
            Body::LeaseAcquire { .. } => self.handle_lease_acquire(r),
            Body::LeaseRenew { .. } => self.handle_lease_renew(r),
            Body::LeaseCleanup => self.handle_lease_cleanup(r),
            Body::Checkpoint => r.status = 0,
            Body::ReplicationCheck => {
                self.layout.replication_check(&self.tree);
                self.layout.heartbeat_idle_servers(HEARTBEAT_IDLE_SECS);
                r.status = 0;
            }
            Body::ChunkVersionInc { .. } => r.status = 0,
            Body::Hello(_) => self.handle_hello(r),
            Body::Bye { .. } => self.handle_bye(r),
            Body::Ping { .. } => self.handle_ping(r),
            Body::Stats { .. } => self.handle_stats(r),
        }
    }

    fn handle_lookup(&mut self, r: &mut MetaRequest) {
        let (dir, name) = match &r.body {
            Body::Lookup { dir, name, .. } => (*dir, name.clone()),
            _ => unreachable!(),
        };
        match self.tree.lookup(dir, &name) {
            Ok(fa) => {
                r.status = 0;
                if let Body::Lookup { result, .. } = &mut r.body {
                    *result = Some(fa);
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_lookup_path(&mut self, r: &mut MetaRequest) {
        let (root, path) = match &r.body {
            Body::LookupPath { root, path, .. } => (*root, path.clone()),
            _ => unreachable!(),
        };
        match self.tree.lookup_path(root, &path) {
            Ok(fa) => {
                r.status = 0;
                if let Body::LookupPath { result, .. } = &mut r.body {
                    *result = Some(fa);
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_create(&mut self, r: &mut MetaRequest) {
        let (dir, name, num_replicas) = match &r.body {
            Body::Create {
                dir,
                name,
                num_replicas,
                ..
            } => (*dir, name.clone(), *num_replicas),
            _ => unreachable!(),
        };
        self.cp.wait_if_active(&MetaKey::dentry(dir, &name));
        match self.tree.create(dir, &name, num_replicas) {
            Ok(fid) => {
                r.status = 0;
                if let Body::Create { fid: slot, .. } = &mut r.body {
                    *slot = fid;
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_mkdir(&mut self, r: &mut MetaRequest) {
        let (dir, name) = match &r.body {
            Body::Mkdir { dir, name, .. } => (*dir, name.clone()),
            _ => unreachable!(),
        };
        self.cp.wait_if_active(&MetaKey::dentry(dir, &name));
        match self.tree.mkdir(dir, &name) {
            Ok(fid) => {
                r.status = 0;
                if let Body::Mkdir { fid: slot, .. } = &mut r.body {
                    *slot = fid;
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_remove(&mut self, r: &mut MetaRequest) {
        let (dir, name) = match &r.body {
            Body::Remove { dir, name } => (*dir, name.clone()),
            _ => unreachable!(),
        };
        self.cp.wait_if_active(&MetaKey::dentry(dir, &name));
        match self.tree.remove(dir, &name) {
            Ok(chunks) => {
                for c in &chunks {
                    self.layout.delete_chunk(c.chunk_id);
                }
                r.status = 0;
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_rmdir(&mut self, r: &mut MetaRequest) {
        let (dir, name) = match &r.body {
            Body::Rmdir { dir, name } => (*dir, name.clone()),
            _ => unreachable!(),
        };
        self.cp.wait_if_active(&MetaKey::dentry(dir, &name));
        r.status = match self.tree.rmdir(dir, &name) {
            Ok(()) => 0,
            Err(e) => e.to_status(),
        };
    }

    fn handle_readdir(&mut self, r: &mut MetaRequest) {
        let dir = match &r.body {
            Body::Readdir { dir, .. } => *dir,
            _ => unreachable!(),
        };
        match self.tree.readdir(dir) {
            Ok(entries) => {
                r.status = 0;
                if let Body::Readdir { entries: slot, .. } = &mut r.body {
                    *slot = entries;
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_getalloc(&mut self, r: &mut MetaRequest) {
        let (fid, offset) = match &r.body {
            Body::Getalloc { fid, offset, .. } => (*fid, *offset),
            _ => unreachable!(),
        };
        match self.tree.get_alloc(fid, offset) {
            Ok(ci) => {
                let locations = self.layout.get_servers(ci.chunk_id);
                if locations.is_empty() {
                    r.status = MetaError::NoSuchEntry.to_status();
                    return;
                }
                r.status = 0;
                if let Body::Getalloc {
                    chunk_id,
                    chunk_version,
                    locations: slot,
                    ..
                } = &mut r.body
                {
                    *chunk_id = ci.chunk_id;
                    *chunk_version = ci.chunk_version;
                    *slot = locations;
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_getlayout(&mut self, r: &mut MetaRequest) {
        let fid = match &r.body {
            Body::Getlayout { fid, .. } => *fid,
            _ => unreachable!(),
        };
        match self.tree.get_alloc_all(fid) {
            Ok(chunks) => {
                let mut rows = Vec::with_capacity(chunks.len());
                for ci in chunks {
                    let locations = self.layout.get_servers(ci.chunk_id);
                    if locations.is_empty() {
                        r.status = MetaError::HostUnreachable.to_status();
                        return;
                    }
                    rows.push(ChunkLayout {
                        offset: ci.offset,
                        chunk_id: ci.chunk_id,
                        chunk_version: ci.chunk_version,
                        locations,
                    });
                }
                r.status = 0;
                if let Body::Getlayout { chunks: slot, .. } = &mut r.body {
                    *slot = rows;
                }
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    /// The allocate state machine. `Start` consults the tree: a fresh slot
    /// goes through placement and suspends on the primary's ack; an
    /// existing slot goes through the write-lease path and, when a new
    /// lease bumps the version, suspends on the CHUNK_VERS_CHANGE fan-out.
    /// Either resume point binds the result into the tree on success or
    /// takes the failure path on error.
    fn handle_allocate(&mut self, r: &mut MetaRequest) {
        let id = r.id;
        let seq = r.seq;
        let st = match &mut r.body {
            Body::Allocate(a) => a,
            _ => unreachable!(),
        };
        match st.phase {
            AllocPhase::Start => {
                self.cp.wait_if_active(&MetaKey::chunk(st.fid, st.offset));
                match self.tree.allocate_chunk_id(st.fid, st.offset, self.vers_inc.get()) {
                    Err(e) => {
                        r.status = e.to_status();
                        st.phase = AllocPhase::Done;
                    }
                    Ok(ChunkAllocation::Fresh {
                        chunk_id,
                        chunk_version,
                        num_replicas,
                    }) => {
                        st.chunk_id = chunk_id;
                        st.chunk_version = chunk_version;
                        st.num_replicas = num_replicas;
                        st.lease_id = self.leases.grant_new_chunk_lease(chunk_id, now_ms());
                        match self.layout.allocate_chunk(
                            id,
                            st.fid,
                            chunk_id,
                            chunk_version,
                            num_replicas,
                            st.lease_id,
                        ) {
                            Ok(servers) => {
                                st.master = servers.first().cloned();
                                st.servers = servers;
                                st.phase = AllocPhase::WaitPrimary;
                                r.suspended = true;
                                r.awaiting = 1;
                            }
                            Err(e) => {
                                r.status = e.to_status();
                                st.phase = AllocPhase::Done;
                            }
                        }
                    }
                    Ok(ChunkAllocation::Exists {
                        chunk_id,
                        chunk_version,
                        num_replicas,
                    }) => {
                        st.chunk_id = chunk_id;
                        st.chunk_version = chunk_version;
                        st.num_replicas = num_replicas;
                        let servers = self.layout.get_servers(chunk_id);
                        match self.leases.get_write_lease(chunk_id, now_ms()) {
                            WriteLeaseOutcome::Existing { lease_id } => {
                                st.lease_id = lease_id;
                                if servers.is_empty() {
                                    r.status = MetaError::DataUnavailable.to_status();
                                } else {
                                    st.master = servers.first().cloned();
                                    st.servers = servers;
                                    r.status = 0;
                                }
                                st.phase = AllocPhase::Done;
                            }
                            WriteLeaseOutcome::Denied => {
                                r.status = MetaError::ServerBusy.to_status();
                                st.phase = AllocPhase::Done;
                            }
                            WriteLeaseOutcome::Granted { lease_id } => {
                                st.lease_id = lease_id;
                                st.chunk_version += self.vers_inc.get();
                                st.master = servers.first().cloned();
                                st.servers = servers;
                                let sent = self.layout.version_change(
                                    Some(id),
                                    st.fid,
                                    chunk_id,
                                    st.chunk_version,
                                );
                                if sent == 0 {
                                    r.status = MetaError::AllocFailed.to_status();
                                    st.phase = AllocPhase::Done;
                                } else {
                                    st.phase = AllocPhase::WaitVersChange;
                                    r.suspended = true;
                                    r.awaiting = sent;
                                }
                            }
                        }
                    }
                }
            }
            AllocPhase::WaitPrimary => {
                if r.status == 0 {
                    r.status = match self
                        .tree
                        .assign_chunk_id(st.fid, st.offset, st.chunk_id, st.chunk_version)
                    {
                        Ok(()) => 0,
                        Err(e) => e.to_status(),
                    };
                    if r.status == 0 {
                        // The primary's ack reports the replica set hosting
                        // the chunk at this version.
                        for loc in &st.servers {
                            self.layout.host_chunk(loc, st.chunk_id);
                        }
                    }
                    st.phase = AllocPhase::Done;
                } else {
                    Self::alloc_failed(
                        &self.tree,
                        &self.layout,
                        &self.vers_inc,
                        &self.queue,
                        id,
                        seq,
                        st,
                        &mut r.status,
                        &mut r.suspended,
                        &mut r.awaiting,
                    );
                }
            }
            AllocPhase::WaitVersChange => {
                if r.status == 0 {
                    r.status = match self
                        .tree
                        .update_chunk_version(st.chunk_id, st.chunk_version)
                    {
                        Ok(()) => 0,
                        Err(e) => e.to_status(),
                    };
                    st.phase = AllocPhase::Done;
                } else {
                    Self::alloc_failed(
                        &self.tree,
                        &self.layout,
                        &self.vers_inc,
                        &self.queue,
                        id,
                        seq,
                        st,
                        &mut r.status,
                        &mut r.suspended,
                        &mut r.awaiting,
                    );
                }
            }
            AllocPhase::Failed => {
                // The incarnation bump is durable; the failure stands.
                debug_assert_ne!(r.status, 0);
            }
            AllocPhase::Done => {}
        }
    }

    /// Allocation failure path: surviving replicas must not be shadowed by
    /// the failed one, so the chunk version increment is bumped and made
    /// durable (via a child record) before the error is released.
    #[allow(clippy::too_many_arguments)]
    fn alloc_failed(
        tree: &Metatree,
        layout: &LayoutManager,
        vers_inc: &VersionInc,
        queue: &RequestQueue,
        id: RequestId,
        seq: Seq,
        st: &mut AllocateState,
        status: &mut i32,
        suspended: &mut bool,
        awaiting: &mut usize,
    ) {
        *status = MetaError::AllocFailed.to_status();
        match tree.chunk_lookup(st.chunk_id) {
            Some(cur) => {
                // Reset the replicas back to the version the tree knows.
                layout.version_change(None, st.fid, st.chunk_id, cur.chunk_version);
            }
            None => layout.remove_chunk_mapping(st.chunk_id),
        }
        let inc = vers_inc.bump();
        let mut child = MetaRequest::new(queue.next_id(), seq, Body::ChunkVersionInc { inc });
        child.parent = Some(id);
        // The child is already complete; queue it for logging so the parent
        // resumes only after the bump is durable.
        queue.enqueue(QueueEntry::Req(child));
        st.phase = AllocPhase::Failed;
        *suspended = true;
        *awaiting = 1;
    }

    fn handle_truncate(&mut self, r: &mut MetaRequest) {
        let (fid, offset, waiting) = match &r.body {
            Body::Truncate {
                fid,
                offset,
                wait_alloc,
            } => (*fid, *offset, *wait_alloc),
            _ => unreachable!(),
        };
        if waiting {
            // The synthesised allocation finished; its status, if bad, was
            // copied onto this request at resume.
            return;
        }
        self.cp.wait_if_active(&MetaKey::fattr(fid));
        match self.tree.truncate(fid, offset) {
            Err(e) => r.status = e.to_status(),
            Ok(res) => {
                for c in &res.removed {
                    self.layout.delete_chunk(c.chunk_id);
                }
                if let Some((chunk_id, size)) = res.boundary {
                    self.layout.truncate_chunk(chunk_id, size);
                }
                match res.alloc_offset {
                    None => r.status = 0,
                    Some(alloc_offset) => {
                        debug!(fid, alloc_offset, "truncate extends; synthesising allocation");
                        if let Body::Truncate { wait_alloc, .. } = &mut r.body {
                            *wait_alloc = true;
                        }
                        r.suspended = true;
                        r.awaiting = 1;
                        let mut child = MetaRequest::new(
                            self.queue.next_id(),
                            r.seq,
                            Body::Allocate(AllocateState::new(fid, alloc_offset)),
                        );
                        child.parent = Some(r.id);
                        self.dispatch_child(child);
                    }
                }
            }
        }
    }

    fn handle_rename(&mut self, r: &mut MetaRequest) {
        let (dir, old, new_path, overwrite) = match &r.body {
            Body::Rename {
                dir,
                old,
                new_path,
                overwrite,
            } => (*dir, old.clone(), new_path.clone(), *overwrite),
            _ => unreachable!(),
        };
        self.cp.wait_if_active(&MetaKey::dentry(dir, &old));
        match self.tree.rename(dir, &old, &new_path, overwrite) {
            Ok(displaced) => {
                for c in &displaced {
                    self.layout.delete_chunk(c.chunk_id);
                }
                r.status = 0;
            }
            Err(e) => r.status = e.to_status(),
        }
    }

    fn handle_lease_acquire(&mut self, r: &mut MetaRequest) {
        let chunk_id = match &r.body {
            Body::LeaseAcquire { chunk_id, .. } => *chunk_id,
            _ => unreachable!(),
        };
        if self.tree.chunk_lookup(chunk_id).is_none() {
            r.status = MetaError::NoSuchEntry.to_status();
            return;
        }
        if self.layout.get_servers(chunk_id).is_empty() {
            r.status = MetaError::DataUnavailable.to_status();
            return;
        }
        let lease_id = self.leases.get_read_lease(chunk_id, now_ms());
        r.status = 0;
        if let Body::LeaseAcquire { lease_id: slot, .. } = &mut r.body {
            *slot = lease_id;
        }
    }

    fn handle_lease_renew(&mut self, r: &mut MetaRequest) {
        let (chunk_id, lease_id, kind) = match &r.body {
            Body::LeaseRenew {
                chunk_id,
                lease_id,
                kind,
            } => (*chunk_id, *lease_id, *kind),
            _ => unreachable!(),
        };
        r.status = match self.leases.renew(chunk_id, lease_id, kind, now_ms()) {
            Ok(()) => 0,
            Err(e) => e.to_status(),
        };
    }

    fn handle_lease_cleanup(&mut self, r: &mut MetaRequest) {
        let dropped = self.leases.cleanup(now_ms());
        if dropped > 0 {
            debug!(dropped, "expired leases dropped");
        }
        // The dumpster can only be purged between checkpoints; a running
        // checkpoint drains it itself.
        if !self.cp.is_running() {
            let purged = self.tree.cleanup_dumpster();
            if !purged.is_empty() {
                let ids: Vec<ChunkId> = purged.iter().map(|c| c.chunk_id).collect();
                self.layout.note_dumpster_purged(&ids);
                debug!(purged = ids.len(), "dumpster purged");
            }
        }
        r.status = 0;
    }

    fn handle_hello(&mut self, r: &mut MetaRequest) {
        let h = match &r.body {
            Body::Hello(h) => h.clone(),
            _ => unreachable!(),
        };
        self.layout.register_server(ChunkServerInfo {
            loc: h.loc.clone(),
            total_space: h.total_space,
            used_space: h.used_space,
            num_chunks: h.num_chunks,
            rack: h.rack.clone(),
            last_heard: crate::tree::now_secs(),
        });
        let mut stale = Vec::new();
        for chunk_id in &h.chunk_ids {
            if self.tree.chunk_lookup(*chunk_id).is_some() {
                self.layout.host_chunk(&h.loc, *chunk_id);
            } else {
                stale.push(*chunk_id);
            }
        }
        self.layout.stale_notify(&h.loc, stale);
        r.status = 0;
    }

    fn handle_bye(&mut self, r: &mut MetaRequest) {
        let loc = match &r.body {
            Body::Bye { loc } => loc.clone(),
            _ => unreachable!(),
        };
        let down = self.layout.server_down(&loc);
        // RPCs still queued to the dead server will never be sent; their
        // suspended requests fail as if the server were busy.
        for waiter in down.orphaned_waiters {
            self.deliver_ack(waiter, MetaError::ServerBusy.to_status());
        }
        if !down.lost_chunks.is_empty() {
            // Each newly under-replicated chunk gets a check pass.
            self.queue.submit(0, Body::ReplicationCheck);
        }
        r.status = 0;
    }

    fn handle_ping(&mut self, r: &mut MetaRequest) {
        let servers = self.layout.ping_servers();
        r.status = 0;
        if let Body::Ping { servers: slot } = &mut r.body {
            *slot = servers;
        }
    }

    fn handle_stats(&mut self, r: &mut MetaRequest) {
        let mut stats = String::new();
        for (name, count) in &self.counters {
            stats.push_str(&format!("{name}: {count}\r\n"));
        }
        r.status = 0;
        if let Body::Stats { stats: slot } = &mut r.body {
            *slot = stats;
        }
    }
}

/// The timer thread: posts periodic `Checkpoint`, `LeaseCleanup`, and
/// `ChunkReplicationCheck` requests into the dispatcher queue.
pub fn spawn_timer(
    queue: Arc<RequestQueue>,
    cp: Arc<Checkpointer>,
    cfg: TimerConfig,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("kfs-timer".to_string())
        .spawn(move || {
            let mut ticks: u64 = 0;
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                ticks += 1;
                if cfg.lease_cleanup_secs > 0 && ticks % cfg.lease_cleanup_secs == 0 {
                    queue.submit(0, Body::LeaseCleanup);
                }
                if cfg.replication_check_secs > 0 && ticks % cfg.replication_check_secs == 0 {
                    queue.submit(0, Body::ReplicationCheck);
                }
                if cfg.cp_max_secs > 0 && ticks % cfg.cp_max_secs == 0 && cp.is_cp_needed() {
                    queue.submit(0, Body::Checkpoint);
                }
            }
        })
        .expect("spawn timer thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo_and_front() {
        let q = RequestQueue::new();
        q.submit(1, Body::LeaseCleanup);
        q.submit(2, Body::LeaseCleanup);
        q.enqueue_front(QueueEntry::Req(MetaRequest::new(
            q.next_id(),
            3,
            Body::LeaseCleanup,
        )));
        let first = match q.dequeue() {
            QueueEntry::Req(r) => r.seq,
            _ => panic!(),
        };
        assert_eq!(first, 3);
        let second = match q.dequeue() {
            QueueEntry::Req(r) => r.seq,
            _ => panic!(),
        };
        assert_eq!(second, 1);
    }

    #[test]
    fn test_log_record_formats() {
        let r = MetaRequest::new(
            1,
            9,
            Body::Create {
                dir: 2,
                name: "a".into(),
                num_replicas: 3,
                fid: 5,
            },
        );
        assert_eq!(
            r.log_record(12).unwrap(),
            "create/seq/12/dir/2/name/a/id/5/numReplicas/3"
        );

        let mut failed = r.clone();
        failed.status = -2;
        assert!(failed.log_record(13).is_none());

        let q = MetaRequest::new(
            2,
            9,
            Body::Lookup {
                dir: 2,
                name: "a".into(),
                result: None,
            },
        );
        assert!(q.log_record(14).is_none());
    }

    #[test]
    fn test_rename_record_keeps_path() {
        let r = MetaRequest::new(
            1,
            9,
            Body::Rename {
                dir: 2,
                old: "d".into(),
                new_path: "/x/y".into(),
                overwrite: false,
            },
        );
        assert_eq!(r.log_record(4).unwrap(), "rename/seq/4/dir/2/old/d/new//x/y");
    }
}
