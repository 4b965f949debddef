//! KFS metaserver core
//!
//! The single metadata authority of a KFS cluster: an in-memory metadata
//! tree, a write-ahead operation log, a cooperative checkpointer, the
//! chunkserver registry with placement and replication checking, lease
//! bookkeeping, the single-threaded request dispatcher, the line-oriented
//! wire codec, and startup recovery.
//!
//! Threading model: the dispatcher owns all tree mutations; the log writer
//! owns the log file and releases responses once records are durable; the
//! checkpoint thread walks the tree in bounded batches; the timer posts
//! periodic maintenance requests. Suspended requests (chunk allocation,
//! version-change fan-outs, truncate-driven allocations) park in the
//! dispatcher until their acks arrive.

pub mod boot;
pub mod checkpoint;
pub mod layout;
pub mod lease;
pub mod oplog;
pub mod protocol;
pub mod recovery;
pub mod request;
pub mod seed;
pub mod tree;

pub use boot::MetaCore;
pub use checkpoint::Checkpointer;
pub use layout::{ChunkRpc, ChunkServerInfo, LayoutManager, PendingRpc};
pub use lease::{LeaseClerk, LeaseKind, WriteLeaseOutcome};
pub use oplog::OpLog;
pub use request::{
    AllocateState, Body, Dispatcher, MetaRequest, QueueEntry, RequestQueue, RpcKind, RpcReply,
};
pub use seed::{UniqueId, VersionInc};
pub use tree::{ChunkAllocation, ChunkInfo, Dentry, Fattr, Meta, MetaKey, Metatree};
