//! Startup wiring
//!
//! Builds the single owning container for the metaserver core: recovery,
//! the shared tree/layout/checkpointer, the dispatcher and log-writer and
//! checkpoint and timer threads. The network transport stays outside; it
//! feeds the queue and consumes the completion channel.

use crate::checkpoint::Checkpointer;
use crate::layout::LayoutManager;
use crate::oplog::OpLog;
use crate::recovery;
use crate::request::{spawn_timer, Body, Dispatcher, MetaRequest, QueueEntry, RequestQueue};
use crate::seed::VersionInc;
use crate::tree::Metatree;
use kfs_common::{MetaConfig, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

/// The running metaserver core: every long-lived thread plus the shared
/// state the transport needs to reach.
pub struct MetaCore {
    pub queue: Arc<RequestQueue>,
    pub tree: Arc<Metatree>,
    pub layout: Arc<LayoutManager>,
    pub cp: Arc<Checkpointer>,
    pub oplog: OpLog,
    pub vers_inc: Arc<VersionInc>,
    timer_stop: Arc<AtomicBool>,
    dispatcher_handle: Option<JoinHandle<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl MetaCore {
    /// Recover state and start the dispatcher, log writer, checkpoint, and
    /// timer threads. The returned receiver yields retired requests whose
    /// responses are due (already durable).
    pub fn start(config: &MetaConfig) -> Result<(Self, Receiver<MetaRequest>)> {
        let tree = Arc::new(Metatree::new());
        let vers_inc = Arc::new(VersionInc::new());
        let layout = Arc::new(LayoutManager::new(
            config.replication.max_inflight_per_server,
        ));
        let queue = Arc::new(RequestQueue::new());

        let recovered = recovery::recover(&config.cp_dir, &config.log_dir, &tree, &vers_inc)?;
        let oplog = OpLog::open(&config.log_dir, recovered.next_seq)?;

        let cp = Arc::new(Checkpointer::new(
            &config.cp_dir,
            Arc::clone(&tree),
            Arc::clone(&vers_inc),
        ));
        cp.log_rotated(recovered.checkpoint_seq, oplog.name());
        cp.add_mutations(recovered.replayed);

        let (out_tx, out_rx) = channel();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&tree),
            Arc::clone(&layout),
            Arc::clone(&cp),
            oplog.clone(),
            Arc::clone(&vers_inc),
            out_tx,
        );

        let dispatcher_handle = thread::Builder::new()
            .name("kfs-dispatcher".to_string())
            .spawn(move || dispatcher.run())
            .expect("spawn dispatcher");
        let mut handles = Vec::new();
        handles.push(oplog.start(Arc::clone(&queue), Arc::clone(&cp)));
        handles.push(cp.spawn());

        let timer_stop = Arc::new(AtomicBool::new(false));
        handles.push(spawn_timer(
            Arc::clone(&queue),
            Arc::clone(&cp),
            config.timers.clone(),
            Arc::clone(&timer_stop),
        ));

        // A restart without a usable checkpoint takes one before accepting
        // client requests.
        if !recovered.have_checkpoint {
            cp.add_mutations(1);
            queue.submit(0, Body::Checkpoint);
        }

        info!(
            next_seq = recovered.next_seq,
            replayed = recovered.replayed,
            "metaserver core started"
        );
        Ok((
            Self {
                queue,
                tree,
                layout,
                cp,
                oplog,
                vers_inc,
                timer_stop,
                dispatcher_handle: Some(dispatcher_handle),
                handles,
            },
            out_rx,
        ))
    }

    /// Stop every thread and flush the log. The dispatcher drains first so
    /// no retired request misses the log writer.
    pub fn shutdown(mut self) {
        self.timer_stop.store(true, Ordering::Relaxed);
        self.queue.enqueue(QueueEntry::Shutdown);
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.join();
        }
        self.oplog.shutdown();
        self.cp.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("metaserver core stopped");
    }
}
