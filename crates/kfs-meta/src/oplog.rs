//! Write-ahead operation log
//!
//! One textual record per committed mutation, in the exact order the
//! dispatcher retired them. The dispatcher enqueues retired requests;
//! the writer thread appends, flushes, and fsyncs before the response is
//! released (the durability barrier). Pure queries log nothing but still
//! flow through the queue so a reply always implies all prior records are
//! durable.
//!
//! The log rotates when a `Checkpoint` request reaches the writer: the
//! current file is closed and renamed after its last record's seq, a new
//! file opens at `seq + 1`, and the checkpointer is woken with the closed
//! seq.

use crate::checkpoint::Checkpointer;
use crate::request::{Body, MetaRequest, QueueEntry, RequestQueue};
use kfs_common::{Result, Seq, VERSION};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Build the on-disk name of a log file.
pub fn log_file_name(seq: Seq) -> String {
    format!("log.{seq}")
}

struct LogState {
    queue: VecDeque<MetaRequest>,
    file: BufWriter<File>,
    /// Seq of the first record this log file holds (names the file until
    /// rotation renames it after the last).
    first_seq: Seq,
    /// Next seq to assign; `next_seq - 1` is the last record written.
    next_seq: Seq,
    shutdown: bool,
}

struct LogInner {
    state: Mutex<LogState>,
    work: Condvar,
    log_dir: PathBuf,
}

/// Handle to the operation log shared by the dispatcher and the writer.
#[derive(Clone)]
pub struct OpLog {
    inner: Arc<LogInner>,
}

impl OpLog {
    /// Open a fresh log file starting at `next_seq`. Called after recovery
    /// has replayed any existing logs.
    pub fn open(log_dir: impl AsRef<Path>, next_seq: Seq) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;
        let file = Self::create_log_file(&log_dir, next_seq)?;
        info!(seq = next_seq, "opened operation log {}", log_file_name(next_seq));
        Ok(Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState {
                    queue: VecDeque::new(),
                    file,
                    first_seq: next_seq,
                    next_seq,
                    shutdown: false,
                }),
                work: Condvar::new(),
                log_dir,
            }),
        })
    }

    fn create_log_file(dir: &Path, first_seq: Seq) -> Result<BufWriter<File>> {
        let path = dir.join(log_file_name(first_seq));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "version/{VERSION}")?;
        writer.flush()?;
        Ok(writer)
    }

    /// The name of the active log file.
    pub fn name(&self) -> String {
        log_file_name(self.inner.state.lock().first_seq)
    }

    /// Hand a retired request to the writer. Must persist before the
    /// response to the request is released; the writer re-enqueues the
    /// request as `Logged` once it is.
    pub fn add_pending(&self, r: MetaRequest) {
        let mut state = self.inner.state.lock();
        state.queue.push_back(r);
        self.inner.work.notify_one();
    }

    /// Ask the writer to stop once its queue drains.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.work.notify_one();
    }

    /// Spawn the log writer thread. Completed requests are pushed back into
    /// `queue` as `Logged`; rotations wake `cp`.
    pub fn start(&self, queue: Arc<RequestQueue>, cp: Arc<Checkpointer>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("kfs-logger".to_string())
            .spawn(move || Self::writer_loop(inner, queue, cp))
            .expect("spawn log writer")
    }

    fn writer_loop(inner: Arc<LogInner>, queue: Arc<RequestQueue>, cp: Arc<Checkpointer>) {
        loop {
            let batch: Vec<MetaRequest> = {
                let mut state = inner.state.lock();
                while state.queue.is_empty() && !state.shutdown {
                    inner.work.wait(&mut state);
                }
                if state.queue.is_empty() && state.shutdown {
                    if let Err(e) = state.file.flush().and_then(|_| state.file.get_ref().sync_data())
                    {
                        error!("log flush on shutdown failed: {e}");
                    }
                    return;
                }
                state.queue.drain(..).collect()
            };

            let mut unsynced = false;
            for r in batch {
                if matches!(r.body, Body::Checkpoint) {
                    Self::sync_or_die(&inner, &mut unsynced);
                    Self::rotate(&inner, &cp);
                    cp.start_cp();
                    queue.enqueue(QueueEntry::Logged(r));
                    continue;
                }
                let mut state = inner.state.lock();
                let seq = state.next_seq;
                if let Some(record) = r.log_record(seq) {
                    if let Err(e) = writeln!(state.file, "{record}") {
                        drop(state);
                        Self::die(e);
                    }
                    state.next_seq += 1;
                    unsynced = true;
                }
                drop(state);
                Self::sync_or_die(&inner, &mut unsynced);
                queue.enqueue(QueueEntry::Logged(r));
            }
        }
    }

    fn sync_or_die(inner: &LogInner, unsynced: &mut bool) {
        if !*unsynced {
            return;
        }
        let mut state = inner.state.lock();
        let res = state
            .file
            .flush()
            .and_then(|_| state.file.get_ref().sync_data());
        drop(state);
        if let Err(e) = res {
            Self::die(e);
        }
        *unsynced = false;
    }

    /// Close the current log, name it by its last seq, open a new one
    /// starting at `seq + 1`, and hand the closed seq to the checkpointer.
    fn rotate(inner: &LogInner, cp: &Checkpointer) {
        let mut state = inner.state.lock();
        let last = state.next_seq - 1;
        if last < state.first_seq {
            // Nothing was logged into this file; no rotation to do.
            cp.log_rotated(state.first_seq - 1, log_file_name(state.first_seq));
            return;
        }
        if let Err(e) = state
            .file
            .flush()
            .and_then(|_| state.file.get_ref().sync_all())
        {
            drop(state);
            Self::die(e);
        }
        let old = inner.log_dir.join(log_file_name(state.first_seq));
        let closed = inner.log_dir.join(log_file_name(last));
        if old != closed {
            if let Err(e) = fs::rename(&old, &closed) {
                drop(state);
                Self::die(e);
            }
        }
        let next = last + 1;
        match Self::create_log_file(&inner.log_dir, next) {
            Ok(file) => {
                state.file = file;
                state.first_seq = next;
            }
            Err(e) => {
                drop(state);
                error!("cannot open new log file: {e}");
                std::process::abort();
            }
        }
        info!(closed_seq = last, "rotated operation log to {}", log_file_name(next));
        cp.log_rotated(last, log_file_name(next));
    }

    /// A failed log write leaves the durability barrier broken; abort so
    /// the operator recovers from the logs on disk.
    fn die(e: std::io::Error) -> ! {
        error!("operation log write failed: {e}");
        std::process::abort();
    }
}
