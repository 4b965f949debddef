//! Metadata checkpointing
//!
//! Serialises all leaves of the metadata tree plus the zombie queue to a
//! file named by the last log seq it includes. Single-checkpoint-at-a-time:
//!
//! 1. the timer posts a `Checkpoint` request when mutations are pending;
//! 2. the log writer retires it, rotates the log, and calls `start_cp`;
//! 3. this thread walks leaves through a restartable iterator, publishing
//!    the batch it currently holds so mutators can `wait_if_active`;
//! 4. zombies are flushed (each emitted, then destroyed);
//! 5. the file is closed and the `latest` pointer swings atomically.
//!
//! A request inside a `lock_running` critical section defers a start until
//! `unlock_running`.

use crate::seed::VersionInc;
use crate::tree::{now_secs, MetaKey, Metatree};
use kfs_common::{MetaError, Result, Seq, VERSION};
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Entities copied per read-lock acquisition during the leaf walk.
const LEAF_BATCH: usize = 256;

/// Name of the pointer file tracking the newest checkpoint.
pub const LATEST: &str = "latest";

struct CpState {
    running: bool,
    /// Set while some request holds `lock_running`; a start arriving then
    /// is deferred, not dropped.
    nostart: bool,
    startblocked: bool,
    mutations: u64,
    cp_count: u64,
    /// Last seq included in the next checkpoint; stamped at log rotation.
    checkpointed: Seq,
    log_name: String,
    shutdown: bool,
}

/// The checkpoint subsystem: state machine, writer thread, and the
/// active-node handshake with the dispatcher.
pub struct Checkpointer {
    state: Mutex<CpState>,
    wake: Condvar,
    active: Mutex<Option<(MetaKey, MetaKey)>>,
    active_cv: Condvar,
    cp_dir: PathBuf,
    tree: Arc<Metatree>,
    vers_inc: Arc<VersionInc>,
}

impl Checkpointer {
    pub fn new(cp_dir: impl AsRef<Path>, tree: Arc<Metatree>, vers_inc: Arc<VersionInc>) -> Self {
        Self {
            state: Mutex::new(CpState {
                running: false,
                nostart: false,
                startblocked: false,
                mutations: 0,
                cp_count: 0,
                checkpointed: 0,
                log_name: String::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            active: Mutex::new(None),
            active_cv: Condvar::new(),
            cp_dir: cp_dir.as_ref().to_path_buf(),
            tree,
            vers_inc,
        }
    }

    /// Count a retired mutation; checkpoints only run when there is
    /// something to capture.
    pub fn note_mutation(&self) {
        self.state.lock().mutations += 1;
    }

    /// Seed the mutation counter, e.g. with the number of replayed records
    /// after recovery.
    pub fn add_mutations(&self, n: u64) {
        self.state.lock().mutations += n;
    }

    /// There is a likelihood of a CP being taken.
    pub fn is_cp_needed(&self) -> bool {
        let state = self.state.lock();
        !state.running && state.mutations != 0
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn cp_count(&self) -> u64 {
        self.state.lock().cp_count
    }

    /// Seq the next (or current) checkpoint covers.
    pub fn checkpointed(&self) -> Seq {
        self.state.lock().checkpointed
    }

    /// Record a log rotation: `seq` is the last record in the closed log,
    /// `log_name` the file now being written. Also used by recovery to seed
    /// the initial state.
    pub fn log_rotated(&self, seq: Seq, log_name: String) {
        let mut state = self.state.lock();
        state.checkpointed = seq;
        state.log_name = log_name;
    }

    /// Wake the checkpoint thread if work is pending and no critical
    /// section blocks the start.
    pub fn start_cp(&self) {
        let mut state = self.state.lock();
        if !state.running && state.mutations != 0 {
            if state.nostart {
                state.startblocked = true;
            } else {
                state.running = true;
                state.mutations = 0;
                self.wake.notify_one();
            }
        }
    }

    /// Enter a critical section that must not race a checkpoint start.
    /// Returns whether a checkpoint is currently running.
    pub fn lock_running(&self) -> bool {
        let mut state = self.state.lock();
        state.nostart = true;
        state.running
    }

    /// Leave the critical section; a deferred start fires now.
    pub fn unlock_running(&self) {
        let startit = {
            let mut state = self.state.lock();
            state.nostart = false;
            let startit = state.startblocked;
            state.startblocked = false;
            startit
        };
        if startit {
            self.start_cp();
        }
    }

    /// Block while the checkpoint iterator holds the batch covering `key`;
    /// the iterator wakes waiters as it advances.
    pub fn wait_if_active(&self, key: &MetaKey) {
        let mut active = self.active.lock();
        while matches!(&*active, Some((lo, hi)) if lo <= key && key <= hi) {
            self.active_cv.wait(&mut active);
        }
    }

    fn set_active(&self, range: Option<(MetaKey, MetaKey)>) {
        let mut active = self.active.lock();
        *active = range;
        self.active_cv.notify_all();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.wake.notify_one();
    }

    /// Spawn the checkpoint writer thread.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let cp = Arc::clone(self);
        thread::Builder::new()
            .name("kfs-checkpoint".to_string())
            .spawn(move || loop {
                {
                    let mut state = cp.state.lock();
                    while !state.running && !state.shutdown {
                        cp.wake.wait(&mut state);
                    }
                    if state.shutdown {
                        return;
                    }
                }
                if let Err(e) = cp.do_cp() {
                    error!("checkpoint failed: {e}");
                }
                let mut state = cp.state.lock();
                state.running = false;
                state.cp_count += 1;
            })
            .expect("spawn checkpoint thread")
    }

    /// Write one checkpoint. Runs on the checkpoint thread with `running`
    /// already set.
    fn do_cp(&self) -> Result<()> {
        let (seq, log_name) = {
            let state = self.state.lock();
            (state.checkpointed, state.log_name.clone())
        };
        fs::create_dir_all(&self.cp_dir)?;
        let final_path = self.cp_dir.join(seq.to_string());
        let tmp_path = self.cp_dir.join(format!("{seq}.tmp"));

        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut out = BufWriter::new(file);
            self.write_header(&mut out, seq, &log_name)?;
            self.write_leaves(&mut out)?;
            self.write_zombies(&mut out)?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &final_path)?;
        self.link_latest(seq)?;
        info!(seq, "checkpoint written to {}", final_path.display());
        Ok(())
    }

    fn write_header<W: Write>(&self, out: &mut W, seq: Seq, log_name: &str) -> Result<()> {
        writeln!(out, "checkpoint/{seq}")?;
        writeln!(out, "version/{VERSION}")?;
        writeln!(out, "fid/{}", self.tree.fid_seed().seed())?;
        writeln!(out, "chunkId/{}", self.tree.chunk_seed().seed())?;
        writeln!(out, "chunkVersionInc/{}", self.vers_inc.get())?;
        writeln!(out, "time/{}", now_secs())?;
        writeln!(out, "log/{log_name}")?;
        writeln!(out)?;
        Ok(())
    }

    /// Restartable leaf walk: copy a bounded batch under the tree lock,
    /// publish it as active while it streams out, release, repeat.
    fn write_leaves<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut resume: Option<MetaKey> = None;
        loop {
            let (batch, last) = self.tree.leaf_batch(resume.as_ref(), LEAF_BATCH);
            if batch.is_empty() {
                break;
            }
            let lo = batch.first().map(|m| m.key());
            if let (Some(lo), Some(hi)) = (lo, last.clone()) {
                self.set_active(Some((lo, hi)));
            }
            for meta in &batch {
                writeln!(out, "{}", meta.checkpoint_line())?;
            }
            self.set_active(None);
            resume = last;
        }
        Ok(())
    }

    /// Flush the dumpster: each zombie is both emitted and destroyed, so a
    /// delete racing this checkpoint stays visible on disk.
    fn write_zombies<W: Write>(&self, out: &mut W) -> Result<()> {
        for zombie in self.tree.cleanup_dumpster() {
            writeln!(
                out,
                "chunkinfo/fid/{}/chunkid/{}/offset/{}/chunkVersion/{}",
                zombie.fid, zombie.chunk_id, zombie.offset, zombie.chunk_version
            )?;
        }
        Ok(())
    }

    /// Atomically swing `<cp_dir>/latest` to the new checkpoint file.
    fn link_latest(&self, seq: Seq) -> Result<()> {
        let tmp = self.cp_dir.join("latest.tmp");
        {
            let mut f = File::create(&tmp)?;
            writeln!(f, "{seq}")?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.cp_dir.join(LATEST))?;
        Ok(())
    }
}

/// Resolve the newest checkpoint file named by the `latest` pointer.
/// Returns `None` on a fresh cluster.
pub fn resolve_latest(cp_dir: &Path) -> Result<Option<PathBuf>> {
    let pointer = cp_dir.join(LATEST);
    if !pointer.exists() {
        return Ok(None);
    }
    let name = fs::read_to_string(&pointer)?;
    let name = name.trim();
    let path = cp_dir.join(name);
    if !path.exists() {
        warn!("latest pointer names missing checkpoint {name}");
        return Err(MetaError::corrupt(format!(
            "latest points at missing checkpoint {name}"
        )));
    }
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_common::ROOT_FID;
    use tempfile::tempdir;

    fn fixture() -> (Arc<Metatree>, Arc<VersionInc>) {
        let tree = Arc::new(Metatree::default());
        (tree, Arc::new(VersionInc::new()))
    }

    #[test]
    fn test_start_cp_requires_mutations() {
        let dir = tempdir().unwrap();
        let (tree, inc) = fixture();
        let cp = Checkpointer::new(dir.path(), tree, inc);
        cp.start_cp();
        assert!(!cp.is_running());
        cp.note_mutation();
        cp.start_cp();
        assert!(cp.is_running());
    }

    #[test]
    fn test_lock_running_defers_start() {
        let dir = tempdir().unwrap();
        let (tree, inc) = fixture();
        let cp = Checkpointer::new(dir.path(), tree, inc);
        cp.note_mutation();
        assert!(!cp.lock_running());
        cp.start_cp();
        assert!(!cp.is_running());
        cp.unlock_running();
        assert!(cp.is_running());
    }

    #[test]
    fn test_do_cp_writes_file_and_latest() {
        let dir = tempdir().unwrap();
        let (tree, inc) = fixture();
        tree.create(ROOT_FID, "a", 3).unwrap();
        let cp = Checkpointer::new(dir.path(), Arc::clone(&tree), inc);
        cp.log_rotated(5, "log.6".to_string());
        cp.do_cp().unwrap();

        let latest = resolve_latest(dir.path()).unwrap().unwrap();
        assert_eq!(latest, dir.path().join("5"));
        let text = fs::read_to_string(latest).unwrap();
        assert!(text.starts_with("checkpoint/5\nversion/KFS/1.0\n"));
        assert!(text.contains("log/log.6"));
        assert!(text.contains("dentry/name/a/"));
        assert!(text.contains("fattr/file/"));
    }

    #[test]
    fn test_checkpoint_drains_zombies() {
        let dir = tempdir().unwrap();
        let (tree, inc) = fixture();
        let fid = tree.create(ROOT_FID, "a", 3).unwrap();
        tree.assign_chunk_id(fid, 0, 11, 1).unwrap();
        tree.remove(ROOT_FID, "a").unwrap();
        assert_eq!(tree.dumpster_len(), 1);

        let cp = Checkpointer::new(dir.path(), Arc::clone(&tree), inc);
        cp.log_rotated(3, "log.4".to_string());
        cp.do_cp().unwrap();
        assert_eq!(tree.dumpster_len(), 0);
        let text = fs::read_to_string(dir.path().join("3")).unwrap();
        assert!(text.contains("chunkinfo/fid/"));
    }

    #[test]
    fn test_wait_if_active_outside_range() {
        let dir = tempdir().unwrap();
        let (tree, inc) = fixture();
        let cp = Checkpointer::new(dir.path(), tree, inc);
        // Nothing published: must not block.
        cp.wait_if_active(&MetaKey::fattr(7));
        cp.set_active(Some((MetaKey::fattr(1), MetaKey::fattr(3))));
        // Key outside the held batch: must not block either.
        cp.wait_if_active(&MetaKey::fattr(7));
        cp.set_active(None);
    }
}
