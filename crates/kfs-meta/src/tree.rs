//! In-memory metadata tree
//!
//! An ordered index over all files, directories, and chunks, keyed by a
//! composite `(fid, kind, subkey)` so that lookups by directory, by
//! attribute, and by chunk offset all reduce to range scans.
//!
//! The tree exclusively owns all entities. The dispatcher is the only
//! mutator; the checkpoint thread reads through the same lock in bounded
//! batches (see `checkpoint.rs`). Detached chunks move into the dumpster so
//! an in-flight checkpoint still records chunks whose deletion RPCs have
//! not been acknowledged yet.

use crate::seed::UniqueId;
use kfs_common::{ChunkId, ChunkOff, Fid, FileType, MetaError, Result, CHUNK_SIZE, NUM_REPLICAS_PER_FILE, ROOT_FID};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds for file timestamps.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Which of the three entity families a key addresses. The declaration
/// order fixes the scan order within a fid: attribute first, then the
/// directory entries, then the chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyKind {
    Fattr,
    Dentry,
    Chunk,
}

/// Discriminating tail of a key: nothing for attributes, the entry name
/// for dentries, the chunk start offset for chunks.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubKey {
    None,
    Name(String),
    Offset(ChunkOff),
}

/// Composite tree key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetaKey {
    pub fid: Fid,
    pub kind: KeyKind,
    pub sub: SubKey,
}

impl MetaKey {
    pub fn fattr(fid: Fid) -> Self {
        Self {
            fid,
            kind: KeyKind::Fattr,
            sub: SubKey::None,
        }
    }

    pub fn dentry(parent: Fid, name: &str) -> Self {
        Self {
            fid: parent,
            kind: KeyKind::Dentry,
            sub: SubKey::Name(name.to_string()),
        }
    }

    pub fn chunk(fid: Fid, offset: ChunkOff) -> Self {
        Self {
            fid,
            kind: KeyKind::Chunk,
            sub: SubKey::Offset(offset),
        }
    }

    fn kind_start(fid: Fid, kind: KeyKind) -> Self {
        Self {
            fid,
            kind,
            sub: SubKey::None,
        }
    }
}

/// Directory entry: maps a name within a parent to a child fid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dentry {
    pub parent: Fid,
    pub name: String,
    pub id: Fid,
}

/// Per-file attributes. One per fid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fattr {
    pub id: Fid,
    pub file_type: FileType,
    pub chunk_count: i64,
    pub num_replicas: u8,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
}

impl Fattr {
    pub fn new(id: Fid, file_type: FileType, num_replicas: u8, now: i64) -> Self {
        Self {
            id,
            file_type,
            chunk_count: 0,
            num_replicas,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }
}

/// Location of one chunk of a file. Unique per `(fid, offset)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub fid: Fid,
    pub offset: ChunkOff,
    pub chunk_id: ChunkId,
    pub chunk_version: i64,
}

/// A tree entity, as stored and as serialised into checkpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Meta {
    Dentry(Dentry),
    Fattr(Fattr),
    Chunk(ChunkInfo),
}

impl Meta {
    pub fn key(&self) -> MetaKey {
        match self {
            Meta::Dentry(d) => MetaKey::dentry(d.parent, &d.name),
            Meta::Fattr(f) => MetaKey::fattr(f.id),
            Meta::Chunk(c) => MetaKey::chunk(c.fid, c.offset),
        }
    }

    /// One line per entity, the checkpoint on-disk form.
    pub fn checkpoint_line(&self) -> String {
        match self {
            Meta::Dentry(d) => {
                format!("dentry/name/{}/id/{}/parent/{}", d.name, d.id, d.parent)
            }
            Meta::Fattr(f) => format!(
                "fattr/{}/id/{}/chunkcount/{}/numReplicas/{}/mtime/{}/ctime/{}/crtime/{}",
                f.file_type, f.id, f.chunk_count, f.num_replicas, f.mtime, f.ctime, f.crtime
            ),
            Meta::Chunk(c) => format!(
                "chunkinfo/fid/{}/chunkid/{}/offset/{}/chunkVersion/{}",
                c.fid, c.chunk_id, c.offset, c.chunk_version
            ),
        }
    }
}

/// Outcome of `allocate_chunk_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkAllocation {
    /// First allocation for this `(fid, offset)`.
    Fresh {
        chunk_id: ChunkId,
        chunk_version: i64,
        num_replicas: u8,
    },
    /// The slot already holds a chunk; versioning is left to the lease logic.
    Exists {
        chunk_id: ChunkId,
        chunk_version: i64,
        num_replicas: u8,
    },
}

/// Outcome of `truncate`.
#[derive(Clone, Debug, Default)]
pub struct TruncateResult {
    /// Set when extending past the last chunk: the offset of the chunk the
    /// caller must allocate next.
    pub alloc_offset: Option<ChunkOff>,
    /// Chunks cut off by a shrink; already moved to the dumpster.
    pub removed: Vec<ChunkInfo>,
    /// The kept chunk straddling the new EOF and its new in-chunk size, for
    /// the chunkserver-side truncation the handler issues.
    pub boundary: Option<(ChunkId, i64)>,
}

struct TreeInner {
    entries: BTreeMap<MetaKey, Meta>,
    /// Secondary index: which slot a chunk id occupies. Rebuilt alongside
    /// the primary entries; lease and layout bookkeeping key on chunk ids.
    chunk_index: HashMap<ChunkId, (Fid, ChunkOff)>,
}

/// The metadata tree plus the id seeds it persists.
pub struct Metatree {
    inner: RwLock<TreeInner>,
    dumpster: Mutex<VecDeque<ChunkInfo>>,
    fid_seed: UniqueId,
    chunk_seed: UniqueId,
}

impl Metatree {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TreeInner {
                entries: BTreeMap::new(),
                chunk_index: HashMap::new(),
            }),
            dumpster: Mutex::new(VecDeque::new()),
            fid_seed: UniqueId::file_ids(),
            chunk_seed: UniqueId::chunk_ids(),
        }
    }

    /// Bootstrap the root directory. Called once on a fresh start; recovery
    /// loads the root from the checkpoint instead.
    pub fn init(&self) {
        let now = now_secs();
        let mut inner = self.inner.write();
        let root = Fattr::new(ROOT_FID, FileType::Dir, 1, now);
        inner
            .entries
            .insert(MetaKey::fattr(ROOT_FID), Meta::Fattr(root));
        let dot = Dentry {
            parent: ROOT_FID,
            name: "/".to_string(),
            id: ROOT_FID,
        };
        inner
            .entries
            .insert(MetaKey::dentry(ROOT_FID, "/"), Meta::Dentry(dot));
    }

    pub fn fid_seed(&self) -> &UniqueId {
        &self.fid_seed
    }

    pub fn chunk_seed(&self) -> &UniqueId {
        &self.chunk_seed
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(MetaError::invalid(format!("bad name {name:?}")));
        }
        Ok(())
    }

    fn getattr_locked(inner: &TreeInner, fid: Fid) -> Option<Fattr> {
        match inner.entries.get(&MetaKey::fattr(fid)) {
            Some(Meta::Fattr(f)) => Some(f.clone()),
            _ => None,
        }
    }

    fn dir_check(inner: &TreeInner, fid: Fid) -> Result<()> {
        let fa = Self::getattr_locked(inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::Dir {
            return Err(MetaError::NotDir);
        }
        Ok(())
    }

    /// Fetch a file attribute by fid.
    pub fn getattr(&self, fid: Fid) -> Option<Fattr> {
        Self::getattr_locked(&self.inner.read(), fid)
    }

    /// Look up `name` within directory `dir`.
    pub fn lookup(&self, dir: Fid, name: &str) -> Result<Fattr> {
        let inner = self.inner.read();
        Self::dir_check(&inner, dir)?;
        let child = match inner.entries.get(&MetaKey::dentry(dir, name)) {
            Some(Meta::Dentry(d)) => d.id,
            _ => return Err(MetaError::NoSuchEntry),
        };
        Self::getattr_locked(&inner, child).ok_or(MetaError::NoSuchEntry)
    }

    /// Resolve a `/`-delimited path, one component at a time. An absolute
    /// path restarts at the root regardless of `root`.
    pub fn lookup_path(&self, root: Fid, path: &str) -> Result<Fattr> {
        let inner = self.inner.read();
        let mut cur = if path.starts_with('/') { ROOT_FID } else { root };
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            Self::dir_check(&inner, cur)?;
            cur = match inner.entries.get(&MetaKey::dentry(cur, comp)) {
                Some(Meta::Dentry(d)) => d.id,
                _ => return Err(MetaError::NoSuchEntry),
            };
        }
        Self::getattr_locked(&inner, cur).ok_or(MetaError::NoSuchEntry)
    }

    /// Create a file in `dir`. Fails with `Exists` on a duplicate name.
    pub fn create(&self, dir: Fid, name: &str, num_replicas: u8) -> Result<Fid> {
        Self::check_name(name)?;
        let replicas = num_replicas.clamp(1, NUM_REPLICAS_PER_FILE);
        let mut inner = self.inner.write();
        Self::dir_check(&inner, dir)?;
        if inner.entries.contains_key(&MetaKey::dentry(dir, name)) {
            return Err(MetaError::Exists);
        }
        let fid = self.fid_seed.next_id();
        let now = now_secs();
        inner.entries.insert(
            MetaKey::dentry(dir, name),
            Meta::Dentry(Dentry {
                parent: dir,
                name: name.to_string(),
                id: fid,
            }),
        );
        inner.entries.insert(
            MetaKey::fattr(fid),
            Meta::Fattr(Fattr::new(fid, FileType::File, replicas, now)),
        );
        Ok(fid)
    }

    /// Create a directory in `dir`.
    pub fn mkdir(&self, dir: Fid, name: &str) -> Result<Fid> {
        Self::check_name(name)?;
        let mut inner = self.inner.write();
        Self::dir_check(&inner, dir)?;
        if inner.entries.contains_key(&MetaKey::dentry(dir, name)) {
            return Err(MetaError::Exists);
        }
        let fid = self.fid_seed.next_id();
        let now = now_secs();
        inner.entries.insert(
            MetaKey::dentry(dir, name),
            Meta::Dentry(Dentry {
                parent: dir,
                name: name.to_string(),
                id: fid,
            }),
        );
        inner.entries.insert(
            MetaKey::fattr(fid),
            Meta::Fattr(Fattr::new(fid, FileType::Dir, 1, now)),
        );
        Ok(fid)
    }

    fn chunks_of(inner: &TreeInner, fid: Fid) -> Vec<ChunkInfo> {
        inner
            .entries
            .range((
                Bound::Included(MetaKey::kind_start(fid, KeyKind::Chunk)),
                Bound::Excluded(MetaKey::kind_start(fid + 1, KeyKind::Fattr)),
            ))
            .filter_map(|(_, m)| match m {
                Meta::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn dentries_of(inner: &TreeInner, fid: Fid) -> Vec<Dentry> {
        inner
            .entries
            .range((
                Bound::Included(MetaKey::kind_start(fid, KeyKind::Dentry)),
                Bound::Excluded(MetaKey::kind_start(fid, KeyKind::Chunk)),
            ))
            .filter_map(|(_, m)| match m {
                Meta::Dentry(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Detach a file's metadata under the lock; the chunks land in the
    /// dumpster and are also returned so the caller can queue DELETE RPCs.
    fn detach_file(&self, inner: &mut TreeInner, dir: Fid, name: &str, fid: Fid) -> Vec<ChunkInfo> {
        inner.entries.remove(&MetaKey::dentry(dir, name));
        inner.entries.remove(&MetaKey::fattr(fid));
        let chunks = Self::chunks_of(inner, fid);
        for c in &chunks {
            inner.entries.remove(&MetaKey::chunk(c.fid, c.offset));
            inner.chunk_index.remove(&c.chunk_id);
        }
        let mut dumpster = self.dumpster.lock();
        for c in &chunks {
            dumpster.push_back(c.clone());
        }
        chunks
    }

    /// Remove a file. Its chunks move to the dumpster so they stay visible
    /// to an in-flight checkpoint; the returned list drives DELETE RPCs.
    pub fn remove(&self, dir: Fid, name: &str) -> Result<Vec<ChunkInfo>> {
        let mut inner = self.inner.write();
        Self::dir_check(&inner, dir)?;
        let fid = match inner.entries.get(&MetaKey::dentry(dir, name)) {
            Some(Meta::Dentry(d)) => d.id,
            _ => return Err(MetaError::NoSuchEntry),
        };
        let fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type == FileType::Dir {
            return Err(MetaError::IsDir);
        }
        Ok(self.detach_file(&mut inner, dir, name, fid))
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, dir: Fid, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        Self::dir_check(&inner, dir)?;
        let fid = match inner.entries.get(&MetaKey::dentry(dir, name)) {
            Some(Meta::Dentry(d)) => d.id,
            _ => return Err(MetaError::NoSuchEntry),
        };
        if fid == ROOT_FID {
            return Err(MetaError::invalid("cannot remove the root"));
        }
        let fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::Dir {
            return Err(MetaError::NotDir);
        }
        if !Self::dentries_of(&inner, fid).is_empty() {
            return Err(MetaError::NotEmpty);
        }
        inner.entries.remove(&MetaKey::dentry(dir, name));
        inner.entries.remove(&MetaKey::fattr(fid));
        Ok(())
    }

    /// List a directory. The root's `"/"` self-entry is included; response
    /// formatting filters it.
    pub fn readdir(&self, dir: Fid) -> Result<Vec<Dentry>> {
        let inner = self.inner.read();
        Self::dir_check(&inner, dir)?;
        Ok(Self::dentries_of(&inner, dir))
    }

    /// Allocation info for the chunk containing `offset`.
    pub fn get_alloc(&self, fid: Fid, offset: ChunkOff) -> Result<ChunkInfo> {
        let inner = self.inner.read();
        let fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::File {
            return Err(MetaError::IsDir);
        }
        let base = offset - offset.rem_euclid(CHUNK_SIZE);
        match inner.entries.get(&MetaKey::chunk(fid, base)) {
            Some(Meta::Chunk(c)) => Ok(c.clone()),
            _ => Err(MetaError::NoSuchEntry),
        }
    }

    /// Allocation info for every chunk of a file, in offset order.
    pub fn get_alloc_all(&self, fid: Fid) -> Result<Vec<ChunkInfo>> {
        let inner = self.inner.read();
        let fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::File {
            return Err(MetaError::IsDir);
        }
        Ok(Self::chunks_of(&inner, fid))
    }

    /// Hand out a fresh `(chunk_id, version)` for `(fid, offset)`, or the
    /// existing tuple when the slot is already taken. Nothing is inserted
    /// until `assign_chunk_id` runs after the chunkservers ack.
    pub fn allocate_chunk_id(
        &self,
        fid: Fid,
        offset: ChunkOff,
        version_inc: i64,
    ) -> Result<ChunkAllocation> {
        if offset < 0 || offset % CHUNK_SIZE != 0 {
            return Err(MetaError::invalid(format!("unaligned chunk offset {offset}")));
        }
        let inner = self.inner.read();
        let fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::File {
            return Err(MetaError::IsDir);
        }
        if let Some(Meta::Chunk(c)) = inner.entries.get(&MetaKey::chunk(fid, offset)) {
            return Ok(ChunkAllocation::Exists {
                chunk_id: c.chunk_id,
                chunk_version: c.chunk_version,
                num_replicas: fa.num_replicas,
            });
        }
        Ok(ChunkAllocation::Fresh {
            chunk_id: self.chunk_seed.next_id(),
            chunk_version: version_inc,
            num_replicas: fa.num_replicas,
        })
    }

    /// Bind a chunk id (and version) to its slot once the primary acked.
    /// Versions are strictly monotonic per chunk; re-binding an existing
    /// chunk with a version at or below the stored one is refused.
    pub fn assign_chunk_id(
        &self,
        fid: Fid,
        offset: ChunkOff,
        chunk_id: ChunkId,
        chunk_version: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let mut fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::File {
            return Err(MetaError::IsDir);
        }
        let key = MetaKey::chunk(fid, offset);
        let prior = match inner.entries.get(&key) {
            Some(Meta::Chunk(c)) => Some(c.clone()),
            _ => None,
        };
        if let Some(old) = &prior {
            if old.chunk_id == chunk_id && chunk_version <= old.chunk_version {
                return Err(MetaError::BadVersion);
            }
            if old.chunk_id != chunk_id {
                inner.chunk_index.remove(&old.chunk_id);
                self.dumpster.lock().push_back(old.clone());
            }
        }
        inner.entries.insert(
            key,
            Meta::Chunk(ChunkInfo {
                fid,
                offset,
                chunk_id,
                chunk_version,
            }),
        );
        inner.chunk_index.insert(chunk_id, (fid, offset));
        let now = now_secs();
        fa.mtime = now;
        fa.ctime = now;
        if prior.is_none() {
            fa.chunk_count += 1;
        }
        inner.entries.insert(MetaKey::fattr(fid), Meta::Fattr(fa));
        Ok(())
    }

    /// Update the stored version of an already-assigned chunk. The new
    /// version must be strictly greater than the stored one, so stale
    /// replicas can never shadow fresh ones.
    pub fn update_chunk_version(&self, chunk_id: ChunkId, chunk_version: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let (fid, offset) = *inner
            .chunk_index
            .get(&chunk_id)
            .ok_or(MetaError::NoSuchEntry)?;
        match inner.entries.get_mut(&MetaKey::chunk(fid, offset)) {
            Some(Meta::Chunk(c)) => {
                if chunk_version <= c.chunk_version {
                    return Err(MetaError::BadVersion);
                }
                c.chunk_version = chunk_version;
                Ok(())
            }
            _ => Err(MetaError::NoSuchEntry),
        }
    }

    /// Locate a chunk by id.
    pub fn chunk_lookup(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        let inner = self.inner.read();
        let (fid, offset) = *inner.chunk_index.get(&chunk_id)?;
        match inner.entries.get(&MetaKey::chunk(fid, offset)) {
            Some(Meta::Chunk(c)) => Some(c.clone()),
            _ => None,
        }
    }

    /// Replication degree owed to a chunk, from its file's attribute.
    pub fn chunk_replication(&self, chunk_id: ChunkId) -> Option<u8> {
        let inner = self.inner.read();
        let (fid, _) = *inner.chunk_index.get(&chunk_id)?;
        Self::getattr_locked(&inner, fid).map(|fa| fa.num_replicas)
    }

    /// Shrink or extend a file. Extending past the last chunk reports the
    /// chunk offset the caller must allocate; the allocation itself is
    /// issued by the handler.
    pub fn truncate(&self, fid: Fid, offset: ChunkOff) -> Result<TruncateResult> {
        if offset < 0 {
            return Err(MetaError::invalid("negative truncate offset"));
        }
        let mut inner = self.inner.write();
        let mut fa = Self::getattr_locked(&inner, fid).ok_or(MetaError::NoSuchEntry)?;
        if fa.file_type != FileType::File {
            return Err(MetaError::IsDir);
        }

        let mut result = TruncateResult::default();
        let chunks = Self::chunks_of(&inner, fid);
        for c in &chunks {
            if c.offset >= offset {
                inner.entries.remove(&MetaKey::chunk(c.fid, c.offset));
                inner.chunk_index.remove(&c.chunk_id);
                fa.chunk_count -= 1;
                result.removed.push(c.clone());
            } else if c.offset + CHUNK_SIZE > offset {
                result.boundary = Some((c.chunk_id, offset - c.offset));
            }
        }
        {
            let mut dumpster = self.dumpster.lock();
            for c in &result.removed {
                dumpster.push_back(c.clone());
            }
        }

        if offset > 0 {
            let target = ((offset - 1) / CHUNK_SIZE) * CHUNK_SIZE;
            if !inner.entries.contains_key(&MetaKey::chunk(fid, target)) {
                result.alloc_offset = Some(target);
            }
        }

        let now = now_secs();
        fa.mtime = now;
        fa.ctime = now;
        inner.entries.insert(MetaKey::fattr(fid), Meta::Fattr(fa));
        Ok(result)
    }

    fn is_descendant(inner: &TreeInner, ancestor: Fid, fid: Fid) -> bool {
        if ancestor == fid {
            return true;
        }
        let mut stack = vec![ancestor];
        while let Some(dir) = stack.pop() {
            for d in Self::dentries_of(inner, dir) {
                if d.id == dir {
                    continue;
                }
                if d.id == fid {
                    return true;
                }
                if matches!(
                    Self::getattr_locked(inner, d.id).map(|f| f.file_type),
                    Some(FileType::Dir)
                ) {
                    stack.push(d.id);
                }
            }
        }
        false
    }

    /// Rename within or across directories, atomically. `new_path` is a
    /// bare name for a same-directory rename or an absolute path resolved
    /// from the root. Crossing file/dir kinds fails; with `overwrite` an
    /// existing file target is displaced (its chunks are returned for
    /// deletion).
    pub fn rename(
        &self,
        dir: Fid,
        old: &str,
        new_path: &str,
        overwrite: bool,
    ) -> Result<Vec<ChunkInfo>> {
        let mut inner = self.inner.write();
        Self::dir_check(&inner, dir)?;
        let src = match inner.entries.get(&MetaKey::dentry(dir, old)) {
            Some(Meta::Dentry(d)) => d.clone(),
            _ => return Err(MetaError::NoSuchEntry),
        };
        if src.id == ROOT_FID {
            return Err(MetaError::invalid("cannot rename the root"));
        }
        let src_fa = Self::getattr_locked(&inner, src.id).ok_or(MetaError::NoSuchEntry)?;

        let (dst_dir, dst_name) = match new_path.rfind('/') {
            Some(pos) => {
                let (dirpart, rest) = new_path.split_at(pos);
                let base = &rest[1..];
                if base.is_empty() {
                    return Err(MetaError::invalid("rename target names a directory"));
                }
                let parent = if dirpart.is_empty() {
                    ROOT_FID
                } else {
                    let fa = {
                        // Path resolution needs read access while we hold the
                        // write lock; resolve against the locked map directly.
                        let mut cur = ROOT_FID;
                        for comp in dirpart.split('/').filter(|c| !c.is_empty()) {
                            Self::dir_check(&inner, cur)?;
                            cur = match inner.entries.get(&MetaKey::dentry(cur, comp)) {
                                Some(Meta::Dentry(d)) => d.id,
                                _ => return Err(MetaError::NoSuchEntry),
                            };
                        }
                        Self::getattr_locked(&inner, cur).ok_or(MetaError::NoSuchEntry)?
                    };
                    if fa.file_type != FileType::Dir {
                        return Err(MetaError::NotDir);
                    }
                    fa.id
                };
                (parent, base.to_string())
            }
            None => (dir, new_path.to_string()),
        };
        Self::check_name(&dst_name)?;

        if dst_dir == dir && dst_name == old {
            return Ok(Vec::new());
        }
        if src_fa.file_type == FileType::Dir && Self::is_descendant(&inner, src.id, dst_dir) {
            return Err(MetaError::invalid("rename would create a cycle"));
        }

        let mut displaced = Vec::new();
        if let Some(Meta::Dentry(existing)) = inner.entries.get(&MetaKey::dentry(dst_dir, &dst_name))
        {
            let existing = existing.clone();
            if !overwrite {
                return Err(MetaError::Exists);
            }
            let dst_fa = Self::getattr_locked(&inner, existing.id).ok_or(MetaError::NoSuchEntry)?;
            if dst_fa.file_type != src_fa.file_type {
                return Err(MetaError::invalid("rename across file/dir kinds"));
            }
            if dst_fa.file_type == FileType::Dir {
                return Err(MetaError::IsDir);
            }
            displaced = self.detach_file(&mut inner, dst_dir, &dst_name, existing.id);
        }

        inner.entries.remove(&MetaKey::dentry(dir, old));
        inner.entries.insert(
            MetaKey::dentry(dst_dir, &dst_name),
            Meta::Dentry(Dentry {
                parent: dst_dir,
                name: dst_name,
                id: src.id,
            }),
        );
        let mut fa = src_fa;
        fa.ctime = now_secs();
        inner.entries.insert(MetaKey::fattr(src.id), Meta::Fattr(fa));
        Ok(displaced)
    }

    /// Drain the dumpster. The caller must not invoke this while a
    /// checkpoint is running; the checkpoint writer drains zombies itself.
    pub fn cleanup_dumpster(&self) -> Vec<ChunkInfo> {
        self.dumpster.lock().drain(..).collect()
    }

    pub fn dumpster_len(&self) -> usize {
        self.dumpster.lock().len()
    }

    /// One bounded batch of the restartable checkpoint iteration: entities
    /// strictly after `resume`, in key order.
    pub fn leaf_batch(&self, resume: Option<&MetaKey>, limit: usize) -> (Vec<Meta>, Option<MetaKey>) {
        let inner = self.inner.read();
        let range = match resume {
            Some(key) => inner
                .entries
                .range((Bound::Excluded(key.clone()), Bound::Unbounded)),
            None => inner.entries.range(..),
        };
        let mut out = Vec::with_capacity(limit);
        let mut last = None;
        for (k, v) in range.take(limit) {
            out.push(v.clone());
            last = Some(k.clone());
        }
        (out, last)
    }

    /// Raw insert used by recovery; no timestamp or seed side effects.
    pub fn load_entity(&self, meta: Meta) {
        let mut inner = self.inner.write();
        if let Meta::Chunk(c) = &meta {
            inner.chunk_index.insert(c.chunk_id, (c.fid, c.offset));
        }
        inner.entries.insert(meta.key(), meta);
    }

    /// Re-home chunk rows whose file no longer exists into the dumpster.
    /// Checkpoints serialise zombies with the same record as live chunks;
    /// after a load they are told apart by their missing attribute.
    pub fn sweep_orphan_chunks(&self) -> usize {
        let mut inner = self.inner.write();
        let orphans: Vec<ChunkInfo> = inner
            .entries
            .values()
            .filter_map(|m| match m {
                Meta::Chunk(c) => match Self::getattr_locked(&inner, c.fid) {
                    Some(fa) if fa.file_type == FileType::File => None,
                    _ => Some(c.clone()),
                },
                _ => None,
            })
            .collect();
        for c in &orphans {
            inner.entries.remove(&MetaKey::chunk(c.fid, c.offset));
            inner.chunk_index.remove(&c.chunk_id);
        }
        let count = orphans.len();
        let mut dumpster = self.dumpster.lock();
        for c in orphans {
            dumpster.push_back(c);
        }
        count
    }

    /// Every entity in key order; snapshot/replay equivalence tests compare
    /// these.
    pub fn export(&self) -> Vec<Meta> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Metatree {
    fn default() -> Self {
        let tree = Self::new();
        tree.init();
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Metatree {
        Metatree::default()
    }

    #[test]
    fn test_create_then_lookup() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        let fa = t.lookup(ROOT_FID, "a").unwrap();
        assert_eq!(fa.id, fid);
        assert_eq!(fa.file_type, FileType::File);
        assert_eq!(fa.chunk_count, 0);
        assert_eq!(fa.num_replicas, 3);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let t = tree();
        t.create(ROOT_FID, "a", 3).unwrap();
        assert!(matches!(t.create(ROOT_FID, "a", 3), Err(MetaError::Exists)));
    }

    #[test]
    fn test_replica_clamp() {
        let t = tree();
        t.create(ROOT_FID, "many", 9).unwrap();
        assert_eq!(t.lookup(ROOT_FID, "many").unwrap().num_replicas, 3);
    }

    #[test]
    fn test_lookup_path() {
        let t = tree();
        let d = t.mkdir(ROOT_FID, "d").unwrap();
        let x = t.create(d, "x", 3).unwrap();
        assert_eq!(t.lookup_path(ROOT_FID, "/d/x").unwrap().id, x);
        assert_eq!(t.lookup_path(d, "x").unwrap().id, x);
        assert!(t.lookup_path(ROOT_FID, "/d/y").is_err());
    }

    #[test]
    fn test_allocate_chunk_id_twice_returns_same() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        let first = t.allocate_chunk_id(fid, 0, 1).unwrap();
        let (cid, vers) = match first {
            ChunkAllocation::Fresh {
                chunk_id,
                chunk_version,
                ..
            } => (chunk_id, chunk_version),
            _ => panic!("expected fresh allocation"),
        };
        t.assign_chunk_id(fid, 0, cid, vers).unwrap();
        match t.allocate_chunk_id(fid, 0, 1).unwrap() {
            ChunkAllocation::Exists {
                chunk_id,
                chunk_version,
                ..
            } => {
                assert_eq!(chunk_id, cid);
                assert_eq!(chunk_version, vers);
            }
            _ => panic!("expected existing allocation"),
        }
    }

    #[test]
    fn test_assign_bumps_chunk_count_once() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        t.assign_chunk_id(fid, 0, 7, 1).unwrap();
        t.assign_chunk_id(fid, 0, 7, 2).unwrap();
        assert_eq!(t.getattr(fid).unwrap().chunk_count, 1);
        assert_eq!(t.get_alloc(fid, 0).unwrap().chunk_version, 2);
    }

    #[test]
    fn test_chunk_version_strictly_monotonic() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        t.assign_chunk_id(fid, 0, 7, 3).unwrap();

        // Re-binding the same chunk at or below the stored version is
        // refused and leaves the stored version untouched.
        assert!(matches!(
            t.assign_chunk_id(fid, 0, 7, 3),
            Err(MetaError::BadVersion)
        ));
        assert!(matches!(
            t.assign_chunk_id(fid, 0, 7, 2),
            Err(MetaError::BadVersion)
        ));
        assert_eq!(t.get_alloc(fid, 0).unwrap().chunk_version, 3);
        t.assign_chunk_id(fid, 0, 7, 4).unwrap();

        assert!(matches!(
            t.update_chunk_version(7, 4),
            Err(MetaError::BadVersion)
        ));
        assert!(matches!(
            t.update_chunk_version(7, 1),
            Err(MetaError::BadVersion)
        ));
        assert_eq!(t.get_alloc(fid, 0).unwrap().chunk_version, 4);
        t.update_chunk_version(7, 9).unwrap();
        assert_eq!(t.get_alloc(fid, 0).unwrap().chunk_version, 9);
    }

    #[test]
    fn test_remove_moves_chunks_to_dumpster() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        t.assign_chunk_id(fid, 0, 7, 1).unwrap();
        t.assign_chunk_id(fid, CHUNK_SIZE, 8, 1).unwrap();
        let removed = t.remove(ROOT_FID, "a").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(t.dumpster_len(), 2);
        assert!(t.get_alloc(fid, 0).is_err());
        assert!(t.chunk_lookup(7).is_none());
    }

    #[test]
    fn test_rmdir_refuses_nonempty() {
        let t = tree();
        let d = t.mkdir(ROOT_FID, "d").unwrap();
        t.create(d, "x", 3).unwrap();
        assert!(matches!(t.rmdir(ROOT_FID, "d"), Err(MetaError::NotEmpty)));
        t.remove(d, "x").unwrap();
        t.rmdir(ROOT_FID, "d").unwrap();
        assert!(t.lookup(ROOT_FID, "d").is_err());
    }

    #[test]
    fn test_rename_across_dirs() {
        let t = tree();
        t.create(ROOT_FID, "a", 3).unwrap();
        let d = t.mkdir(ROOT_FID, "d").unwrap();
        let x = t.create(d, "x", 3).unwrap();
        t.rename(ROOT_FID, "d", "/e", false).unwrap();
        let names: Vec<String> = t
            .readdir(ROOT_FID)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .filter(|n| n != "/")
            .collect();
        assert_eq!(names, vec!["a".to_string(), "e".to_string()]);
        let e = t.lookup(ROOT_FID, "e").unwrap();
        assert_eq!(t.lookup(e.id, "x").unwrap().id, x);
    }

    #[test]
    fn test_rename_overwrite() {
        let t = tree();
        t.create(ROOT_FID, "a", 3).unwrap();
        let b = t.create(ROOT_FID, "b", 3).unwrap();
        t.assign_chunk_id(b, 0, 9, 1).unwrap();
        assert!(matches!(
            t.rename(ROOT_FID, "a", "b", false),
            Err(MetaError::Exists)
        ));
        let displaced = t.rename(ROOT_FID, "a", "b", true).unwrap();
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].chunk_id, 9);
        assert!(t.lookup(ROOT_FID, "a").is_err());
        assert!(t.lookup(ROOT_FID, "b").is_ok());
    }

    #[test]
    fn test_rename_kind_mismatch() {
        let t = tree();
        t.create(ROOT_FID, "f", 3).unwrap();
        t.mkdir(ROOT_FID, "d").unwrap();
        assert!(t.rename(ROOT_FID, "f", "d", true).is_err());
    }

    #[test]
    fn test_rename_cycle_refused() {
        let t = tree();
        let d = t.mkdir(ROOT_FID, "d").unwrap();
        t.mkdir(d, "sub").unwrap();
        assert!(t.rename(ROOT_FID, "d", "/d/sub/d2", false).is_err());
    }

    #[test]
    fn test_truncate_shrink_and_extend() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        t.assign_chunk_id(fid, 0, 7, 1).unwrap();
        t.assign_chunk_id(fid, CHUNK_SIZE, 8, 1).unwrap();

        // Shrink into the middle of the first chunk.
        let r = t.truncate(fid, 10).unwrap();
        assert_eq!(r.removed.len(), 1);
        assert_eq!(r.removed[0].chunk_id, 8);
        assert_eq!(r.boundary, Some((7, 10)));
        assert!(r.alloc_offset.is_none());
        assert_eq!(t.getattr(fid).unwrap().chunk_count, 1);

        // Extend past the last chunk.
        let r = t.truncate(fid, CHUNK_SIZE + 10).unwrap();
        assert_eq!(r.alloc_offset, Some(CHUNK_SIZE));
    }

    #[test]
    fn test_truncate_extension_on_empty_file() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        let r = t.truncate(fid, CHUNK_SIZE + 10).unwrap();
        assert_eq!(r.alloc_offset, Some(CHUNK_SIZE));
        assert!(r.removed.is_empty());
    }

    #[test]
    fn test_leaf_batch_iteration() {
        let t = tree();
        for i in 0..10 {
            t.create(ROOT_FID, &format!("f{i}"), 3).unwrap();
        }
        let mut seen = 0;
        let mut resume = None;
        loop {
            let (batch, last) = t.leaf_batch(resume.as_ref(), 4);
            if batch.is_empty() {
                break;
            }
            seen += batch.len();
            resume = last;
        }
        assert_eq!(seen, t.len());
    }

    #[test]
    fn test_invariant_chunk_count_matches_rows() {
        let t = tree();
        let fid = t.create(ROOT_FID, "a", 3).unwrap();
        for i in 0..5 {
            t.assign_chunk_id(fid, i * CHUNK_SIZE, 100 + i, 1).unwrap();
        }
        let rows = t.get_alloc_all(fid).unwrap();
        assert_eq!(rows.len() as i64, t.getattr(fid).unwrap().chunk_count);
    }
}
