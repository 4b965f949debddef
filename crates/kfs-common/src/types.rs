//! Core type definitions for KFS
//!
//! Identifier aliases, protocol constants, and the chunkserver address
//! type shared by the metaserver core and its collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request sequence number used for logging.
pub type Seq = i64;

/// File identifier.
pub type Fid = i64;

/// Chunk identifier, globally unique within a cluster.
pub type ChunkId = i64;

/// Byte offset of a chunk within a file; always a multiple of [`CHUNK_SIZE`].
pub type ChunkOff = i64;

/// The fid of the root directory, bootstrapped at init.
pub const ROOT_FID: Fid = 2;

/// Size of a chunk: 64 MiB, the unit of replication and placement.
pub const CHUNK_SIZE: ChunkOff = 1 << 26;

/// Maximum length of a request or response header block.
pub const MAX_RPC_HEADER_LEN: usize = 1024;

/// Default (and maximum) degree of replication per file.
pub const NUM_REPLICAS_PER_FILE: u8 = 3;

/// Default lease interval of 1 min.
pub const LEASE_INTERVAL_SECS: u64 = 60;

/// Protocol version string stamped into checkpoints, logs, and RPCs.
pub const VERSION: &str = "KFS/1.0";

// KFS-specific status codes, beyond the standard errno values.

/// Version presented by the client doesn't match what the server has.
pub const EBADVERS: i32 = 1000;
/// Lease has expired.
pub const ELEASEEXPIRED: i32 = 1001;
/// Checksum for data on a server is bad; client should read elsewhere.
pub const EBADCKSUM: i32 = 1002;
/// Data lives on chunkservers that are all unreachable.
pub const EDATAUNAVAIL: i32 = 1003;
/// Server is busy and can't take on new work.
pub const ESERVERBUSY: i32 = 1004;
/// Allocation failed; the client is expected to retry.
pub const EALLOCFAILED: i32 = 1005;

/// Whether a file attribute names a regular file or a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Dir,
}

impl FileType {
    /// Wire name used in responses and checkpoint records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }

    /// Parse the wire name back; used by recovery.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a chunkserver. Server records are held by identity; callers
/// look them up by this location.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerLocation {
    pub hostname: String,
    pub port: u16,
}

impl ServerLocation {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// A location is valid once both halves are filled in.
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size() {
        assert_eq!(CHUNK_SIZE, 64 * 1024 * 1024);
    }

    #[test]
    fn test_server_location_display() {
        let loc = ServerLocation::new("cs1.example.com", 20000);
        assert_eq!(loc.to_string(), "cs1.example.com 20000");
        assert!(loc.is_valid());
        assert!(!ServerLocation::new("", 20000).is_valid());
    }

    #[test]
    fn test_file_type_roundtrip() {
        assert_eq!(FileType::parse("file"), Some(FileType::File));
        assert_eq!(FileType::parse("dir"), Some(FileType::Dir));
        assert_eq!(FileType::parse("empty"), None);
        assert_eq!(FileType::Dir.as_str(), "dir");
    }
}
