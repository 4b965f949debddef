//! Line-oriented wire protocol codec
//!
//! Requests arrive as an opcode line, `Header: value` pairs, and a blank
//! line; an optional body follows when `Content-length` says so. Responses
//! mirror the shape: `OK`, `Cseq`, `Status`, opcode-specific headers, blank
//! line, optional body. The same framing carries meta-to-chunkserver RPCs.

use crate::layout::ChunkRpc;
use crate::lease::LeaseKind;
use crate::request::{AllocateState, Body, HelloInfo, MetaRequest};
use kfs_common::{
    ChunkId, MetaError, Properties, Result, Seq, ServerLocation, ROOT_FID, VERSION,
};

/// A request parsed off the wire. `content_length` is nonzero when a body
/// (e.g. the HELLO chunk list) follows the header block.
#[derive(Clone, Debug)]
pub struct ParsedRequest {
    pub seq: Seq,
    pub body: Body,
    pub content_length: usize,
}

/// Parse one request header block (everything up to the blank line).
pub fn parse_request(text: &str) -> Result<ParsedRequest> {
    let mut lines = text.lines();
    let first = lines
        .next()
        .ok_or_else(|| MetaError::bad_request("empty request"))?;
    let opcode = first
        .split_whitespace()
        .next()
        .ok_or_else(|| MetaError::bad_request("missing opcode"))?;
    let rest: String = lines.collect::<Vec<_>>().join("\n");
    let prop = Properties::load(&rest);
    let seq = prop.get_i64("Cseq", -1);

    let body = match opcode {
        "LOOKUP" => Body::Lookup {
            dir: required_fid(&prop, "Parent File-handle")?,
            name: required_str(&prop, "Filename")?,
            result: None,
        },
        "LOOKUP_PATH" => Body::LookupPath {
            root: required_fid(&prop, "Root File-handle")?,
            path: required_str(&prop, "Pathname")?,
            result: None,
        },
        "CREATE" => {
            let num_replicas = prop.get_i64("Num-replicas", 1);
            if num_replicas <= 0 {
                return Err(MetaError::bad_request("bad Num-replicas"));
            }
            Body::Create {
                dir: required_fid(&prop, "Parent File-handle")?,
                name: required_str(&prop, "Filename")?,
                num_replicas: num_replicas.min(i64::from(u8::MAX)) as u8,
                fid: 0,
            }
        }
        "MKDIR" => Body::Mkdir {
            dir: required_fid(&prop, "Parent File-handle")?,
            name: required_str(&prop, "Directory")?,
            fid: 0,
        },
        "REMOVE" => Body::Remove {
            dir: required_fid(&prop, "Parent File-handle")?,
            name: required_str(&prop, "Filename")?,
        },
        "RMDIR" => Body::Rmdir {
            dir: required_fid(&prop, "Parent File-handle")?,
            name: required_str(&prop, "Directory")?,
        },
        "READDIR" => Body::Readdir {
            dir: required_fid(&prop, "Directory File-handle")?,
            entries: Vec::new(),
        },
        "GETALLOC" => Body::Getalloc {
            fid: required_fid(&prop, "File-handle")?,
            offset: required_i64(&prop, "Chunk-offset")?,
            chunk_id: 0,
            chunk_version: 0,
            locations: Vec::new(),
        },
        "GETLAYOUT" => Body::Getlayout {
            fid: required_fid(&prop, "File-handle")?,
            chunks: Vec::new(),
        },
        "ALLOCATE" => Body::Allocate(AllocateState::new(
            required_fid(&prop, "File-handle")?,
            required_i64(&prop, "Chunk-offset")?,
        )),
        "TRUNCATE" => Body::Truncate {
            fid: required_fid(&prop, "File-handle")?,
            offset: required_i64(&prop, "Offset")?,
            wait_alloc: false,
        },
        "RENAME" => Body::Rename {
            dir: required_fid(&prop, "Parent File-handle")?,
            old: required_str(&prop, "Old-name")?,
            new_path: required_str(&prop, "New-path")?,
            overwrite: prop.get_i64("Overwrite", 0) == 1,
        },
        "LEASE_ACQUIRE" => Body::LeaseAcquire {
            chunk_id: required_i64(&prop, "Chunk-handle")?,
            lease_id: -1,
        },
        "LEASE_RENEW" => Body::LeaseRenew {
            chunk_id: required_i64(&prop, "Chunk-handle")?,
            lease_id: required_i64(&prop, "Lease-id")?,
            kind: LeaseKind::parse(prop.get_str("Lease-type").unwrap_or("READ_LEASE")),
        },
        "HELLO" => {
            let loc = ServerLocation::new(
                prop.get_str("Chunk-server-name").unwrap_or("").to_string(),
                prop.get_u16("Chunk-server-port", 0),
            );
            if !loc.is_valid() {
                return Err(MetaError::bad_request("bad chunkserver location"));
            }
            Body::Hello(HelloInfo {
                loc,
                total_space: prop.get_i64("Total-space", 0),
                used_space: prop.get_i64("Used-space", 0),
                num_chunks: prop.get_i64("Num-chunks", 0),
                rack: prop.get_str("Rack-id").map(str::to_string),
                chunk_ids: Vec::new(),
            })
        }
        "PING" => Body::Ping {
            servers: String::new(),
        },
        "STATS" => Body::Stats {
            stats: String::new(),
        },
        other => {
            return Err(MetaError::bad_request(format!("unknown opcode {other}")));
        }
    };

    Ok(ParsedRequest {
        seq,
        content_length: prop.get_usize("Content-length", 0),
        body,
    })
}

/// Fill the chunk-id list a HELLO carries in its body.
pub fn parse_hello_body(body: &mut Body, text: &str) -> Result<()> {
    let Body::Hello(h) = body else {
        return Err(MetaError::bad_request("body on a non-HELLO request"));
    };
    for token in text.split_whitespace() {
        let id: ChunkId = token
            .parse()
            .map_err(|_| MetaError::bad_request(format!("bad chunk id {token:?}")))?;
        h.chunk_ids.push(id);
    }
    Ok(())
}

fn required_str(prop: &Properties, key: &str) -> Result<String> {
    prop.get_str(key)
        .map(str::to_string)
        .ok_or_else(|| MetaError::bad_request(format!("missing {key}")))
}

fn required_fid(prop: &Properties, key: &str) -> Result<i64> {
    required_i64(prop, key)
}

fn required_i64(prop: &Properties, key: &str) -> Result<i64> {
    let v = prop.get_i64(key, -1);
    if v < 0 {
        return Err(MetaError::bad_request(format!("missing {key}")));
    }
    Ok(v)
}

fn status_line(r: &MetaRequest, out: &mut String) {
    out.push_str("OK\r\n");
    out.push_str(&format!("Cseq: {}\r\n", r.seq));
    out.push_str(&format!("Status: {}\r\n", r.status));
}

fn push_locations(out: &mut String, locations: &[ServerLocation]) {
    out.push_str("Replicas:");
    for loc in locations {
        out.push_str(&format!(" {} {}", loc.hostname, loc.port));
    }
    out.push_str("\r\n");
}

fn fattr_headers(out: &mut String, fa: &crate::tree::Fattr) {
    out.push_str(&format!("File-handle: {}\r\n", fa.id));
    out.push_str(&format!("Type: {}\r\n", fa.file_type));
    out.push_str(&format!("Chunk-count: {}\r\n", fa.chunk_count));
    out.push_str(&format!("M-Time: {}\r\n", fa.mtime));
    out.push_str(&format!("C-Time: {}\r\n", fa.ctime));
    out.push_str(&format!("CR-Time: {}\r\n", fa.crtime));
}

/// Format the response for a retired request; `None` for internal ops that
/// answer nobody.
pub fn format_response(r: &MetaRequest) -> Option<String> {
    let mut out = String::new();
    match &r.body {
        Body::Lookup { result, .. } | Body::LookupPath { result, .. } => {
            status_line(r, &mut out);
            if r.status < 0 {
                out.push_str("\r\n");
                return Some(out);
            }
            if let Some(fa) = result {
                fattr_headers(&mut out, fa);
            }
            out.push_str("\r\n");
        }
        Body::Create { fid, .. } | Body::Mkdir { fid, .. } => {
            status_line(r, &mut out);
            if r.status < 0 {
                out.push_str("\r\n");
                return Some(out);
            }
            out.push_str(&format!("File-handle: {fid}\r\n\r\n"));
        }
        Body::Remove { .. }
        | Body::Rmdir { .. }
        | Body::Rename { .. }
        | Body::Truncate { .. }
        | Body::LeaseRenew { .. } => {
            status_line(r, &mut out);
            out.push_str("\r\n");
        }
        Body::Readdir { dir, entries } => {
            status_line(r, &mut out);
            if r.status < 0 {
                out.push_str("\r\n");
                return Some(out);
            }
            // One name per line; the root does not list its own "/".
            let mut body = String::new();
            let mut count = 0;
            for d in entries {
                if *dir == ROOT_FID && d.name == "/" {
                    continue;
                }
                body.push_str(&d.name);
                body.push('\n');
                count += 1;
            }
            out.push_str(&format!("Num-Entries: {count}\r\n"));
            out.push_str(&format!("Content-length: {}\r\n\r\n", body.len()));
            out.push_str(&body);
        }
        Body::Getalloc {
            chunk_id,
            chunk_version,
            locations,
            ..
        } => {
            status_line(r, &mut out);
            if r.status < 0 {
                out.push_str("\r\n");
                return Some(out);
            }
            out.push_str(&format!("Chunk-handle: {chunk_id}\r\n"));
            out.push_str(&format!("Chunk-version: {chunk_version}\r\n"));
            out.push_str(&format!("Num-replicas: {}\r\n", locations.len()));
            push_locations(&mut out, locations);
            out.push_str("\r\n");
        }
        Body::Getlayout { chunks, .. } => {
            status_line(r, &mut out);
            if r.status < 0 {
                out.push_str("\r\n");
                return Some(out);
            }
            let mut body = String::new();
            for c in chunks {
                body.push_str(&format!(
                    "{} {} {} {}",
                    c.offset,
                    c.chunk_id,
                    c.chunk_version,
                    c.locations.len()
                ));
                for loc in &c.locations {
                    body.push_str(&format!(" {} {}", loc.hostname, loc.port));
                }
                body.push('\n');
            }
            out.push_str(&format!("Num-chunks: {}\r\n", chunks.len()));
            out.push_str(&format!("Content-length: {}\r\n\r\n", body.len()));
            out.push_str(&body);
        }
        Body::Allocate(a) => {
            status_line(r, &mut out);
            if r.status != 0 {
                out.push_str("\r\n");
                return Some(out);
            }
            out.push_str(&format!("Chunk-handle: {}\r\n", a.chunk_id));
            out.push_str(&format!("Chunk-version: {}\r\n", a.chunk_version));
            if let Some(master) = &a.master {
                out.push_str(&format!("Master: {} {}\r\n", master.hostname, master.port));
            }
            out.push_str(&format!("Num-replicas: {}\r\n", a.servers.len()));
            push_locations(&mut out, &a.servers);
            out.push_str("\r\n");
        }
        Body::LeaseAcquire { lease_id, .. } => {
            status_line(r, &mut out);
            if r.status == 0 {
                out.push_str(&format!("Lease-id: {lease_id}\r\n"));
            }
            out.push_str("\r\n");
        }
        Body::Ping { servers } => {
            status_line(r, &mut out);
            out.push_str(&format!("Servers: {servers}\r\n\r\n"));
        }
        Body::Stats { stats } => {
            status_line(r, &mut out);
            out.push_str(stats);
            out.push_str("\r\n");
        }
        Body::Hello(_)
        | Body::Bye { .. }
        | Body::LeaseCleanup
        | Body::Checkpoint
        | Body::ReplicationCheck
        | Body::ChunkVersionInc { .. } => return None,
    }
    Some(out)
}

/// Format a meta-to-chunkserver RPC.
pub fn format_chunk_rpc(rpc: &ChunkRpc) -> String {
    let mut out = String::new();
    match rpc {
        ChunkRpc::Allocate {
            seq,
            fid,
            chunk_id,
            chunk_version,
            lease_id,
            servers,
        } => {
            out.push_str("ALLOCATE \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n"));
            out.push_str(&format!("File-handle: {fid}\r\n"));
            out.push_str(&format!("Chunk-handle: {chunk_id}\r\n"));
            out.push_str(&format!("Chunk-version: {chunk_version}\r\n"));
            if *lease_id >= 0 {
                out.push_str(&format!("Lease-id: {lease_id}\r\n"));
            }
            out.push_str(&format!("Num-servers: {}\r\n", servers.len()));
            out.push_str("Servers:");
            for loc in servers {
                out.push_str(&format!(" {} {}", loc.hostname, loc.port));
            }
            out.push_str("\r\n\r\n");
        }
        ChunkRpc::Delete { seq, chunk_id } => {
            out.push_str("DELETE \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n"));
            out.push_str(&format!("Chunk-handle: {chunk_id}\r\n\r\n"));
        }
        ChunkRpc::Truncate {
            seq,
            chunk_id,
            chunk_size,
        } => {
            out.push_str("TRUNCATE \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n"));
            out.push_str(&format!("Chunk-handle: {chunk_id}\r\n"));
            out.push_str(&format!("Chunk-size: {chunk_size}\r\n\r\n"));
        }
        ChunkRpc::Heartbeat { seq } => {
            out.push_str("HEARTBEAT \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n\r\n"));
        }
        ChunkRpc::StaleNotify { seq, chunk_ids } => {
            let mut body = String::new();
            for id in chunk_ids {
                body.push_str(&id.to_string());
                body.push(' ');
            }
            out.push_str("STALE_CHUNKS \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n"));
            out.push_str(&format!("Num-chunks: {}\r\n", chunk_ids.len()));
            out.push_str(&format!("Content-length: {}\r\n\r\n", body.len()));
            out.push_str(&body);
        }
        ChunkRpc::VersChange {
            seq,
            fid,
            chunk_id,
            chunk_version,
        } => {
            out.push_str("CHUNK_VERS_CHANGE \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n"));
            out.push_str(&format!("File-handle: {fid}\r\n"));
            out.push_str(&format!("Chunk-handle: {chunk_id}\r\n"));
            out.push_str(&format!("Chunk-version: {chunk_version}\r\n\r\n"));
        }
        ChunkRpc::Replicate {
            seq,
            fid,
            chunk_id,
            chunk_version,
            src,
        } => {
            out.push_str("REPLICATE \r\n");
            out.push_str(&format!("Cseq: {seq}\r\n"));
            out.push_str(&format!("Version: {VERSION}\r\n"));
            out.push_str(&format!("File-handle: {fid}\r\n"));
            out.push_str(&format!("Chunk-handle: {chunk_id}\r\n"));
            out.push_str(&format!("Chunk-version: {chunk_version}\r\n"));
            out.push_str(&format!("Chunk-location: {} {}\r\n\r\n", src.hostname, src.port));
        }
    }
    out
}

/// Parse a chunkserver's reply to an outbound RPC: `(Cseq, Status)`.
pub fn parse_rpc_reply(text: &str) -> Result<(Seq, i32)> {
    let mut lines = text.lines();
    let first = lines
        .next()
        .ok_or_else(|| MetaError::bad_request("empty reply"))?;
    if first.trim_end_matches('\r') != "OK" {
        return Err(MetaError::bad_request("reply does not start with OK"));
    }
    let rest: String = lines.collect::<Vec<_>>().join("\n");
    let prop = Properties::load(&rest);
    let seq = prop.get_i64("Cseq", -1);
    let status = prop.get_i64("Status", i64::from(i32::MIN)) as i32;
    Ok((seq, status))
}
