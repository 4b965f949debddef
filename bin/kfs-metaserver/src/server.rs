//! Blocking TCP transport for the metaserver core
//!
//! One thread per connection. Client connections submit parsed requests to
//! the dispatcher queue; a router thread sends each completed response back
//! over the connection that asked. A connection that says HELLO becomes a
//! chunkserver link: queued RPCs are pushed down it and its acks flow back
//! as `RpcReply` entries. Connection drop on a chunkserver link synthesises
//! BYE.
//!
//! This is deliberately a shim; the production I/O reactor is an external
//! collaborator. It exists to exercise the codec end to end.

use kfs_meta::request::{Body, MetaRequest, QueueEntry, RequestId, RpcKind, RpcReply};
use kfs_meta::{protocol, ChunkRpc, MetaCore};
use kfs_common::{ChunkId, MetaError, Result, Seq, ServerLocation, MAX_RPC_HEADER_LEN};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Routes completed responses back to the connection that submitted the
/// request.
type ResponderMap = Arc<Mutex<HashMap<RequestId, Sender<String>>>>;

/// Accept loop. Runs until the listener fails.
pub fn serve(listener: TcpListener, core: Arc<MetaCore>, out_rx: Receiver<MetaRequest>) {
    let responders: ResponderMap = Arc::new(Mutex::new(HashMap::new()));

    {
        let responders = Arc::clone(&responders);
        thread::Builder::new()
            .name("kfs-responder".to_string())
            .spawn(move || route_responses(out_rx, responders))
            .expect("spawn responder");
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let core = Arc::clone(&core);
                let responders = Arc::clone(&responders);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, core, responders) {
                        debug!("connection closed: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}

fn route_responses(out_rx: Receiver<MetaRequest>, responders: ResponderMap) {
    while let Ok(req) = out_rx.recv() {
        let Some(tx) = responders.lock().remove(&req.id) else {
            continue;
        };
        if let Some(text) = protocol::format_response(&req) {
            // A dropped client just discards its response.
            let _ = tx.send(text);
        }
    }
}

/// Read one header block (up to the blank line), bounded by the protocol's
/// header limit.
fn read_header_block(reader: &mut BufReader<TcpStream>) -> Result<Option<String>> {
    let mut block = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(if block.is_empty() { None } else { Some(block) });
        }
        if line == "\r\n" || line == "\n" {
            if block.is_empty() {
                continue;
            }
            return Ok(Some(block));
        }
        block.push_str(&line);
        if block.len() > MAX_RPC_HEADER_LEN {
            return Err(MetaError::bad_request("request header too long"));
        }
    }
}

fn handle_connection(stream: TcpStream, core: Arc<MetaCore>, responders: ResponderMap) -> Result<()> {
    let peer = stream.peer_addr().map_err(MetaError::Io)?;
    debug!(%peer, "connection accepted");
    let mut reader = BufReader::new(stream.try_clone().map_err(MetaError::Io)?);
    let mut writer = stream;
    let (tx, rx) = channel::<String>();

    loop {
        // Flush any responses routed to this connection first.
        while let Ok(text) = rx.try_recv() {
            writer.write_all(text.as_bytes()).map_err(MetaError::Io)?;
        }

        let Some(block) = read_header_block(&mut reader)? else {
            return Ok(());
        };
        let mut parsed = match protocol::parse_request(&block) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%peer, "unparseable request: {e}");
                continue;
            }
        };
        if parsed.content_length > 0 {
            let mut body = vec![0u8; parsed.content_length];
            reader.read_exact(&mut body).map_err(MetaError::Io)?;
            let body = String::from_utf8_lossy(&body).into_owned();
            protocol::parse_hello_body(&mut parsed.body, &body)?;
        }

        if let Body::Hello(h) = &parsed.body {
            // This connection now belongs to a chunkserver; register the
            // HELLO and switch roles.
            let loc = h.loc.clone();
            core.queue.submit(parsed.seq, parsed.body);
            return chunkserver_link(reader, writer, core, loc);
        }

        let id = core.queue.next_id();
        responders.lock().insert(id, tx.clone());
        core.queue
            .enqueue(QueueEntry::Req(MetaRequest::new(id, parsed.seq, parsed.body)));

        // Responses are released by the router once durable; block for the
        // next one so replies stay in order on this connection.
        match rx.recv_timeout(Duration::from_secs(30)) {
            Ok(text) => writer.write_all(text.as_bytes()).map_err(MetaError::Io)?,
            Err(_) => warn!(%peer, "response timed out"),
        }
    }
}

/// Sent RPCs awaiting a chunkserver ack, keyed by RPC Cseq.
struct SentRpc {
    waiter: Option<RequestId>,
    kind: RpcKind,
    chunk_id: ChunkId,
}

fn rpc_kind(rpc: &ChunkRpc) -> (RpcKind, ChunkId) {
    match rpc {
        ChunkRpc::Allocate { chunk_id, .. } => (RpcKind::Allocate, *chunk_id),
        ChunkRpc::Delete { chunk_id, .. } => (RpcKind::Delete, *chunk_id),
        ChunkRpc::Truncate { chunk_id, .. } => (RpcKind::Truncate, *chunk_id),
        ChunkRpc::Heartbeat { .. } => (RpcKind::Heartbeat, 0),
        ChunkRpc::StaleNotify { .. } => (RpcKind::StaleNotify, 0),
        ChunkRpc::VersChange { chunk_id, .. } => (RpcKind::VersChange, *chunk_id),
        ChunkRpc::Replicate { chunk_id, .. } => (RpcKind::Replicate, *chunk_id),
    }
}

/// Pump queued RPCs to a chunkserver and feed its acks back into the
/// dispatcher queue. Ends (with BYE) when the connection drops.
fn chunkserver_link(
    mut reader: BufReader<TcpStream>,
    mut writer: TcpStream,
    core: Arc<MetaCore>,
    loc: ServerLocation,
) -> Result<()> {
    info!(server = %loc, "chunkserver link up");
    let _ = reader
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(100)));
    let mut sent: HashMap<Seq, SentRpc> = HashMap::new();

    loop {
        for pending in core.layout.drain_pending(&loc) {
            let (kind, chunk_id) = rpc_kind(&pending.rpc);
            sent.insert(
                pending.rpc.seq(),
                SentRpc {
                    waiter: pending.waiter,
                    kind,
                    chunk_id,
                },
            );
            let text = protocol::format_chunk_rpc(&pending.rpc);
            if writer.write_all(text.as_bytes()).is_err() {
                link_down(&core, &loc, sent);
                return Ok(());
            }
        }

        match read_header_block(&mut reader) {
            Ok(Some(block)) => {
                let Ok((seq, status)) = protocol::parse_rpc_reply(&block) else {
                    warn!(server = %loc, "unparseable chunkserver reply");
                    continue;
                };
                let Some(sent_rpc) = sent.remove(&seq) else {
                    continue;
                };
                if sent_rpc.kind == RpcKind::Heartbeat && status == 0 {
                    // Heartbeat acks refresh the server's space figures.
                    let prop = kfs_common::Properties::load(&block);
                    let total = prop.get_i64("Total-space", -1);
                    let used = prop.get_i64("Used-space", -1);
                    if total >= 0 && used >= 0 {
                        core.layout.heartbeat(&loc, total, used);
                    }
                }
                core.queue.enqueue(QueueEntry::RpcReply(RpcReply {
                    waiter: sent_rpc.waiter,
                    kind: sent_rpc.kind,
                    chunk_id: sent_rpc.chunk_id,
                    server: loc.clone(),
                    status,
                }));
            }
            Ok(None) => {
                // EOF: the chunkserver went away.
                link_down(&core, &loc, sent);
                return Ok(());
            }
            Err(MetaError::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => {
                link_down(&core, &loc, sent);
                return Ok(());
            }
        }
    }
}

/// The link died: sent-but-unacked RPCs fail as SERVER_BUSY for their
/// suspended waiters, then the registry learns the server is gone.
fn link_down(core: &Arc<MetaCore>, loc: &ServerLocation, sent: HashMap<Seq, SentRpc>) {
    for (_, rpc) in sent {
        core.queue.enqueue(QueueEntry::RpcReply(RpcReply {
            waiter: rpc.waiter,
            kind: rpc.kind,
            chunk_id: rpc.chunk_id,
            server: loc.clone(),
            status: kfs_common::ESERVERBUSY,
        }));
    }
    core.queue.submit(0, Body::Bye { loc: loc.clone() });
}
