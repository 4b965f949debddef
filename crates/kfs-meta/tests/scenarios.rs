//! End-to-end scenarios against a running core with a fake chunkserver
//! transport: queued RPCs are drained straight off the layout manager and
//! acked by injecting replies into the dispatcher queue.

use kfs_common::config::{MetaConfig, TimerConfig};
use kfs_common::{ChunkId, ServerLocation, CHUNK_SIZE, ELEASEEXPIRED, ROOT_FID};
use kfs_meta::request::{Body, MetaRequest, QueueEntry, RequestId, RpcKind, RpcReply};
use kfs_meta::{AllocateState, ChunkRpc, MetaCore, PendingRpc};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tempfile::tempdir;

fn test_config(dir: &Path) -> MetaConfig {
    MetaConfig {
        log_dir: dir.join("log"),
        cp_dir: dir.join("cp"),
        timers: TimerConfig {
            // Tests drive maintenance explicitly.
            cp_max_secs: 0,
            lease_cleanup_secs: 0,
            replication_check_secs: 0,
        },
        ..Default::default()
    }
}

fn recv_for(rx: &Receiver<MetaRequest>, id: RequestId) -> MetaRequest {
    loop {
        let r = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("timed out waiting for response");
        if r.id == id {
            return r;
        }
    }
}

fn hello(core: &MetaCore, host: &str, used: i64, chunks: Vec<ChunkId>) {
    core.queue.submit(
        0,
        Body::Hello(kfs_meta::request::HelloInfo {
            loc: ServerLocation::new(host, 20000),
            total_space: 1_000_000,
            used_space: used,
            num_chunks: chunks.len() as i64,
            rack: None,
            chunk_ids: chunks,
        }),
    );
}

/// Wait until an RPC matching the predicate shows up on some server's
/// queue; fire-and-forget RPCs drained along the way are discarded, as a
/// real transport would send them.
fn await_rpc(
    core: &MetaCore,
    mut pred: impl FnMut(&ServerLocation, &PendingRpc) -> bool,
) -> (ServerLocation, PendingRpc) {
    for _ in 0..500 {
        for (loc, pending) in core.layout.drain_all_pending() {
            if pred(&loc, &pending) {
                return (loc, pending);
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("expected chunkserver RPC never queued");
}

fn ack(core: &MetaCore, loc: &ServerLocation, pending: &PendingRpc, status: i32) {
    let (kind, chunk_id) = match &pending.rpc {
        ChunkRpc::Allocate { chunk_id, .. } => (RpcKind::Allocate, *chunk_id),
        ChunkRpc::Delete { chunk_id, .. } => (RpcKind::Delete, *chunk_id),
        ChunkRpc::Truncate { chunk_id, .. } => (RpcKind::Truncate, *chunk_id),
        ChunkRpc::Heartbeat { .. } => (RpcKind::Heartbeat, 0),
        ChunkRpc::StaleNotify { .. } => (RpcKind::StaleNotify, 0),
        ChunkRpc::VersChange { chunk_id, .. } => (RpcKind::VersChange, *chunk_id),
        ChunkRpc::Replicate { chunk_id, .. } => (RpcKind::Replicate, *chunk_id),
    };
    core.queue.enqueue(QueueEntry::RpcReply(RpcReply {
        waiter: pending.waiter,
        kind,
        chunk_id,
        server: loc.clone(),
        status,
    }));
}

#[test]
fn test_client_scenarios() {
    let dir = tempdir().unwrap();
    let (core, rx) = MetaCore::start(&test_config(dir.path())).unwrap();

    // Scenario 1: bootstrap, create, lookup.
    let id = core.queue.submit(
        1,
        Body::Create {
            dir: ROOT_FID,
            name: "a".into(),
            num_replicas: 3,
            fid: 0,
        },
    );
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    let f1 = match r.body {
        Body::Create { fid, .. } => fid,
        _ => unreachable!(),
    };
    assert!(f1 > ROOT_FID);

    let id = core.queue.submit(
        2,
        Body::Lookup {
            dir: ROOT_FID,
            name: "a".into(),
            result: None,
        },
    );
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    match r.body {
        Body::Lookup { result: Some(fa), .. } => {
            assert_eq!(fa.id, f1);
            assert_eq!(fa.file_type, kfs_common::FileType::File);
            assert_eq!(fa.chunk_count, 0);
        }
        _ => panic!("lookup carried no attribute"),
    }

    // Scenario 2: allocation against three chunkservers.
    hello(&core, "srvA", 0, vec![]);
    hello(&core, "srvB", 0, vec![]);
    hello(&core, "srvC", 0, vec![]);

    let alloc_id = core
        .queue
        .submit(3, Body::Allocate(AllocateState::new(f1, 0)));
    let (primary, pending) =
        await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::Allocate { .. }));
    assert_eq!(pending.waiter, Some(alloc_id));
    ack(&core, &primary, &pending, 0);

    let r = recv_for(&rx, alloc_id);
    assert_eq!(r.status, 0);
    let (c1, v1, servers) = match &r.body {
        Body::Allocate(a) => (a.chunk_id, a.chunk_version, a.servers.clone()),
        _ => unreachable!(),
    };
    assert_eq!(v1, 1);
    assert_eq!(servers.len(), 3);
    match &r.body {
        Body::Allocate(a) => assert_eq!(a.master.as_ref(), servers.first()),
        _ => unreachable!(),
    }

    // A second allocate with no intervening write activity re-reports the
    // same chunk and version off the live write lease.
    let id = core
        .queue
        .submit(4, Body::Allocate(AllocateState::new(f1, 0)));
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    match &r.body {
        Body::Allocate(a) => {
            assert_eq!(a.chunk_id, c1);
            assert_eq!(a.chunk_version, v1);
        }
        _ => unreachable!(),
    }

    // Scenario 3: replica loss repairs through the replication checker.
    hello(&core, "srvD", 0, vec![]);
    let lost = servers[1].clone();
    core.queue.submit(5, Body::Bye { loc: lost.clone() });
    let (dst, pending) = await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::Replicate { .. }));
    match &pending.rpc {
        ChunkRpc::Replicate { chunk_id, src, .. } => {
            assert_eq!(*chunk_id, c1);
            assert_ne!(*src, lost);
        }
        _ => unreachable!(),
    }
    ack(&core, &dst, &pending, 0);

    let id = core.queue.submit(
        6,
        Body::Getalloc {
            fid: f1,
            offset: 0,
            chunk_id: 0,
            chunk_version: 0,
            locations: Vec::new(),
        },
    );
    // The Replicate ack races the Getalloc; poll until the repaired set
    // shows up.
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    let mut locs = core.layout.get_servers(c1);
    for _ in 0..500 {
        if locs.len() == 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
        locs = core.layout.get_servers(c1);
    }
    locs.sort();
    let mut expected = vec![servers[0].clone(), servers[2].clone(), dst.clone()];
    expected.sort();
    expected.dedup();
    assert_eq!(locs, expected);
    assert!(!locs.contains(&lost));

    // Scenario 4: directories and rename.
    let id = core.queue.submit(
        7,
        Body::Mkdir {
            dir: ROOT_FID,
            name: "d".into(),
            fid: 0,
        },
    );
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    let d = match r.body {
        Body::Mkdir { fid, .. } => fid,
        _ => unreachable!(),
    };

    let id = core.queue.submit(
        8,
        Body::Create {
            dir: d,
            name: "x".into(),
            num_replicas: 3,
            fid: 0,
        },
    );
    assert_eq!(recv_for(&rx, id).status, 0);

    let id = core.queue.submit(
        9,
        Body::Rename {
            dir: ROOT_FID,
            old: "d".into(),
            new_path: "/e".into(),
            overwrite: false,
        },
    );
    assert_eq!(recv_for(&rx, id).status, 0);

    let id = core.queue.submit(
        10,
        Body::Readdir {
            dir: ROOT_FID,
            entries: Vec::new(),
        },
    );
    let r = recv_for(&rx, id);
    let mut names: Vec<String> = match r.body {
        Body::Readdir { entries, .. } => entries
            .into_iter()
            .map(|e| e.name)
            .filter(|n| n != "/")
            .collect(),
        _ => unreachable!(),
    };
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "e".to_string()]);

    let id = core.queue.submit(
        11,
        Body::Readdir {
            dir: d,
            entries: Vec::new(),
        },
    );
    let r = recv_for(&rx, id);
    let names: Vec<String> = match r.body {
        Body::Readdir { entries, .. } => entries.into_iter().map(|e| e.name).collect(),
        _ => unreachable!(),
    };
    assert_eq!(names, vec!["x".to_string()]);

    // Scenario 5: lease acquire, then renew with a bad lease id (the
    // expiry path itself is covered with a synthetic clock in the clerk's
    // tests).
    let id = core.queue.submit(
        12,
        Body::LeaseAcquire {
            chunk_id: c1,
            lease_id: -1,
        },
    );
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    let lease = match r.body {
        Body::LeaseAcquire { lease_id, .. } => lease_id,
        _ => unreachable!(),
    };
    assert!(lease > 0);

    let id = core.queue.submit(
        13,
        Body::LeaseRenew {
            chunk_id: c1,
            lease_id: lease + 1000,
            kind: kfs_meta::LeaseKind::Read,
        },
    );
    assert_eq!(recv_for(&rx, id).status, ELEASEEXPIRED);

    // Scenario 6: truncate past EOF synthesises the allocation.
    let trunc_id = core.queue.submit(
        14,
        Body::Truncate {
            fid: f1,
            offset: CHUNK_SIZE + 10,
            wait_alloc: false,
        },
    );
    let (primary, pending) =
        await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::Allocate { .. }));
    match &pending.rpc {
        ChunkRpc::Allocate { chunk_id, .. } => assert_ne!(*chunk_id, c1),
        _ => unreachable!(),
    }
    ack(&core, &primary, &pending, 0);
    let r = recv_for(&rx, trunc_id);
    assert_eq!(r.status, 0);

    let id = core.queue.submit(
        15,
        Body::Getlayout {
            fid: f1,
            chunks: Vec::new(),
        },
    );
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    match r.body {
        Body::Getlayout { chunks, .. } => {
            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[0].offset, 0);
            assert_eq!(chunks[1].offset, CHUNK_SIZE);
        }
        _ => unreachable!(),
    }

    core.shutdown();
}

#[test]
fn test_failed_allocation_bumps_version_inc() {
    let dir = tempdir().unwrap();
    let (core, rx) = MetaCore::start(&test_config(dir.path())).unwrap();
    hello(&core, "srvA", 0, vec![]);

    let id = core.queue.submit(
        1,
        Body::Create {
            dir: ROOT_FID,
            name: "f".into(),
            num_replicas: 1,
            fid: 0,
        },
    );
    let fid = match recv_for(&rx, id).body {
        Body::Create { fid, .. } => fid,
        _ => unreachable!(),
    };

    let inc_before = core.vers_inc.get();
    let alloc_id = core
        .queue
        .submit(2, Body::Allocate(AllocateState::new(fid, 0)));
    let (primary, pending) =
        await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::Allocate { .. }));
    // The primary fails the allocation.
    ack(&core, &primary, &pending, -1);

    let r = recv_for(&rx, alloc_id);
    assert_eq!(r.status, kfs_common::EALLOCFAILED);
    assert_eq!(core.vers_inc.get(), inc_before + 1);
    // Nothing was bound in the tree.
    assert!(core.tree.get_alloc(fid, 0).is_err());

    core.shutdown();
}

#[test]
fn test_restart_replays_log() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let f1;
    {
        let (core, rx) = MetaCore::start(&config).unwrap();
        let id = core.queue.submit(
            1,
            Body::Create {
                dir: ROOT_FID,
                name: "durable".into(),
                num_replicas: 2,
                fid: 0,
            },
        );
        let r = recv_for(&rx, id);
        assert_eq!(r.status, 0);
        f1 = match r.body {
            Body::Create { fid, .. } => fid,
            _ => unreachable!(),
        };
        let id = core.queue.submit(
            2,
            Body::Mkdir {
                dir: ROOT_FID,
                name: "dir".into(),
                fid: 0,
            },
        );
        assert_eq!(recv_for(&rx, id).status, 0);
        core.shutdown();
    }

    let (core, rx) = MetaCore::start(&config).unwrap();
    assert_eq!(core.tree.lookup(ROOT_FID, "durable").unwrap().id, f1);
    assert!(core.tree.lookup(ROOT_FID, "dir").is_ok());
    // Fid allocation continues past what was recovered.
    let id = core.queue.submit(
        3,
        Body::Create {
            dir: ROOT_FID,
            name: "later".into(),
            num_replicas: 1,
            fid: 0,
        },
    );
    let r = recv_for(&rx, id);
    assert_eq!(r.status, 0);
    match r.body {
        Body::Create { fid, .. } => assert!(fid > f1),
        _ => unreachable!(),
    }
    core.shutdown();
}

#[test]
fn test_remove_queues_chunk_deletes() {
    let dir = tempdir().unwrap();
    let (core, rx) = MetaCore::start(&test_config(dir.path())).unwrap();
    hello(&core, "srvA", 0, vec![]);

    let id = core.queue.submit(
        1,
        Body::Create {
            dir: ROOT_FID,
            name: "f".into(),
            num_replicas: 1,
            fid: 0,
        },
    );
    let fid = match recv_for(&rx, id).body {
        Body::Create { fid, .. } => fid,
        _ => unreachable!(),
    };

    let alloc_id = core
        .queue
        .submit(2, Body::Allocate(AllocateState::new(fid, 0)));
    let (primary, pending) =
        await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::Allocate { .. }));
    ack(&core, &primary, &pending, 0);
    let chunk_id = match recv_for(&rx, alloc_id).body {
        Body::Allocate(a) => a.chunk_id,
        _ => unreachable!(),
    };

    let id = core.queue.submit(
        3,
        Body::Remove {
            dir: ROOT_FID,
            name: "f".into(),
        },
    );
    assert_eq!(recv_for(&rx, id).status, 0);

    // The holder gets a DELETE, the chunk sits in the dumpster, and the
    // mapping is gone.
    let (_, pending) = await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::Delete { .. }));
    match pending.rpc {
        ChunkRpc::Delete { chunk_id: cid, .. } => assert_eq!(cid, chunk_id),
        _ => unreachable!(),
    }
    assert_eq!(core.tree.dumpster_len(), 1);
    assert!(core.layout.get_servers(chunk_id).is_empty());

    // A lease-cleanup tick purges the dumpster outside a checkpoint.
    let mut seq = 4;
    for _ in 0..100 {
        let id = core.queue.submit(seq, Body::LeaseCleanup);
        recv_for(&rx, id);
        seq += 1;
        if core.tree.dumpster_len() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(core.tree.dumpster_len(), 0);

    core.shutdown();
}

#[test]
fn test_stale_chunks_notified_on_hello() {
    let dir = tempdir().unwrap();
    let (core, _rx) = MetaCore::start(&test_config(dir.path())).unwrap();

    // The server reports a chunk the tree has never heard of.
    hello(&core, "srvA", 0, vec![4242]);
    let (loc, pending) =
        await_rpc(&core, |_, p| matches!(p.rpc, ChunkRpc::StaleNotify { .. }));
    assert_eq!(loc, ServerLocation::new("srvA", 20000));
    match &pending.rpc {
        ChunkRpc::StaleNotify { chunk_ids, .. } => assert_eq!(chunk_ids, &vec![4242]),
        _ => unreachable!(),
    }
    core.shutdown();
}
