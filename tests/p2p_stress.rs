//! Peer-overlay bombardment: every pair of peers exchanges
//! hash-acknowledged random payloads of increasing size, then a bombard
//! phase of large random payloads. Any corrupted delivery fails the test.

mod common;

use {
    meshwire::{ConnMode, ConnRef, MsgPayload, NetAddr, Opcode, PeerNetConfig, PeerNetwork},
    rand::{Rng, RngCore},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
};

const NPEERS: usize = 3;
/// Payload sizes climb 1, 2, … up to this, one message per ack.
const INCREASING_MAX: i64 = 512;
/// Bombard-phase payloads are random sizes below this.
const BOMBARD_MAX: usize = 2048;
/// Bombard-phase messages per stream before it counts as done.
const BOMBARD_COUNT: i64 = 100;

#[derive(Debug, Serialize, Deserialize)]
struct MsgRand {
    bytes: Vec<u8>,
}

impl MsgPayload for MsgRand {
    const OPCODE: Opcode = 0x00;
}

#[derive(Debug, Serialize, Deserialize)]
struct MsgAck {
    hash: [u8; 32],
}

impl MsgPayload for MsgAck {
    const OPCODE: Opcode = 0x01;
}

fn hash_of(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[derive(Default)]
struct TestCtx {
    /// Next payload size during the increasing phase; -1 once bombarding.
    state: i64,
    /// Hash of the last payload sent, to check against the ack.
    hash: [u8; 32],
    bombards_left: i64,
}

struct Node {
    net: Arc<PeerNetwork>,
    tc: Mutex<HashMap<NetAddr, TestCtx>>,
    acks: AtomicUsize,
    done: AtomicUsize,
    corrupted: AtomicBool,
}

fn send_rand(node: &Arc<Node>, size: usize, conn: &ConnRef) {
    let mut bytes = vec![0u8; size.max(1)];
    rand::thread_rng().fill_bytes(&mut bytes);
    node.tc
        .lock()
        .unwrap()
        .entry(conn.addr())
        .or_default()
        .hash = hash_of(&bytes);
    let _ = node.net.send_msg_conn(&MsgRand { bytes }, conn);
}

fn install_proto(node: &Arc<Node>) {
    // Each node starts a stream on every connection it originated.
    {
        let node = node.clone();
        node.net.clone().reg_conn_handler(move |conn: &ConnRef, connected| {
            if connected && conn.mode() == ConnMode::Active {
                node.tc.lock().unwrap().insert(
                    conn.addr(),
                    TestCtx {
                        state: 1,
                        ..Default::default()
                    },
                );
                send_rand(&node, 1, conn);
            }
        });
    }
    // Receivers ack every random payload with its hash.
    {
        let node = node.clone();
        node.net.clone().reg_handler(move |m: MsgRand, conn: &ConnRef| {
            let _ = node.net.send_msg_conn(
                &MsgAck {
                    hash: hash_of(&m.bytes),
                },
                conn,
            );
        });
    }
    // Senders verify each ack and advance the stream.
    {
        let node = node.clone();
        node.net.clone().reg_handler(move |m: MsgAck, conn: &ConnRef| {
            node.acks.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut tc = node.tc.lock().unwrap();
                let ctx = tc.entry(conn.addr()).or_default();
                if m.hash != ctx.hash {
                    node.corrupted.store(true, Ordering::SeqCst);
                    None
                } else if ctx.state == INCREASING_MAX {
                    ctx.state = -1;
                    ctx.bombards_left = BOMBARD_COUNT;
                    Some(rand::thread_rng().gen_range(1..BOMBARD_MAX))
                } else if ctx.state == -1 {
                    ctx.bombards_left -= 1;
                    if ctx.bombards_left <= 0 {
                        node.done.fetch_add(1, Ordering::SeqCst);
                        None
                    } else {
                        Some(rand::thread_rng().gen_range(1..BOMBARD_MAX))
                    }
                } else {
                    ctx.state += 1;
                    Some(ctx.state as usize)
                }
            };
            if let Some(size) = next {
                send_rand(&node, size, conn);
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_p2p_bombardment() {
    common::init_logging();

    let mut nodes = Vec::new();
    for _ in 0..NPEERS {
        let mut cfg = PeerNetConfig::dev_default();
        // Keep keepalive out of the way of the bombardment.
        cfg.ping_period = Duration::from_secs(2);
        cfg.conn_timeout = Duration::from_secs(10);
        let node = Arc::new(Node {
            net: Arc::new(PeerNetwork::new(cfg).unwrap()),
            tc: Mutex::new(HashMap::new()),
            acks: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            corrupted: AtomicBool::new(false),
        });
        install_proto(&node);
        node.net.start();
        nodes.push(node);
    }

    let mut addrs = Vec::new();
    for node in &nodes {
        addrs.push(
            node.net
                .listen("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
    }
    for (i, node) in nodes.iter().enumerate() {
        for (j, addr) in addrs.iter().enumerate() {
            if i != j {
                node.net.add_peer(*addr).unwrap();
            }
        }
    }

    // One stream per surviving pair connection must run to completion.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
    loop {
        assert!(
            !nodes.iter().any(|n| n.corrupted.load(Ordering::SeqCst)),
            "corrupted I/O"
        );
        let done: usize = nodes.iter().map(|n| n.done.load(Ordering::SeqCst)).sum();
        if done >= NPEERS {
            break;
        }
        let total: usize = nodes.iter().map(|n| n.acks.load(Ordering::SeqCst)).sum();
        assert!(
            tokio::time::Instant::now() < deadline,
            "stress stalled: {} streams done, {} acks",
            done,
            total
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let total: usize = nodes.iter().map(|n| n.acks.load(Ordering::SeqCst)).sum();
    assert!(total >= (INCREASING_MAX + BOMBARD_COUNT) as usize);

    for node in &nodes {
        node.net.stop();
    }
}
