//! Peer-overlay integration tests: handshake convergence, unknown-peer
//! handling, promotion, idempotence laws, multicast fail-fast, liveness.

mod common;

use {
    meshwire::{ConnRef, MsgPayload, NetAddr, NetError, Opcode, PeerNetConfig, PeerNetwork},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
};

#[derive(Debug, Serialize, Deserialize)]
struct Probe {
    n: u64,
}

impl MsgPayload for Probe {
    const OPCODE: Opcode = 0x01;
}

#[derive(Debug, Serialize, Deserialize)]
struct ProbeAck {
    n: u64,
}

impl MsgPayload for ProbeAck {
    const OPCODE: Opcode = 0x02;
}

fn make_net(tweak: impl FnOnce(&mut PeerNetConfig)) -> Arc<PeerNetwork> {
    let mut cfg = PeerNetConfig::dev_default();
    tweak(&mut cfg);
    Arc::new(PeerNetwork::new(cfg).unwrap())
}

/// Register a probe echo on `net`: answers `Probe` with `ProbeAck` and
/// counts both directions. Returns `(probes_received, acks_received)`.
fn reg_probe_echo(net: &Arc<PeerNetwork>) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let probes = Arc::new(AtomicUsize::new(0));
    let acks = Arc::new(AtomicUsize::new(0));
    {
        let n = net.clone();
        let probes = probes.clone();
        net.reg_handler(move |p: Probe, conn: &ConnRef| {
            probes.fetch_add(1, Ordering::SeqCst);
            let _ = n.send_msg_conn(&ProbeAck { n: p.n }, conn);
        });
    }
    {
        let acks = acks.clone();
        net.reg_handler(move |_: ProbeAck, _conn: &ConnRef| {
            acks.fetch_add(1, Ordering::SeqCst);
        });
    }
    (probes, acks)
}

/// Track live connections seen by the conn handler.
fn track_live(net: &PeerNetwork) -> Arc<Mutex<HashSet<usize>>> {
    let live = Arc::new(Mutex::new(HashSet::new()));
    let l = live.clone();
    net.reg_conn_handler(move |conn: &ConnRef, up| {
        let key = Arc::as_ptr(conn) as usize;
        let mut s = l.lock().unwrap();
        if up {
            s.insert(key);
        } else {
            s.remove(&key);
        }
    });
    live
}

async fn listen_any(net: &PeerNetwork) -> NetAddr {
    net.listen("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

/// Keep probing `peer` until an ack lands.
async fn wait_roundtrip(net: &Arc<PeerNetwork>, peer: NetAddr, acks: &Arc<AtomicUsize>, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let base = acks.load(Ordering::SeqCst);
    loop {
        let _ = net.send_msg(&Probe { n: 0 }, &peer);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if acks.load(Ordering::SeqCst) > base {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for roundtrip: {}",
            what
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simultaneous_connect_converges() {
    common::init_logging();
    let n1 = make_net(|_| {});
    let n2 = make_net(|_| {});
    let (_, acks1) = reg_probe_echo(&n1);
    let (_, acks2) = reg_probe_echo(&n2);
    let live1 = track_live(&n1);
    let live2 = track_live(&n2);
    n1.start();
    n2.start();
    let a1 = listen_any(&n1).await;
    let a2 = listen_any(&n2).await;

    // Both sides declare each other at the same time.
    n1.add_peer(a2).unwrap();
    n2.add_peer(a1).unwrap();

    assert!(n1.has_peer(a2).await.unwrap());
    assert!(n2.has_peer(a1).await.unwrap());

    wait_roundtrip(&n1, a2, &acks1, "n1 -> n2").await;
    wait_roundtrip(&n2, a1, &acks2, "n2 -> n1").await;

    // The duplicate connection is reconciled away on both sides.
    common::wait_for("single live connection", Duration::from_secs(5), || {
        live1.lock().unwrap().len() == 1 && live2.lock().unwrap().len() == 1
    })
    .await;

    assert!(n1.get_peer_conn(a2).await.unwrap().peer_id().is_some());
    assert!(n2.get_peer_conn(a1).await.unwrap().peer_id().is_some());

    n1.stop();
    n2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_peer_rejected() {
    common::init_logging();
    let n1 = make_net(|_| {});
    let n2 = make_net(|_| {});
    let unknowns = Arc::new(Mutex::new(Vec::<NetAddr>::new()));
    {
        let u = unknowns.clone();
        n1.reg_unknown_peer_handler(move |id| {
            u.lock().unwrap().push(id);
        });
    }
    n1.start();
    n2.start();
    let a1 = listen_any(&n1).await;
    let a2 = listen_any(&n2).await;

    // n2 declares n1, but n1 never declared n2.
    n2.add_peer(a1).unwrap();

    common::wait_for("unknown-peer callback", Duration::from_secs(5), || {
        unknowns.lock().unwrap().first() == Some(&a2)
    })
    .await;
    assert!(!n1.has_peer(a2).await.unwrap());

    // n1 terminated the connection; n2 retries and trips the callback
    // again after a randomized delay.
    common::wait_for("retry visible", Duration::from_secs(5), || {
        unknowns.lock().unwrap().len() >= 2
    })
    .await;
    assert!(n2.has_peer(a1).await.unwrap());

    n1.stop();
    n2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allow_unknown_peer_promotion_keeps_conn() {
    common::init_logging();
    let n1 = make_net(|cfg| cfg.allow_unknown_peer = true);
    let n2 = make_net(|_| {});
    let (_, acks1) = reg_probe_echo(&n1);
    let (_, acks2) = reg_probe_echo(&n2);
    let unknowns = Arc::new(Mutex::new(Vec::<NetAddr>::new()));
    {
        let u = unknowns.clone();
        n1.reg_unknown_peer_handler(move |id| {
            u.lock().unwrap().push(id);
        });
    }
    n1.start();
    n2.start();
    let a1 = listen_any(&n1).await;
    let a2 = listen_any(&n2).await;

    n2.add_peer(a1).unwrap();

    common::wait_for("unknown-peer callback", Duration::from_secs(5), || {
        unknowns.lock().unwrap().first() == Some(&a2)
    })
    .await;

    // A provisional entry holds the connection even before promotion.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let provisional = loop {
        if let Ok(conn) = n1.get_peer_conn(a2).await {
            break conn;
        }
        assert!(tokio::time::Instant::now() < deadline, "no provisional conn");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert!(!n1.has_peer(a2).await.unwrap());

    // Promotion retains the connection.
    n1.add_peer(a2).unwrap();
    wait_has_peer(&n1, a2, true).await;
    let promoted = n1.get_peer_conn(a2).await.unwrap();
    assert!(Arc::ptr_eq(&provisional, &promoted));

    wait_roundtrip(&n1, a2, &acks1, "n1 -> n2 after promotion").await;
    wait_roundtrip(&n2, a1, &acks2, "n2 -> n1 after promotion").await;

    n1.stop();
    n2.stop();
}

/// Poll `has_peer` until it reports `want`.
async fn wait_has_peer(net: &PeerNetwork, addr: NetAddr, want: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if net.has_peer(addr).await.unwrap() == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for has_peer({}) == {}",
            addr,
            want
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_del_idempotence_laws() {
    common::init_logging();
    let n = make_net(|_| {});
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let e = errors.clone();
        n.reg_error_handler(move |err: &NetError| {
            e.lock().unwrap().push(err.to_string());
        });
    }
    n.start();
    let other: NetAddr = "127.0.0.1:1".parse().unwrap();

    n.add_peer(other).unwrap();
    assert!(n.has_peer(other).await.unwrap());
    n.add_peer(other).unwrap();
    common::wait_for("duplicate add reported", Duration::from_secs(5), || {
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("peer already exists"))
    })
    .await;

    n.del_peer(other).unwrap();
    wait_has_peer(&n, other, false).await;

    n.del_peer(other).unwrap();
    common::wait_for("double delete reported", Duration::from_secs(5), || {
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("peer does not exist"))
    })
    .await;

    n.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multicast_fail_fast() {
    common::init_logging();
    let n1 = make_net(|_| {});
    let n2 = make_net(|_| {});
    let (_, acks1) = reg_probe_echo(&n1);
    let (probes2, _) = reg_probe_echo(&n2);
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let e = errors.clone();
        n1.reg_error_handler(move |err: &NetError| {
            e.lock().unwrap().push(err.to_string());
        });
    }
    n1.start();
    n2.start();
    let a1 = listen_any(&n1).await;
    let a2 = listen_any(&n2).await;
    n1.add_peer(a2).unwrap();
    n2.add_peer(a1).unwrap();
    wait_roundtrip(&n1, a2, &acks1, "initial link").await;
    // Let probes still in flight from the roundtrip loop drain.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let missing: NetAddr = "127.0.0.1:9".parse().unwrap();

    // Member present, then missing: the present one is attempted, the
    // missing one aborts with a recoverable error.
    n1.multicast_msg(&Probe { n: 1 }, &[a2, missing]).unwrap();
    common::wait_for("missing peer reported", Duration::from_secs(5), || {
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("peer does not exist: 127.0.0.1:9"))
    })
    .await;

    // Missing first: the whole batch is aborted before any send.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let before = probes2.load(Ordering::SeqCst);
    errors.lock().unwrap().clear();
    n1.multicast_msg(&Probe { n: 2 }, &[missing, a2]).unwrap();
    common::wait_for("abort reported", Duration::from_secs(5), || {
        !errors.lock().unwrap().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(probes2.load(Ordering::SeqCst), before);

    n1.stop();
    n2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_times_out_and_retries() {
    common::init_logging();
    // A plain message network accepts TCP but never answers pings.
    let silent = meshwire::MsgNetwork::new(meshwire::NetConfig::dev_default()).unwrap();
    silent.start();
    let silent_addr = silent.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let n1 = make_net(|_| {});
    let downs = Arc::new(AtomicUsize::new(0));
    {
        let downs = downs.clone();
        n1.reg_conn_handler(move |_conn: &ConnRef, up| {
            if !up {
                downs.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    n1.start();
    listen_any(&n1).await;
    n1.add_peer(silent_addr).unwrap();

    // The dead-connection deadline (2s in the dev config) fires without a
    // pong, the connection is torn down, and a reconnect follows.
    common::wait_for("silent peer detected", Duration::from_secs(8), || {
        downs.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert!(n1.has_peer(silent_addr).await.unwrap());

    n1.stop();
    silent.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_after_peer_restart() {
    common::init_logging();
    let n1 = make_net(|_| {});
    let (_, acks1) = reg_probe_echo(&n1);
    let downs = Arc::new(AtomicUsize::new(0));
    {
        let downs = downs.clone();
        n1.reg_conn_handler(move |_conn: &ConnRef, up| {
            if !up {
                downs.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    n1.start();
    let a1 = listen_any(&n1).await;

    let n2 = make_net(|_| {});
    let _echo2 = reg_probe_echo(&n2);
    n2.start();
    let a2 = listen_any(&n2).await;
    n1.add_peer(a2).unwrap();
    n2.add_peer(a1).unwrap();
    wait_roundtrip(&n1, a2, &acks1, "initial link").await;

    // Kill n2 outright.
    n2.stop();
    common::wait_for("link loss observed", Duration::from_secs(10), || {
        downs.load(Ordering::SeqCst) >= 1
    })
    .await;

    // Restart a peer on the same port; n1's retry timer redials it.
    let n3 = make_net(|_| {});
    let _echo3 = reg_probe_echo(&n3);
    n3.start();
    let mut bound = false;
    for _ in 0..50 {
        if n3.listen(a2).await.is_ok() {
            bound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(bound, "could not rebind {}", a2);
    n3.add_peer(a1).unwrap();

    wait_roundtrip(&n1, a2, &acks1, "link after restart").await;

    n1.stop();
    n3.stop();
}
