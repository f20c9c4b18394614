//! Peer-to-peer overlay: one persistent, liveness-monitored channel
//! between any two declared peers, regardless of which side dialed.
//!
//! ## Lifecycle
//!
//! A peer becomes known through [`PeerNetwork::add_peer`]. The overlay
//! dials it, and every new TCP connection (either direction) runs the
//! PING/PONG handshake: each side sends a `Ping` carrying its *listening*
//! port the moment the connection is up, answers pings with pongs, and
//! resolves the remote's identity from the announced port. When two
//! connections to the same identity collide (both sides dialed at once),
//! the first one bound wins and the newcomer is terminated; both sides
//! converge because the loser's ping still produces a pong on the winner
//! that is discarded as a duplicate.
//!
//! ## Keepalive
//!
//! Two flags gate each ping cycle: the ping timer must have fired
//! (`ping_timer_ok`) *and* the previous pong must have arrived
//! (`pong_msg_ok`). Only when both hold does the next ping fly, so at
//! most one ping is outstanding per peer and liveness is coupled to
//! round-trip success. A connection that produces no pong within
//! `conn_timeout` is torn down by its reader task, and a reconnect is
//! scheduled after a randomized delay.
//!
//! All tables and peer fields are owned by the dispatcher task; every
//! public entry point marshals to it.

use {
    crate::{
        addr::NetAddr,
        config::{IdentityMode, PeerNetConfig},
        conn::{ConnRef, PoolEvent},
        error::{NetError, Result},
        message::{Msg, MsgPayload, Opcode},
        msg_net::{build_core, user_pump, Boot, NetCore, UserEvent},
    },
    log::{debug, info, warn},
    parking_lot::Mutex,
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        runtime::Runtime,
        sync::{mpsc, oneshot},
        task::JoinHandle,
        time::sleep,
    },
};

/// Reserved opcode for the keepalive ping.
pub const OPCODE_PING: Opcode = 0xf0;
/// Reserved opcode for the keepalive pong.
pub const OPCODE_PONG: Opcode = 0xf1;

/// Keepalive ping; announces the sender's listening port.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MsgPing {
    pub port: u16,
}

impl MsgPayload for MsgPing {
    const OPCODE: Opcode = OPCODE_PING;
}

/// Keepalive pong; announces the sender's listening port.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MsgPong {
    pub port: u16,
}

impl MsgPayload for MsgPong {
    const OPCODE: Opcode = OPCODE_PONG;
}

/// A duration drawn uniformly from `[0.5·base, 1.5·base]`, so that a
/// fleet of peers sharing a config never synchronizes its timers.
pub(crate) fn gen_rand_timeout(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// The identity a given address resolves to under an identity mode.
fn identity(mode: IdentityMode, addr: NetAddr) -> NetAddr {
    match mode {
        IdentityMode::IpBased => addr.ip_only(),
        IdentityMode::IpPortBased => addr,
    }
}

// ── Peer bookkeeping (dispatcher-owned) ─────────────────────────────────────

struct Peer {
    /// Nominal connect address. For promoted peers this is what
    /// `add_peer` supplied; for provisional peers, the announced
    /// identity when dialable.
    addr: NetAddr,
    /// Currently bound connection, if any. May be stale (dead) between
    /// teardown and reconnect.
    conn: Option<ConnRef>,
    /// True only after the PING/PONG handshake bound a connection.
    connected: bool,
    ping_timer_ok: bool,
    pong_msg_ok: bool,
    /// Invalidates in-flight ping-timer fires across resets.
    timer_gen: u64,
    ping_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl Peer {
    fn new(addr: NetAddr) -> Self {
        Self {
            addr,
            conn: None,
            connected: false,
            ping_timer_ok: false,
            pong_msg_ok: false,
            timer_gen: 0,
            ping_timer: None,
            retry_timer: None,
        }
    }

    fn clear_ping_timer(&mut self) {
        self.timer_gen += 1;
        if let Some(t) = self.ping_timer.take() {
            t.abort();
        }
    }

    fn clear_timers(&mut self) {
        self.clear_ping_timer();
        if let Some(t) = self.retry_timer.take() {
            t.abort();
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

enum PeerCmd {
    Listen(NetAddr, oneshot::Sender<Result<NetAddr>>),
    AddPeer(NetAddr),
    DelPeer(NetAddr),
    HasPeer(NetAddr, oneshot::Sender<bool>),
    GetPeerConn(NetAddr, oneshot::Sender<Result<ConnRef>>),
    SendTo(Msg, NetAddr),
    Multicast(Msg, Vec<NetAddr>),
    Send(Msg, ConnRef),
    Terminate(ConnRef),
    PingTimer(NetAddr, u64),
    RetryTimer(NetAddr),
    Stop,
}

struct PeerState {
    cfg: PeerNetConfig,
    core: Arc<NetCore>,
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
    known: HashMap<NetAddr, Peer>,
    unknown: HashMap<NetAddr, Peer>,
    conns: HashMap<u64, ConnRef>,
    listen_port: u16,
    listener: Option<JoinHandle<()>>,
}

impl PeerState {
    fn identity_of(&self, addr: NetAddr) -> NetAddr {
        identity(self.cfg.id_mode, addr)
    }

    fn get_peer(&self, id: &NetAddr) -> Option<&Peer> {
        self.known.get(id).or_else(|| self.unknown.get(id))
    }

    fn get_peer_mut(&mut self, id: &NetAddr) -> Option<&mut Peer> {
        if self.known.contains_key(id) {
            self.known.get_mut(id)
        } else {
            self.unknown.get_mut(id)
        }
    }

    // ── Connection hooks ────────────────────────────────────────────────

    fn on_setup(&mut self, conn: ConnRef) {
        if conn.is_dead() {
            return;
        }
        self.conns.insert(conn.conn_id(), conn.clone());
        self.core.handle_setup(&conn);
        // The initial ping-pong sets up the channel; the deadline covers
        // the whole handshake.
        conn.reset_timeout(self.cfg.conn_timeout);
        self.send_ping_on(&conn);
    }

    fn on_teardown(&mut self, conn: &ConnRef) {
        let Some(id) = conn.peer_id() else { return };
        let retry_base = self.cfg.retry_conn_delay;
        let cmd_tx = self.cmd_tx.clone();
        let rt = self.core.rt.clone();
        let Some(p) = self.get_peer_mut(&id) else { return };
        if !p.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            return;
        }
        p.clear_ping_timer();
        p.connected = false;
        info!("connection to peer {} lost ({})", id, conn);
        if let Some(t) = p.retry_timer.take() {
            t.abort();
        }
        let delay = gen_rand_timeout(retry_base);
        p.retry_timer = Some(rt.spawn(async move {
            sleep(delay).await;
            let _ = cmd_tx.send(PeerCmd::RetryTimer(id));
        }));
    }

    /// Terminate a connection and run its teardown exactly once.
    fn terminate_conn(&mut self, conn: &ConnRef) {
        self.conns.remove(&conn.conn_id());
        if self.core.retire(conn) {
            self.on_teardown(conn);
        }
    }

    // ── Handshake ───────────────────────────────────────────────────────

    /// Decide what a handshake frame on `conn` (announcing `port`) means.
    /// Returns true when the frame was fully handled here; the caller
    /// must not act on the connection any further (it may be dead).
    fn check_new_conn(&mut self, conn: &ConnRef, port: u16) -> bool {
        let id = match conn.peer_id() {
            Some(id) => id,
            None => {
                // Passive connections resolve their identity from the
                // announced listening port (the source port differs).
                let id = match self.cfg.id_mode {
                    IdentityMode::IpPortBased => NetAddr::new(conn.addr().ip, port),
                    IdentityMode::IpBased => conn.addr().ip_only(),
                };
                conn.assign_peer_id(id);
                id
            }
        };

        if !self.known.contains_key(&id) {
            self.core.push_user(UserEvent::UnknownPeer(id));
            if self.cfg.allow_unknown_peer {
                if !self.unknown.contains_key(&id) {
                    let addr = if id.port != 0 { id } else { conn.addr() };
                    self.unknown.insert(id, Peer::new(addr));
                }
            } else {
                info!("rejecting {} from unknown peer {}", conn, id);
                self.terminate_conn(conn);
                return true;
            }
        }

        let Some(p) = self.get_peer_mut(&id) else {
            return false;
        };
        if p.connected {
            if p.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                // Already bound; duplicate handshake frame.
                return false;
            }
            // Colliding initiation: first bound wins.
            debug!("duplicate connection for {}, terminating {}", id, conn);
            self.terminate_conn(conn);
            return true;
        }

        // Bind this connection, replacing any stale one.
        let old = if p.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            None
        } else {
            p.conn.replace(conn.clone())
        };
        p.clear_ping_timer();
        p.connected = true;
        self.reset_ping_timer(id);
        self.send_peer_ping(id);
        if let Some(old) = old {
            info!("terminating replaced connection {}", old);
            self.terminate_conn(&old);
        }
        info!("established connection with peer {} via {}", id, conn);
        false
    }

    fn handle_ping(&mut self, conn: &ConnRef, port: u16) {
        if conn.is_dead() {
            return;
        }
        debug!("ping from {}, port {}", conn, port);
        if self.check_new_conn(conn, port) {
            return;
        }
        self.send_pong_on(conn);
    }

    fn handle_pong(&mut self, conn: &ConnRef, port: u16) {
        if conn.is_dead() {
            return;
        }
        let Some(id) = conn.peer_id() else {
            warn!("pong discarded on {}", conn);
            return;
        };
        if self.get_peer(&id).is_none() {
            warn!("pong discarded on {}", conn);
            return;
        }
        if self.check_new_conn(conn, port) {
            return;
        }
        let Some(p) = self.get_peer_mut(&id) else { return };
        p.pong_msg_ok = true;
        if p.ping_timer_ok {
            self.reset_ping_timer(id);
            self.send_peer_ping(id);
        }
    }

    // ── Keepalive ───────────────────────────────────────────────────────

    fn reset_ping_timer(&mut self, id: NetAddr) {
        let period = gen_rand_timeout(self.cfg.ping_period);
        let cmd_tx = self.cmd_tx.clone();
        let rt = self.core.rt.clone();
        let Some(p) = self.get_peer_mut(&id) else { return };
        p.clear_ping_timer();
        let gen = p.timer_gen;
        p.ping_timer = Some(rt.spawn(async move {
            sleep(period).await;
            let _ = cmd_tx.send(PeerCmd::PingTimer(id, gen));
        }));
    }

    /// Start a fresh ping cycle on the peer's bound connection: clear both
    /// gate flags, push the dead-connection deadline out, transmit.
    fn send_peer_ping(&mut self, id: NetAddr) {
        let conn_timeout = self.cfg.conn_timeout;
        let Some(p) = self.get_peer_mut(&id) else { return };
        p.ping_timer_ok = false;
        p.pong_msg_ok = false;
        if let Some(conn) = p.conn.clone() {
            conn.reset_timeout(conn_timeout);
            self.send_ping_on(&conn);
        }
    }

    fn on_ping_timer(&mut self, id: NetAddr, gen: u64) {
        let Some(p) = self.get_peer_mut(&id) else { return };
        if p.timer_gen != gen {
            return;
        }
        p.ping_timer_ok = true;
        if p.pong_msg_ok {
            self.reset_ping_timer(id);
            self.send_peer_ping(id);
        }
    }

    fn send_ping_on(&self, conn: &ConnRef) {
        match (MsgPing {
            port: self.listen_port,
        })
        .to_msg()
        {
            Ok(msg) => self.core.send_msg_on(&msg, conn),
            Err(e) => warn!("failed to encode ping: {}", e),
        }
    }

    fn send_pong_on(&self, conn: &ConnRef) {
        match (MsgPong {
            port: self.listen_port,
        })
        .to_msg()
        {
            Ok(msg) => self.core.send_msg_on(&msg, conn),
            Err(e) => warn!("failed to encode pong: {}", e),
        }
    }

    // ── Reconnect ───────────────────────────────────────────────────────

    fn start_active_conn(&mut self, id: NetAddr) {
        let Some(p) = self.get_peer(&id) else { return };
        if p.connected {
            return;
        }
        let target = p.addr;
        let conn = self.core.pool.connect(target);
        conn.assign_peer_id(id);
        if let Some(p) = self.get_peer_mut(&id) {
            p.conn = Some(conn);
        }
    }

    // ── Public operations (marshalled) ──────────────────────────────────

    fn add_peer(&mut self, addr: NetAddr) {
        let id = self.identity_of(addr);
        if self.known.contains_key(&id) {
            self.core.report(NetError::PeerAlreadyExists(addr));
            return;
        }
        let peer = match self.unknown.remove(&id) {
            Some(mut p) => {
                // Promotion keeps the bound connection; reconnects now
                // target the caller-supplied address.
                info!("promoting unknown peer {} to known", id);
                p.addr = addr;
                p
            }
            None => Peer::new(addr),
        };
        self.known.insert(id, peer);
        self.start_active_conn(id);
    }

    fn del_peer(&mut self, addr: NetAddr) {
        let id = self.identity_of(addr);
        match self.known.remove(&id) {
            Some(mut p) => {
                p.clear_timers();
                if let Some(conn) = p.conn.take() {
                    self.terminate_conn(&conn);
                }
            }
            None => self.core.report(NetError::PeerNotExist(addr)),
        }
    }

    fn get_peer_conn(&self, addr: NetAddr) -> Result<ConnRef> {
        let id = self.identity_of(addr);
        match self.get_peer(&id) {
            None => Err(NetError::PeerNotExist(addr)),
            Some(p) => p.conn.clone().ok_or(NetError::PeerNotConnected(addr)),
        }
    }

    /// Send toward one peer. Returns false when the batch (multicast)
    /// must be aborted.
    fn send_to(&mut self, msg: Msg, addr: NetAddr) -> bool {
        let id = self.identity_of(addr);
        match self.get_peer(&id) {
            None => {
                self.core.report(NetError::PeerNotExist(addr));
                false
            }
            Some(p) => match &p.conn {
                Some(conn) => {
                    self.core.send_msg_on(&msg, conn);
                    true
                }
                None => {
                    self.core.report(NetError::PeerNotConnected(addr));
                    false
                }
            },
        }
    }

    fn multicast(&mut self, msg: Msg, addrs: Vec<NetAddr>) {
        // Sends are attempted in order; the first missing address aborts
        // the remainder of the batch.
        for addr in addrs {
            if !self.send_to(msg.clone(), addr) {
                break;
            }
        }
    }

    async fn listen(&mut self, addr: NetAddr) -> Result<NetAddr> {
        if self.listener.is_some() {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "already listening",
            )));
        }
        let (local, handle) = self.core.pool.listen(addr).await?;
        self.listener = Some(handle);
        self.listen_port = local.port;
        Ok(local)
    }

    fn shutdown(&mut self) {
        if let Some(l) = self.listener.take() {
            l.abort();
        }
        for p in self.known.values_mut().chain(self.unknown.values_mut()) {
            p.clear_timers();
        }
        let mut pending: Vec<ConnRef> = self.conns.values().cloned().collect();
        for p in self.known.values().chain(self.unknown.values()) {
            if let Some(c) = &p.conn {
                pending.push(c.clone());
            }
        }
        for conn in pending {
            self.conns.remove(&conn.conn_id());
            self.core.retire(&conn);
        }
    }
}

async fn peer_dispatcher(
    cfg: PeerNetConfig,
    core: Arc<NetCore>,
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCmd>,
    mut pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
) {
    let mut state = PeerState {
        cfg,
        core,
        cmd_tx,
        known: HashMap::new(),
        unknown: HashMap::new(),
        conns: HashMap::new(),
        listen_port: 0,
        listener: None,
    };
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PeerCmd::Listen(addr, reply)) => {
                    let _ = reply.send(state.listen(addr).await);
                }
                Some(PeerCmd::AddPeer(addr)) => state.add_peer(addr),
                Some(PeerCmd::DelPeer(addr)) => state.del_peer(addr),
                Some(PeerCmd::HasPeer(addr, reply)) => {
                    let id = state.identity_of(addr);
                    let _ = reply.send(state.known.contains_key(&id));
                }
                Some(PeerCmd::GetPeerConn(addr, reply)) => {
                    let _ = reply.send(state.get_peer_conn(addr));
                }
                Some(PeerCmd::SendTo(msg, addr)) => {
                    state.send_to(msg, addr);
                }
                Some(PeerCmd::Multicast(msg, addrs)) => state.multicast(msg, addrs),
                Some(PeerCmd::Send(msg, conn)) => state.core.send_msg_on(&msg, &conn),
                Some(PeerCmd::Terminate(conn)) => state.terminate_conn(&conn),
                Some(PeerCmd::PingTimer(id, gen)) => state.on_ping_timer(id, gen),
                Some(PeerCmd::RetryTimer(id)) => state.start_active_conn(id),
                Some(PeerCmd::Stop) | None => break,
            },
            ev = pool_rx.recv() => match ev {
                Some(PoolEvent::Setup(conn)) => state.on_setup(conn),
                Some(PoolEvent::Disconnected(conn)) => state.terminate_conn(&conn),
                Some(PoolEvent::Ctrl(conn, msg)) => match msg.opcode() {
                    OPCODE_PING => match MsgPing::from_msg(&msg) {
                        Ok(m) => state.handle_ping(&conn, m.port),
                        Err(e) => warn!("malformed ping on {}: {}", conn, e),
                    },
                    OPCODE_PONG => match MsgPong::from_msg(&msg) {
                        Ok(m) => state.handle_pong(&conn, m.port),
                        Err(e) => warn!("malformed pong on {}: {}", conn, e),
                    },
                    op => debug!("unexpected control frame {:#04x} on {}", op, conn),
                },
                None => break,
            },
        }
    }
    state.shutdown();
}

// ── Public handle ───────────────────────────────────────────────────────────

/// A peer-to-peer overlay network.
///
/// Maintains one established connection per known peer, recovers from
/// disconnects with randomized backoff, detects silent peers via the
/// PING/PONG keepalive, and reconciles colliding initiations
/// deterministically.
pub struct PeerNetwork {
    core: Arc<NetCore>,
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
    cfg: PeerNetConfig,
    boot: Mutex<Option<Boot<PeerCmd>>>,
    rt: Mutex<Option<Runtime>>,
    started: AtomicBool,
}

impl PeerNetwork {
    /// Create a peer network with the given configuration. Call
    /// [`start`](Self::start) to launch the worker threads.
    pub fn new(cfg: PeerNetConfig) -> Result<Self> {
        let parts = build_core(cfg.net.clone(), Some((OPCODE_PING, OPCODE_PONG)))?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Self {
            core: parts.core,
            cmd_tx,
            cfg,
            boot: Mutex::new(Some(Boot {
                cmd_rx,
                pool_rx: parts.pool_rx,
                user_rx: parts.user_rx,
            })),
            rt: Mutex::new(Some(parts.rt)),
            started: AtomicBool::new(false),
        })
    }

    /// Launch the dispatcher and the user dispatch pump. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(boot) = self.boot.lock().take() {
            self.core.rt.spawn(peer_dispatcher(
                self.cfg.clone(),
                self.core.clone(),
                self.cmd_tx.clone(),
                boot.cmd_rx,
                boot.pool_rx,
            ));
            self.core.rt.spawn(user_pump(self.core.clone(), boot.user_rx));
        }
    }

    /// Bind and start accepting connections; the bound port is what
    /// subsequent pings announce. Returns the actual bound address.
    pub async fn listen(&self, addr: NetAddr) -> Result<NetAddr> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCmd::Listen(addr, tx))
            .map_err(|_| NetError::Stopped)?;
        rx.await.map_err(|_| NetError::Stopped)?
    }

    /// Declare a peer and start dialing it. A duplicate declaration
    /// surfaces [`NetError::PeerAlreadyExists`] through the error handler.
    pub fn add_peer(&self, addr: NetAddr) -> Result<()> {
        self.cmd_tx
            .send(PeerCmd::AddPeer(addr))
            .map_err(|_| NetError::Stopped)
    }

    /// Remove a peer and terminate its connection. An unknown address
    /// surfaces [`NetError::PeerNotExist`] through the error handler.
    pub fn del_peer(&self, addr: NetAddr) -> Result<()> {
        self.cmd_tx
            .send(PeerCmd::DelPeer(addr))
            .map_err(|_| NetError::Stopped)
    }

    /// Whether `addr` resolves to a *known* peer.
    pub async fn has_peer(&self, addr: NetAddr) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCmd::HasPeer(addr, tx))
            .map_err(|_| NetError::Stopped)?;
        rx.await.map_err(|_| NetError::Stopped)
    }

    /// The connection currently bound to a peer.
    pub async fn get_peer_conn(&self, addr: NetAddr) -> Result<ConnRef> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCmd::GetPeerConn(addr, tx))
            .map_err(|_| NetError::Stopped)?;
        rx.await.map_err(|_| NetError::Stopped)?
    }

    /// Send a typed message to a peer by address.
    pub fn send_msg<M: MsgPayload>(&self, msg: &M, addr: &NetAddr) -> Result<()> {
        self.send_raw(msg.to_msg()?, addr)
    }

    /// Send a pre-framed message to a peer by address.
    pub fn send_raw(&self, msg: Msg, addr: &NetAddr) -> Result<()> {
        self.cmd_tx
            .send(PeerCmd::SendTo(msg, *addr))
            .map_err(|_| NetError::Stopped)
    }

    /// Send a typed message on a specific connection (e.g. the one a
    /// message arrived on).
    pub fn send_msg_conn<M: MsgPayload>(&self, msg: &M, conn: &ConnRef) -> Result<()> {
        self.cmd_tx
            .send(PeerCmd::Send(msg.to_msg()?, conn.clone()))
            .map_err(|_| NetError::Stopped)
    }

    /// Send a typed message to several peers. Sends are attempted in
    /// order; the first missing address aborts the remainder and surfaces
    /// [`NetError::PeerNotExist`] through the error handler.
    pub fn multicast_msg<M: MsgPayload>(&self, msg: &M, addrs: &[NetAddr]) -> Result<()> {
        self.cmd_tx
            .send(PeerCmd::Multicast(msg.to_msg()?, addrs.to_vec()))
            .map_err(|_| NetError::Stopped)
    }

    /// Terminate a connection.
    pub fn terminate(&self, conn: &ConnRef) {
        let _ = self.cmd_tx.send(PeerCmd::Terminate(conn.clone()));
    }

    /// Register a typed handler (see [`MsgNetwork::reg_handler`](crate::MsgNetwork::reg_handler)).
    pub fn reg_handler<M, F>(&self, f: F)
    where
        M: MsgPayload,
        F: Fn(M, &ConnRef) + Send + Sync + 'static,
    {
        self.core.set_handler(
            M::OPCODE,
            Arc::new(move |msg: &Msg, conn: &ConnRef| match M::from_msg(msg) {
                Ok(m) => f(m, conn),
                Err(e) => warn!("failed to decode opcode {:#04x}: {}", msg.opcode(), e),
            }),
        );
    }

    /// Register a raw handler for an opcode.
    pub fn set_handler<F>(&self, opcode: Opcode, f: F)
    where
        F: Fn(&Msg, &ConnRef) + Send + Sync + 'static,
    {
        self.core.set_handler(opcode, Arc::new(f));
    }

    /// Register a connection lifecycle handler `(conn, connected)`.
    pub fn reg_conn_handler<F>(&self, f: F)
    where
        F: Fn(&ConnRef, bool) + Send + Sync + 'static,
    {
        self.core.set_conn_handler(Arc::new(f));
    }

    /// Register a recoverable-error handler.
    pub fn reg_error_handler<F>(&self, f: F)
    where
        F: Fn(&NetError) + Send + Sync + 'static,
    {
        self.core.set_err_handler(Arc::new(f));
    }

    /// Register the callback invoked (on the user loop) when an inbound
    /// connection presents an identity that was never `add_peer`ed.
    pub fn reg_unknown_peer_handler<F>(&self, f: F)
    where
        F: Fn(NetAddr) + Send + Sync + 'static,
    {
        self.core.set_unknown_handler(Arc::new(f));
    }

    /// Stop the network: terminate connections, cancel timers, and shut
    /// the worker runtime down. Idempotent.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(PeerCmd::Stop);
        self.stop_workers();
    }

    /// Shut down the worker runtime without waiting. Idempotent.
    pub fn stop_workers(&self) {
        if let Some(rt) = self.rt.lock().take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for PeerNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
