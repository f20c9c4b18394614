//! Message network: framed messages over the connection pool, routed to
//! registered opcode handlers.
//!
//! The architecture is a single **dispatcher** task that owns all mutable
//! network state, plus the pool's per-connection I/O tasks, plus a **user
//! dispatch pump** that drains the bounded message queue and runs
//! handlers. Public entry points never touch state directly: they
//! marshal commands to the dispatcher over a channel and, where the API
//! is synchronous, await a oneshot reply carrying the outcome.
//!
//! ```text
//!  caller ──cmd──▶ dispatcher ──bytes──▶ writer task ──▶ TCP
//!  TCP ──▶ reader task ──(Msg, Conn)──▶ bounded queue ──▶ user pump ──▶ handler
//! ```

use {
    crate::{
        addr::NetAddr,
        config::NetConfig,
        conn::{ConnPool, ConnRef, PoolEvent},
        error::{NetError, Result},
        message::{Msg, MsgPayload, Opcode},
    },
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{collections::HashMap, sync::atomic::AtomicBool, sync::atomic::Ordering, sync::Arc},
    tokio::{
        runtime::{Builder, Handle, Runtime},
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
};

// ── Handlers and user-loop events ───────────────────────────────────────────

/// Raw message handler: `(message, connection)`.
pub type Handler = Arc<dyn Fn(&Msg, &ConnRef) + Send + Sync>;
/// Connection lifecycle handler: `(connection, connected)`.
pub type ConnHandler = Arc<dyn Fn(&ConnRef, bool) + Send + Sync>;
/// Recoverable-error handler.
pub type ErrHandler = Arc<dyn Fn(&NetError) + Send + Sync>;
/// Unknown-peer handler (peer network only): called with the identity an
/// inbound connection presented.
pub type UnknownPeerHandler = Arc<dyn Fn(NetAddr) + Send + Sync>;

/// Events delivered to the user dispatch pump.
#[derive(Debug)]
pub(crate) enum UserEvent {
    /// A decoded application message.
    Msg(Msg, ConnRef),
    /// Connection came up (true) or went down (false).
    Conn(ConnRef, bool),
    /// An inbound connection presented an unregistered identity.
    UnknownPeer(NetAddr),
    /// A recoverable error to surface to the application.
    Error(NetError),
}

// ── Shared core ─────────────────────────────────────────────────────────────

/// State shared between the public handle, the dispatcher, and the pump.
/// Mutable *network* state (tables, connection maps) lives in the
/// dispatcher task instead; this only carries registries and channels.
pub(crate) struct NetCore {
    pub cfg: NetConfig,
    pub pool: ConnPool,
    pub rt: Handle,
    pub user_tx: mpsc::Sender<UserEvent>,
    handlers: Mutex<HashMap<Opcode, Handler>>,
    conn_handler: Mutex<Option<ConnHandler>>,
    err_handler: Mutex<Option<ErrHandler>>,
    unknown_handler: Mutex<Option<UnknownPeerHandler>>,
}

impl NetCore {
    pub fn set_handler(&self, opcode: Opcode, h: Handler) {
        self.handlers.lock().insert(opcode, h);
    }

    pub fn set_conn_handler(&self, h: ConnHandler) {
        *self.conn_handler.lock() = Some(h);
    }

    pub fn set_err_handler(&self, h: ErrHandler) {
        *self.err_handler.lock() = Some(h);
    }

    pub fn set_unknown_handler(&self, h: UnknownPeerHandler) {
        *self.unknown_handler.lock() = Some(h);
    }

    /// Serialize a message onto a connection's send queue and bump stat
    /// counters. Dispatcher-only.
    pub fn send_msg_on(&self, msg: &Msg, conn: &ConnRef) {
        if conn.is_dead() {
            debug!("dropping send on {}", conn);
            return;
        }
        let bytes = msg.encode();
        conn.stats().mark_sent(msg.len());
        conn.send_bytes(bytes);
    }

    /// Push an event toward the user pump without ever blocking the
    /// dispatcher: a full queue falls back to an async push from a spawned
    /// task. Only the frame readers block for back-pressure.
    pub fn push_user(&self, ev: UserEvent) {
        if let Err(mpsc::error::TrySendError::Full(ev)) = self.user_tx.try_send(ev) {
            let tx = self.user_tx.clone();
            self.rt.spawn(async move {
                let _ = tx.send(ev).await;
            });
        }
    }

    /// Surface a recoverable error to the application.
    pub fn report(&self, err: NetError) {
        self.push_user(UserEvent::Error(err));
    }

    /// Move a connection to `Dead` and emit the down event. Returns true
    /// for the caller that performed the transition (teardown hooks are
    /// theirs to run).
    pub fn retire(&self, conn: &ConnRef) -> bool {
        if conn.mark_dead() {
            if conn.was_setup() {
                self.push_user(UserEvent::Conn(conn.clone(), false));
            }
            true
        } else {
            false
        }
    }

    /// Mark a connection set up and emit the up event.
    pub fn handle_setup(&self, conn: &ConnRef) {
        conn.mark_setup();
        self.push_user(UserEvent::Conn(conn.clone(), true));
    }
}

/// Everything `new()` builds and `start()` consumes.
pub(crate) struct CoreParts {
    pub core: Arc<NetCore>,
    pub rt: Runtime,
    pub pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
    pub user_rx: mpsc::Receiver<UserEvent>,
}

/// Build the worker runtime, channels, pool, and shared core.
pub(crate) fn build_core(cfg: NetConfig, reserved: Option<(Opcode, Opcode)>) -> Result<CoreParts> {
    let rt = Builder::new_multi_thread()
        .worker_threads(cfg.nworker.max(1))
        .thread_name("meshwire-worker")
        .enable_io()
        .enable_time()
        .build()?;
    let (pool_tx, pool_rx) = mpsc::unbounded_channel();
    let (user_tx, user_rx) = mpsc::channel(cfg.queue_capacity.max(1));
    let pool = ConnPool::new(
        cfg.clone(),
        rt.handle().clone(),
        pool_tx,
        user_tx.clone(),
        reserved,
    );
    let core = Arc::new(NetCore {
        cfg,
        pool,
        rt: rt.handle().clone(),
        user_tx,
        handlers: Mutex::new(HashMap::new()),
        conn_handler: Mutex::new(None),
        err_handler: Mutex::new(None),
        unknown_handler: Mutex::new(None),
    });
    Ok(CoreParts {
        core,
        rt,
        pool_rx,
        user_rx,
    })
}

// ── User dispatch pump ──────────────────────────────────────────────────────

/// Drain the user queue, running handlers. After `burst_size` consecutive
/// events the pump yields so other tasks are not starved.
pub(crate) async fn user_pump(core: Arc<NetCore>, mut rx: mpsc::Receiver<UserEvent>) {
    let burst = core.cfg.burst_size.max(1);
    while let Some(ev) = rx.recv().await {
        handle_user_event(&core, ev);
        let mut n = 1;
        while n < burst {
            match rx.try_recv() {
                Ok(ev) => {
                    handle_user_event(&core, ev);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        if n >= burst {
            tokio::task::yield_now().await;
        }
    }
}

fn handle_user_event(core: &NetCore, ev: UserEvent) {
    match ev {
        UserEvent::Msg(msg, conn) => {
            let handler = core.handlers.lock().get(&msg.opcode()).cloned();
            match handler {
                Some(h) => {
                    conn.stats().mark_recv(msg.len());
                    h(&msg, &conn);
                }
                None => {
                    warn!("unknown opcode {:#04x} from {}", msg.opcode(), conn);
                    let eh = core.err_handler.lock().clone();
                    if let Some(eh) = eh {
                        eh(&NetError::UnknownOpcode(msg.opcode()));
                    }
                }
            }
        }
        UserEvent::Conn(conn, up) => {
            let handler = core.conn_handler.lock().clone();
            if let Some(h) = handler {
                h(&conn, up);
            }
        }
        UserEvent::UnknownPeer(id) => {
            let handler = core.unknown_handler.lock().clone();
            if let Some(h) = handler {
                h(id);
            }
        }
        UserEvent::Error(err) => {
            let handler = core.err_handler.lock().clone();
            match handler {
                Some(h) => h(&err),
                None => warn!("recoverable error: {}", err),
            }
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

enum MsgCmd {
    Listen(NetAddr, oneshot::Sender<Result<NetAddr>>),
    Send(Msg, ConnRef),
    Terminate(ConnRef),
    Stop,
}

struct MsgState {
    core: Arc<NetCore>,
    conns: HashMap<u64, ConnRef>,
    listener: Option<JoinHandle<()>>,
}

impl MsgState {
    async fn listen(&mut self, addr: NetAddr) -> Result<NetAddr> {
        if self.listener.is_some() {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "already listening",
            )));
        }
        let (local, handle) = self.core.pool.listen(addr).await?;
        self.listener = Some(handle);
        Ok(local)
    }

    fn terminate(&mut self, conn: &ConnRef) {
        self.conns.remove(&conn.conn_id());
        if self.core.retire(conn) {
            info!("terminated {}", conn);
        }
    }

    fn shutdown(&mut self) {
        if let Some(l) = self.listener.take() {
            l.abort();
        }
        let conns: Vec<ConnRef> = self.conns.values().cloned().collect();
        for conn in conns {
            self.terminate(&conn);
        }
    }
}

async fn msg_dispatcher(
    core: Arc<NetCore>,
    mut cmd_rx: mpsc::UnboundedReceiver<MsgCmd>,
    mut pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
) {
    let mut state = MsgState {
        core,
        conns: HashMap::new(),
        listener: None,
    };
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(MsgCmd::Listen(addr, reply)) => {
                    let _ = reply.send(state.listen(addr).await);
                }
                Some(MsgCmd::Send(msg, conn)) => state.core.send_msg_on(&msg, &conn),
                Some(MsgCmd::Terminate(conn)) => state.terminate(&conn),
                Some(MsgCmd::Stop) | None => break,
            },
            ev = pool_rx.recv() => match ev {
                Some(PoolEvent::Setup(conn)) => {
                    if conn.is_dead() {
                        continue;
                    }
                    state.conns.insert(conn.conn_id(), conn.clone());
                    state.core.handle_setup(&conn);
                }
                Some(PoolEvent::Disconnected(conn)) => {
                    state.conns.remove(&conn.conn_id());
                    state.core.retire(&conn);
                }
                // No reserved opcodes at this layer.
                Some(PoolEvent::Ctrl(conn, msg)) => {
                    debug!("ignoring control frame {:#04x} on {}", msg.opcode(), conn);
                }
                None => break,
            },
        }
    }
    state.shutdown();
}

// ── Public handle ───────────────────────────────────────────────────────────

pub(crate) struct Boot<C> {
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<C>,
    pub(crate) pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
    pub(crate) user_rx: mpsc::Receiver<UserEvent>,
}

/// A network of nodes exchanging framed messages over TCP.
///
/// Handlers are registered per opcode and run on the user dispatch pump;
/// sends are serialized through the dispatcher, so concurrent callers
/// never contend on a connection's send buffer.
pub struct MsgNetwork {
    core: Arc<NetCore>,
    cmd_tx: mpsc::UnboundedSender<MsgCmd>,
    boot: Mutex<Option<Boot<MsgCmd>>>,
    rt: Mutex<Option<Runtime>>,
    started: AtomicBool,
}

impl MsgNetwork {
    /// Create a network with the given configuration. Call
    /// [`start`](Self::start) to launch the worker threads.
    pub fn new(cfg: NetConfig) -> Result<Self> {
        let parts = build_core(cfg, None)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Self {
            core: parts.core,
            cmd_tx,
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
            self.core
                .rt
                .spawn(msg_dispatcher(self.core.clone(), boot.cmd_rx, boot.pool_rx));
            self.core.rt.spawn(user_pump(self.core.clone(), boot.user_rx));
        }
    }

    /// Bind and start accepting connections. Returns the actual bound
    /// address (use port 0 to let the OS pick).
    pub async fn listen(&self, addr: NetAddr) -> Result<NetAddr> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(MsgCmd::Listen(addr, tx))
            .map_err(|_| NetError::Stopped)?;
        rx.await.map_err(|_| NetError::Stopped)?
    }

    /// Originate a connection to `addr`. The returned handle is live
    /// immediately; the TCP connect resolves in the background.
    pub fn connect(&self, addr: NetAddr) -> ConnRef {
        self.core.pool.connect(addr)
    }

    /// Send a typed message on a connection.
    pub fn send_msg<M: MsgPayload>(&self, msg: &M, conn: &ConnRef) -> Result<()> {
        self.send_raw(msg.to_msg()?, conn)
    }

    /// Send a pre-framed message on a connection.
    pub fn send_raw(&self, msg: Msg, conn: &ConnRef) -> Result<()> {
        self.cmd_tx
            .send(MsgCmd::Send(msg, conn.clone()))
            .map_err(|_| NetError::Stopped)
    }

    /// Terminate a connection: mark it dead, close the socket, drop
    /// pending writes.
    pub fn terminate(&self, conn: &ConnRef) {
        let _ = self.cmd_tx.send(MsgCmd::Terminate(conn.clone()));
    }

    /// Register a typed handler; the payload decoder is inferred from the
    /// handler's argument type.
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

    /// Register a recoverable-error handler. Without one, recoverable
    /// errors are logged at warn level.
    pub fn reg_error_handler<F>(&self, f: F)
    where
        F: Fn(&NetError) + Send + Sync + 'static,
    {
        self.core.set_err_handler(Arc::new(f));
    }

    /// Stop the network: terminate connections and shut the worker
    /// runtime down. Idempotent.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(MsgCmd::Stop);
        self.stop_workers();
    }

    /// Shut down the worker runtime without waiting. Idempotent.
    pub fn stop_workers(&self) {
        if let Some(rt) = self.rt.lock().take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for MsgNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}
