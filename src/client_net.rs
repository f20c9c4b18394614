//! Client-server network: a message network that indexes inbound
//! (passive) connections by remote address.
//!
//! A server built on [`ClientNetwork`] never originates connections;
//! clients dial in, the server answers by address. The address index is
//! dispatcher-owned and tracks connection lifecycle automatically.

use {
    crate::{
        addr::NetAddr,
        config::NetConfig,
        conn::{ConnMode, ConnRef, PoolEvent},
        error::{NetError, Result},
        message::{Msg, MsgPayload, Opcode},
        msg_net::{build_core, user_pump, Boot, NetCore},
    },
    log::{debug, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    tokio::{
        runtime::Runtime,
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
};

enum ClientCmd {
    Listen(NetAddr, oneshot::Sender<Result<NetAddr>>),
    SendTo(Msg, NetAddr),
    Send(Msg, ConnRef),
    Terminate(ConnRef),
    Stop,
}

struct ClientState {
    core: Arc<NetCore>,
    addr2conn: HashMap<NetAddr, ConnRef>,
    conns: HashMap<u64, ConnRef>,
    listener: Option<JoinHandle<()>>,
}

impl ClientState {
    fn on_setup(&mut self, conn: ConnRef) {
        if conn.is_dead() {
            return;
        }
        // Only passive connections exist at this layer.
        debug_assert_eq!(conn.mode(), ConnMode::Passive);
        self.conns.insert(conn.conn_id(), conn.clone());
        self.addr2conn.insert(conn.addr(), conn.clone());
        self.core.handle_setup(&conn);
    }

    fn on_disconnect(&mut self, conn: &ConnRef) {
        self.conns.remove(&conn.conn_id());
        if self
            .addr2conn
            .get(&conn.addr())
            .is_some_and(|c| Arc::ptr_eq(c, conn))
        {
            self.addr2conn.remove(&conn.addr());
        }
        self.core.retire(conn);
    }

    fn send_to(&self, msg: Msg, addr: NetAddr) {
        match self.addr2conn.get(&addr) {
            Some(conn) => self.core.send_msg_on(&msg, conn),
            None => debug!("no client connection for {}", addr),
        }
    }

    fn shutdown(&mut self) {
        if let Some(l) = self.listener.take() {
            l.abort();
        }
        let conns: Vec<ConnRef> = self.conns.drain().map(|(_, c)| c).collect();
        for conn in &conns {
            self.core.retire(conn);
        }
        self.addr2conn.clear();
    }
}

async fn client_dispatcher(
    core: Arc<NetCore>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCmd>,
    mut pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
) {
    let mut state = ClientState {
        core,
        addr2conn: HashMap::new(),
        conns: HashMap::new(),
        listener: None,
    };
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Listen(addr, reply)) => {
                    let res = async {
                        if state.listener.is_some() {
                            return Err(NetError::Io(std::io::Error::new(
                                std::io::ErrorKind::AddrInUse,
                                "already listening",
                            )));
                        }
                        let (local, handle) = state.core.pool.listen(addr).await?;
                        state.listener = Some(handle);
                        Ok(local)
                    }
                    .await;
                    let _ = reply.send(res);
                }
                Some(ClientCmd::SendTo(msg, addr)) => state.send_to(msg, addr),
                Some(ClientCmd::Send(msg, conn)) => state.core.send_msg_on(&msg, &conn),
                Some(ClientCmd::Terminate(conn)) => state.on_disconnect(&conn),
                Some(ClientCmd::Stop) | None => break,
            },
            ev = pool_rx.recv() => match ev {
                Some(PoolEvent::Setup(conn)) => state.on_setup(conn),
                Some(PoolEvent::Disconnected(conn)) => state.on_disconnect(&conn),
                Some(PoolEvent::Ctrl(conn, msg)) => {
                    debug!("ignoring control frame {:#04x} on {}", msg.opcode(), conn);
                }
                None => break,
            },
        }
    }
    state.shutdown();
}

/// A message network for client-server request handling.
///
/// Inbound connections are indexed by remote address; there is no
/// outbound `connect` in the public surface.
pub struct ClientNetwork {
    core: Arc<NetCore>,
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    boot: Mutex<Option<Boot<ClientCmd>>>,
    rt: Mutex<Option<Runtime>>,
    started: AtomicBool,
}

impl ClientNetwork {
    /// Create a client-server network with the given configuration.
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
            self.core.rt.spawn(client_dispatcher(
                self.core.clone(),
                boot.cmd_rx,
                boot.pool_rx,
            ));
            self.core.rt.spawn(user_pump(self.core.clone(), boot.user_rx));
        }
    }

    /// Bind and start accepting clients. Returns the actual bound address.
    pub async fn listen(&self, addr: NetAddr) -> Result<NetAddr> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCmd::Listen(addr, tx))
            .map_err(|_| NetError::Stopped)?;
        rx.await.map_err(|_| NetError::Stopped)?
    }

    /// Send a typed message to the client connected from `addr`. Silently
    /// dropped when no such client is connected.
    pub fn send_msg<M: MsgPayload>(&self, msg: &M, addr: &NetAddr) -> Result<()> {
        self.send_raw(msg.to_msg()?, addr)
    }

    /// Send a pre-framed message to the client connected from `addr`.
    pub fn send_raw(&self, msg: Msg, addr: &NetAddr) -> Result<()> {
        self.cmd_tx
            .send(ClientCmd::SendTo(msg, *addr))
            .map_err(|_| NetError::Stopped)
    }

    /// Send a typed message on a specific connection (e.g. the one a
    /// request arrived on).
    pub fn send_msg_conn<M: MsgPayload>(&self, msg: &M, conn: &ConnRef) -> Result<()> {
        self.cmd_tx
            .send(ClientCmd::Send(msg.to_msg()?, conn.clone()))
            .map_err(|_| NetError::Stopped)
    }

    /// Terminate a client connection.
    pub fn terminate(&self, conn: &ConnRef) {
        let _ = self.cmd_tx.send(ClientCmd::Terminate(conn.clone()));
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

    /// Register a connection lifecycle handler.
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

    /// Stop the network and shut the worker runtime down. Idempotent.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(ClientCmd::Stop);
        self.stop_workers();
    }

    /// Shut down the worker runtime without waiting. Idempotent.
    pub fn stop_workers(&self) {
        if let Some(rt) = self.rt.lock().take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for ClientNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}
