//! TCP connection pool: sockets, per-connection I/O tasks, and lifecycle.
//!
//! Each live connection is served by exactly one reader task and one
//! writer task for its whole life. The reader owns the receive buffer,
//! the frame decoder, and the inactivity deadline; the only way anything
//! else influences them is the connection's control channel (deadline
//! resets) and the cancellation token (shutdown). The dispatcher owns the
//! other side of the lifecycle: setup and teardown events are delivered to
//! it over the pool event channel and processed there.
//!
//! Decoded application frames go into a *bounded* queue toward the user
//! dispatch loop; when the queue is full the reader parks, which stops
//! reading, which lets TCP push back on the remote. Reserved control
//! frames (the peer layer's PING/PONG) are routed to the dispatcher
//! channel instead so liveness never depends on the user loop draining.

use {
    crate::{
        addr::NetAddr,
        config::NetConfig,
        error::{NetError, Result},
        message::{Msg, MsgDecoder, Opcode},
        msg_net::UserEvent,
    },
    bytes::{Bytes, BytesMut},
    log::{debug, info, warn},
    std::{
        fmt,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
            Arc, OnceLock,
        },
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpSocket, TcpStream,
        },
        runtime::Handle,
        sync::mpsc,
        task::JoinHandle,
        time::{sleep_until, Duration, Instant},
    },
    tokio_util::sync::{CancellationToken, WaitForCancellationFuture},
};

/// Connection mode: who initiated, or whether it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// We originated this connection.
    Active,
    /// We accepted this connection.
    Passive,
    /// Terminal state; the socket is closed or closing.
    Dead,
}

const MODE_ACTIVE: u8 = 0;
const MODE_PASSIVE: u8 = 1;
const MODE_DEAD: u8 = 2;

impl ConnMode {
    fn as_u8(self) -> u8 {
        match self {
            ConnMode::Active => MODE_ACTIVE,
            ConnMode::Passive => MODE_PASSIVE,
            ConnMode::Dead => MODE_DEAD,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            MODE_ACTIVE => ConnMode::Active,
            MODE_PASSIVE => ConnMode::Passive,
            _ => ConnMode::Dead,
        }
    }
}

// ── Stat counters ───────────────────────────────────────────────────────────

/// Per-connection message statistics. Relaxed atomics: counters only,
/// no cross-thread ordering is implied.
#[derive(Debug, Default)]
pub struct ConnStats {
    nsent: AtomicU64,
    nrecv: AtomicU64,
    nsentb: AtomicU64,
    nrecvb: AtomicU64,
}

impl ConnStats {
    pub(crate) fn mark_sent(&self, bytes: usize) {
        self.nsent.fetch_add(1, Ordering::Relaxed);
        self.nsentb.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn mark_recv(&self, bytes: usize) {
        self.nrecv.fetch_add(1, Ordering::Relaxed);
        self.nrecvb.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Messages sent on this connection.
    pub fn nsent(&self) -> u64 {
        self.nsent.load(Ordering::Relaxed)
    }

    /// Messages delivered to handlers from this connection.
    pub fn nrecv(&self) -> u64 {
        self.nrecv.load(Ordering::Relaxed)
    }

    /// Payload bytes sent.
    pub fn nsentb(&self) -> u64 {
        self.nsentb.load(Ordering::Relaxed)
    }

    /// Payload bytes delivered.
    pub fn nrecvb(&self) -> u64 {
        self.nrecvb.load(Ordering::Relaxed)
    }
}

// ── Connection handle ───────────────────────────────────────────────────────

/// Shared handle to one live TCP connection.
pub type ConnRef = Arc<Conn>;

/// One TCP connection.
///
/// The handle may be cloned and shared freely across threads; mutation is
/// confined to the owning tasks (see module docs). `peer_id` is assigned
/// at most once, when the peer layer resolves the remote's identity.
pub struct Conn {
    id: u64,
    addr: NetAddr,
    mode: AtomicU8,
    peer_id: OnceLock<NetAddr>,
    setup_done: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    timeout_tx: mpsc::UnboundedSender<Duration>,
    cancel: CancellationToken,
    stats: ConnStats,
}

impl Conn {
    /// The remote endpoint.
    pub fn addr(&self) -> NetAddr {
        self.addr
    }

    /// Current mode.
    pub fn mode(&self) -> ConnMode {
        ConnMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_dead(&self) -> bool {
        self.mode() == ConnMode::Dead
    }

    /// The peer identity bound to this connection, once resolved.
    pub fn peer_id(&self) -> Option<NetAddr> {
        self.peer_id.get().copied()
    }

    /// Message statistics.
    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub(crate) fn assign_peer_id(&self, id: NetAddr) {
        let _ = self.peer_id.set(id);
    }

    pub(crate) fn mark_setup(&self) {
        self.setup_done.store(true, Ordering::Release);
    }

    pub(crate) fn was_setup(&self) -> bool {
        self.setup_done.load(Ordering::Acquire)
    }

    /// Transition to `Dead` and wake the I/O tasks. Returns true for the
    /// caller that performed the transition; teardown hooks run exactly
    /// once, guarded by this.
    pub(crate) fn mark_dead(&self) -> bool {
        let prev = self.mode.swap(MODE_DEAD, Ordering::AcqRel);
        if prev != MODE_DEAD {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Reset the reader's inactivity deadline. No-op once the reader is
    /// gone.
    pub(crate) fn reset_timeout(&self, after: Duration) {
        let _ = self.timeout_tx.send(after);
    }

    pub(crate) fn send_bytes(&self, bytes: Bytes) {
        let _ = self.outbound_tx.send(bytes);
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode() {
            ConnMode::Active => "active",
            ConnMode::Passive => "passive",
            ConnMode::Dead => "dead",
        };
        write!(f, "conn #{} ({}) {}", self.id, mode, self.addr)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

/// Lifecycle and control events the pool delivers to the dispatcher.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// TCP is up and I/O tasks are running.
    Setup(ConnRef),
    /// The connection's I/O has ended (EOF, error, deadline, or cancel).
    Disconnected(ConnRef),
    /// A reserved-opcode frame (peer-layer control traffic).
    Ctrl(ConnRef, Msg),
}

struct ConnChannels {
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    timeout_rx: mpsc::UnboundedReceiver<Duration>,
}

/// The connection pool: accepts and originates TCP connections and runs
/// their I/O tasks on the library's worker runtime.
///
/// Cheap to clone; clones share the same counters and channels.
#[derive(Clone)]
pub(crate) struct ConnPool {
    cfg: NetConfig,
    rt: Handle,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    user_tx: mpsc::Sender<UserEvent>,
    reserved: Option<(Opcode, Opcode)>,
    next_id: Arc<AtomicU64>,
}

impl ConnPool {
    pub fn new(
        cfg: NetConfig,
        rt: Handle,
        events_tx: mpsc::UnboundedSender<PoolEvent>,
        user_tx: mpsc::Sender<UserEvent>,
        reserved: Option<(Opcode, Opcode)>,
    ) -> Self {
        Self {
            cfg,
            rt,
            events_tx,
            user_tx,
            reserved,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn is_reserved(&self, opcode: Opcode) -> bool {
        matches!(self.reserved, Some((a, b)) if opcode == a || opcode == b)
    }

    fn make_conn(&self, addr: NetAddr, mode: ConnMode) -> (ConnRef, ConnChannels) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Conn {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            addr,
            mode: AtomicU8::new(mode.as_u8()),
            peer_id: OnceLock::new(),
            setup_done: AtomicBool::new(false),
            outbound_tx,
            timeout_tx,
            cancel: CancellationToken::new(),
            stats: ConnStats::default(),
        });
        (
            conn,
            ConnChannels {
                outbound_rx,
                timeout_rx,
            },
        )
    }

    fn start_io(
        &self,
        conn: ConnRef,
        ch: ConnChannels,
        stream: TcpStream,
        initial_deadline: Option<Duration>,
    ) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        // Setup goes first so the dispatcher sees it before any control
        // frame the reader decodes.
        let _ = self.events_tx.send(PoolEvent::Setup(conn.clone()));
        self.rt.spawn(reader_loop(
            self.clone(),
            conn.clone(),
            read_half,
            ch.timeout_rx,
            initial_deadline,
        ));
        self.rt
            .spawn(writer_loop(self.clone(), conn, write_half, ch.outbound_rx));
    }

    /// Bind and start accepting. Returns the actual bound address (useful
    /// when the caller asked for port 0) and the accept task's handle.
    pub async fn listen(&self, addr: NetAddr) -> Result<(NetAddr, JoinHandle<()>)> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr.socket_addr())?;
        let listener = socket.listen(self.cfg.max_listen_backlog)?;
        let local = NetAddr::from(listener.local_addr()?);
        info!("listening on {}", local);

        let pool = self.clone();
        let handle = self.rt.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, sa)) => {
                        let (conn, ch) = pool.make_conn(NetAddr::from(sa), ConnMode::Passive);
                        debug!("accepted {}", conn);
                        pool.start_io(conn, ch, stream, pool.cfg.conn_server_timeout);
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                    }
                }
            }
        });
        Ok((local, handle))
    }

    /// Originate a connection. The handle is returned immediately so the
    /// caller can bind it (peer layer); TCP is resolved in the background
    /// and failure follows the normal teardown path.
    pub fn connect(&self, addr: NetAddr) -> ConnRef {
        let (conn, ch) = self.make_conn(addr, ConnMode::Active);
        debug!("connecting {}", conn);
        let pool = self.clone();
        let c = conn.clone();
        self.rt.spawn(async move {
            match TcpStream::connect(addr.socket_addr()).await {
                Ok(stream) if !c.is_dead() => pool.start_io(c, ch, stream, None),
                Ok(_) => {} // terminated while connecting; teardown already ran
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    let _ = pool.events_tx.send(PoolEvent::Disconnected(c));
                }
            }
        });
        conn
    }
}

// ── I/O tasks ───────────────────────────────────────────────────────────────

// Deadline used while no timeout is armed.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

async fn reader_loop(
    pool: ConnPool,
    conn: ConnRef,
    mut read: OwnedReadHalf,
    mut timeout_rx: mpsc::UnboundedReceiver<Duration>,
    initial_deadline: Option<Duration>,
) {
    let mut buf = BytesMut::with_capacity(pool.cfg.seg_buff_size);
    let mut decoder = MsgDecoder::new(pool.cfg.max_payload_size);
    let deadline = sleep_until(Instant::now() + FAR_FUTURE);
    tokio::pin!(deadline);
    let mut armed = false;
    if let Some(d) = initial_deadline {
        deadline.as_mut().reset(Instant::now() + d);
        armed = true;
    }

    loop {
        if buf.capacity() == buf.len() {
            buf.reserve(pool.cfg.seg_buff_size);
        }
        tokio::select! {
            _ = conn.cancelled() => break,
            reset = timeout_rx.recv() => match reset {
                Some(d) => {
                    deadline.as_mut().reset(Instant::now() + d);
                    armed = true;
                    debug!("reset timeout on {} to {:?}", conn, d);
                }
                None => break,
            },
            _ = deadline.as_mut(), if armed => {
                info!("{} timed out", conn);
                break;
            }
            r = read.read_buf(&mut buf) => match r {
                Ok(0) => {
                    debug!("{} closed by remote", conn);
                    break;
                }
                Ok(_) => {
                    if !drain_frames(&pool, &conn, &mut decoder, &mut buf).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("read error on {}: {}", conn, e);
                    break;
                }
            }
        }
    }
    let _ = pool.events_tx.send(PoolEvent::Disconnected(conn));
}

/// Decode and route every complete frame in `buf`. Returns false when the
/// connection must be terminated.
async fn drain_frames(
    pool: &ConnPool,
    conn: &ConnRef,
    decoder: &mut MsgDecoder,
    buf: &mut BytesMut,
) -> bool {
    loop {
        match decoder.decode(buf) {
            Ok(Some(msg)) => {
                if pool.is_reserved(msg.opcode()) {
                    if pool
                        .events_tx
                        .send(PoolEvent::Ctrl(conn.clone(), msg))
                        .is_err()
                    {
                        return false;
                    }
                } else if pool
                    .user_tx
                    .send(UserEvent::Msg(msg, conn.clone()))
                    .await
                    .is_err()
                {
                    // Network stopped; no one is listening anymore.
                    return false;
                }
            }
            Ok(None) => return true,
            Err(NetError::ChecksumMismatch { expected, actual }) => {
                warn!(
                    "checksum mismatch on {} ({:#010x} != {:#010x}), dropping message",
                    conn, actual, expected
                );
            }
            Err(e) => {
                warn!("protocol fault on {}: {}", conn, e);
                return false;
            }
        }
    }
}

async fn writer_loop(
    pool: ConnPool,
    conn: ConnRef,
    mut write: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            item = outbound_rx.recv() => match item {
                Some(bytes) => {
                    if let Err(e) = write.write_all(&bytes).await {
                        warn!("write error on {}: {}", conn, e);
                        let _ = pool.events_tx.send(PoolEvent::Disconnected(conn.clone()));
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = write.shutdown().await;
}

// ── Tests ───────────────────────────────────────────────────────────────────
