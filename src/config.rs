//! Configuration for the connection pool, message network, and peer overlay.

use std::time::Duration;

/// How peer identities are derived from connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Identity is `(ip, 0)`: every socket from a host collapses onto
    /// one peer.
    IpBased,
    /// Identity is `(ip, listening port announced in the PING)`. Needed
    /// when several peers share a host, since a connecting side's source
    /// port differs from its listening port.
    IpPortBased,
}

/// Configuration shared by all network flavors (pool + message layer).
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Worker threads for socket I/O. The library runs its own runtime
    /// with this many threads.
    pub nworker: usize,

    /// Initial receive-buffer segment per connection, in bytes.
    pub seg_buff_size: usize,

    /// Backlog passed to `listen()`.
    pub max_listen_backlog: u32,

    /// Deadline for a freshly-accepted connection to complete its initial
    /// handshake. `None` disables the deadline (the peer layer arms its
    /// own immediately).
    pub conn_server_timeout: Option<Duration>,

    /// Capacity of the bounded queue carrying decoded messages to the
    /// user dispatch loop. When full, readers park and back-pressure
    /// propagates to TCP.
    pub queue_capacity: usize,

    /// Maximum messages dispatched to handlers per user-loop wake before
    /// yielding to other tasks.
    pub burst_size: usize,

    /// Maximum accepted payload size. A frame announcing more is a
    /// transport fault and terminates the connection.
    pub max_payload_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            nworker: 2,
            seg_buff_size: 4096,
            max_listen_backlog: 128,
            conn_server_timeout: None,
            queue_capacity: 65536,
            burst_size: 1000,
            max_payload_size: 1 << 20, // 1 MiB
        }
    }
}

impl NetConfig {
    /// A config suitable for local tests: small buffers, small queue.
    pub fn dev_default() -> Self {
        Self {
            nworker: 2,
            seg_buff_size: 1024,
            max_listen_backlog: 16,
            conn_server_timeout: None,
            queue_capacity: 1024,
            burst_size: 64,
            max_payload_size: 1 << 20,
        }
    }
}

/// Configuration for the peer-to-peer overlay.
#[derive(Debug, Clone)]
pub struct PeerNetConfig {
    /// Pool and message-layer settings.
    pub net: NetConfig,

    /// Base reconnect interval. Actual delays are randomized within
    /// ±50% to avoid synchronized reconnect storms.
    pub retry_conn_delay: Duration,

    /// Base keepalive interval, randomized the same way.
    pub ping_period: Duration,

    /// Inactivity deadline: if a ping goes unanswered this long, the
    /// connection is considered dead and torn down.
    pub conn_timeout: Duration,

    /// Identity resolution policy.
    pub id_mode: IdentityMode,

    /// Keep provisional entries for inbound connections from identities
    /// that were never `add_peer`ed. When false such connections are
    /// terminated after the unknown-peer callback fires.
    pub allow_unknown_peer: bool,
}

impl Default for PeerNetConfig {
    fn default() -> Self {
        Self {
            net: NetConfig::default(),
            retry_conn_delay: Duration::from_secs(2),
            ping_period: Duration::from_secs(30),
            conn_timeout: Duration::from_secs(180),
            id_mode: IdentityMode::IpPortBased,
            allow_unknown_peer: false,
        }
    }
}

impl PeerNetConfig {
    /// A config suitable for local tests: short timers so liveness and
    /// reconnect paths run within a test's patience.
    pub fn dev_default() -> Self {
        Self {
            net: NetConfig::dev_default(),
            retry_conn_delay: Duration::from_millis(200),
            ping_period: Duration::from_millis(200),
            conn_timeout: Duration::from_secs(2),
            id_mode: IdentityMode::IpPortBased,
            allow_unknown_peer: false,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
