//! meshwire: asynchronous message-passing networking for distributed
//! protocols.
//!
//! This crate provides three layered network abstractions over framed
//! binary messages on TCP:
//!
//! - [`MsgNetwork`]: a connection pool plus opcode-dispatched message
//!   handlers; the caller manages connections explicitly.
//! - [`ClientNetwork`]: a server-side variant that indexes inbound
//!   connections by remote address and never dials out.
//! - [`PeerNetwork`]: a peer-to-peer overlay that keeps one persistent,
//!   liveness-monitored channel per declared peer, regardless of which
//!   side initiated the TCP connection.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  application handlers (user dispatch pump)      │
//!  └──────────────▲──────────────────────────────────┘
//!                 │  bounded queue (back-pressure)
//!  ┌──────────────┴──────────────────────────────────┐
//!  │  dispatcher task                                │
//!  │  • owns peer tables and connection maps         │
//!  │  • PING/PONG handshake + keepalive              │
//!  │  • serializes all sends                         │
//!  └──────┬──────────────────────────────▲───────────┘
//!         │ per-conn send queues         │ pool events
//!  ┌──────▼──────────────────────────────┴───────────┐
//!  │  connection pool (nworker runtime)              │
//!  │  • one reader + one writer task per socket      │
//!  │  • frame decode, checksum, deadlines            │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! Every frame is `opcode | length | checksum | payload`; typed payload
//! bodies implement [`MsgPayload`] and ride on bincode. All mutable
//! network state is owned by a single dispatcher task; public entry
//! points marshal to it over channels, so no user-facing call ever takes
//! a lock on connection state.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`addr`]       | `NetAddr` endpoints and peer identities |
//! | [`message`]    | Wire frames, checksums, the frame decoder, typed payloads |
//! | [`config`]     | `NetConfig` / `PeerNetConfig` defaults |
//! | [`conn`]       | TCP pool, per-connection I/O tasks, lifecycle |
//! | [`msg_net`]    | Opcode-dispatched message network |
//! | [`client_net`] | Client-server variant |
//! | [`peer_net`]   | The peer-to-peer overlay |
//! | [`error`]      | Crate-wide error enum |

pub mod addr;
pub mod client_net;
pub mod config;
pub mod conn;
pub mod error;
pub mod message;
pub mod msg_net;
pub mod peer_net;

pub use addr::NetAddr;
pub use client_net::ClientNetwork;
pub use config::{IdentityMode, NetConfig, PeerNetConfig};
pub use conn::{Conn, ConnMode, ConnRef, ConnStats};
pub use error::{NetError, Result};
pub use message::{checksum32, Msg, MsgDecoder, MsgPayload, Opcode, HEADER_SIZE};
pub use msg_net::MsgNetwork;
pub use peer_net::{PeerNetwork, OPCODE_PING, OPCODE_PONG};
