//! Error types for the network library.

use {crate::addr::NetAddr, thiserror::Error};

/// Errors that can occur in the messaging and peer layers.
#[derive(Error, Debug)]
pub enum NetError {
    /// The peer is already present in the known-peer table.
    #[error("peer already exists: {0}")]
    PeerAlreadyExists(NetAddr),

    /// The peer is not present in any peer table.
    #[error("peer does not exist: {0}")]
    PeerNotExist(NetAddr),

    /// The peer exists but has no connection bound to it yet.
    #[error("peer {0} has no live connection")]
    PeerNotConnected(NetAddr),

    /// A message arrived with an opcode no handler is registered for.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// The payload checksum did not match the header.
    #[error("checksum mismatch: header says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header.
        expected: u32,
        /// Checksum recomputed over the received payload.
        actual: u32,
    },

    /// A frame header announced a payload larger than the configured cap.
    #[error("payload too large: {size} bytes (max {max} bytes)")]
    PayloadTooLarge {
        /// Announced payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Failed to serialize or deserialize a typed payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Transport-level I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The network has been stopped; the operation cannot be completed.
    #[error("network stopped")]
    Stopped,
}

impl NetError {
    /// Whether this error is a user-recoverable condition (the library
    /// keeps running) as opposed to a transport or fatal fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NetError::PeerAlreadyExists(_)
                | NetError::PeerNotExist(_)
                | NetError::PeerNotConnected(_)
                | NetError::UnknownOpcode(_)
        )
    }
}

/// Convenience result type for network operations.
pub type Result<T> = std::result::Result<T, NetError>;
