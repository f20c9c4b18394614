//! Framed wire messages and the per-connection frame decoder.
//!
//! Every byte sequence on a connection is a stream of frames:
//!
//! ```text
//! [1 byte: opcode] [4 bytes: payload length, u32-le] [4 bytes: checksum, u32-le] [N bytes: payload]
//! ```
//!
//! The checksum is a pure function of the payload (the first four bytes of
//! its SHA-256 digest). A frame whose checksum does not match is dropped
//! with a warning and the connection stays up; a lone corruption does not
//! cost the channel. A frame whose announced length exceeds the configured
//! cap is a transport fault and does terminate the connection.
//!
//! Typed payload bodies implement [`MsgPayload`] and are serialized with
//! bincode; the frame header itself is hand-encoded so the wire format
//! stays fixed regardless of payload schema.

use {
    crate::error::{NetError, Result},
    bytes::{Buf, BufMut, Bytes, BytesMut},
    serde::{de::DeserializeOwned, Serialize},
    sha2::{Digest, Sha256},
};

/// Opcode type parameterizing the network. One byte on the wire.
pub type Opcode = u8;

/// Size of the fixed frame header: opcode + length + checksum.
pub const HEADER_SIZE: usize = 1 + 4 + 4;

/// 32-bit checksum over a payload: the first four bytes of SHA-256,
/// little-endian.
pub fn checksum32(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

// ── Wire message ────────────────────────────────────────────────────────────

/// A framed message: opcode, checksum, and payload bytes.
///
/// The payload is reference-counted ([`Bytes`]), so cloning a message for
/// multicast does not copy the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    opcode: Opcode,
    checksum: u32,
    payload: Bytes,
}

impl Msg {
    /// Build a message from an opcode and raw payload bytes. The checksum
    /// is computed here, so a `Msg` is always internally consistent.
    pub fn new(opcode: Opcode, payload: Bytes) -> Self {
        let checksum = checksum32(&payload);
        Self {
            opcode,
            checksum,
            payload,
        }
    }

    pub(crate) fn from_parts(opcode: Opcode, checksum: u32, payload: Bytes) -> Self {
        Self {
            opcode,
            checksum,
            payload,
        }
    }

    /// The message opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The checksum carried in the header.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Recompute the payload checksum and compare with the header.
    pub fn verify_checksum(&self) -> bool {
        checksum32(&self.payload) == self.checksum
    }

    /// Serialize header + payload into a single buffer ready for the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.opcode);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(self.checksum);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

// ── Typed payloads ──────────────────────────────────────────────────────────

/// A typed message body bound to a fixed opcode.
///
/// Implementors get bincode-backed encoding for free; registering a
/// handler with [`reg_handler`](crate::MsgNetwork::reg_handler) infers the
/// decoder from the handler's argument type.
pub trait MsgPayload: Serialize + DeserializeOwned + Send + 'static {
    /// The opcode this payload type travels under.
    const OPCODE: Opcode;

    /// Serialize into a framed [`Msg`].
    fn to_msg(&self) -> Result<Msg> {
        let body = bincode::serialize(self)?;
        Ok(Msg::new(Self::OPCODE, Bytes::from(body)))
    }

    /// Decode a payload of this type from a received message.
    fn from_msg(msg: &Msg) -> Result<Self> {
        Ok(bincode::deserialize(msg.payload())?)
    }
}

// ── Frame decoder ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Payload {
        opcode: Opcode,
        len: usize,
        checksum: u32,
    },
}

/// Per-connection frame decoder.
///
/// A two-state machine: consume a header once enough bytes are buffered,
/// then consume the announced payload, then back to header. The decoder
/// is resumable and can be fed a byte at a time.
#[derive(Debug)]
pub struct MsgDecoder {
    max_payload: usize,
    state: DecodeState,
}

impl MsgDecoder {
    /// Create a decoder enforcing the given payload size cap.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            state: DecodeState::Header,
        }
    }

    /// Try to pull the next complete frame out of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A
    /// [`NetError::ChecksumMismatch`] consumes the bad frame and leaves the
    /// decoder ready for the next one; a [`NetError::PayloadTooLarge`] means
    /// the stream cannot be trusted any further.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Msg>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let opcode = buf.get_u8();
                    let len = buf.get_u32_le() as usize;
                    let checksum = buf.get_u32_le();
                    if len > self.max_payload {
                        return Err(NetError::PayloadTooLarge {
                            size: len,
                            max: self.max_payload,
                        });
                    }
                    self.state = DecodeState::Payload {
                        opcode,
                        len,
                        checksum,
                    };
                }
                DecodeState::Payload {
                    opcode,
                    len,
                    checksum,
                } => {
                    if buf.len() < len {
                        return Ok(None);
                    }
                    let payload = buf.split_to(len).freeze();
                    self.state = DecodeState::Header;
                    let actual = checksum32(&payload);
                    if actual != checksum {
                        return Err(NetError::ChecksumMismatch {
                            expected: checksum,
                            actual,
                        });
                    }
                    return Ok(Some(Msg::from_parts(opcode, checksum, payload)));
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
