//! Binary WebSocket protocol for Yjs synchronization.
//!
//! Frames use the lib0 encoding shared by y-protocols and y-websocket, so
//! existing browser clients can talk to the server unchanged:
//!
//! ```text
//! varuint message_type
//!   0 sync:      varuint sub_type, varuint8array payload
//!   1 awareness: varuint8array payload
//!   2 auth:      varuint 0 (denied), varstring reason
//!   3 query awareness (no payload)
//! ```
//!
//! A frame may carry several messages back to back.

use bytes::{BufMut, Bytes, BytesMut};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use super::bounds;

/// Maximum frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Top-level message type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, <Self as TryFrom<u64>>::Error> {
        match value {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            2 => Ok(MessageType::Auth),
            3 => Ok(MessageType::QueryAwareness),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Sync sub-message identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Step1 = 0,
    Step2 = 1,
    Update = 2,
}

impl TryFrom<u64> for SyncType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, <Self as TryFrom<u64>>::Error> {
        match value {
            0 => Ok(SyncType::Step1),
            1 => Ok(SyncType::Step2),
            2 => Ok(SyncType::Update),
            _ => Err(ProtocolError::UnknownSyncType(value)),
        }
    }
}

const AUTH_PERMISSION_DENIED: u64 = 0;

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Unknown sync message type: {0}")]
    UnknownSyncType(u64),

    #[error("Unknown auth message type: {0}")]
    UnknownAuthType(u64),

    #[error("Unexpected end of frame at byte {0}")]
    UnexpectedEnd(usize),

    #[error("Variable-length integer overflows 64 bits")]
    VarIntOverflow,

    #[error("Declared length {0} exceeds remaining {1} bytes")]
    LengthOutOfBounds(u64, usize),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Empty frame")]
    EmptyFrame,
}

/// Messages of the two-phase sync handshake and update broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// "Here is what I have" - the receiver answers with a SyncStep2
    SyncStep1(StateVector),
    /// Update closing the gap implied by a prior SyncStep1 (v1 encoded)
    SyncStep2(Vec<u8>),
    /// Unsolicited update (v1 encoded)
    Update(Vec<u8>),
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Sync(SyncMessage),
    /// Opaque awareness payload; presence is handled outside the document actor
    Awareness(Vec<u8>),
    /// Permission denied, with reason
    Auth(String),
    QueryAwareness,
}

impl Message {
    /// Encode this message into a fresh frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append this message to an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::Sync(sync) => {
                write_var_uint(buf, MessageType::Sync as u64);
                match sync {
                    SyncMessage::SyncStep1(sv) => {
                        write_var_uint(buf, SyncType::Step1 as u64);
                        write_var_buf(buf, &sv.encode_v1());
                    }
                    SyncMessage::SyncStep2(update) => {
                        write_var_uint(buf, SyncType::Step2 as u64);
                        write_var_buf(buf, update);
                    }
                    SyncMessage::Update(update) => {
                        write_var_uint(buf, SyncType::Update as u64);
                        write_var_buf(buf, update);
                    }
                }
            }
            Message::Awareness(payload) => {
                write_var_uint(buf, MessageType::Awareness as u64);
                write_var_buf(buf, payload);
            }
            Message::Auth(reason) => {
                write_var_uint(buf, MessageType::Auth as u64);
                write_var_uint(buf, AUTH_PERMISSION_DENIED);
                write_var_buf(buf, reason.as_bytes());
            }
            Message::QueryAwareness => {
                write_var_uint(buf, MessageType::QueryAwareness as u64);
            }
        }
    }
}

/// Protocol codec for encoding/decoding frames
pub struct SyncProtocol;

impl SyncProtocol {
    /// Decode every message contained in a frame.
    ///
    /// Never panics; any malformed input yields a [`ProtocolError`] and
    /// nothing from the frame is returned.
    pub fn decode_frame(data: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }

        let mut reader = FrameReader::new(data);
        let mut messages = Vec::with_capacity(1);
        while !reader.is_empty() {
            messages.push(reader.read_message()?);
        }
        Ok(messages)
    }

    /// Encode a SyncStep1 frame carrying the given state vector
    pub fn sync_step1(sv: StateVector) -> Bytes {
        Message::Sync(SyncMessage::SyncStep1(sv)).encode()
    }

    /// Encode a SyncStep2 frame carrying the given update
    pub fn sync_step2(update: Vec<u8>) -> Bytes {
        Message::Sync(SyncMessage::SyncStep2(update)).encode()
    }

    /// Encode an Update broadcast frame
    pub fn update(update: Vec<u8>) -> Bytes {
        Message::Sync(SyncMessage::Update(update)).encode()
    }
}

/// Bounds-checked lib0 reader over one frame
struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let low = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && low > 1) {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= low << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_var_buf(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_uint()?;
        let remaining = self.data.len() - self.pos;
        let len_usize = usize::try_from(len)
            .ok()
            .filter(|l| *l <= remaining)
            .ok_or(ProtocolError::LengthOutOfBounds(len, remaining))?;
        let slice = &self.data[self.pos..self.pos + len_usize];
        self.pos += len_usize;
        Ok(slice)
    }

    fn read_var_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_var_buf()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_message(&mut self) -> Result<Message, ProtocolError> {
        match MessageType::try_from(self.read_var_uint()?)? {
            MessageType::Sync => {
                let sync = match SyncType::try_from(self.read_var_uint()?)? {
                    SyncType::Step1 => {
                        let raw = self.read_var_buf()?;
                        bounds::check_state_vector(raw)
                            .map_err(|e| ProtocolError::InvalidStateVector(e.to_string()))?;
                        let sv = StateVector::decode_v1(raw)
                            .map_err(|e| ProtocolError::InvalidStateVector(e.to_string()))?;
                        SyncMessage::SyncStep1(sv)
                    }
                    SyncType::Step2 => SyncMessage::SyncStep2(self.read_var_buf()?.to_vec()),
                    SyncType::Update => SyncMessage::Update(self.read_var_buf()?.to_vec()),
                };
                Ok(Message::Sync(sync))
            }
            MessageType::Awareness => Ok(Message::Awareness(self.read_var_buf()?.to_vec())),
            MessageType::Auth => match self.read_var_uint()? {
                AUTH_PERMISSION_DENIED => Ok(Message::Auth(self.read_var_string()?)),
                other => Err(ProtocolError::UnknownAuthType(other)),
            },
            MessageType::QueryAwareness => Ok(Message::QueryAwareness),
        }
    }
}

fn write_var_uint(buf: &mut BytesMut, mut n: u64) {
    while n > 0x7f {
        buf.put_u8(0x80 | (n & 0x7f) as u8);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

fn write_var_buf(buf: &mut BytesMut, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.put_slice(data);
}
