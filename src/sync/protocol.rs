//! Binary WebSocket protocol for CRDT synchronization.
//!
//! Frame layout: `[version:u8][type:u8][len:u24][bincode payload]`. CRDT
//! updates travel as raw Automerge bytes inside the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Cursor;

use super::{DocumentId, PeerId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 2;

/// Maximum message size (16MB, the u24 length limit)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Welcome = 0x02,
    Error = 0x04,

    // CRDT sync (binary payloads)
    SyncRequest = 0x10,
    Update = 0x11,

    // Awareness (cursors, selections), relayed but never persisted
    Awareness = 0x40,
    AwarenessBroadcast = 0x41,

    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x02 => Ok(MessageType::Welcome),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::SyncRequest),
            0x11 => Ok(MessageType::Update),
            0x40 => Ok(MessageType::Awareness),
            0x41 => Ok(MessageType::AwarenessBroadcast),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Code reported to the client when its frame cannot be decoded
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::VersionMismatch(_, _) => ErrorCode::VersionMismatch,
            _ => ErrorCode::InvalidMessage,
        }
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Automerge changes: a saved document or an incremental chunk
    Update { update: Vec<u8> },

    /// Ask for the full current state
    SyncRequest,

    /// Opaque awareness payload to relay to other peers
    Awareness { payload: Vec<u8> },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

impl ClientMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Update { .. } => MessageType::Update,
            ClientMessage::SyncRequest => MessageType::SyncRequest,
            ClientMessage::Awareness { .. } => MessageType::Awareness,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First message on an authenticated connection, carries the full state
    Welcome {
        protocol_version: u8,
        document_id: DocumentId,
        peer_id: PeerId,
        state: Vec<u8>,
    },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Changes to apply, relayed from a peer or produced server-side
    Update {
        update: Vec<u8>,
        /// Originating peer, `None` for server-side edits
        from_peer: Option<PeerId>,
    },

    /// Awareness payload from another peer
    Awareness { peer_id: PeerId, payload: Vec<u8> },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },
}

impl ServerMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Update { .. } => MessageType::Update,
            ServerMessage::Awareness { .. } => MessageType::AwarenessBroadcast,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidMessage = 1,
    UpdateRejected = 2,
    ServerError = 3,
    VersionMismatch = 4,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        encode_frame(msg.message_type(), msg)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        encode_frame(msg.message_type(), msg)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, msg): (_, ClientMessage) = decode_frame(data)?;
        check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, msg): (_, ServerMessage) = decode_frame(data)?;
        check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Create an error response message
    pub fn error_response(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

fn encode_frame<T: Serialize>(msg_type: MessageType, msg: &T) -> Result<Bytes, ProtocolError> {
    let payload = bincode::serialize(msg)?;

    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> Result<(MessageType, T), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat("Message too short".to_string()));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
    Ok((msg_type, bincode::deserialize(payload)?))
}

fn check_type(header: MessageType, payload: MessageType) -> Result<(), ProtocolError> {
    if header != payload {
        return Err(ProtocolError::InvalidFormat(format!(
            "Header type {:?} does not match payload {:?}",
            header, payload
        )));
    }
    Ok(())
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
