//! Error types for the chat relay
//!
//! Defines the application-level error taxonomy and the narrower errors
//! produced by the codec, registry, router and file-transfer layers.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::MessageType;
use crate::transfer::{TransferEvent, TransferStatus};
use crate::types::FileId;

/// Application-level errors
///
/// `Io` and `ChannelSend` are fatal for the connection that hit them.
/// The remaining variants are turned into typed envelopes and sent back
/// to the affected client (see `From<AppError> for Envelope`).
#[derive(Debug, Error)]
pub enum AppError {
    /// Socket or file IO error (fatal for the connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unexpected envelope
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Login or admin authentication rejected
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Registry is at `max_clients`
    #[error("server is full")]
    Capacity,

    /// Private delivery failed
    #[error("{0}")]
    Route(#[from] RouteError),

    /// File transfer failed or was cancelled
    #[error("file transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    /// Channel send error (fatal - internal channel broken)
    #[error("channel send error")]
    ChannelSend,
}

impl From<RegisterError> for AppError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::DuplicateName(name) => AppError::Auth(AuthError::DuplicateName(name)),
            RegisterError::CapacityExceeded => AppError::Capacity,
            RegisterError::ShuttingDown => AppError::Auth(AuthError::Unavailable),
        }
    }
}

/// Malformed, unknown or out-of-place messages
///
/// The session that produced one stays alive; it receives an ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("expected at least {expected} fields, got {actual}")]
    MissingFields { expected: usize, actual: usize },

    #[error("expected at most {expected} fields, got {actual}")]
    TooManyFields { expected: usize, actual: usize },

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid escape sequence in field")]
    InvalidEscape,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("message exceeds {0} characters")]
    MessageTooLong(usize),

    #[error("sender and receiver must be non-empty and different")]
    InvalidRecipient,

    #[error("broadcast must not name a receiver")]
    BroadcastWithReceiver,

    #[error("unexpected message type {0}")]
    Unexpected(MessageType),

    #[error("invalid websocket handshake: {0}")]
    Handshake(String),

    #[error("unsupported websocket opcode {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("fragmented websocket frames are not supported")]
    Fragmented,

    #[error("frame payload of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: u64, limit: usize },

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed websocket message: {0}")]
    MalformedPayload(String),
}

/// Authentication failures (the connection is closed afterwards)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("username '{0}' is already taken")]
    DuplicateName(String),

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("username exceeds {max} characters")]
    UsernameTooLong { max: usize },

    #[error("username '{0}' contains reserved characters or is reserved")]
    InvalidUsername(String),

    #[error("invalid admin credentials")]
    BadCredentials,

    #[error("server is shutting down")]
    Unavailable,

    /// Rejection reported by the server, as seen from the client library
    #[error("login rejected: {0}")]
    Rejected(String),
}

/// Registration rejections from `SessionRegistry::register`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("username '{0}' is already registered")]
    DuplicateName(String),

    #[error("registry is at capacity")]
    CapacityExceeded,

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Private message delivery failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("user '{0}' is not online")]
    Offline(String),

    #[error(transparent)]
    Invalid(#[from] ProtocolError),
}

/// File transfer failures
#[derive(Debug, Error)]
pub enum FileTransferError {
    #[error("announced size {announced} does not match declared size {declared}")]
    SizeMismatch { declared: u64, announced: u64 },

    #[error("stream ended after {received} of {expected} bytes")]
    UnexpectedEof { expected: u64, received: u64 },

    #[error("file on disk is {actual} bytes, expected {expected}")]
    DiskSizeMismatch { expected: u64, actual: u64 },

    #[error("file of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("invalid file name '{0}'")]
    InvalidFilename(String),

    #[error("transfer {0} not found")]
    UnknownTransfer(FileId),

    #[error("cannot apply {event:?} to a transfer in state {from:?}")]
    InvalidTransition {
        from: TransferStatus,
        event: TransferEvent,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer refused by relay: {0}")]
    Relay(String),

    #[error("control connection closed")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("channel closed")]
    ChannelClosed,

    /// The session stopped draining its queue
    #[error("outbound queue full")]
    Full,
}

impl From<SendError> for AppError {
    fn from(_: SendError) -> Self {
        AppError::ChannelSend
    }
}
