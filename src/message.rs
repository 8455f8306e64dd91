//! Message envelope definitions
//!
//! One tagged `MessageType` plus a single `Envelope` struct carrying the
//! typed fields every transport shares. The text-socket codec and the
//! WebSocket key-value binding both translate to and from this type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AuthError, FileTransferError, ProtocolError};
use crate::types::{FileId, SERVER_NAME};

/// Envelope type tag
///
/// The wire name of each variant is its SCREAMING_SNAKE_CASE spelling,
/// shared by the text codec, the WebSocket binding and JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Login,
    Logout,
    Broadcast,
    Private,
    UserJoined,
    UserLeft,
    UserList,
    FileTransferRequest,
    FileTransferAccept,
    FileTransferReject,
    FileMetadata,
    FileComplete,
    FileError,
    FileProgress,
    /// First line on a transfer relay connection
    FileStream,
    Announcement,
    AdminLogin,
    AdminAuthSuccess,
    AdminAuthFailed,
    AdminListUsers,
    AdminUserList,
    AdminGetHistory,
    AdminHistory,
    AdminGetStats,
    AdminStats,
    AdminAnnounce,
    AdminKick,
    AdminShutdown,
    Error,
    Info,
    Success,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Login => "LOGIN",
            MessageType::Logout => "LOGOUT",
            MessageType::Broadcast => "BROADCAST",
            MessageType::Private => "PRIVATE",
            MessageType::UserJoined => "USER_JOINED",
            MessageType::UserLeft => "USER_LEFT",
            MessageType::UserList => "USER_LIST",
            MessageType::FileTransferRequest => "FILE_TRANSFER_REQUEST",
            MessageType::FileTransferAccept => "FILE_TRANSFER_ACCEPT",
            MessageType::FileTransferReject => "FILE_TRANSFER_REJECT",
            MessageType::FileMetadata => "FILE_METADATA",
            MessageType::FileComplete => "FILE_COMPLETE",
            MessageType::FileError => "FILE_ERROR",
            MessageType::FileProgress => "FILE_PROGRESS",
            MessageType::FileStream => "FILE_STREAM",
            MessageType::Announcement => "ANNOUNCEMENT",
            MessageType::AdminLogin => "ADMIN_LOGIN",
            MessageType::AdminAuthSuccess => "ADMIN_AUTH_SUCCESS",
            MessageType::AdminAuthFailed => "ADMIN_AUTH_FAILED",
            MessageType::AdminListUsers => "ADMIN_LIST_USERS",
            MessageType::AdminUserList => "ADMIN_USER_LIST",
            MessageType::AdminGetHistory => "ADMIN_GET_HISTORY",
            MessageType::AdminHistory => "ADMIN_HISTORY",
            MessageType::AdminGetStats => "ADMIN_GET_STATS",
            MessageType::AdminStats => "ADMIN_STATS",
            MessageType::AdminAnnounce => "ADMIN_ANNOUNCE",
            MessageType::AdminKick => "ADMIN_KICK",
            MessageType::AdminShutdown => "ADMIN_SHUTDOWN",
            MessageType::Error => "ERROR",
            MessageType::Info => "INFO",
            MessageType::Success => "SUCCESS",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }

    /// Control envelopes of the file-transfer state machine
    pub fn is_file_transfer(self) -> bool {
        matches!(
            self,
            MessageType::FileTransferRequest
                | MessageType::FileTransferAccept
                | MessageType::FileTransferReject
                | MessageType::FileMetadata
                | MessageType::FileComplete
                | MessageType::FileError
                | MessageType::FileProgress
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "LOGIN" => MessageType::Login,
            "LOGOUT" => MessageType::Logout,
            "BROADCAST" => MessageType::Broadcast,
            "PRIVATE" => MessageType::Private,
            "USER_JOINED" => MessageType::UserJoined,
            "USER_LEFT" => MessageType::UserLeft,
            "USER_LIST" => MessageType::UserList,
            "FILE_TRANSFER_REQUEST" => MessageType::FileTransferRequest,
            "FILE_TRANSFER_ACCEPT" => MessageType::FileTransferAccept,
            "FILE_TRANSFER_REJECT" => MessageType::FileTransferReject,
            "FILE_METADATA" => MessageType::FileMetadata,
            "FILE_COMPLETE" => MessageType::FileComplete,
            "FILE_ERROR" => MessageType::FileError,
            "FILE_PROGRESS" => MessageType::FileProgress,
            "FILE_STREAM" => MessageType::FileStream,
            "ANNOUNCEMENT" => MessageType::Announcement,
            "ADMIN_LOGIN" => MessageType::AdminLogin,
            "ADMIN_AUTH_SUCCESS" => MessageType::AdminAuthSuccess,
            "ADMIN_AUTH_FAILED" => MessageType::AdminAuthFailed,
            "ADMIN_LIST_USERS" => MessageType::AdminListUsers,
            "ADMIN_USER_LIST" => MessageType::AdminUserList,
            "ADMIN_GET_HISTORY" => MessageType::AdminGetHistory,
            "ADMIN_HISTORY" => MessageType::AdminHistory,
            "ADMIN_GET_STATS" => MessageType::AdminGetStats,
            "ADMIN_STATS" => MessageType::AdminStats,
            "ADMIN_ANNOUNCE" => MessageType::AdminAnnounce,
            "ADMIN_KICK" => MessageType::AdminKick,
            "ADMIN_SHUTDOWN" => MessageType::AdminShutdown,
            "ERROR" => MessageType::Error,
            "INFO" => MessageType::Info,
            "SUCCESS" => MessageType::Success,
            "PING" => MessageType::Ping,
            "PONG" => MessageType::Pong,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(kind)
    }
}

/// The unit of wire communication
///
/// `receiver == None` means broadcast semantics, `Some` means private.
/// The timestamp is fixed when the envelope is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(kind: MessageType, sender: impl Into<String>) -> Self {
        Self::with_timestamp(kind, sender, Utc::now())
    }

    pub(crate) fn with_timestamp(
        kind: MessageType,
        sender: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: None,
            content: None,
            timestamp,
            filename: None,
            file_size: None,
            file_id: None,
        }
    }

    /// Envelope originated by the server itself
    pub fn server(kind: MessageType, content: impl Into<String>) -> Self {
        Self::new(kind, SERVER_NAME).with_content(content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::server(MessageType::Error, content)
    }

    pub fn info(content: impl Into<String>) -> Self {
        Self::server(MessageType::Info, content)
    }

    pub fn success(content: impl Into<String>) -> Self {
        Self::server(MessageType::Success, content)
    }

    pub fn broadcast(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageType::Broadcast, sender).with_content(content)
    }

    pub fn private(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::Private, sender)
            .to(receiver)
            .with_content(content)
    }

    pub fn to(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_file(mut self, filename: impl Into<String>, file_size: u64) -> Self {
        self.filename = Some(filename.into());
        self.file_size = Some(file_size);
        self
    }

    pub fn with_file_id(mut self, file_id: FileId) -> Self {
        self.file_id = Some(file_id);
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Receiver name, treating an empty string like an absent one
    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref().filter(|r| !r.is_empty())
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver().is_none()
    }

    pub fn is_private(&self) -> bool {
        self.receiver().is_some()
    }
}

/// Convert AppError to an envelope for client notification
impl From<AppError> for Envelope {
    fn from(err: AppError) -> Self {
        match &err {
            AppError::Auth(AuthError::BadCredentials) => {
                Envelope::server(MessageType::AdminAuthFailed, "Invalid admin credentials")
            }
            AppError::Auth(_) | AppError::Capacity | AppError::Protocol(_) | AppError::Route(_) => {
                Envelope::error(err.to_string())
            }
            AppError::FileTransfer(FileTransferError::UnknownTransfer(id)) => {
                Envelope::server(MessageType::FileError, err.to_string()).with_file_id(*id)
            }
            AppError::FileTransfer(_) => Envelope::server(MessageType::FileError, err.to_string()),
            AppError::Json(e) => Envelope::error(format!("Invalid message format: {}", e)),
            // Fatal errors are not typically converted (connection closes)
            _ => Envelope::error("Internal error"),
        }
    }
}
