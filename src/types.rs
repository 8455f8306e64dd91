//! Basic type definitions for the chat relay
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: UUID-based identifier of one accepted connection
//! - `FileId`: UUID-based identifier of one file transfer attempt
//!
//! plus the session `Role`, its `Transport` and username validation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

/// Name used as sender on every server-originated envelope
pub const SERVER_NAME: &str = "SERVER";

/// Unique connection identifier (newtype pattern)
///
/// Distinguishes two sessions that held the same username at different
/// times, so a late cleanup of the old one never evicts the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique token for one file transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Standard,
    Admin,
}

/// Wire binding a session logged in over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Socket,
    /// The flat JSON payload has no file fields
    WebSocket,
}

impl Transport {
    pub fn carries_files(self) -> bool {
        self == Transport::Socket
    }
}

/// Validate and normalize a requested username
///
/// The name is trimmed; it must be non-empty, at most `max_len`
/// characters, free of control characters and of the `|` and `:`
/// separators, and must not be the reserved server name.
pub fn validate_username(raw: &str, max_len: usize) -> Result<String, AuthError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AuthError::EmptyUsername);
    }
    if name.chars().count() > max_len {
        return Err(AuthError::UsernameTooLong { max: max_len });
    }
    let reserved_char = |c: char| c.is_control() || c == '|' || c == ':';
    if name.chars().any(reserved_char) || name.eq_ignore_ascii_case(SERVER_NAME) {
        return Err(AuthError::InvalidUsername(name.to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_file_id_parse_display() {
        let id = FileId::new();
        let parsed: FileId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<FileId>().is_err());
    }

    #[test]
    fn test_username_trimmed() {
        assert_eq!(validate_username("  alice ", 20).unwrap(), "alice");
    }

    #[test]
    fn test_username_rejections() {
        assert_eq!(validate_username("   ", 20), Err(AuthError::EmptyUsername));
        assert_eq!(
            validate_username("abcdefghijk", 10),
            Err(AuthError::UsernameTooLong { max: 10 })
        );
        assert!(matches!(
            validate_username("a|b", 20),
            Err(AuthError::InvalidUsername(_))
        ));
        assert!(matches!(
            validate_username("server", 20),
            Err(AuthError::InvalidUsername(_))
        ));
        assert!(matches!(
            validate_username("tab\there", 20),
            Err(AuthError::InvalidUsername(_))
        ));
    }

    #[test]
    fn test_username_length_counts_chars() {
        // Four characters, more than four bytes
        assert!(validate_username("élan", 4).is_ok());
    }
}
