//! Admin channel
//!
//! Credential check, command parsing and the JSON snapshots sent back to
//! admin sessions. The commands themselves run inside the `ChatServer`
//! actor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AdminCredentials;
use crate::error::{AuthError, ProtocolError};
use crate::message::{Envelope, MessageType};

/// Check `username:password` against the configured pair
///
/// Returns the admin username on an exact match.
pub fn authenticate(presented: &str, credentials: &AdminCredentials) -> Result<String, AuthError> {
    match presented.split_once(':') {
        Some((user, pass)) if user == credentials.username && pass == credentials.password => {
            Ok(user.to_string())
        }
        _ => Err(AuthError::BadCredentials),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    ListUsers,
    /// Most recent `limit` entries, everything when `None`
    GetHistory {
        limit: Option<usize>,
    },
    GetStats,
    Announce(String),
    Kick(String),
    Shutdown,
    Logout,
}

impl AdminCommand {
    pub fn parse(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let content = envelope.content_str().trim();
        let command = match envelope.kind {
            MessageType::AdminListUsers => AdminCommand::ListUsers,
            MessageType::AdminGetHistory => {
                let limit = if content.is_empty() {
                    None
                } else {
                    Some(content.parse().map_err(|_| ProtocolError::InvalidField {
                        field: "content",
                        reason: format!("history limit '{}' is not a number", content),
                    })?)
                };
                AdminCommand::GetHistory { limit }
            }
            MessageType::AdminGetStats => AdminCommand::GetStats,
            MessageType::AdminAnnounce if !content.is_empty() => {
                AdminCommand::Announce(content.to_string())
            }
            MessageType::AdminKick if !content.is_empty() => AdminCommand::Kick(content.to_string()),
            MessageType::AdminAnnounce | MessageType::AdminKick => {
                return Err(ProtocolError::InvalidField {
                    field: "content",
                    reason: "must not be empty".to_string(),
                })
            }
            MessageType::AdminShutdown => AdminCommand::Shutdown,
            MessageType::Logout => AdminCommand::Logout,
            other => return Err(ProtocolError::Unexpected(other)),
        };
        Ok(command)
    }
}

/// One row of ADMIN_USER_LIST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub username: String,
    pub origin: String,
    pub connected_at: DateTime<Utc>,
}

/// ADMIN_STATS payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub online_users: usize,
    pub max_clients: usize,
    pub connected_admins: usize,
    pub messages_routed: u64,
    pub file_transfers: u64,
    pub active_transfers: usize,
    pub uptime_secs: u64,
    pub uptime: String,
    pub started_at: DateTime<Utc>,
}

/// `3725` → `1h 2m 5s`
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn json_reply<T: Serialize + ?Sized>(
    kind: MessageType,
    payload: &T,
) -> Result<Envelope, serde_json::Error> {
    Ok(Envelope::server(kind, serde_json::to_string(payload)?))
}

pub fn user_list_envelope(users: &[UserSummary]) -> Result<Envelope, serde_json::Error> {
    json_reply(MessageType::AdminUserList, users)
}

pub fn history_envelope(history: &[Envelope]) -> Result<Envelope, serde_json::Error> {
    json_reply(MessageType::AdminHistory, history)
}

pub fn stats_envelope(stats: &AdminStats) -> Result<Envelope, serde_json::Error> {
    json_reply(MessageType::AdminStats, stats)
}

/// Server-wide announcement as delivered to every session
pub fn announcement(text: impl Into<String>) -> Envelope {
    Envelope::server(MessageType::Announcement, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> AdminCredentials {
        AdminCredentials {
            username: "admin".into(),
            password: "pa:ss".into(),
        }
    }

    #[test]
    fn test_authenticate_exact_match() {
        assert_eq!(authenticate("admin:pa:ss", &creds()).unwrap(), "admin");
        assert_eq!(
            authenticate("admin:pa", &creds()),
            Err(AuthError::BadCredentials)
        );
        assert_eq!(authenticate("admin", &creds()), Err(AuthError::BadCredentials));
        assert_eq!(
            authenticate("Admin:pa:ss", &creds()),
            Err(AuthError::BadCredentials)
        );
    }

    #[test]
    fn test_parse_commands() {
        let history = Envelope::new(MessageType::AdminGetHistory, "admin").with_content("20");
        assert_eq!(
            AdminCommand::parse(&history).unwrap(),
            AdminCommand::GetHistory { limit: Some(20) }
        );

        let all = Envelope::new(MessageType::AdminGetHistory, "admin");
        assert_eq!(
            AdminCommand::parse(&all).unwrap(),
            AdminCommand::GetHistory { limit: None }
        );

        let kick = Envelope::new(MessageType::AdminKick, "admin").with_content(" bob ");
        assert_eq!(
            AdminCommand::parse(&kick).unwrap(),
            AdminCommand::Kick("bob".into())
        );

        let bad_limit = Envelope::new(MessageType::AdminGetHistory, "admin").with_content("lots");
        assert!(AdminCommand::parse(&bad_limit).is_err());

        let empty_kick = Envelope::new(MessageType::AdminKick, "admin");
        assert!(AdminCommand::parse(&empty_kick).is_err());

        assert_eq!(
            AdminCommand::parse(&Envelope::broadcast("admin", "hi")),
            Err(ProtocolError::Unexpected(MessageType::Broadcast))
        );
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(3_725), "1h 2m 5s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn test_user_list_payload() {
        let users = vec![UserSummary {
            username: "alice".into(),
            origin: "127.0.0.1:5555".into(),
            connected_at: Utc::now(),
        }];
        let env = user_list_envelope(&users).unwrap();
        assert_eq!(env.kind, MessageType::AdminUserList);
        let parsed: Vec<UserSummary> = serde_json::from_str(env.content_str()).unwrap();
        assert_eq!(parsed, users);
    }
}
