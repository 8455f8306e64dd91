//! WebSocket payload grammar
//!
//! Each text frame carries one flat JSON object whose values are all
//! strings, for example
//! `{"type":"PRIVATE","sender":"alice","content":"hi","targetUser":"bob"}`.
//!
//! Escaping follows JSON string rules exactly (`\"`, `\\`, `\n`, `\uXXXX`
//! and so on), so embedded quotes and newlines are unambiguous. Only the
//! keys `type`, `sender`, `content` and `targetUser` are accepted; nested
//! values, non-string values and unknown keys are rejected.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::{Envelope, MessageType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        rename = "targetUser",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_user: Option<String>,
}

impl WsMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Convert to an envelope; the sender is left as the client claimed it
    /// and is overwritten by the connection handler after login.
    pub fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        let kind: MessageType = self.kind.parse()?;
        let mut envelope = Envelope::new(kind, self.sender.unwrap_or_default());
        envelope.content = self.content;
        envelope.receiver = self.target_user.filter(|t| !t.is_empty());
        Ok(envelope)
    }
}

impl From<&Envelope> for WsMessage {
    fn from(envelope: &Envelope) -> Self {
        Self {
            kind: envelope.kind.as_str().to_string(),
            sender: Some(envelope.sender.clone()),
            content: envelope.content.clone(),
            target_user: envelope.receiver().map(str::to_string),
        }
    }
}
