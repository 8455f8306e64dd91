//! Persistent-logging collaborator
//!
//! The router and transfer relay report chat messages, server events and
//! file-transfer milestones here. Calls are fire-and-forget: an
//! implementation must not block and cannot fail delivery.

use tracing::info;

use crate::message::Envelope;

pub trait ChatLog: Send + Sync {
    fn log_chat_message(&self, message: &Envelope);

    fn log_server_event(&self, event: &str);

    fn log_file_transfer(&self, sender: &str, receiver: &str, filename: &str, status: &str);
}

/// Default sink: structured `tracing` events under the `chat_log` target
///
/// Route them to a file with a subscriber filter such as
/// `RUST_LOG=chat_log=info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChatLog;

impl ChatLog for TracingChatLog {
    fn log_chat_message(&self, message: &Envelope) {
        info!(
            target: "chat_log",
            kind = %message.kind,
            sender = %message.sender,
            receiver = message.receiver().unwrap_or("ALL"),
            timestamp = %message.timestamp(),
            "{}",
            message.content_str()
        );
    }

    fn log_server_event(&self, event: &str) {
        info!(target: "chat_log", "{}", event);
    }

    fn log_file_transfer(&self, sender: &str, receiver: &str, filename: &str, status: &str) {
        info!(
            target: "chat_log",
            sender,
            receiver,
            filename,
            status,
            "file transfer"
        );
    }
}
