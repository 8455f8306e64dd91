//! Session struct definition
//!
//! Represents one authenticated connection with its identity, role and
//! outbound message channel.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::SendError;
use crate::message::Envelope;
use crate::types::{Role, SessionId, Transport};

/// Per-connection resources handed to the server at login
///
/// The connection handler keeps the matching `mpsc::Receiver` (drained by
/// its writer task) and the `oneshot::Receiver` it watches for a forced
/// disconnect.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: SessionId,
    /// Peer address or other transport description, for admin listings
    pub origin: String,
    pub transport: Transport,
    pub sender: mpsc::Sender<Envelope>,
    pub kick: oneshot::Sender<()>,
}

/// One authenticated, currently connected identity
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub role: Role,
    pub origin: String,
    pub transport: Transport,
    pub connected_at: DateTime<Utc>,
    /// Server → client message channel
    sender: mpsc::Sender<Envelope>,
    kick: Option<oneshot::Sender<()>>,
}

impl Session {
    pub fn new(username: String, role: Role, handle: ConnectionHandle) -> Self {
        Self {
            id: handle.id,
            username,
            role,
            origin: handle.origin,
            transport: handle.transport,
            connected_at: Utc::now(),
            sender: handle.sender,
            kick: Some(handle.kick),
        }
    }

    /// Queue a message for this session without waiting
    ///
    /// Fails if the connection is gone or its queue is full; either way the
    /// caller treats the session as unreachable.
    pub fn send(&self, msg: Envelope) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// False once the connection's writer has gone away
    pub fn is_online(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Force the owning connection handler to stop reading and clean up
    ///
    /// Messages already queued are still written before the socket closes.
    pub fn disconnect(&mut self) {
        if let Some(kick) = self.kick.take() {
            let _ = kick.send(());
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> (
    ConnectionHandle,
    mpsc::Receiver<Envelope>,
    oneshot::Receiver<()>,
) {
    let (tx, rx) = mpsc::channel(32);
    let (kick_tx, kick_rx) = oneshot::channel();
    let handle = ConnectionHandle {
        id: SessionId::new(),
        origin: "test".to_string(),
        transport: Transport::Socket,
        sender: tx,
        kick: kick_tx,
    };
    (handle, rx, kick_rx)
}
