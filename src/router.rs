//! Message router
//!
//! Delivers broadcasts and private messages to registered sessions and
//! keeps the bounded chat history. Delivery to one session never aborts
//! delivery to the others; failed recipients are returned so the caller
//! can run their disconnect path.

use tracing::debug;

use crate::error::{ProtocolError, RouteError};
use crate::history::ChatHistory;
use crate::message::Envelope;
use crate::registry::SessionRegistry;

#[derive(Debug)]
pub struct MessageRouter {
    history: ChatHistory,
    messages_routed: u64,
}

impl MessageRouter {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            history: ChatHistory::new(max_history_size),
            messages_routed: 0,
        }
    }

    /// Record in history, then deliver to every session (sender included)
    ///
    /// Returns the usernames whose delivery failed.
    pub fn route_broadcast(&mut self, registry: &SessionRegistry, msg: Envelope) -> Vec<String> {
        self.history.push(msg.clone());
        self.messages_routed += 1;
        Self::deliver_all(registry, &msg)
    }

    /// Deliver without touching history (system notices, user lists)
    ///
    /// A session whose queue is full counts as failed, so one stalled
    /// reader never holds up the others.
    pub fn deliver_all(registry: &SessionRegistry, msg: &Envelope) -> Vec<String> {
        let mut failed = Vec::new();
        for session in registry.sessions() {
            if let Err(e) = session.send(msg.clone()) {
                debug!("Delivery to {} failed: {}", session.username, e);
                failed.push(session.username.clone());
            }
        }
        failed
    }

    /// Deliver to the receiver and echo back to the sender as confirmation
    pub fn route_private(
        &mut self,
        registry: &SessionRegistry,
        msg: Envelope,
    ) -> Result<(), RouteError> {
        let receiver = match msg.receiver() {
            Some(r) if !msg.sender.is_empty() && r != msg.sender => r.to_string(),
            _ => return Err(ProtocolError::InvalidRecipient.into()),
        };

        let Some(target) = registry.lookup(&receiver) else {
            return Err(RouteError::Offline(receiver));
        };
        // A session found by lookup may already be gone or stalled
        if target.send(msg.clone()).is_err() {
            return Err(RouteError::Offline(receiver));
        }

        self.history.push(msg.clone());
        self.messages_routed += 1;

        if let Some(sender) = registry.lookup(&msg.sender) {
            let _ = sender.send(msg);
        }
        Ok(())
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Broadcast and private messages routed since startup
    pub fn messages_routed(&self) -> u64 {
        self.messages_routed
    }
}
