//! ChatServer actor implementation
//!
//! The central actor that owns all shared state: the session registry, the
//! router with its chat history, and the file-transfer table. Connection
//! handlers talk to it through `ServerContext`, sending `ServerCommand`s
//! over an mpsc channel and receiving replies on oneshot channels, so
//! every state change runs to completion before the next one starts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::admin::{self, AdminCommand, AdminStats, UserSummary};
use crate::chat_log::ChatLog;
use crate::codec;
use crate::config::ServerConfig;
use crate::error::{AppError, AuthError, ProtocolError, RegisterError, RouteError};
use crate::message::{Envelope, MessageType};
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;
use crate::session::ConnectionHandle;
use crate::transfer::relay::{pipe, StreamRole, TransferTable};
use crate::types::{validate_username, FileId, SessionId, SERVER_NAME};

/// A relay data connection after its FILE_STREAM line was read
pub type RelayStream = BufReader<TcpStream>;

const COMMAND_CAPACITY: usize = 256;

/// Commands sent from handlers to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Register a standard session; replies with the accepted username
    Login {
        username: String,
        handle: ConnectionHandle,
        reply: oneshot::Sender<Result<String, AppError>>,
    },
    /// Authenticate and register an admin session
    AdminLogin {
        credentials: String,
        handle: ConnectionHandle,
        reply: oneshot::Sender<Result<String, AppError>>,
    },
    /// A standard session's connection ended (idempotent)
    Disconnect { username: String, id: SessionId },
    /// An admin session's connection ended
    AdminDisconnect { id: SessionId },
    /// An envelope read from a standard session
    Route {
        username: String,
        id: SessionId,
        envelope: Envelope,
    },
    /// An envelope read from an admin session
    Admin { id: SessionId, envelope: Envelope },
    /// A relay data connection identified itself
    AttachStream {
        file_id: FileId,
        username: String,
        role: StreamRole,
        stream: RelayStream,
    },
    /// Broadcast a farewell and disconnect everyone
    Shutdown { reason: String },
}

/// Handle given to every connection handler
#[derive(Debug, Clone)]
pub struct ServerContext {
    commands: mpsc::Sender<ServerCommand>,
    pub config: Arc<ServerConfig>,
    online: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl ServerContext {
    pub async fn send(&self, cmd: ServerCommand) -> Result<(), AppError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    /// Send a command carrying a reply channel and wait for the answer
    pub async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Registered standard sessions, as last published by the actor
    pub fn online(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }

    /// Capacity gate applied before any handshake
    pub fn at_capacity(&self) -> bool {
        self.online() >= self.config.max_clients
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// The main ChatServer actor
pub struct ChatServer {
    registry: SessionRegistry,
    router: MessageRouter,
    transfers: TransferTable<RelayStream>,
    config: Arc<ServerConfig>,
    chat_log: Arc<dyn ChatLog>,
    online: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    started_at: DateTime<Utc>,
    file_transfers: u64,
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    pub fn new(config: Arc<ServerConfig>, chat_log: Arc<dyn ChatLog>) -> (Self, ServerContext) {
        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let online = Arc::new(AtomicUsize::new(0));

        let server = Self {
            registry: SessionRegistry::new(config.max_clients),
            router: MessageRouter::new(config.max_history_size),
            transfers: TransferTable::new(config.max_file_size),
            config: config.clone(),
            chat_log,
            online: online.clone(),
            shutdown,
            started_at: Utc::now(),
            file_transfers: 0,
            receiver,
        };
        let ctx = ServerContext {
            commands,
            config,
            online,
            shutdown: shutdown_rx,
        };
        (server, ctx)
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are
    /// dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");
        self.chat_log.log_server_event("Server started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer stopped");
        self.chat_log.log_server_event("Server stopped");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Login {
                username,
                handle,
                reply,
            } => {
                let result = self.handle_login(username, handle);
                let _ = reply.send(result);
            }
            ServerCommand::AdminLogin {
                credentials,
                handle,
                reply,
            } => {
                let result = self.handle_admin_login(&credentials, handle);
                let _ = reply.send(result);
            }
            ServerCommand::Disconnect { username, id } => {
                if self.registry.unregister(&username, id).is_some() {
                    self.after_departure(username);
                }
            }
            ServerCommand::AdminDisconnect { id } => {
                if let Some(session) = self.registry.unregister_admin(id) {
                    info!("Admin {} disconnected", session.username);
                    self.chat_log
                        .log_server_event(&format!("Admin {} disconnected", session.username));
                }
            }
            ServerCommand::Route {
                username,
                id,
                envelope,
            } => {
                // Ignore envelopes queued by a session that was kicked meanwhile
                if self.registry.lookup(&username).map(|s| s.id) != Some(id) {
                    debug!("Dropping {} from stale session of {}", envelope.kind, username);
                    return;
                }
                if let Err(e) = self.handle_route(&username, envelope) {
                    self.reply_to(&username, e.into());
                }
            }
            ServerCommand::Admin { id, envelope } => {
                if let Err(e) = self.handle_admin(id, envelope) {
                    self.reply_to_admin(id, e.into());
                }
            }
            ServerCommand::AttachStream {
                file_id,
                username,
                role,
                stream,
            } => {
                self.handle_attach(file_id, &username, role, stream);
            }
            ServerCommand::Shutdown { reason } => {
                self.handle_shutdown(&reason);
            }
        }
    }

    fn publish_online(&self) {
        self.online.store(self.registry.len(), Ordering::SeqCst);
    }

    fn handle_login(
        &mut self,
        requested: String,
        handle: ConnectionHandle,
    ) -> Result<String, AppError> {
        if self.shutting_down() {
            return Err(RegisterError::ShuttingDown.into());
        }
        let username = validate_username(&requested, self.config.max_username_length)?;
        let origin = handle.origin.clone();
        self.registry.register(username.clone(), handle)?;
        // Published before the welcome so the accept gate never lags a client
        self.publish_online();
        if let Some(session) = self.registry.lookup(&username) {
            let _ = session.send(Envelope::success(format!("Welcome to the chat, {}!", username)));
        }

        info!("{} logged in from {} ({} online)", username, origin, self.registry.len());
        self.chat_log
            .log_server_event(&format!("User {} connected from {}", username, origin));

        let joined = Envelope::server(
            MessageType::UserJoined,
            format!("{} has joined the chat", username),
        );
        let mut failed = MessageRouter::deliver_all(&self.registry, &joined);
        failed.extend(MessageRouter::deliver_all(&self.registry, &self.user_list()));
        self.evict(failed);
        Ok(username)
    }

    fn handle_admin_login(
        &mut self,
        credentials: &str,
        handle: ConnectionHandle,
    ) -> Result<String, AppError> {
        if self.shutting_down() {
            return Err(AuthError::Unavailable.into());
        }
        let username = match admin::authenticate(credentials, &self.config.admin) {
            Ok(name) => name,
            Err(e) => {
                warn!("Failed admin login from {}", handle.origin);
                self.chat_log
                    .log_server_event(&format!("Failed admin login from {}", handle.origin));
                return Err(e.into());
            }
        };

        let origin = handle.origin.clone();
        let id = self.registry.register_admin(username.clone(), handle);
        info!("Admin {} authenticated from {}", username, origin);
        self.chat_log
            .log_server_event(&format!("Admin {} connected from {}", username, origin));

        let greeting = Envelope::server(
            MessageType::AdminAuthSuccess,
            "Admin authentication successful",
        );
        let snapshots = [
            Ok(greeting),
            admin::user_list_envelope(&self.user_summaries()),
            admin::history_envelope(&self.router.history().recent(None)),
            admin::stats_envelope(&self.stats()),
        ];
        for envelope in snapshots {
            self.reply_to_admin(id, envelope?);
        }
        Ok(username)
    }

    /// Run one envelope from a logged-in standard session
    fn handle_route(&mut self, username: &str, envelope: Envelope) -> Result<(), AppError> {
        match envelope.kind {
            MessageType::Broadcast => {
                if envelope.receiver().is_some() {
                    return Err(ProtocolError::BroadcastWithReceiver.into());
                }
                self.check_length(&envelope)?;
                self.chat_log.log_chat_message(&envelope);
                let failed = self.router.route_broadcast(&self.registry, envelope);
                self.evict(failed);
                Ok(())
            }
            MessageType::Private => {
                self.check_length(&envelope)?;
                match self.router.route_private(&self.registry, envelope.clone()) {
                    Ok(()) => {
                        self.chat_log.log_chat_message(&envelope);
                        Ok(())
                    }
                    Err(RouteError::Offline(target)) => {
                        // A session that vanished or stalled mid-delivery still
                        // needs its cleanup
                        if self.registry.lookup(&target).is_some() {
                            self.evict(vec![target.clone()]);
                        }
                        Err(RouteError::Offline(target).into())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            MessageType::Ping => {
                self.reply_to(username, Envelope::server(MessageType::Pong, "PONG"));
                Ok(())
            }
            MessageType::UserList => {
                let list = self.user_list();
                self.reply_to(username, list);
                Ok(())
            }
            kind if kind.is_file_transfer() => self.handle_file(username, envelope),
            other => Err(ProtocolError::Unexpected(other).into()),
        }
    }

    fn check_length(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let max = self.config.max_message_length;
        if envelope.content_str().chars().count() > max {
            return Err(ProtocolError::MessageTooLong(max));
        }
        Ok(())
    }

    /// Mirror the transfer control flow and forward to the peer
    fn handle_file(&mut self, username: &str, envelope: Envelope) -> Result<(), AppError> {
        let (session, peer, status) = match envelope.kind {
            MessageType::FileTransferRequest => {
                let target = envelope
                    .receiver()
                    .ok_or(ProtocolError::InvalidRecipient)?
                    .to_string();
                let refusal = match self.registry.lookup(&target) {
                    None => Some(format!("user '{}' is not online", target)),
                    Some(s) if !s.transport.carries_files() => {
                        Some(format!("user '{}' cannot receive files over WebSocket", target))
                    }
                    Some(_) => None,
                };
                if let Some(reason) = refusal {
                    let notice = Envelope::server(MessageType::FileError, reason);
                    let notice = match envelope.file_id {
                        Some(id) => notice.with_file_id(id),
                        None => notice,
                    };
                    self.reply_to(username, notice);
                    return Ok(());
                }
                let session = self.transfers.register(&envelope)?.clone();
                let peer = session.receiver.clone();
                (session, peer, "REQUESTED")
            }
            MessageType::FileTransferAccept => {
                let session = self.transfers.answer(&envelope, true)?;
                let peer = session.sender.clone();
                (session, peer, "ACCEPTED")
            }
            MessageType::FileTransferReject => {
                let session = self.transfers.answer(&envelope, false)?;
                let peer = session.sender.clone();
                (session, peer, "REJECTED")
            }
            MessageType::FileMetadata => {
                let session = self.transfers.metadata(&envelope)?;
                let peer = session.receiver.clone();
                (session, peer, "STARTED")
            }
            MessageType::FileComplete => {
                let session = self.transfers.finish(&envelope)?;
                self.file_transfers += 1;
                let peer = session.sender.clone();
                (session, peer, "COMPLETED")
            }
            MessageType::FileError => {
                let session = self.transfers.abort(&envelope)?;
                let peer = if session.sender == username {
                    session.receiver.clone()
                } else {
                    session.sender.clone()
                };
                (session, peer, "FAILED")
            }
            MessageType::FileProgress => {
                debug!(
                    "{} reports {}% for {:?}",
                    username,
                    envelope.content_str(),
                    envelope.file_id
                );
                return Ok(());
            }
            other => return Err(ProtocolError::Unexpected(other).into()),
        };

        self.chat_log
            .log_file_transfer(&session.sender, &session.receiver, &session.filename, status);

        let forwarded = envelope.to(peer.as_str());
        let delivered = self
            .registry
            .lookup(&peer)
            .map(|target| target.send(forwarded).is_ok());
        if delivered != Some(true) {
            // The peer is gone or stalled; end the transfer on this side too
            self.transfers.abort(
                &Envelope::new(MessageType::FileError, username).with_file_id(session.file_id),
            )
            .ok();
            let notice = Envelope::server(
                MessageType::FileError,
                format!("user '{}' is not online", peer),
            )
            .with_file_id(session.file_id);
            self.reply_to(username, notice);
            if delivered == Some(false) {
                self.evict(vec![peer]);
            }
        }
        Ok(())
    }

    fn handle_attach(&mut self, file_id: FileId, username: &str, role: StreamRole, stream: RelayStream) {
        match self.transfers.attach(file_id, username, role, stream) {
            Ok(None) => debug!("{} attached {} stream for {}", username, role, file_id),
            Ok(Some(pair)) => {
                info!(
                    "Relaying {} ({} bytes) from {} to {}",
                    pair.session.filename,
                    pair.session.declared_size,
                    pair.session.sender,
                    pair.session.receiver
                );
                tokio::spawn(async move {
                    let file_id = pair.session.file_id;
                    if let Err(e) = pipe(pair).await {
                        warn!("Relay for {} failed: {}", file_id, e);
                    }
                });
            }
            Err((err, mut stream)) => {
                warn!("Refused {} stream from {} for {}: {}", role, username, file_id, err);
                tokio::spawn(async move {
                    let _ = codec::write_envelope(&mut stream, &err.into()).await;
                });
            }
        }
    }

    fn handle_admin(&mut self, id: SessionId, envelope: Envelope) -> Result<(), AppError> {
        if self.registry.admin(id).is_none() {
            return Ok(());
        }
        let reply = match AdminCommand::parse(&envelope)? {
            AdminCommand::ListUsers => admin::user_list_envelope(&self.user_summaries())?,
            AdminCommand::GetHistory { limit } => {
                admin::history_envelope(&self.router.history().recent(limit))?
            }
            AdminCommand::GetStats => admin::stats_envelope(&self.stats())?,
            AdminCommand::Announce(text) => {
                let announcement = admin::announcement(text);
                self.chat_log.log_chat_message(&announcement);
                let failed = self.router.route_broadcast(&self.registry, announcement);
                self.evict(failed);
                Envelope::success("Announcement sent")
            }
            AdminCommand::Kick(target) => self.kick(&target),
            AdminCommand::Shutdown => {
                self.reply_to_admin(id, Envelope::success("Server is shutting down"));
                self.handle_shutdown("Server is shutting down by admin request");
                return Ok(());
            }
            // The connection handler ends the session itself
            AdminCommand::Logout => return Ok(()),
        };
        self.reply_to_admin(id, reply);
        Ok(())
    }

    fn kick(&mut self, target: &str) -> Envelope {
        let Some(mut session) = self.registry.remove(target) else {
            return Envelope::error(format!("User {} not found", target));
        };
        let _ = session.send(admin::announcement(
            "You have been kicked from the server by admin",
        ));
        session.disconnect();
        drop(session);

        info!("{} was kicked by admin", target);
        self.chat_log
            .log_server_event(&format!("User {} was kicked by admin", target));
        self.after_departure(target.to_string());
        Envelope::success(format!("User {} has been kicked", target))
    }

    fn handle_shutdown(&mut self, reason: &str) {
        if self.shutting_down() {
            return;
        }
        info!("Shutting down: {}", reason);
        self.chat_log.log_server_event(reason);
        let _ = self.shutdown.send(true);

        let farewell = admin::announcement("Server is shutting down. Goodbye!");
        for mut session in self.registry.drain() {
            let _ = session.send(farewell.clone());
            session.disconnect();
        }
        self.transfers.clear();
        self.publish_online();
    }

    /// Remove sessions whose delivery failed, notifying the rest
    fn evict(&mut self, mut pending: Vec<String>) {
        while let Some(username) = pending.pop() {
            let Some(mut session) = self.registry.remove(&username) else {
                continue;
            };
            debug!("Evicting unreachable session {}", username);
            session.disconnect();
            drop(session);
            pending.extend(self.notify_departure(&username));
        }
        self.publish_online();
    }

    fn after_departure(&mut self, username: String) {
        let failed = self.notify_departure(&username);
        self.evict(failed);
    }

    /// USER_LEFT, USER_LIST and transfer cleanup for a removed session
    ///
    /// Returns usernames whose delivery failed.
    fn notify_departure(&mut self, username: &str) -> Vec<String> {
        self.publish_online();
        info!("{} left ({} online)", username, self.registry.len());
        self.chat_log
            .log_server_event(&format!("User {} disconnected", username));

        let mut failed = Vec::new();
        for session in self.transfers.drop_user(username) {
            let peer = if session.sender == username {
                &session.receiver
            } else {
                &session.sender
            };
            self.chat_log.log_file_transfer(
                &session.sender,
                &session.receiver,
                &session.filename,
                "FAILED",
            );
            if let Some(target) = self.registry.lookup(peer) {
                let notice = Envelope::server(
                    MessageType::FileError,
                    format!("{} disconnected", username),
                )
                .to(peer.as_str())
                .with_file_id(session.file_id);
                if target.send(notice).is_err() {
                    failed.push(peer.clone());
                }
            }
        }

        let left = Envelope::server(
            MessageType::UserLeft,
            format!("{} has left the chat", username),
        );
        failed.extend(MessageRouter::deliver_all(&self.registry, &left));
        failed.extend(MessageRouter::deliver_all(&self.registry, &self.user_list()));
        failed
    }

    fn user_list(&self) -> Envelope {
        let names = self.registry.online_users();
        let content = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
        Envelope::new(MessageType::UserList, SERVER_NAME).with_content(content)
    }

    fn user_summaries(&self) -> Vec<UserSummary> {
        self.registry
            .sessions()
            .map(|s| UserSummary {
                username: s.username.clone(),
                origin: s.origin.clone(),
                connected_at: s.connected_at,
            })
            .collect()
    }

    fn stats(&self) -> AdminStats {
        let uptime_secs = (Utc::now() - self.started_at).num_seconds().max(0) as u64;
        AdminStats {
            online_users: self.registry.len(),
            max_clients: self.config.max_clients,
            connected_admins: self.registry.admin_count(),
            messages_routed: self.router.messages_routed(),
            file_transfers: self.file_transfers,
            active_transfers: self.transfers.len(),
            uptime_secs,
            uptime: admin::format_uptime(uptime_secs),
            started_at: self.started_at,
        }
    }

    fn reply_to(&mut self, username: &str, envelope: Envelope) {
        let failed = match self.registry.lookup(username) {
            Some(session) => session.send(envelope).is_err(),
            None => false,
        };
        if failed {
            self.evict(vec![username.to_string()]);
        }
    }

    fn reply_to_admin(&mut self, id: SessionId, envelope: Envelope) {
        let failed = match self.registry.admin(id) {
            Some(session) => session.send(envelope).is_err(),
            None => false,
        };
        if failed {
            if let Some(mut session) = self.registry.unregister_admin(id) {
                session.disconnect();
            }
        }
    }
}
