//! Listener wiring
//!
//! Binds the chat, transfer, admin and WebSocket listeners, starts the
//! `ChatServer` actor and runs one accept loop per listener until asked to
//! stop. The chat and WebSocket listeners are gated on capacity: a
//! connection accepted while the server is full is closed before any
//! handshake.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chat_log::ChatLog;
use crate::config::{ConfigError, ServerConfig};
use crate::error::AppError;
use crate::handler::{handle_connection, handle_relay_connection};
use crate::server::{ChatServer, ServerCommand, ServerContext};
use crate::ws_handler::handle_ws_connection;

/// How long `run_until` waits for sessions to drain after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: String,
        source: std::io::Error,
    },
}

struct Listener {
    name: &'static str,
    inner: TcpListener,
    addr: SocketAddr,
}

impl Listener {
    async fn bind(name: &'static str, addr: &str) -> Result<Self, StartupError> {
        let bind_err = |source| StartupError::Bind {
            name,
            addr: addr.to_string(),
            source,
        };
        let inner = TcpListener::bind(addr).await.map_err(bind_err)?;
        let addr = inner.local_addr().map_err(bind_err)?;
        info!("{} listener on {}", name, addr);
        Ok(Self { name, inner, addr })
    }
}

/// A bound server that has not started accepting yet
pub struct ServerRuntime {
    ctx: ServerContext,
    actor: JoinHandle<()>,
    chat: Listener,
    transfer: Listener,
    admin: Listener,
    ws: Listener,
}

impl ServerRuntime {
    /// Validate `config`, bind every listener and start the actor
    pub async fn bind(
        config: ServerConfig,
        chat_log: Arc<dyn ChatLog>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let chat = Listener::bind("chat", &config.chat_addr).await?;
        let transfer = Listener::bind("transfer", &config.transfer_addr).await?;
        let admin = Listener::bind("admin", &config.admin_addr).await?;
        let ws = Listener::bind("websocket", &config.ws_addr).await?;

        let (server, ctx) = ChatServer::new(Arc::new(config), chat_log);
        let actor = tokio::spawn(server.run());

        Ok(Self {
            ctx,
            actor,
            chat,
            transfer,
            admin,
            ws,
        })
    }

    pub fn chat_addr(&self) -> SocketAddr {
        self.chat.addr
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer.addr
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin.addr
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws.addr
    }

    pub fn context(&self) -> ServerContext {
        self.ctx.clone()
    }

    /// Accept connections until `stop` resolves or an admin shuts down
    ///
    /// Then broadcasts the farewell, disconnects every session and waits
    /// (bounded) for the actor to finish.
    pub async fn run_until<F>(self, stop: F)
    where
        F: Future<Output = ()>,
    {
        let Self {
            ctx,
            actor,
            chat,
            transfer,
            admin,
            ws,
        } = self;
        let mut shutdown = ctx.shutdown_signal();

        let accepting = async {
            tokio::join!(
                accept_loop(chat, ctx.clone(), true, handle_connection),
                accept_loop(ws, ctx.clone(), true, handle_ws_connection),
                accept_loop(admin, ctx.clone(), false, handle_connection),
                accept_loop(transfer, ctx.clone(), false, handle_relay_connection),
            )
        };

        tokio::select! {
            _ = accepting => {}
            _ = stop => info!("Shutdown requested"),
            _ = shutdown.wait_for(|stopping| *stopping) => info!("Shutdown by admin"),
        }

        let _ = ctx
            .send(ServerCommand::Shutdown {
                reason: "Server shutting down".to_string(),
            })
            .await;
        // The actor exits once every context clone is gone
        drop(ctx);
        if tokio::time::timeout(DRAIN_TIMEOUT, actor).await.is_err() {
            warn!("Sessions did not drain within {:?}", DRAIN_TIMEOUT);
        }
        info!("Server stopped");
    }
}

async fn accept_loop<H, Fut>(listener: Listener, ctx: ServerContext, gated: bool, handler: H)
where
    H: Fn(TcpStream, ServerContext) -> Fut,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    let name = listener.name;
    loop {
        match listener.inner.accept().await {
            Ok((stream, addr)) => {
                if gated && ctx.at_capacity() {
                    info!("Refusing {} connection from {}: server is full", name, addr);
                    drop(stream);
                    continue;
                }
                let task = handler(stream, ctx.clone());
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        error!("{} connection from {} failed: {}", name, addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept {} connection: {}", name, e);
            }
        }
    }
}
