//! Multi-client chat and file-relay server
//!
//! Clients log in with a unique username and exchange broadcast and
//! private messages, relayed through a central server that keeps a
//! bounded chat history. Files move between two online users over a
//! dedicated relay connection after an offer/accept handshake. A
//! WebSocket binding (handshake and framing written by hand) exposes the
//! same chat semantics to browsers, and a separate admin listener offers
//! user listing, history, stats, announcements, kicks and shutdown.
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning the registry, router and
//!   transfer table
//! - Each connection runs a reader loop that talks to the actor through
//!   `ServerContext`, plus a writer task draining its outbound channel
//! - Relay pipes run in their own tasks once both ends have attached
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use chat_relay::{ServerConfig, ServerRuntime, TracingChatLog};
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = ServerRuntime::bind(ServerConfig::default(), Arc::new(TracingChatLog))
//!         .await
//!         .unwrap();
//!     runtime.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! }
//! ```

pub mod admin;
pub mod chat_log;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod history;
pub mod message;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod server;
pub mod session;
pub mod transfer;
pub mod types;
pub mod websocket;
pub mod ws_handler;
pub mod ws_message;

// Re-export main types for convenience
pub use chat_log::{ChatLog, TracingChatLog};
pub use client::{ChatClient, ClientConnection, ClientOptions};
pub use config::{AdminCredentials, ConfigError, ServerConfig};
pub use error::{AppError, AuthError, FileTransferError, ProtocolError, RouteError};
pub use message::{Envelope, MessageType};
pub use runtime::{ServerRuntime, StartupError};
pub use server::{ChatServer, ServerCommand, ServerContext};
pub use types::{FileId, SessionId};
