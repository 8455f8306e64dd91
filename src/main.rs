//! Chat relay server - Entry Point
//!
//! Loads the configuration, binds every listener and serves until Ctrl-C.

use std::env;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{ServerConfig, ServerRuntime, TracingChatLog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to control log level, e.g. RUST_LOG=debug or
    // RUST_LOG=chat_relay=trace,chat_log=info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info,chat_log=info")),
        )
        .init();

    // Optional JSON config file as the first argument
    let config = match env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(Path::new(&path))?,
        None => ServerConfig::default(),
    };

    let runtime = match ServerRuntime::bind(config, Arc::new(TracingChatLog)).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Chat relay ready (chat {}, transfer {}, admin {}, websocket {})",
        runtime.chat_addr(),
        runtime.transfer_addr(),
        runtime.admin_addr(),
        runtime.ws_addr()
    );

    runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}
