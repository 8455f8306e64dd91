//! Connection handlers
//!
//! Handles individual client connections on the text-socket and admin
//! listeners, plus the relay data connections used for file bytes. Each
//! connection runs one reader loop (which preserves per-sender order) and
//! one writer task that drains the session's outbound channel (which
//! serializes writes to the socket).

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{AppError, ProtocolError};
use crate::message::{Envelope, MessageType};
use crate::server::{ServerCommand, ServerContext};
use crate::session::ConnectionHandle;
use crate::transfer::StreamRole;
use crate::types::{SessionId, Transport};

/// Source of decoded envelopes for one connection
pub(crate) trait EnvelopeSource {
    /// `Ok(None)` when the peer closed the connection
    async fn next_envelope(&mut self) -> Result<Option<Envelope>, AppError>;
}

/// Newline-delimited text envelopes
pub(crate) struct LineSource<R> {
    reader: R,
    max_line: usize,
}

impl<R> LineSource<R> {
    pub(crate) fn new(reader: R, max_line: usize) -> Self {
        Self { reader, max_line }
    }
}

impl<R: AsyncBufRead + Unpin> EnvelopeSource for LineSource<R> {
    async fn next_envelope(&mut self) -> Result<Option<Envelope>, AppError> {
        codec::read_envelope(&mut self.reader, self.max_line).await
    }
}

/// Errors after which the stream can no longer be trusted
pub(crate) fn is_fatal(err: &AppError) -> bool {
    match err {
        AppError::Protocol(ProtocolError::LineTooLong(_))
        | AppError::Protocol(ProtocolError::FrameTooLarge { .. }) => true,
        AppError::Protocol(_) => false,
        _ => true,
    }
}

/// Whether the peer should be told about `err` before the socket closes
fn is_reportable(err: &AppError) -> bool {
    !matches!(err, AppError::Io(_) | AppError::ChannelSend)
}

/// Write each queued envelope as one line until every sender is gone
pub(crate) async fn write_lines<W>(mut writer: W, mut outbound: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = codec::write_envelope(&mut writer, &envelope).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Handle a new connection on the chat or admin listener
pub async fn handle_connection(stream: TcpStream, ctx: ServerContext) -> Result<(), AppError> {
    let origin = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!("New TCP connection from {}", origin);

    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::channel(ctx.config.outbound_capacity);
    let writer = tokio::spawn(write_lines(write_half, outbound_rx));
    let source = LineSource::new(BufReader::new(read_half), ctx.config.max_line_len());

    serve(source, outbound, writer, ctx, origin, Transport::Socket).await
}

enum Identity {
    Standard {
        username: String,
        id: SessionId,
        kick: oneshot::Receiver<()>,
    },
    Admin {
        username: String,
        id: SessionId,
        kick: oneshot::Receiver<()>,
    },
}

/// Log in, run the session, and always clean up
///
/// Transport-independent: the text socket and the WebSocket binding both
/// end up here with their own source and writer task.
pub(crate) async fn serve<S: EnvelopeSource>(
    mut source: S,
    outbound: mpsc::Sender<Envelope>,
    writer: JoinHandle<()>,
    ctx: ServerContext,
    origin: String,
    transport: Transport,
) -> Result<(), AppError> {
    let mut shutdown = ctx.shutdown_signal();

    let identity = tokio::select! {
        identity = login(&mut source, &outbound, &ctx, &origin, transport) => identity,
        _ = shutdown.wait_for(|stopping| *stopping) => Ok(None),
    };

    let result = match identity {
        Ok(Some(identity)) => {
            run_session(&mut source, &outbound, &ctx, identity, &mut shutdown).await
        }
        Ok(None) => Ok(()),
        Err(e) if is_reportable(&e) => {
            info!("Login from {} refused: {}", origin, e);
            let _ = outbound.send(e.into()).await;
            Ok(())
        }
        Err(e) => Err(e),
    };

    // Queued envelopes are still written before the socket closes
    drop(outbound);
    let _ = writer.await;
    debug!("Connection from {} closed", origin);
    result
}

async fn login<S: EnvelopeSource>(
    source: &mut S,
    outbound: &mpsc::Sender<Envelope>,
    ctx: &ServerContext,
    origin: &str,
    transport: Transport,
) -> Result<Option<Identity>, AppError> {
    let Some(first) = source.next_envelope().await? else {
        return Ok(None);
    };

    let (kick_tx, kick) = oneshot::channel();
    let id = SessionId::new();
    let handle = ConnectionHandle {
        id,
        origin: origin.to_string(),
        transport,
        sender: outbound.clone(),
        kick: kick_tx,
    };

    match first.kind {
        MessageType::Login => {
            let requested = match first.content_str() {
                "" => first.sender.clone(),
                content => content.to_string(),
            };
            let username = ctx
                .request(|reply| ServerCommand::Login {
                    username: requested,
                    handle,
                    reply,
                })
                .await??;
            Ok(Some(Identity::Standard { username, id, kick }))
        }
        MessageType::AdminLogin => {
            let credentials = first.content_str().to_string();
            let username = ctx
                .request(|reply| ServerCommand::AdminLogin {
                    credentials,
                    handle,
                    reply,
                })
                .await??;
            Ok(Some(Identity::Admin { username, id, kick }))
        }
        other => Err(ProtocolError::Unexpected(other).into()),
    }
}

async fn run_session<S: EnvelopeSource>(
    source: &mut S,
    outbound: &mpsc::Sender<Envelope>,
    ctx: &ServerContext,
    identity: Identity,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), AppError> {
    match identity {
        Identity::Standard {
            username,
            id,
            mut kick,
        } => {
            // The authenticated name replaces whatever sender the client claimed
            let route = |mut envelope: Envelope| {
                envelope.sender = username.clone();
                ServerCommand::Route {
                    username: username.clone(),
                    id,
                    envelope,
                }
            };
            let result = read_loop(source, outbound, &mut kick, shutdown, ctx, route).await;
            // Runs on every exit path; a no-op if the server already removed us
            let _ = ctx
                .send(ServerCommand::Disconnect {
                    username: username.clone(),
                    id,
                })
                .await;
            info!("{} disconnected", username);
            result
        }
        Identity::Admin {
            username,
            id,
            mut kick,
        } => {
            let command = |mut envelope: Envelope| {
                envelope.sender = username.clone();
                ServerCommand::Admin { id, envelope }
            };
            let result = read_loop(source, outbound, &mut kick, shutdown, ctx, command).await;
            let _ = ctx.send(ServerCommand::AdminDisconnect { id }).await;
            result
        }
    }
}

/// Forward envelopes until LOGOUT, close, kick, shutdown or a fatal error
async fn read_loop<S, F>(
    source: &mut S,
    outbound: &mpsc::Sender<Envelope>,
    kick: &mut oneshot::Receiver<()>,
    shutdown: &mut watch::Receiver<bool>,
    ctx: &ServerContext,
    mut to_command: F,
) -> Result<(), AppError>
where
    S: EnvelopeSource,
    F: FnMut(Envelope) -> ServerCommand,
{
    loop {
        let next = tokio::select! {
            next = source.next_envelope() => next,
            _ = &mut *kick => return Ok(()),
            _ = shutdown.wait_for(|stopping| *stopping) => return Ok(()),
        };
        match next {
            Ok(Some(envelope)) if envelope.kind == MessageType::Logout => return Ok(()),
            Ok(Some(envelope)) => ctx.send(to_command(envelope)).await?,
            Ok(None) => return Ok(()),
            Err(e) if is_fatal(&e) => {
                if is_reportable(&e) {
                    warn!("Closing connection: {}", e);
                    let _ = outbound.send(e.into()).await;
                    return Ok(());
                }
                return Err(e);
            }
            Err(e) => {
                debug!("Rejected envelope: {}", e);
                if outbound.send(e.into()).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a relay data connection on the transfer listener
///
/// Reads the FILE_STREAM line and hands the connection to the server,
/// which pairs it with the other end or refuses it.
pub async fn handle_relay_connection(stream: TcpStream, ctx: ServerContext) -> Result<(), AppError> {
    let mut reader = BufReader::with_capacity(ctx.config.file_buffer_size, stream);
    let hello = match codec::read_envelope(&mut reader, ctx.config.max_line_len()).await {
        Ok(Some(hello)) => hello,
        Ok(None) => return Ok(()),
        Err(e) => return refuse(reader, e).await,
    };

    let parsed = match (hello.kind, hello.file_id) {
        (MessageType::FileStream, Some(file_id)) => hello
            .content_str()
            .parse::<StreamRole>()
            .map(|role| (file_id, role))
            .map_err(AppError::from),
        (MessageType::FileStream, None) => Err(ProtocolError::InvalidField {
            field: "fileId",
            reason: "missing".to_string(),
        }
        .into()),
        (other, _) => Err(ProtocolError::Unexpected(other).into()),
    };
    let (file_id, role) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => return refuse(reader, e).await,
    };

    debug!("{} opened {} stream for {}", hello.sender, role, file_id);
    ctx.send(ServerCommand::AttachStream {
        file_id,
        username: hello.sender,
        role,
        stream: reader,
    })
    .await
}

async fn refuse<W: AsyncWrite + Unpin>(mut stream: W, err: AppError) -> Result<(), AppError> {
    if is_reportable(&err) {
        let _ = codec::write_envelope(&mut stream, &Envelope::from(err)).await;
        return Ok(());
    }
    Err(err)
}
