//! Client library
//!
//! What a GUI or CLI front end builds on: connect, log in, send envelopes,
//! and receive everything the server sends on an mpsc channel. File
//! transfers run through a `FileTransferCoordinator` whose mirror is kept
//! current by the reader task before each envelope is handed out, so by
//! the time the application sees an ACCEPT the coordinator has too.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec;
use crate::error::{AppError, AuthError};
use crate::handler::write_lines;
use crate::message::{Envelope, MessageType};
use crate::transfer::relay::open_stream;
use crate::transfer::{
    DestinationLocks, FileOffer, FileTransferCoordinator, ProgressSink, StreamRole,
    TransferDecision, TransferStatus,
};
use crate::types::FileId;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Incoming files land in `<download_dir>/<username>/`
    pub download_dir: PathBuf,
    pub buffer_size: usize,
    pub max_file_size: u64,
    pub max_line: usize,
    pub channel_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            buffer_size: 8192,
            max_file_size: 100 * 1024 * 1024,
            max_line: 16 * 1024,
            channel_capacity: 64,
        }
    }
}

/// A connected socket that has not logged in yet
pub struct ClientConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    transfer_addr: SocketAddr,
    options: ClientOptions,
}

impl ClientConnection {
    /// Send LOGIN and wait for the verdict
    ///
    /// Returns the client and the receiver of every later envelope.
    pub async fn login(
        mut self,
        username: &str,
    ) -> Result<(ChatClient, mpsc::Receiver<Envelope>), AppError> {
        let login = Envelope::new(MessageType::Login, username).with_content(username);
        codec::write_envelope(&mut self.writer, &login).await?;

        let reply = codec::read_envelope(&mut self.reader, self.options.max_line)
            .await?
            .ok_or_else(|| AuthError::Rejected("connection closed".to_string()))?;
        if reply.kind != MessageType::Success {
            return Err(AuthError::Rejected(reply.content_str().to_string()).into());
        }
        debug!("Logged in as {}", username);

        let (outbound, outbound_rx) = mpsc::channel(self.options.channel_capacity);
        let (events_tx, events) = mpsc::channel(self.options.channel_capacity);
        let coordinator = Arc::new(FileTransferCoordinator::new(
            username,
            &self.options.download_dir,
            self.options.buffer_size,
            self.options.max_file_size,
            Arc::new(DestinationLocks::new()),
            outbound.clone(),
        ));

        let writer_task = tokio::spawn(write_lines(self.writer, outbound_rx));
        let reader_task = tokio::spawn(read_events(
            self.reader,
            self.options.max_line,
            coordinator.clone(),
            events_tx,
        ));

        let client = ChatClient {
            username: username.to_string(),
            outbound,
            coordinator,
            transfer_addr: self.transfer_addr,
            max_line: self.options.max_line,
            writer_task,
            reader_task,
        };
        Ok((client, events))
    }
}

async fn read_events(
    mut reader: BufReader<OwnedReadHalf>,
    max_line: usize,
    coordinator: Arc<FileTransferCoordinator>,
    events: mpsc::Sender<Envelope>,
) {
    loop {
        match codec::read_envelope(&mut reader, max_line).await {
            Ok(Some(envelope)) => {
                if envelope.kind.is_file_transfer() {
                    coordinator.observe(&envelope);
                }
                if events.send(envelope).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Client read failed: {}", e);
                break;
            }
        }
    }
}

/// A logged-in chat client
pub struct ChatClient {
    username: String,
    outbound: mpsc::Sender<Envelope>,
    coordinator: Arc<FileTransferCoordinator>,
    transfer_addr: SocketAddr,
    max_line: usize,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl ChatClient {
    pub async fn connect(
        chat_addr: SocketAddr,
        transfer_addr: SocketAddr,
        options: ClientOptions,
    ) -> Result<ClientConnection, AppError> {
        let (read_half, writer) = TcpStream::connect(chat_addr).await?.into_split();
        Ok(ClientConnection {
            reader: BufReader::new(read_half),
            writer,
            transfer_addr,
            options,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn download_dir(&self) -> &Path {
        self.coordinator.download_dir()
    }

    /// Queue an envelope; the sender is always this client's name
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), AppError> {
        envelope.sender = self.username.clone();
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    pub async fn broadcast(&self, text: &str) -> Result<(), AppError> {
        self.send(Envelope::new(MessageType::Broadcast, "").with_content(text))
            .await
    }

    pub async fn private(&self, to: &str, text: &str) -> Result<(), AppError> {
        self.send(Envelope::private("", to, text)).await
    }

    /// Offer a local file to `receiver`
    pub async fn offer_file(&self, receiver: &str, path: &Path) -> Result<FileId, AppError> {
        Ok(self.coordinator.request(receiver, path).await?)
    }

    /// Consult `decision` about an incoming offer and reply ACCEPT or REJECT
    pub async fn answer_offer(
        &self,
        offer: &FileOffer,
        decision: &dyn TransferDecision,
    ) -> Result<bool, AppError> {
        Ok(self.coordinator.answer(offer, decision).await?)
    }

    /// Stream an offer the receiver accepted
    ///
    /// Waits on the relay until the receiver has attached too.
    pub async fn send_accepted(
        &self,
        file_id: FileId,
        progress: &dyn ProgressSink,
    ) -> Result<(), AppError> {
        let mut stream = open_stream(
            self.transfer_addr,
            &self.username,
            file_id,
            StreamRole::Send,
            self.max_line,
        )
        .await?;
        self.coordinator
            .send_stream(file_id, &mut stream, progress)
            .await?;
        Ok(())
    }

    /// Receive an offer this client accepted; returns the written path
    pub async fn receive_accepted(
        &self,
        file_id: FileId,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, AppError> {
        let mut stream = open_stream(
            self.transfer_addr,
            &self.username,
            file_id,
            StreamRole::Receive,
            self.max_line,
        )
        .await?;
        Ok(self
            .coordinator
            .receive_stream(file_id, &mut stream, progress)
            .await?)
    }

    pub fn cancel_transfer(&self, file_id: FileId) -> bool {
        self.coordinator.cancel(file_id)
    }

    pub fn transfer_status(&self, file_id: FileId) -> Option<TransferStatus> {
        self.coordinator.status(file_id)
    }

    /// Send LOGOUT and wait until it is written
    pub async fn logout(self) -> Result<(), AppError> {
        let result = self.send(Envelope::new(MessageType::Logout, "")).await;
        let ChatClient {
            outbound,
            coordinator,
            writer_task,
            reader_task,
            ..
        } = self;
        // The writer stops once every sender is gone, including the
        // coordinator's clones held here and by the reader task
        reader_task.abort();
        drop(coordinator);
        drop(outbound);
        let _ = writer_task.await;
        result
    }
}
