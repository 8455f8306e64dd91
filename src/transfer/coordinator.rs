//! Endpoint-side file transfer coordinator
//!
//! One instance per logged-in client. Outgoing transfers are owned here;
//! incoming ones are mirrored from the envelopes this client receives, so
//! the two sides only agree through the message sequence and may briefly
//! disagree about a transfer's state.
//!
//! Control envelopes (REQUEST, ACCEPT/REJECT, METADATA, COMPLETE, FILE_ERROR)
//! go out through the `notices` channel; the byte stream is read from or
//! written to whatever relay stream the caller hands in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{FileTransferError, ProtocolError};
use crate::message::{Envelope, MessageType};
use crate::transfer::naming::{sanitize_filename, DestinationLocks};
use crate::transfer::state::{FileTransferSession, TransferEvent, TransferStatus};
use crate::types::FileId;

/// Receives progress updates as `(file_id, percent, bytes, total)`
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, file_id: FileId, percent: u8, bytes: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(FileId, u8, u64, u64) + Send + Sync,
{
    fn on_progress(&self, file_id: FileId, percent: u8, bytes: u64, total: u64) {
        self(file_id, percent, bytes, total)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _: FileId, _: u8, _: u64, _: u64) {}
}

/// Cooperative cancellation, checked at every chunk boundary
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An incoming FILE_TRANSFER_REQUEST as the receiver sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub file_id: FileId,
    pub sender: String,
    pub filename: String,
    pub file_size: u64,
}

impl FileOffer {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if envelope.kind != MessageType::FileTransferRequest {
            return Err(ProtocolError::Unexpected(envelope.kind));
        }
        let missing = |field| ProtocolError::InvalidField {
            field,
            reason: "missing".to_string(),
        };
        Ok(Self {
            file_id: envelope.file_id.ok_or_else(|| missing("fileId"))?,
            sender: envelope.sender.clone(),
            filename: envelope.filename.clone().ok_or_else(|| missing("filename"))?,
            file_size: envelope.file_size.ok_or_else(|| missing("fileSize"))?,
        })
    }
}

/// The accept/reject decision source (a UI prompt, a policy, a test)
pub trait TransferDecision: Send + Sync {
    fn decide(&self, offer: &FileOffer) -> bool;
}

impl<F> TransferDecision for F
where
    F: Fn(&FileOffer) -> bool + Send + Sync,
{
    fn decide(&self, offer: &FileOffer) -> bool {
        self(offer)
    }
}

#[derive(Debug)]
struct Tracked {
    session: FileTransferSession,
    /// Local file for outgoing transfers
    source: Option<PathBuf>,
    cancel: CancelFlag,
}

impl Tracked {
    fn is_outgoing(&self) -> bool {
        self.source.is_some()
    }
}

pub struct FileTransferCoordinator {
    username: String,
    download_dir: PathBuf,
    buffer_size: usize,
    max_file_size: u64,
    locks: Arc<DestinationLocks>,
    notices: mpsc::Sender<Envelope>,
    transfers: Mutex<HashMap<FileId, Tracked>>,
}

impl FileTransferCoordinator {
    /// Incoming files land in `<download_root>/<username>/`
    pub fn new(
        username: impl Into<String>,
        download_root: &Path,
        buffer_size: usize,
        max_file_size: u64,
        locks: Arc<DestinationLocks>,
        notices: mpsc::Sender<Envelope>,
    ) -> Self {
        let username = username.into();
        Self {
            download_dir: download_root.join(&username),
            username,
            buffer_size: buffer_size.max(1),
            max_file_size,
            locks,
            notices,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FileId, Tracked>> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a live transfer; terminal transfers are dropped after
    fn with_transfer<T>(
        &self,
        id: FileId,
        f: impl FnOnce(&mut Tracked) -> Result<T, FileTransferError>,
    ) -> Result<T, FileTransferError> {
        let mut transfers = self.lock();
        let tracked = transfers
            .get_mut(&id)
            .ok_or(FileTransferError::UnknownTransfer(id))?;
        let result = f(tracked);
        if tracked.session.status().is_terminal() {
            transfers.remove(&id);
        }
        result
    }

    async fn notify(&self, envelope: Envelope) -> Result<(), FileTransferError> {
        self.notices
            .send(envelope)
            .await
            .map_err(|_| FileTransferError::Disconnected)
    }

    /// Status of a live transfer; `None` once it reached a terminal state
    pub fn status(&self, id: FileId) -> Option<TransferStatus> {
        self.lock().get(&id).map(|t| t.session.status())
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// Ask a running stream to stop at the next chunk boundary
    pub fn cancel(&self, id: FileId) -> bool {
        match self.lock().get(&id) {
            Some(tracked) => {
                tracked.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Offer `path` to `receiver` (sends FILE_TRANSFER_REQUEST)
    pub async fn request(&self, receiver: &str, path: &Path) -> Result<FileId, FileTransferError> {
        let meta = fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(FileTransferError::InvalidFilename(path.display().to_string()));
        }
        let size = meta.len();
        if size > self.max_file_size {
            return Err(FileTransferError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        let raw_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FileTransferError::InvalidFilename(path.display().to_string()))?;
        let filename = sanitize_filename(raw_name)?;

        let file_id = FileId::new();
        let session = FileTransferSession::new(file_id, &self.username, receiver, &filename, size);
        self.lock().insert(
            file_id,
            Tracked {
                session,
                source: Some(path.to_path_buf()),
                cancel: CancelFlag::new(),
            },
        );

        let request = Envelope::new(MessageType::FileTransferRequest, &self.username)
            .to(receiver)
            .with_file(&filename, size)
            .with_file_id(file_id);
        if let Err(e) = self.notify(request).await {
            self.lock().remove(&file_id);
            return Err(e);
        }
        info!("Offered {} ({} bytes) to {} as {}", filename, size, receiver, file_id);
        Ok(file_id)
    }

    /// Consult `decision` and send ACCEPT or REJECT for `offer`
    ///
    /// Returns whether the offer was accepted.
    pub async fn answer(
        &self,
        offer: &FileOffer,
        decision: &dyn TransferDecision,
    ) -> Result<bool, FileTransferError> {
        let accepted = offer.file_size <= self.max_file_size && decision.decide(offer);
        let event = if accepted {
            TransferEvent::Accept
        } else {
            TransferEvent::Reject
        };
        self.with_transfer(offer.file_id, |t| t.session.apply(event))?;

        let kind = if accepted {
            MessageType::FileTransferAccept
        } else {
            MessageType::FileTransferReject
        };
        let reply = Envelope::new(kind, &self.username)
            .to(&offer.sender)
            .with_file(&offer.filename, offer.file_size)
            .with_file_id(offer.file_id);
        self.notify(reply).await?;
        Ok(accepted)
    }

    /// Update local state from a received file-transfer envelope
    ///
    /// Returns the resulting status, or `None` when the envelope does not
    /// concern a transfer this side knows about.
    pub fn observe(&self, envelope: &Envelope) -> Option<TransferStatus> {
        let id = envelope.file_id?;
        match envelope.kind {
            MessageType::FileTransferRequest => {
                let offer = FileOffer::from_envelope(envelope).ok()?;
                let session = FileTransferSession::new(
                    id,
                    &offer.sender,
                    &self.username,
                    &offer.filename,
                    offer.file_size,
                );
                self.lock().insert(
                    id,
                    Tracked {
                        session,
                        source: None,
                        cancel: CancelFlag::new(),
                    },
                );
                Some(TransferStatus::Requested)
            }
            MessageType::FileTransferAccept => self.observe_event(id, TransferEvent::Accept),
            MessageType::FileTransferReject => self.observe_event(id, TransferEvent::Reject),
            MessageType::FileMetadata => self
                .with_transfer(id, |t| {
                    if envelope.file_size.is_some_and(|s| s != t.session.declared_size) {
                        return t.session.apply(TransferEvent::Fail);
                    }
                    // The relay stream may already have moved us further
                    if t.session.status() == TransferStatus::Accepted {
                        t.session.apply(TransferEvent::MetadataSent)?;
                    }
                    Ok(t.session.status())
                })
                .ok(),
            // The receiver checked the on-disk length; only that settles an
            // outgoing transfer
            MessageType::FileComplete => self
                .with_transfer(id, |t| {
                    if !t.is_outgoing() {
                        return Ok(t.session.status());
                    }
                    t.session.complete(None)?;
                    Ok(t.session.status())
                })
                .ok(),
            MessageType::FileError => {
                let flag = self.lock().get(&id).map(|t| t.cancel.clone());
                // Stop a running stream and record the failure
                if let Some(flag) = flag {
                    flag.cancel();
                }
                self.observe_event(id, TransferEvent::Fail)
            }
            _ => self.status(id),
        }
    }

    fn observe_event(&self, id: FileId, event: TransferEvent) -> Option<TransferStatus> {
        match self.with_transfer(id, |t| t.session.apply(event)) {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("Ignoring {:?} for {}: {}", event, id, e);
                None
            }
        }
    }

    /// Send an accepted transfer: METADATA, size prefix, chunks
    ///
    /// Returns once every byte is written. The transfer completes when the
    /// receiver's FILE_COMPLETE is observed.
    pub async fn send_stream<W>(
        &self,
        id: FileId,
        writer: &mut W,
        progress: &dyn ProgressSink,
    ) -> Result<(), FileTransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let (path, receiver, filename, declared, cancel) = self.with_transfer(id, |t| {
            let source = t
                .source
                .clone()
                .ok_or(FileTransferError::UnknownTransfer(id))?;
            t.session.apply(TransferEvent::MetadataSent)?;
            Ok((
                source,
                t.session.receiver.clone(),
                t.session.filename.clone(),
                t.session.declared_size,
                t.cancel.clone(),
            ))
        })?;

        let metadata = Envelope::new(MessageType::FileMetadata, &self.username)
            .to(&receiver)
            .with_file(&filename, declared)
            .with_file_id(id);

        let result = match self.notify(metadata).await {
            Ok(()) => {
                self.stream_file(id, &path, declared, &cancel, writer, progress)
                    .await
            }
            Err(e) => Err(e),
        };

        // The transfer stays open until the receiver's FILE_COMPLETE or
        // FILE_ERROR arrives through `observe`
        match result {
            Ok(()) => {
                if declared == 0 {
                    progress.on_progress(id, 100, 0, 0);
                }
                info!("Sent {} to {} ({} bytes)", filename, receiver, declared);
                Ok(())
            }
            Err(e) => {
                self.abort(id, &receiver, &e).await;
                Err(e)
            }
        }
    }

    async fn stream_file<W>(
        &self,
        id: FileId,
        path: &Path,
        declared: u64,
        cancel: &CancelFlag,
        writer: &mut W,
        progress: &dyn ProgressSink,
    ) -> Result<(), FileTransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut file = File::open(path).await?;
        writer.write_all(&declared.to_be_bytes()).await?;

        let mut buf = vec![0u8; self.buffer_size];
        let mut sent = 0u64;
        while sent < declared {
            if cancel.is_cancelled() {
                return Err(FileTransferError::Cancelled);
            }
            let want = (declared - sent).min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                // The source shrank after it was offered
                return Err(FileTransferError::UnexpectedEof {
                    expected: declared,
                    received: sent,
                });
            }
            // Counted before the write, so a confirmation can never overtake it
            let percent = self.with_transfer(id, |t| t.session.record_bytes(n as u64))?;
            writer.write_all(&buf[..n]).await?;
            sent += n as u64;
            progress.on_progress(id, percent, sent, declared);
        }
        writer.flush().await?;
        Ok(())
    }

    /// Receive an accepted transfer into the download directory
    ///
    /// The size prefix is checked against the declared size before any file
    /// is created. Returns the path actually written.
    pub async fn receive_stream<R>(
        &self,
        id: FileId,
        reader: &mut R,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, FileTransferError>
    where
        R: AsyncRead + Unpin,
    {
        let (sender, filename, declared, cancel) = self.with_transfer(id, |t| {
            if t.is_outgoing() {
                return Err(FileTransferError::UnknownTransfer(id));
            }
            match t.session.status() {
                TransferStatus::Accepted | TransferStatus::MetadataSent => Ok((
                    t.session.sender.clone(),
                    t.session.filename.clone(),
                    t.session.declared_size,
                    t.cancel.clone(),
                )),
                from => Err(FileTransferError::InvalidTransition {
                    from,
                    event: TransferEvent::BytesStarted,
                }),
            }
        })?;

        match self
            .receive_into(id, &filename, declared, &cancel, reader, progress)
            .await
        {
            Ok(path) => {
                info!("Received {} from {} into {}", filename, sender, path.display());
                let complete = Envelope::new(MessageType::FileComplete, &self.username)
                    .to(&sender)
                    .with_content(format!("{} received successfully", filename))
                    .with_file(&filename, declared)
                    .with_file_id(id);
                if self.notify(complete).await.is_err() {
                    warn!("Could not confirm {} to {}", id, sender);
                }
                Ok(path)
            }
            Err(e) => {
                self.abort(id, &sender, &e).await;
                Err(e)
            }
        }
    }

    async fn receive_into<R>(
        &self,
        id: FileId,
        filename: &str,
        declared: u64,
        cancel: &CancelFlag,
        reader: &mut R,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, FileTransferError>
    where
        R: AsyncRead + Unpin,
    {
        let announced = match reader.read_u64().await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FileTransferError::UnexpectedEof {
                    expected: declared,
                    received: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };
        if announced != declared {
            return Err(FileTransferError::SizeMismatch {
                declared,
                announced,
            });
        }
        self.with_transfer(id, |t| {
            if t.session.status() == TransferStatus::Accepted {
                t.session.apply(TransferEvent::MetadataSent)?;
            }
            Ok(())
        })?;

        let (path, file) = self.locks.create_unique(&self.download_dir, filename).await?;
        let mut out = BufWriter::new(file);
        let mut buf = vec![0u8; self.buffer_size];
        let mut received = 0u64;
        while received < declared {
            if cancel.is_cancelled() {
                return Err(FileTransferError::Cancelled);
            }
            let want = (declared - received).min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(FileTransferError::UnexpectedEof {
                    expected: declared,
                    received,
                });
            }
            out.write_all(&buf[..n]).await?;
            received += n as u64;
            let percent = self.with_transfer(id, |t| t.session.record_bytes(n as u64))?;
            progress.on_progress(id, percent, received, declared);
        }
        out.flush().await?;
        let file = out.into_inner();
        file.sync_all().await?;
        drop(file);

        let on_disk = fs::metadata(&path).await?.len();
        self.with_transfer(id, |t| t.session.complete(Some(on_disk)))?;
        if declared == 0 {
            progress.on_progress(id, 100, 0, 0);
        }
        Ok(path)
    }

    /// Mark a transfer failed or cancelled and tell the peer
    ///
    /// Partially written files are left on disk.
    async fn abort(&self, id: FileId, peer: &str, err: &FileTransferError) {
        let event = match err {
            FileTransferError::Cancelled => TransferEvent::Cancel,
            _ => TransferEvent::Fail,
        };
        let _ = self.with_transfer(id, |t| t.session.apply(event));
        warn!("Transfer {} with {} stopped: {}", id, peer, err);

        let notice = Envelope::new(MessageType::FileError, &self.username)
            .to(peer)
            .with_content(err.to_string())
            .with_file_id(id);
        if self.notify(notice).await.is_err() {
            debug!("Could not notify {} about {}", peer, id);
        }
    }
}
