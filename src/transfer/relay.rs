//! Server-side transfer relay
//!
//! The server mirrors each transfer's control flow in a `TransferTable`
//! and pairs the two data connections that attach to it. Each end opens
//! its own connection to the transfer listener and identifies itself with
//! one FILE_STREAM line (`sender` = username, `content` = `send` or
//! `receive`, `fileId`). When both ends of an accepted transfer are
//! present, both get a SUCCESS line and exactly `8 + declaredSize` bytes
//! are piped from sender to receiver.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::codec;
use crate::error::{AppError, FileTransferError, ProtocolError};
use crate::message::{Envelope, MessageType};
use crate::transfer::naming::sanitize_filename;
use crate::transfer::state::{FileTransferSession, TransferEvent, TransferStatus};
use crate::types::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Send,
    Receive,
}

impl StreamRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamRole::Send => "send",
            StreamRole::Receive => "receive",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(StreamRole::Send),
            "receive" => Ok(StreamRole::Receive),
            other => Err(ProtocolError::InvalidField {
                field: "content",
                reason: format!("expected 'send' or 'receive', got '{}'", other),
            }),
        }
    }
}

/// Data connections attached to one transfer so far
#[derive(Debug)]
enum Slot<S> {
    Empty,
    Parked(StreamRole, S),
    /// Both ends were handed to `pipe`
    Streaming,
}

#[derive(Debug)]
struct RelayEntry<S> {
    session: FileTransferSession,
    slot: Slot<S>,
}

/// Both data connections of one transfer, ready to pipe
#[derive(Debug)]
pub struct RelayPair<S> {
    pub session: FileTransferSession,
    pub sender: S,
    pub receiver: S,
}

/// Live transfers known to the server, keyed by file id
#[derive(Debug)]
pub struct TransferTable<S> {
    entries: HashMap<FileId, RelayEntry<S>>,
    max_file_size: u64,
}

fn missing(field: &'static str) -> ProtocolError {
    ProtocolError::InvalidField {
        field,
        reason: "missing".to_string(),
    }
}

impl<S> TransferTable<S> {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_file_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: FileId) -> Option<&FileTransferSession> {
        self.entries.get(&id).map(|e| &e.session)
    }

    /// Record a FILE_TRANSFER_REQUEST whose sender is already authenticated
    pub fn register(&mut self, request: &Envelope) -> Result<&FileTransferSession, AppError> {
        let file_id = request.file_id.ok_or_else(|| missing("fileId"))?;
        let receiver = request
            .receiver()
            .filter(|r| *r != request.sender)
            .ok_or(ProtocolError::InvalidRecipient)?;
        let filename = sanitize_filename(request.filename.as_deref().unwrap_or(""))?;
        let size = request.file_size.ok_or_else(|| missing("fileSize"))?;
        if size > self.max_file_size {
            return Err(FileTransferError::TooLarge {
                size,
                max: self.max_file_size,
            }
            .into());
        }
        if self.entries.contains_key(&file_id) {
            return Err(ProtocolError::InvalidField {
                field: "fileId",
                reason: "already in use".to_string(),
            }
            .into());
        }

        let session = FileTransferSession::new(file_id, &request.sender, receiver, filename, size);
        let entry = self.entries.entry(file_id).or_insert(RelayEntry {
            session,
            slot: Slot::Empty,
        });
        Ok(&entry.session)
    }

    /// Entry for `envelope.file_id` if `envelope.sender` is the party
    /// `expect` selects
    fn entry_from(
        &mut self,
        envelope: &Envelope,
        expect: fn(&FileTransferSession) -> &str,
    ) -> Result<(FileId, &mut RelayEntry<S>), AppError> {
        let id = envelope.file_id.ok_or_else(|| missing("fileId"))?;
        match self.entries.get_mut(&id) {
            Some(entry) if expect(&entry.session) == envelope.sender => Ok((id, entry)),
            _ => Err(FileTransferError::UnknownTransfer(id).into()),
        }
    }

    fn settle(&mut self, id: FileId) {
        if self
            .entries
            .get(&id)
            .is_some_and(|e| e.session.status().is_terminal())
        {
            self.entries.remove(&id);
        }
    }

    /// ACCEPT or REJECT, only from the named receiver
    pub fn answer(
        &mut self,
        envelope: &Envelope,
        accepted: bool,
    ) -> Result<FileTransferSession, AppError> {
        let event = if accepted {
            TransferEvent::Accept
        } else {
            TransferEvent::Reject
        };
        let (id, entry) = self.entry_from(envelope, |s| s.receiver.as_str())?;
        entry.session.apply(event)?;
        let snapshot = entry.session.clone();
        self.settle(id);
        Ok(snapshot)
    }

    /// METADATA from the sender; a no-op if the relay already moved on
    pub fn metadata(&mut self, envelope: &Envelope) -> Result<FileTransferSession, AppError> {
        let (_, entry) = self.entry_from(envelope, |s| s.sender.as_str())?;
        if entry.session.status() == TransferStatus::Accepted {
            entry.session.apply(TransferEvent::MetadataSent)?;
        }
        Ok(entry.session.clone())
    }

    /// COMPLETE from the receiver, sent after it verified the on-disk
    /// length, ends the transfer
    ///
    /// Until then the entry stays live, so a FILE_ERROR from the receiver's
    /// checks still reaches the sender.
    pub fn finish(&mut self, envelope: &Envelope) -> Result<FileTransferSession, AppError> {
        let (id, entry) = self.entry_from(envelope, |s| s.receiver.as_str())?;
        // The sender's METADATA may still be queued behind the stream
        if entry.session.status() == TransferStatus::Accepted {
            entry.session.apply(TransferEvent::MetadataSent)?;
        }
        entry.session.apply(TransferEvent::Finished)?;
        let snapshot = entry.session.clone();
        self.settle(id);
        Ok(snapshot)
    }

    /// FILE_ERROR from either party ends the transfer
    pub fn abort(&mut self, envelope: &Envelope) -> Result<FileTransferSession, AppError> {
        let id = envelope.file_id.ok_or_else(|| missing("fileId"))?;
        let is_party = self.entries.get(&id).is_some_and(|e| {
            e.session.sender == envelope.sender || e.session.receiver == envelope.sender
        });
        if !is_party {
            return Err(FileTransferError::UnknownTransfer(id).into());
        }
        let mut entry = self
            .entries
            .remove(&id)
            .ok_or(FileTransferError::UnknownTransfer(id))?;
        let _ = entry.session.apply(TransferEvent::Fail);
        Ok(entry.session)
    }

    /// Attach one end's data connection
    ///
    /// Returns the pair once both ends are present. On refusal the stream is
    /// handed back so the caller can report the error before closing it.
    pub fn attach(
        &mut self,
        id: FileId,
        username: &str,
        role: StreamRole,
        stream: S,
    ) -> Result<Option<RelayPair<S>>, (AppError, S)> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err((FileTransferError::UnknownTransfer(id).into(), stream));
        };
        let owner = match role {
            StreamRole::Send => &entry.session.sender,
            StreamRole::Receive => &entry.session.receiver,
        };
        if owner != username {
            return Err((FileTransferError::UnknownTransfer(id).into(), stream));
        }
        let status = entry.session.status();
        if !matches!(status, TransferStatus::Accepted | TransferStatus::MetadataSent) {
            return Err((
                FileTransferError::InvalidTransition {
                    from: status,
                    event: TransferEvent::BytesStarted,
                }
                .into(),
                stream,
            ));
        }

        let already = |role: StreamRole| -> AppError {
            ProtocolError::InvalidField {
                field: "content",
                reason: format!("{} stream already attached", role),
            }
            .into()
        };
        match std::mem::replace(&mut entry.slot, Slot::Streaming) {
            Slot::Empty => {
                entry.slot = Slot::Parked(role, stream);
                Ok(None)
            }
            Slot::Parked(parked_role, parked) if parked_role == role => {
                entry.slot = Slot::Parked(parked_role, parked);
                Err((already(role), stream))
            }
            Slot::Parked(_, parked) => {
                let (sender, receiver) = match role {
                    StreamRole::Send => (stream, parked),
                    StreamRole::Receive => (parked, stream),
                };
                Ok(Some(RelayPair {
                    session: entry.session.clone(),
                    sender,
                    receiver,
                }))
            }
            Slot::Streaming => Err((already(role), stream)),
        }
    }

    /// Drop every transfer `username` takes part in (on disconnect)
    pub fn drop_user(&mut self, username: &str) -> Vec<FileTransferSession> {
        let ids: Vec<FileId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.session.sender == username || e.session.receiver == username)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|mut e| {
                let _ = e.session.apply(TransferEvent::Fail);
                e.session
            })
            .collect()
    }

    /// Remove everything (shutdown)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Announce readiness to both ends, then copy the size prefix and payload
///
/// Returns the number of bytes copied, which is `8 + declared_size` on
/// success.
pub async fn pipe<S>(pair: RelayPair<S>) -> Result<u64, FileTransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let RelayPair {
        session,
        mut sender,
        mut receiver,
    } = pair;

    let ready = Envelope::success("relay ready").with_file_id(session.file_id);
    codec::write_envelope(&mut receiver, &ready).await?;
    codec::write_envelope(&mut sender, &ready).await?;

    let expected = 8 + session.declared_size;
    let copied = tokio::io::copy(&mut (&mut sender).take(expected), &mut receiver).await?;
    receiver.flush().await?;
    if copied < expected {
        return Err(FileTransferError::UnexpectedEof {
            expected: session.declared_size,
            received: copied.saturating_sub(8),
        });
    }
    let _ = receiver.shutdown().await;
    debug!("Relayed {} bytes for {}", copied, session.file_id);
    Ok(copied)
}

/// Open a data connection for `file_id` and wait until the peer attaches
pub async fn open_stream(
    addr: SocketAddr,
    username: &str,
    file_id: FileId,
    role: StreamRole,
    max_line: usize,
) -> Result<BufReader<TcpStream>, FileTransferError> {
    let mut stream = BufReader::new(TcpStream::connect(addr).await?);
    let hello = Envelope::new(MessageType::FileStream, username)
        .with_content(role.as_str())
        .with_file_id(file_id);
    codec::write_envelope(stream.get_mut(), &hello)
        .await
        .map_err(|e| FileTransferError::Relay(e.to_string()))?;

    match codec::read_envelope(&mut stream, max_line).await {
        Ok(Some(reply)) if reply.kind == MessageType::Success => Ok(stream),
        Ok(Some(reply)) => Err(FileTransferError::Relay(reply.content_str().to_string())),
        Ok(None) => Err(FileTransferError::Relay("relay closed the connection".to_string())),
        Err(e) => Err(FileTransferError::Relay(e.to_string())),
    }
}
