//! File transfer state machine
//!
//! `Requested → Accepted → MetadataSent → InProgress → Completed`, with
//! `Rejected` reachable only from `Requested` and `Failed` / `Cancelled`
//! reachable from every non-terminal state.

use serde::Serialize;

use crate::error::FileTransferError;
use crate::types::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferStatus {
    Requested,
    Accepted,
    Rejected,
    MetadataSent,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Accept,
    Reject,
    MetadataSent,
    /// First payload byte moved
    BytesStarted,
    /// Every declared byte moved
    Finished,
    Fail,
    Cancel,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Rejected
                | TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Cancelled
        )
    }

    /// Next state, or `InvalidTransition` when `event` is illegal here
    ///
    /// A zero-byte transfer never sees `BytesStarted`, so `Finished` is
    /// also accepted straight from `MetadataSent`.
    pub fn apply(self, event: TransferEvent) -> Result<Self, FileTransferError> {
        use TransferEvent as E;
        use TransferStatus as S;

        let next = match (self, event) {
            (S::Requested, E::Accept) => S::Accepted,
            (S::Requested, E::Reject) => S::Rejected,
            (S::Accepted, E::MetadataSent) => S::MetadataSent,
            (S::MetadataSent, E::BytesStarted) => S::InProgress,
            (S::MetadataSent | S::InProgress, E::Finished) => S::Completed,
            (from, E::Fail) if !from.is_terminal() => S::Failed,
            (from, E::Cancel) if !from.is_terminal() => S::Cancelled,
            (from, event) => return Err(FileTransferError::InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

/// Per-attempt transfer state, keyed by `file_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferSession {
    pub file_id: FileId,
    pub sender: String,
    pub receiver: String,
    pub filename: String,
    pub declared_size: u64,
    bytes_transferred: u64,
    status: TransferStatus,
}

impl FileTransferSession {
    pub fn new(
        file_id: FileId,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        filename: impl Into<String>,
        declared_size: u64,
    ) -> Self {
        Self {
            file_id,
            sender: sender.into(),
            receiver: receiver.into(),
            filename: filename.into(),
            declared_size,
            bytes_transferred: 0,
            status: TransferStatus::Requested,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn apply(&mut self, event: TransferEvent) -> Result<TransferStatus, FileTransferError> {
        self.status = self.status.apply(event)?;
        Ok(self.status)
    }

    /// `floor(bytes * 100 / declared)`; an empty file is at 100 once completed
    pub fn progress_percent(&self) -> u8 {
        if self.declared_size == 0 {
            return if self.status == TransferStatus::Completed { 100 } else { 0 };
        }
        let percent = u128::from(self.bytes_transferred) * 100 / u128::from(self.declared_size);
        percent.min(100) as u8
    }

    /// Account for `n` more bytes and return the new percentage
    ///
    /// The first call moves `MetadataSent` to `InProgress`. Counting past
    /// the declared size fails the transfer.
    pub fn record_bytes(&mut self, n: u64) -> Result<u8, FileTransferError> {
        if n == 0 {
            return Ok(self.progress_percent());
        }
        if self.status == TransferStatus::MetadataSent {
            self.apply(TransferEvent::BytesStarted)?;
        }
        if self.status != TransferStatus::InProgress {
            return Err(FileTransferError::InvalidTransition {
                from: self.status,
                event: TransferEvent::BytesStarted,
            });
        }
        let total = self.bytes_transferred.saturating_add(n);
        if total > self.declared_size {
            self.status = TransferStatus::Failed;
            return Err(FileTransferError::SizeMismatch {
                declared: self.declared_size,
                announced: total,
            });
        }
        self.bytes_transferred = total;
        Ok(self.progress_percent())
    }

    /// Move to `Completed`, or to `Failed` if the counts disagree
    ///
    /// `on_disk` is the written file's length on the receiving side, `None`
    /// on the sending side.
    pub fn complete(&mut self, on_disk: Option<u64>) -> Result<(), FileTransferError> {
        if self.bytes_transferred != self.declared_size {
            self.status = TransferStatus::Failed;
            return Err(FileTransferError::UnexpectedEof {
                expected: self.declared_size,
                received: self.bytes_transferred,
            });
        }
        if let Some(actual) = on_disk {
            if actual != self.declared_size {
                self.status = TransferStatus::Failed;
                return Err(FileTransferError::DiskSizeMismatch {
                    expected: self.declared_size,
                    actual,
                });
            }
        }
        self.apply(TransferEvent::Finished)?;
        Ok(())
    }
}
