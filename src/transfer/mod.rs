//! File transfer
//!
//! The per-transfer state machine, the endpoint coordinator that streams
//! bytes to and from disk, the server-side relay that pairs the two ends,
//! and the naming and checksum helpers they share.

pub mod checksum;
pub mod coordinator;
pub mod naming;
pub mod relay;
pub mod state;

pub use checksum::sha256_file;
pub use coordinator::{
    CancelFlag, FileOffer, FileTransferCoordinator, NoProgress, ProgressSink, TransferDecision,
};
pub use naming::DestinationLocks;
pub use relay::{StreamRole, TransferTable};
pub use state::{FileTransferSession, TransferEvent, TransferStatus};
