/*!
 * Stratus - resilient request execution for object-storage clients
 *
 * Drives storage operations to a final response despite:
 * - Requests sent to the wrong regional endpoint (learned and cached per bucket)
 * - Legacy signatures the provider rejects (re-signed with the newer scheme)
 * - Dropped connections and throttling (bounded backoff, body replayed from a checkpoint)
 *
 * On top of that, multipart uploads and ranged downloads with concurrent
 * parts, per-part retry, and pause/resume through versioned snapshots.
 */

pub mod body;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod logging;
pub mod region;
pub mod signer;
pub mod transfer;
pub mod transport;

// Re-export commonly used types
pub use body::{ContentChecksum, PayloadHash, ReplayableBody};
pub use config::{ClientConfig, RetryConfig, TransferConfig};
pub use credentials::{CredentialProvider, Credentials, StaticCredentialProvider};
pub use error::{ErrorCategory, Result, StratusError};
pub use executor::{AttemptOutcome, AttemptRecord, Execution, RequestExecutor};
pub use region::RegionResolver;
pub use signer::{SignerKind, SignerNegotiator, SigningContext};
pub use transfer::{
    PartSource, ProgressEvent, ProgressReporter, TransferCoordinator, TransferSnapshot,
    TransferState,
};
pub use transport::{Operation, ResponseDescriptor, Transport};

pub use stratus_core_resilience::{BackoffPolicy, Clock, ManualClock, TokioClock};
pub use tokio_util::sync::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
