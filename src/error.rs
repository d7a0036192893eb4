/*!
 * Error types for Stratus
 */

use crate::body::BodyError;
use crate::signer::SignerKind;
use crate::transport::TransportErrorKind;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Stratus operations
pub type Result<T> = std::result::Result<T, StratusError>;

/// Errors surfaced by the request executor and the transfer coordinator
///
/// Addressing and signer-negotiation failures are normally corrected inside
/// the executor; callers only see them once the corrective budget is spent or
/// when correction is not allowed (pinned region, newest signer already in
/// use).
#[derive(Error, Debug, Clone)]
pub enum StratusError {
    /// Request reached the wrong regional endpoint
    #[error("Addressing error for bucket {bucket}: request targeted {attempted}, provider reports {authoritative}")]
    Addressing {
        bucket: String,
        attempted: String,
        authoritative: String,
    },

    /// Provider rejected the signature scheme
    #[error("Signature negotiation failed under {scheme} ({code}): {message}")]
    AuthNegotiation {
        scheme: SignerKind,
        code: String,
        message: String,
    },

    /// Connection-level failure
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Attempt exceeded its deadline
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Request body cannot be rewound for a retry
    #[error("Unrecoverable stream state: {0}")]
    UnrecoverableStreamState(String),

    /// Data integrity check failed
    #[error("Checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Object key that cannot be expressed as a request path
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Part size below the provider minimum
    #[error("Invalid part size: {part_size} bytes is below the minimum of {minimum} bytes")]
    InvalidPartSize { part_size: u64, minimum: u64 },

    /// Provider no longer recognizes the transfer
    #[error("Transfer {upload_id} for {bucket}/{key} has expired; restart the transfer")]
    TransferExpired {
        upload_id: String,
        bucket: String,
        key: String,
    },

    /// Snapshot written by an incompatible format version
    #[error("Unsupported snapshot version {found} (supported up to {supported})")]
    UnsupportedSnapshotVersion { found: u32, supported: u32 },

    /// One or more parts failed after part-level retries
    #[error("Parts failed: {}", describe_part_failures(.failures))]
    PartFailure { failures: Vec<(u32, StratusError)> },

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Retry budget spent; carries the last underlying cause
    #[error("Gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        source: Box<StratusError>,
    },

    /// Non-retryable provider error
    #[error("Service error ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// Completion call failed; the transfer stays abortable
    #[error("Completing upload {upload_id} failed: {message}")]
    Completion { upload_id: String, message: String },

    /// Operation not valid for the transfer's current state
    #[error("Invalid transfer state: {0}")]
    InvalidTransferState(String),

    /// Credentials could not be obtained
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Snapshot or document (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn describe_part_failures(failures: &[(u32, StratusError)]) -> String {
    failures
        .iter()
        .map(|(part_number, cause)| format!("part {}: {}", part_number, cause))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StratusError {
    /// The innermost cause, looking through `Exhausted`
    pub fn root_cause(&self) -> &StratusError {
        match self {
            StratusError::Exhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the error is worth retrying later with the same inputs
    pub fn is_retryable(&self) -> bool {
        match self {
            StratusError::Transport { .. } | StratusError::Timeout(_) | StratusError::Io(_) => true,
            StratusError::Service { status, code, .. } => {
                *status >= 500 || is_retryable_code(code)
            }
            StratusError::Exhausted { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether retrying with the same inputs cannot help
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Part numbers named by a `PartFailure`
    pub fn failed_parts(&self) -> Vec<u32> {
        match self {
            StratusError::PartFailure { failures } => {
                failures.iter().map(|(part_number, _)| *part_number).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Get error category for logging and caller decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            StratusError::Transport { .. } | StratusError::Timeout(_) | StratusError::Io(_) => {
                ErrorCategory::RetryLater
            }
            StratusError::Addressing { .. }
            | StratusError::AuthNegotiation { .. }
            | StratusError::UnrecoverableStreamState(_)
            | StratusError::InvalidKey(_)
            | StratusError::InvalidPartSize { .. }
            | StratusError::UnsupportedSnapshotVersion { .. }
            | StratusError::Credentials(_)
            | StratusError::Config(_) => ErrorCategory::FixConfiguration,
            StratusError::ChecksumMismatch { .. } => ErrorCategory::DataIntegrity,
            StratusError::Cancelled => ErrorCategory::Cancelled,
            StratusError::Exhausted { source, .. } => source.category(),
            StratusError::Service { .. } => {
                if self.is_retryable() {
                    ErrorCategory::RetryLater
                } else {
                    ErrorCategory::Permanent
                }
            }
            StratusError::PartFailure { failures } => failures
                .iter()
                .map(|(_, cause)| cause.category())
                .max_by_key(|category| category.severity())
                .unwrap_or(ErrorCategory::Permanent),
            StratusError::TransferExpired { .. }
            | StratusError::Completion { .. }
            | StratusError::InvalidTransferState(_)
            | StratusError::Serialization(_) => ErrorCategory::Permanent,
        }
    }
}

/// Provider error codes that indicate a transient condition
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestTimeout" | "ServiceUnavailable" | "InternalError" | "SlowDown" | "Throttling"
    )
}

/// What a caller should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient; the same request may succeed later
    RetryLater,
    /// Client setup or input must change
    FixConfiguration,
    /// Data integrity is in question
    DataIntegrity,
    /// Caller cancelled
    Cancelled,
    /// Will not succeed as issued
    Permanent,
}

impl ErrorCategory {
    fn severity(&self) -> u8 {
        match self {
            ErrorCategory::Cancelled => 0,
            ErrorCategory::RetryLater => 1,
            ErrorCategory::Permanent => 2,
            ErrorCategory::FixConfiguration => 3,
            ErrorCategory::DataIntegrity => 4,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::RetryLater => write!(f, "retry-later"),
            ErrorCategory::FixConfiguration => write!(f, "fix-configuration"),
            ErrorCategory::DataIntegrity => write!(f, "data-integrity"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

impl From<BodyError> for StratusError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::UnrecoverableStreamState(msg) => StratusError::UnrecoverableStreamState(msg),
            BodyError::ChecksumMismatch {
                algorithm,
                expected,
                actual,
            } => StratusError::ChecksumMismatch {
                algorithm,
                expected,
                actual,
            },
            BodyError::Io(msg) => StratusError::Io(msg),
        }
    }
}

impl From<io::Error> for StratusError {
    fn from(err: io::Error) -> Self {
        StratusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StratusError {
    fn from(err: serde_json::Error) -> Self {
        StratusError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_surfaces_last_cause() {
        let err = StratusError::Exhausted {
            attempts: 4,
            source: Box::new(StratusError::Transport {
                kind: TransportErrorKind::ConnectionReset,
                message: "peer went away".to_string(),
            }),
        };

        let text = err.to_string();
        assert!(text.contains("4 attempts"));
        assert!(text.contains("peer went away"));
        assert_eq!(err.category(), ErrorCategory::RetryLater);
        assert!(matches!(err.root_cause(), StratusError::Transport { .. }));
    }

    #[test]
    fn test_categories_distinguish_causes() {
        assert_eq!(
            StratusError::Timeout(Duration::from_secs(1)).category(),
            ErrorCategory::RetryLater
        );
        assert_eq!(
            StratusError::UnrecoverableStreamState("buffer evicted".to_string()).category(),
            ErrorCategory::FixConfiguration
        );
        assert_eq!(
            StratusError::ChecksumMismatch {
                algorithm: "sha256".to_string(),
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            }
            .category(),
            ErrorCategory::DataIntegrity
        );
        assert_eq!(StratusError::Cancelled.category(), ErrorCategory::Cancelled);
        assert_eq!(
            StratusError::AuthNegotiation {
                scheme: SignerKind::V4,
                code: "SignatureDoesNotMatch".to_string(),
                message: "nope".to_string(),
            }
            .category(),
            ErrorCategory::FixConfiguration
        );
    }

    #[test]
    fn test_service_error_retryability() {
        let throttled = StratusError::Service {
            status: 503,
            code: "SlowDown".to_string(),
            message: "reduce rate".to_string(),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.category(), ErrorCategory::RetryLater);

        let missing = StratusError::Service {
            status: 404,
            code: "NoSuchKey".to_string(),
            message: "gone".to_string(),
        };
        assert!(!missing.is_retryable());
        assert_eq!(missing.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_part_failure_names_parts() {
        let err = StratusError::PartFailure {
            failures: vec![
                (2, StratusError::Timeout(Duration::from_secs(5))),
                (
                    5,
                    StratusError::ChecksumMismatch {
                        algorithm: "md5".to_string(),
                        expected: "aa".to_string(),
                        actual: "bb".to_string(),
                    },
                ),
            ],
        };

        assert_eq!(err.failed_parts(), vec![2, 5]);
        let text = err.to_string();
        assert!(text.contains("part 2"));
        assert!(text.contains("part 5"));
        assert_eq!(err.category(), ErrorCategory::DataIntegrity);
    }

    #[test]
    fn test_body_error_conversion() {
        let err: StratusError = BodyError::UnrecoverableStreamState("limit".to_string()).into();
        assert!(matches!(err, StratusError::UnrecoverableStreamState(_)));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::RetryLater.to_string(), "retry-later");
        assert_eq!(ErrorCategory::DataIntegrity.to_string(), "data-integrity");
    }
}
