//! Progress events for multipart transfers
//!
//! A [`ProgressReporter`] hands [`ProgressEvent`]s to an unbounded tokio
//! channel so that reporting never blocks a part worker. Dropping the
//! receiver silently disables reporting.
//!
//! ```no_run
//! use stratus::transfer::progress::{ProgressEvent, ProgressReporter};
//!
//! # async fn run() {
//! let (reporter, mut receiver) = ProgressReporter::new();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = receiver.recv().await {
//!         if let ProgressEvent::Progress { percentage, .. } = event {
//!             println!("{:.1}%", percentage);
//!         }
//!     }
//! });
//! # drop(reporter);
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Progress event for one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    TransferStarted {
        transfer_id: String,
        key: String,
        total_bytes: u64,
        total_parts: u32,
        direction: TransferDirection,
    },

    PartCompleted {
        transfer_id: String,
        part_number: u32,
        part_bytes: u64,
    },

    /// Part failed after its part-level retries
    PartFailed {
        transfer_id: String,
        part_number: u32,
        error: String,
    },

    Progress {
        transfer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        /// Percentage complete (0-100)
        percentage: f64,
    },

    TransferPaused {
        transfer_id: String,
        completed_parts: u32,
        total_parts: u32,
    },

    TransferCompleted {
        transfer_id: String,
        total_bytes: u64,
    },

    TransferAborted {
        transfer_id: String,
    },
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "Upload"),
            TransferDirection::Download => write!(f, "Download"),
        }
    }
}

/// Sends progress events
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Arc<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn new() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    pub fn report(&self, event: ProgressEvent) {
        // Receiver may have been dropped
        let _ = self.sender.send(event);
    }

    pub fn transfer_started(
        &self,
        transfer_id: &str,
        key: &str,
        total_bytes: u64,
        total_parts: u32,
        direction: TransferDirection,
    ) {
        self.report(ProgressEvent::TransferStarted {
            transfer_id: transfer_id.to_string(),
            key: key.to_string(),
            total_bytes,
            total_parts,
            direction,
        });
    }

    pub fn part_completed(&self, transfer_id: &str, part_number: u32, part_bytes: u64) {
        self.report(ProgressEvent::PartCompleted {
            transfer_id: transfer_id.to_string(),
            part_number,
            part_bytes,
        });
    }

    pub fn part_failed(&self, transfer_id: &str, part_number: u32, error: String) {
        self.report(ProgressEvent::PartFailed {
            transfer_id: transfer_id.to_string(),
            part_number,
            error,
        });
    }

    /// Report bytes transferred so far
    pub fn progress(&self, transfer_id: &str, bytes_transferred: u64, total_bytes: u64) {
        let percentage = if total_bytes > 0 {
            (bytes_transferred as f64 / total_bytes as f64) * 100.0
        } else {
            100.0
        };

        self.report(ProgressEvent::Progress {
            transfer_id: transfer_id.to_string(),
            bytes_transferred,
            total_bytes,
            percentage,
        });
    }

    pub fn transfer_paused(&self, transfer_id: &str, completed_parts: u32, total_parts: u32) {
        self.report(ProgressEvent::TransferPaused {
            transfer_id: transfer_id.to_string(),
            completed_parts,
            total_parts,
        });
    }

    pub fn transfer_completed(&self, transfer_id: &str, total_bytes: u64) {
        self.report(ProgressEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
            total_bytes,
        });
    }

    pub fn transfer_aborted(&self, transfer_id: &str) {
        self.report(ProgressEvent::TransferAborted {
            transfer_id: transfer_id.to_string(),
        });
    }
}

impl Default for ProgressReporter {
    /// Reporter whose events go nowhere
    fn default() -> Self {
        let (sender, _) = unbounded_channel();
        Self {
            sender: Arc::new(sender),
        }
    }
}
