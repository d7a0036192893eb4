//! Multipart transfers
//!
//! A [`TransferCoordinator`] moves one large object in or out of storage as a
//! set of independently transferred parts, each part going through the
//! [`RequestExecutor`]. Part completion order is unconstrained; the part list
//! handed to the completion call is always in ascending part order.
//!
//! ```text
//! begin_upload ──► run_parts ──► complete
//!      │              │ cancel / error
//!      │              ▼
//!      │           pause ──► snapshot (JSON) ──► resume ──► run_parts ...
//!      └──────────────────────────────────────► abort (idempotent)
//! ```

pub mod download;
pub mod part;
pub mod progress;
pub mod source;
pub mod state;
pub mod upload;
pub mod wire;

pub use part::{PartDescriptor, PartState};
pub use progress::{ProgressEvent, ProgressReporter, TransferDirection};
pub use source::{BytesSource, FileSource, PartSource, SourceDescriptor};
pub use state::{TransferPhase, TransferSnapshot, TransferState, SNAPSHOT_VERSION};

use crate::config::TransferConfig;
use crate::error::{ErrorCategory, Result, StratusError};
use crate::executor::RequestExecutor;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Drives multipart uploads and downloads
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    executor: Arc<RequestExecutor>,
    config: TransferConfig,
    reporter: ProgressReporter,
}

impl TransferCoordinator {
    /// Coordinator using the executor's transfer configuration
    pub fn new(executor: Arc<RequestExecutor>) -> Self {
        let config = executor.config().transfer.clone();
        Self {
            executor,
            config,
            reporter: ProgressReporter::default(),
        }
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Override the number of concurrent part workers
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Snapshot of the transfer for a later [`resume`](Self::resume); parts
    /// that were in flight are forgotten
    pub fn pause(&self, state: &mut TransferState) -> TransferSnapshot {
        state.settle_in_flight();
        self.reporter.transfer_paused(
            &state.transfer_id(),
            state.completed_parts(),
            state.parts.len() as u32,
        );
        debug!(
            transfer = %state.transfer_id(),
            completed_parts = state.completed_parts(),
            "Transfer paused"
        );
        state.snapshot()
    }

    /// Rebuild a paused transfer and check it against the provider
    ///
    /// An upload the provider no longer knows, or a download whose object
    /// changed, is [`StratusError::TransferExpired`].
    pub async fn resume(
        &self,
        snapshot: TransferSnapshot,
        cancel: &CancellationToken,
    ) -> Result<TransferState> {
        let mut state = snapshot.into_state()?;
        match state.direction {
            TransferDirection::Upload => self.reconcile_upload(&mut state, cancel).await?,
            TransferDirection::Download => self.reconcile_download(&mut state, cancel).await?,
        }
        Ok(state)
    }

    /// Run every outstanding part of `state` through `worker`
    ///
    /// Only this loop mutates `state`; workers report back their part's
    /// ETag. Cancelled parts return to `Pending`, so a cancelled run leaves
    /// the state resumable.
    async fn drive_parts<F, Fut>(
        &self,
        state: &mut TransferState,
        cancel: &CancellationToken,
        worker: F,
    ) -> Result<()>
    where
        F: Fn(PartDescriptor, CancellationToken) -> Fut,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let outstanding = state.outstanding_parts();
        if outstanding.is_empty() {
            return Ok(());
        }

        let transfer_id = state.transfer_id();
        let concurrency = self
            .config
            .effective_concurrency()
            .clamp(1, outstanding.len());
        debug!(
            transfer = %transfer_id,
            parts = outstanding.len(),
            concurrency,
            "Running parts"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let run = cancel.child_token();
        let mut tasks = JoinSet::new();

        for part in outstanding {
            state.set_state(part.part_number, PartState::InFlight);
            let part_number = part.part_number;
            let semaphore = semaphore.clone();
            let token = run.clone();
            let work = worker(part, token.clone());

            tasks.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => Err(StratusError::Cancelled),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => {
                            let outcome = work.await;
                            drop(permit);
                            outcome
                        }
                        Err(_) => Err(StratusError::Cancelled),
                    },
                };
                (part_number, outcome)
            });
        }

        let mut failures: Vec<(u32, StratusError)> = Vec::new();
        let mut expired: Option<StratusError> = None;

        while let Some(joined) = tasks.join_next().await {
            let Ok((part_number, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(etag) => {
                    state.mark_completed(part_number, etag);
                    let part_bytes = state.part(part_number).map_or(0, |p| p.length);
                    debug!(transfer = %transfer_id, part_number, "Part completed");
                    self.reporter
                        .part_completed(&transfer_id, part_number, part_bytes);
                    self.reporter.progress(
                        &transfer_id,
                        state.completed_bytes(),
                        state.object_size,
                    );
                }
                Err(StratusError::Cancelled) => {
                    state.set_state(part_number, PartState::Pending);
                }
                Err(err) => {
                    warn!(transfer = %transfer_id, part_number, error = %err, "Part failed");
                    state.set_state(part_number, PartState::Failed);
                    self.reporter
                        .part_failed(&transfer_id, part_number, err.to_string());
                    if matches!(err, StratusError::TransferExpired { .. }) && expired.is_none() {
                        expired = Some(err.clone());
                        run.cancel();
                    }
                    failures.push((part_number, err));
                }
            }
        }

        // Workers that panicked never reported back
        let lost: Vec<u32> = state
            .parts
            .iter()
            .filter(|p| p.state == PartState::InFlight)
            .map(|p| p.part_number)
            .collect();
        for part_number in lost {
            state.set_state(part_number, PartState::Failed);
            failures.push((
                part_number,
                StratusError::Io("part worker stopped unexpectedly".to_string()),
            ));
        }

        if let Some(expired) = expired {
            return Err(expired);
        }
        if cancel.is_cancelled() {
            state.settle_in_flight();
            self.reporter.transfer_paused(
                &transfer_id,
                state.completed_parts(),
                state.parts.len() as u32,
            );
            return Err(StratusError::Cancelled);
        }
        if !failures.is_empty() {
            failures.sort_by_key(|(part_number, _)| *part_number);
            return Err(StratusError::PartFailure { failures });
        }
        Ok(())
    }
}

/// Run `attempt` up to `attempts` times while it fails with a transient
/// error
async fn with_part_retries<F, Fut>(attempts: u32, part_number: u32, mut attempt: F) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let attempts = attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(etag) => return Ok(etag),
            Err(err) if tries < attempts && err.category() == ErrorCategory::RetryLater => {
                warn!(part_number, attempt = tries, error = %err, "Retrying part");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Map "upload not found" to the transfer-level expiry error
fn expired_if_missing(err: StratusError, upload_id: &str, bucket: &str, key: &str) -> StratusError {
    match &err {
        StratusError::Service { code, .. } if code == "NoSuchUpload" => {
            StratusError::TransferExpired {
                upload_id: upload_id.to_string(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        }
        _ => err,
    }
}

fn ensure_active(state: &TransferState, direction: TransferDirection) -> Result<()> {
    if state.direction != direction {
        return Err(StratusError::InvalidTransferState(format!(
            "{} transfer {} cannot be driven as a {}",
            state.direction,
            state.transfer_id(),
            direction
        )));
    }
    match state.phase {
        TransferPhase::Active => Ok(()),
        phase => Err(StratusError::InvalidTransferState(format!(
            "{} is already {:?}",
            state.transfer_id(),
            phase
        ))),
    }
}
