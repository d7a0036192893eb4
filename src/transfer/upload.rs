//! Multipart upload

use super::part::effective_part_size;
use super::{
    ensure_active, expired_if_missing, with_part_retries, wire, PartDescriptor, PartSource,
    TransferCoordinator, TransferDirection, TransferPhase, TransferState,
};
use crate::body::ReplayableBody;
use crate::error::{Result, StratusError};
use crate::executor::RequestExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl TransferCoordinator {
    /// Validate the part size and initiate a multipart upload
    ///
    /// The part size is checked before any request is made.
    pub async fn begin_upload(
        &self,
        bucket: &str,
        key: &str,
        source: &dyn PartSource,
        part_size_hint: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<TransferState> {
        let part_size = effective_part_size(source.size(), part_size_hint, &self.config)?;

        let execution = self
            .executor
            .execute(&wire::initiate(bucket, key), None, cancel)
            .await?;
        let upload_id = wire::parse_upload_id(&execution.response)?;

        let state = TransferState::new(
            TransferDirection::Upload,
            upload_id,
            bucket,
            key,
            part_size,
            source.descriptor(),
            None,
        );
        info!(
            bucket,
            key,
            upload_id = %state.upload_id,
            size = state.object_size,
            part_size,
            parts = state.parts.len(),
            "Multipart upload started"
        );
        self.reporter.transfer_started(
            &state.transfer_id(),
            key,
            state.object_size,
            state.parts.len() as u32,
            TransferDirection::Upload,
        );
        Ok(state)
    }

    /// Upload every `Pending` or `Failed` part
    ///
    /// A part that still fails after its part-level retries is left `Failed`
    /// and named in the returned [`StratusError::PartFailure`]; its siblings
    /// are unaffected and a later call retries only what is outstanding.
    pub async fn run_parts(
        &self,
        state: &mut TransferState,
        source: Arc<dyn PartSource>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_active(state, TransferDirection::Upload)?;
        if source.size() != state.object_size {
            return Err(StratusError::InvalidTransferState(format!(
                "source is {} bytes but transfer {} expects {}",
                source.size(),
                state.transfer_id(),
                state.object_size
            )));
        }

        let executor = self.executor.clone();
        let attempts = self.config.part_retry_attempts;
        let upload_id = state.upload_id.clone();
        let bucket = state.bucket.clone();
        let key = state.key.clone();

        self.drive_parts(state, cancel, move |part, token| {
            let executor = executor.clone();
            let source = source.clone();
            let upload_id = upload_id.clone();
            let bucket = bucket.clone();
            let key = key.clone();
            async move {
                let part_number = part.part_number;
                with_part_retries(attempts, part_number, || {
                    upload_one(&executor, &*source, &bucket, &key, &upload_id, &part, &token)
                })
                .await
            }
        })
        .await
    }

    /// Complete the upload with every part's ETag in ascending part order
    ///
    /// Only valid once every part is `Completed`. A failed completion leaves
    /// the transfer active so it can still be aborted.
    pub async fn complete(
        &self,
        state: &mut TransferState,
        cancel: &CancellationToken,
    ) -> Result<String> {
        ensure_active(state, TransferDirection::Upload)?;
        let parts = state.ordered_etags()?;

        let mut body = ReplayableBody::from_bytes(wire::render_part_list(&parts));
        let operation = wire::complete(&state.bucket, &state.key, &state.upload_id);
        let etag = match self
            .executor
            .execute(&operation, Some(&mut body), cancel)
            .await
        {
            Ok(execution) => wire::parse_completion(&execution.response, &state.upload_id)?,
            Err(err) => {
                let err = expired_if_missing(err, &state.upload_id, &state.bucket, &state.key);
                return Err(match err {
                    StratusError::Cancelled | StratusError::TransferExpired { .. } => err,
                    other => StratusError::Completion {
                        upload_id: state.upload_id.clone(),
                        message: other.to_string(),
                    },
                });
            }
        };

        state.phase = TransferPhase::Completed;
        info!(
            bucket = %state.bucket,
            key = %state.key,
            upload_id = %state.upload_id,
            parts = parts.len(),
            "Multipart upload completed"
        );
        self.reporter
            .transfer_completed(&state.transfer_id(), state.object_size);
        Ok(etag)
    }

    /// Release the provider-side upload
    ///
    /// Aborting a transfer that is already aborted or completed does
    /// nothing, and an upload the provider no longer knows counts as
    /// aborted.
    pub async fn abort(&self, state: &mut TransferState, cancel: &CancellationToken) -> Result<()> {
        if state.phase != TransferPhase::Active {
            debug!(transfer = %state.transfer_id(), phase = ?state.phase, "Abort is a no-op");
            return Ok(());
        }

        if state.direction == TransferDirection::Upload {
            let operation = wire::abort(&state.bucket, &state.key, &state.upload_id);
            match self.executor.execute(&operation, None, cancel).await {
                Ok(_) => {}
                Err(StratusError::Service { code, .. }) if code == "NoSuchUpload" => {
                    debug!(upload_id = %state.upload_id, "Upload already gone");
                }
                Err(err) => return Err(err),
            }
        }

        state.settle_in_flight();
        state.phase = TransferPhase::Aborted;
        info!(transfer = %state.transfer_id(), "Transfer aborted");
        self.reporter.transfer_aborted(&state.transfer_id());
        Ok(())
    }

    /// Upload `source` as one object, using a multipart upload at or above
    /// the configured threshold
    ///
    /// Any failure aborts the multipart upload; use the individual steps to
    /// keep a transfer resumable.
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        source: Arc<dyn PartSource>,
        part_size_hint: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if source.size() < self.config.multipart_threshold {
            return self.put_single(bucket, key, &*source, cancel).await;
        }

        let mut state = self
            .begin_upload(bucket, key, &*source, part_size_hint, cancel)
            .await?;
        let result = match self.run_parts(&mut state, source, cancel).await {
            Ok(()) => self.complete(&mut state, cancel).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            warn!(upload_id = %state.upload_id, error = %err, "Upload failed; aborting");
            if let Err(abort_err) = self.abort(&mut state, &CancellationToken::new()).await {
                warn!(upload_id = %state.upload_id, error = %abort_err, "Abort failed");
            }
        }
        result
    }

    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        source: &dyn PartSource,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let data = source.read_part(0, source.size()).await?;
        let operation = wire::put_object(bucket, key, &data)?;
        let mut body = ReplayableBody::from_bytes(data);
        let execution = self
            .executor
            .execute(&operation, Some(&mut body), cancel)
            .await?;
        execution.response.etag().ok_or_else(|| {
            StratusError::Serialization("PutObject response carries no ETag".to_string())
        })
    }

    /// Keep only completed parts the provider still lists with the same ETag
    pub(super) async fn reconcile_upload(
        &self,
        state: &mut TransferState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let operation = wire::list_parts(&state.bucket, &state.key, &state.upload_id);
        let listed = match self.executor.execute(&operation, None, cancel).await {
            Ok(execution) => wire::parse_list_parts(&execution.response)?,
            Err(err) => {
                return Err(expired_if_missing(
                    err,
                    &state.upload_id,
                    &state.bucket,
                    &state.key,
                ))
            }
        };
        let listed: HashMap<u32, String> = listed
            .into_iter()
            .map(|part| (part.part_number, part.etag))
            .collect();

        let stale: Vec<u32> = state
            .parts
            .iter()
            .filter(|p| p.is_completed() && listed.get(&p.part_number) != p.etag.as_ref())
            .map(|p| p.part_number)
            .collect();
        if !stale.is_empty() {
            warn!(
                upload_id = %state.upload_id,
                parts = ?stale,
                "Provider no longer lists recorded parts; they will be uploaded again"
            );
        }
        for part_number in stale {
            state.reset_part(part_number);
        }

        info!(
            upload_id = %state.upload_id,
            completed_parts = state.completed_parts(),
            total_parts = state.parts.len(),
            "Multipart upload resumed"
        );
        Ok(())
    }
}

async fn upload_one(
    executor: &RequestExecutor,
    source: &dyn PartSource,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part: &PartDescriptor,
    cancel: &CancellationToken,
) -> Result<String> {
    let data = source.read_part(part.offset, part.length).await?;
    let operation = wire::upload_part(bucket, key, upload_id, part.part_number, &data)?;
    let mut body = ReplayableBody::from_bytes(data);

    match executor.execute(&operation, Some(&mut body), cancel).await {
        Ok(execution) => execution.response.etag().ok_or_else(|| {
            StratusError::Serialization(format!(
                "UploadPart response for part {} carries no ETag",
                part.part_number
            ))
        }),
        Err(err) => Err(expired_if_missing(err, upload_id, bucket, key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::credentials::{Credentials, StaticCredentialProvider};
    use crate::transfer::{BytesSource, PartState};
    use crate::transport::mock::{FailureTarget, InjectedFailure, MockStore};
    use std::time::Duration;
    use stratus_core_resilience::ManualClock;

    fn coordinator(store: &MockStore) -> TransferCoordinator {
        let mut config = ClientConfig::default();
        config.transfer.min_part_size = 100;
        config.transfer.multipart_threshold = 200;
        store.set_min_part_size(100);

        let executor = RequestExecutor::new(
            config,
            Arc::new(store.clone()),
            Arc::new(StaticCredentialProvider::new(Credentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            ))),
        )
        .unwrap()
        .with_clock(Arc::new(ManualClock::default()));
        TransferCoordinator::new(Arc::new(executor)).with_concurrency(4)
    }

    fn source(len: usize) -> Arc<BytesSource> {
        Arc::new(BytesSource::new(
            (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>(),
        ))
    }

    #[tokio::test]
    async fn test_upload_assembles_object() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let data = source(350);

        let etag = coordinator(&store)
            .upload("photos", "big.bin", data.clone(), Some(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(etag.ends_with("-4\""));
        let stored = store.object("photos", "big.bin").unwrap();
        assert_eq!(stored, data.read_part(0, 350).await.unwrap());
        let lists = store.completed_part_lists();
        assert_eq!(lists.len(), 1);
        let numbers: Vec<u32> = lists[0].iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_small_object_uses_single_put() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");

        coordinator(&store)
            .upload("photos", "small.bin", source(50), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(store.upload_ids("photos").is_empty());
        assert_eq!(store.object("photos", "small.bin").unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_part_size_below_minimum_sends_nothing() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let data = source(350);

        let err = coordinator(&store)
            .begin_upload("photos", "big.bin", &*data, Some(10), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StratusError::InvalidPartSize {
                part_size: 10,
                minimum: 100
            }
        ));
        assert!(store.requests().is_empty());
    }

    #[tokio::test]
    async fn test_failed_part_leaves_siblings_completed() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        store.fail_requests(
            FailureTarget::Part(2),
            InjectedFailure::Status {
                status: 400,
                code: "InvalidDigest".to_string(),
            },
            1,
        );
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();
        let data = source(300);

        let mut state = coordinator
            .begin_upload("photos", "big.bin", &*data, Some(100), &cancel)
            .await
            .unwrap();
        let err = coordinator
            .run_parts(&mut state, data.clone(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.failed_parts(), vec![2]);
        assert_eq!(state.part(2).unwrap().state, PartState::Failed);
        assert_eq!(state.completed_parts(), 2);

        coordinator
            .run_parts(&mut state, data, &cancel)
            .await
            .unwrap();
        coordinator.complete(&mut state, &cancel).await.unwrap();
        assert_eq!(state.phase, TransferPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parts_finishing_out_of_order_complete_in_order() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        store.delay_part(1, Duration::from_millis(300));
        store.delay_part(2, Duration::from_millis(200));
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();
        let data = source(300);

        let mut state = coordinator
            .begin_upload("photos", "big.bin", &*data, Some(100), &cancel)
            .await
            .unwrap();
        coordinator
            .run_parts(&mut state, data, &cancel)
            .await
            .unwrap();
        coordinator.complete(&mut state, &cancel).await.unwrap();

        let finished: Vec<u32> = store
            .requests()
            .iter()
            .filter_map(|r| r.part_number)
            .collect();
        assert_eq!(finished, vec![3, 2, 1]);
        let numbers: Vec<u32> = store.completed_part_lists()[0]
            .iter()
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();
        let data = source(300);

        let mut state = coordinator
            .begin_upload("photos", "big.bin", &*data, Some(100), &cancel)
            .await
            .unwrap();
        coordinator.abort(&mut state, &cancel).await.unwrap();
        coordinator.abort(&mut state, &cancel).await.unwrap();

        assert_eq!(state.phase, TransferPhase::Aborted);
        assert!(store.upload_ids("photos").is_empty());
        let deletes = store
            .requests()
            .iter()
            .filter(|r| r.method == http::Method::DELETE)
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test]
    async fn test_abort_of_forgotten_upload_succeeds() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();
        let data = source(300);

        let mut state = coordinator
            .begin_upload("photos", "big.bin", &*data, Some(100), &cancel)
            .await
            .unwrap();
        store.expire_upload("photos", &state.upload_id);

        coordinator.abort(&mut state, &cancel).await.unwrap();
        assert_eq!(state.phase, TransferPhase::Aborted);
    }

    #[tokio::test]
    async fn test_failed_completion_stays_abortable() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        store.fail_next_completion(400, "InvalidPart");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();
        let data = source(300);

        let mut state = coordinator
            .begin_upload("photos", "big.bin", &*data, Some(100), &cancel)
            .await
            .unwrap();
        coordinator
            .run_parts(&mut state, data, &cancel)
            .await
            .unwrap();

        let err = coordinator.complete(&mut state, &cancel).await.unwrap_err();
        assert!(matches!(err, StratusError::Completion { .. }));
        assert_eq!(state.phase, TransferPhase::Active);

        coordinator.abort(&mut state, &cancel).await.unwrap();
        assert!(store.upload_ids("photos").is_empty());
    }

    #[tokio::test]
    async fn test_expired_upload_stops_the_run() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();
        let data = source(300);

        let mut state = coordinator
            .begin_upload("photos", "big.bin", &*data, Some(100), &cancel)
            .await
            .unwrap();
        store.expire_upload("photos", &state.upload_id);

        let err = coordinator
            .run_parts(&mut state, data, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::TransferExpired { ref upload_id, .. } if *upload_id == state.upload_id));
    }
}
