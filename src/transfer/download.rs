//! Ranged, resumable download into a local file

use super::{
    ensure_active, with_part_retries, wire, PartDescriptor, SourceDescriptor, TransferCoordinator,
    TransferDirection, TransferPhase, TransferState,
};
use crate::body::{md5_base64, md5_hex, sha256_base64};
use crate::error::{Result, StratusError};
use crate::executor::RequestExecutor;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl TransferCoordinator {
    /// Look the object up and lay out its parts
    ///
    /// The destination is created (or extended) to the object's size so
    /// parts can be written in any order.
    pub async fn begin_download(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
        part_size_hint: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<TransferState> {
        let execution = self
            .executor
            .execute(&wire::head_object(bucket, key), None, cancel)
            .await?;
        let info = wire::parse_object_info(&execution.response)?;

        let part_size = self.download_part_size(info.size, part_size_hint);
        prepare_destination(destination, info.size).await?;

        let state = TransferState::new(
            TransferDirection::Download,
            "",
            bucket,
            key,
            part_size,
            SourceDescriptor::File {
                path: destination.to_path_buf(),
                size: info.size,
            },
            info.etag,
        );
        info!(
            bucket,
            key,
            size = info.size,
            part_size,
            parts = state.parts.len(),
            destination = %destination.display(),
            "Download started"
        );
        self.reporter.transfer_started(
            &state.transfer_id(),
            key,
            state.object_size,
            state.parts.len() as u32,
            TransferDirection::Download,
        );
        Ok(state)
    }

    /// Fetch every `Pending` or `Failed` part into the destination
    ///
    /// Each part is verified against its length and any checksum the
    /// provider returns. A part that fails verification is left `Failed`
    /// and refetched by the next run.
    pub async fn run_download_parts(
        &self,
        state: &mut TransferState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_active(state, TransferDirection::Download)?;
        let SourceDescriptor::File { path, .. } = &state.source else {
            return Err(StratusError::InvalidTransferState(format!(
                "download {} has no destination file",
                state.transfer_id()
            )));
        };

        let target = PartTarget {
            executor: self.executor.clone(),
            bucket: state.bucket.clone(),
            key: state.key.clone(),
            object_etag: state.object_etag.clone(),
            path: path.clone(),
            transfer_id: state.transfer_id(),
        };
        let attempts = self.config.part_retry_attempts;

        self.drive_parts(state, cancel, move |part, token| {
            let target = target.clone();
            async move {
                with_part_retries(attempts, part.part_number, || {
                    target.download_one(&part, &token)
                })
                .await
            }
        })
        .await?;

        state.phase = TransferPhase::Completed;
        info!(
            bucket = %state.bucket,
            key = %state.key,
            bytes = state.object_size,
            "Download completed"
        );
        self.reporter
            .transfer_completed(&state.transfer_id(), state.object_size);
        Ok(())
    }

    /// Download `bucket/key` to `destination` in one call
    ///
    /// Returns the number of bytes written.
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
        part_size_hint: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut state = self
            .begin_download(bucket, key, destination, part_size_hint, cancel)
            .await?;
        self.run_download_parts(&mut state, cancel).await?;
        Ok(state.object_size)
    }

    /// Check the object is unchanged and the destination still holds the
    /// recorded parts
    pub(super) async fn reconcile_download(
        &self,
        state: &mut TransferState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let expired = || StratusError::TransferExpired {
            upload_id: state.transfer_id(),
            bucket: state.bucket.clone(),
            key: state.key.clone(),
        };

        let execution = match self
            .executor
            .execute(&wire::head_object(&state.bucket, &state.key), None, cancel)
            .await
        {
            Ok(execution) => execution,
            Err(StratusError::Service { status: 404, .. }) => return Err(expired()),
            Err(err) => return Err(err),
        };
        let info = wire::parse_object_info(&execution.response)?;
        if info.size != state.object_size || info.etag != state.object_etag {
            warn!(
                bucket = %state.bucket,
                key = %state.key,
                recorded = ?state.object_etag,
                current = ?info.etag,
                "Object changed since the download was paused"
            );
            return Err(expired());
        }

        let SourceDescriptor::File { path, .. } = &state.source else {
            return Err(StratusError::InvalidTransferState(format!(
                "download {} has no destination file",
                state.transfer_id()
            )));
        };
        let path = path.clone();
        prepare_destination(&path, state.object_size).await?;

        let mut stale = Vec::new();
        for part in state.parts.iter().filter(|p| p.is_completed()) {
            let on_disk = read_range(&path, part).await?;
            if part.etag.as_deref() != Some(quoted_md5(&on_disk).as_str()) {
                stale.push(part.part_number);
            }
        }
        if !stale.is_empty() {
            warn!(
                destination = %path.display(),
                parts = ?stale,
                "Destination no longer holds recorded parts; they will be fetched again"
            );
        }
        for part_number in stale {
            state.reset_part(part_number);
        }

        info!(
            bucket = %state.bucket,
            key = %state.key,
            completed_parts = state.completed_parts(),
            total_parts = state.parts.len(),
            "Download resumed"
        );
        Ok(())
    }

    fn download_part_size(&self, object_size: u64, hint: Option<u64>) -> u64 {
        let floor = object_size.div_ceil(u64::from(self.config.max_parts.max(1)));
        hint.unwrap_or(self.config.default_part_size)
            .max(floor)
            .max(1)
    }
}

/// Everything a download worker needs, owned so it can move into a task
#[derive(Debug, Clone)]
struct PartTarget {
    executor: std::sync::Arc<RequestExecutor>,
    bucket: String,
    key: String,
    object_etag: Option<String>,
    path: PathBuf,
    transfer_id: String,
}

impl PartTarget {
    /// Fetch, verify and write one part; returns the part's own digest
    async fn download_one(&self, part: &PartDescriptor, cancel: &CancellationToken) -> Result<String> {
        if part.length == 0 {
            return Ok(quoted_md5(&[]));
        }

        let operation = wire::get_range(
            &self.bucket,
            &self.key,
            &part.range_header(),
            self.object_etag.as_deref(),
        )?;
        let execution = match self.executor.execute(&operation, None, cancel).await {
            Ok(execution) => execution,
            Err(StratusError::Service { status: 412, .. }) => {
                return Err(StratusError::TransferExpired {
                    upload_id: self.transfer_id.clone(),
                    bucket: self.bucket.clone(),
                    key: self.key.clone(),
                })
            }
            Err(err) => return Err(err),
        };
        let response = execution.response;
        let data = response.body.as_ref();

        if data.len() as u64 != part.length {
            return Err(StratusError::ChecksumMismatch {
                algorithm: "length".to_string(),
                expected: part.length.to_string(),
                actual: data.len().to_string(),
            });
        }
        if let Some(expected) = response.header("content-md5") {
            verify("md5", expected, &md5_base64(data))?;
        }
        if let Some(expected) = response.header("x-amz-checksum-sha256") {
            verify("sha256", expected, &sha256_base64(data))?;
        }

        write_at(&self.path, part.offset, data).await?;
        debug!(part_number = part.part_number, bytes = data.len(), "Part written");
        Ok(quoted_md5(data))
    }
}

fn verify(algorithm: &str, expected: &str, actual: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StratusError::ChecksumMismatch {
            algorithm: algorithm.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", md5_hex(data))
}

/// Create the destination if needed and size it to the object, keeping
/// any bytes already written
async fn prepare_destination(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(size).await?;
    Ok(())
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

async fn read_range(path: &Path, part: &PartDescriptor) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(part.offset)).await?;
    let mut buffer = vec![0u8; part.length as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::credentials::{Credentials, StaticCredentialProvider};
    use crate::transfer::PartState;
    use crate::transport::mock::{FailureTarget, InjectedFailure, MockStore};
    use std::sync::Arc;
    use stratus_core_resilience::ManualClock;
    use tempfile::tempdir;

    fn coordinator(store: &MockStore) -> TransferCoordinator {
        let executor = RequestExecutor::new(
            ClientConfig::default(),
            Arc::new(store.clone()),
            Arc::new(StaticCredentialProvider::new(Credentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            ))),
        )
        .unwrap()
        .with_clock(Arc::new(ManualClock::default()));
        TransferCoordinator::new(Arc::new(executor)).with_concurrency(2)
    }

    fn object(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_download_reassembles_object() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let data = object(1000);
        store.put_object("photos", "big.bin", data.clone());
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("big.bin");

        let written = coordinator(&store)
            .download("photos", "big.bin", &path, Some(300), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 1000);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_object_downloads_without_ranged_get() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        store.put_object("photos", "empty", Vec::new());
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");

        coordinator(&store)
            .download("photos", "empty", &path, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(std::fs::read(&path).unwrap().is_empty());
        assert!(store
            .requests()
            .iter()
            .all(|r| r.method != http::Method::GET));
    }

    #[tokio::test]
    async fn test_corrupt_part_is_refetched_on_next_run() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let data = object(900);
        store.put_object("photos", "big.bin", data.clone());
        store.corrupt_range(300, 1);
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();

        let mut state = coordinator
            .begin_download("photos", "big.bin", &path, Some(300), &cancel)
            .await
            .unwrap();
        let err = coordinator
            .run_download_parts(&mut state, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.failed_parts(), vec![2]);
        assert_eq!(state.part(2).unwrap().state, PartState::Failed);
        assert_eq!(state.completed_parts(), 2);

        coordinator
            .run_download_parts(&mut state, &cancel)
            .await
            .unwrap();
        assert_eq!(state.phase, TransferPhase::Completed);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_changed_object_expires_download() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        store.put_object("photos", "big.bin", object(600));
        store.fail_requests(
            FailureTarget::RangeStart(300),
            InjectedFailure::Status {
                status: 503,
                code: "SlowDown".to_string(),
            },
            u32::MAX,
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();

        let mut state = coordinator
            .begin_download("photos", "big.bin", &path, Some(300), &cancel)
            .await
            .unwrap();
        assert!(coordinator
            .run_download_parts(&mut state, &cancel)
            .await
            .is_err());
        let snapshot = coordinator.pause(&mut state);

        store.put_object("photos", "big.bin", object(700));
        let err = coordinator.resume(snapshot, &cancel).await.unwrap_err();
        assert!(matches!(err, StratusError::TransferExpired { .. }));
    }

    #[tokio::test]
    async fn test_resume_keeps_parts_already_on_disk() {
        let store = MockStore::new().with_bucket("photos", "us-east-1");
        let data = object(600);
        store.put_object("photos", "big.bin", data.clone());
        store.fail_requests(
            FailureTarget::RangeStart(300),
            InjectedFailure::Status {
                status: 403,
                code: "AccessDenied".to_string(),
            },
            1,
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let coordinator = coordinator(&store);
        let cancel = CancellationToken::new();

        let mut state = coordinator
            .begin_download("photos", "big.bin", &path, Some(300), &cancel)
            .await
            .unwrap();
        assert!(coordinator
            .run_download_parts(&mut state, &cancel)
            .await
            .is_err());
        let json = coordinator.pause(&mut state).to_json().unwrap();

        store.clear_requests();
        let snapshot = super::super::TransferSnapshot::from_json(&json).unwrap();
        let mut resumed = coordinator.resume(snapshot, &cancel).await.unwrap();
        assert_eq!(resumed.completed_parts(), 1);
        coordinator
            .run_download_parts(&mut resumed, &cancel)
            .await
            .unwrap();

        let ranged: Vec<Option<u64>> = store
            .requests()
            .iter()
            .filter(|r| r.method == http::Method::GET)
            .map(|r| r.range_start)
            .collect();
        assert_eq!(ranged, vec![Some(300)]);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }
}
