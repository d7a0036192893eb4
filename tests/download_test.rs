mod common;

use common::{coordinator, pattern, KIB};
use http::Method;
use std::time::Duration;
use stratus::transfer::{PartState, TransferPhase, TransferSnapshot};
use stratus::transport::mock::{FailureTarget, InjectedFailure, MockStore};
use stratus::{CancellationToken, ErrorCategory, StratusError};

const PART: u64 = KIB as u64;

#[tokio::test]
async fn test_download_from_another_region() {
    let store = MockStore::new().with_bucket("archive", "ap-southeast-2");
    let data = pattern(5 * KIB + 17);
    store.put_object("archive", "big.bin", data.clone());
    let (coordinator, _) = coordinator(&store);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");

    let written = coordinator
        .download("archive", "big.bin", &path, Some(PART), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&path).unwrap(), data);
    let misdirected = store
        .requests()
        .iter()
        .filter(|r| r.signing_region != "ap-southeast-2")
        .count();
    assert_eq!(misdirected, 1);
}

#[tokio::test]
async fn test_corruption_is_reported_as_integrity_failure() {
    let store = MockStore::new().with_bucket("photos", "us-east-1");
    let data = pattern(3 * KIB);
    store.put_object("photos", "big.bin", data.clone());
    store.corrupt_range(2 * PART, 1);
    let (coordinator, _) = coordinator(&store);
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");

    let mut state = coordinator
        .begin_download("photos", "big.bin", &path, Some(PART), &cancel)
        .await
        .unwrap();
    let err = coordinator
        .run_download_parts(&mut state, &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::DataIntegrity);
    assert_eq!(err.failed_parts(), vec![3]);
    let ranged = store
        .requests()
        .iter()
        .filter(|r| r.range_start == Some(2 * PART))
        .count();
    assert_eq!(ranged, 1);

    coordinator
        .run_download_parts(&mut state, &cancel)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_download_resumes() {
    let store = MockStore::new().with_bucket("photos", "us-east-1");
    let data = pattern(4 * KIB);
    store.put_object("photos", "big.bin", data.clone());
    store.fail_requests(FailureTarget::RangeStart(3 * PART), InjectedFailure::Hang, 1);
    let (coordinator, _) = coordinator(&store);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");

    let cancel = CancellationToken::new();
    let mut state = coordinator
        .begin_download("photos", "big.bin", &path, Some(PART), &cancel)
        .await
        .unwrap();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.cancel();
    });
    let err = coordinator
        .run_download_parts(&mut state, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::Cancelled));
    assert_eq!(state.part(4).unwrap().state, PartState::Pending);
    assert_eq!(state.completed_parts(), 3);

    let json = coordinator.pause(&mut state).to_json().unwrap();
    store.clear_requests();

    let cancel = CancellationToken::new();
    let mut resumed = coordinator
        .resume(TransferSnapshot::from_json(&json).unwrap(), &cancel)
        .await
        .unwrap();
    coordinator
        .run_download_parts(&mut resumed, &cancel)
        .await
        .unwrap();

    assert_eq!(resumed.phase, TransferPhase::Completed);
    let fetched: Vec<Option<u64>> = store
        .requests()
        .iter()
        .filter(|r| r.method == Method::GET)
        .map(|r| r.range_start)
        .collect();
    assert_eq!(fetched, vec![Some(3 * PART)]);
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn test_object_replaced_mid_download_expires_it() {
    let store = MockStore::new().with_bucket("photos", "us-east-1");
    store.put_object("photos", "big.bin", pattern(3 * KIB));
    let (coordinator, _) = coordinator(&store);
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");

    let mut state = coordinator
        .begin_download("photos", "big.bin", &path, Some(PART), &cancel)
        .await
        .unwrap();
    store.put_object("photos", "big.bin", pattern(3 * KIB + 1));

    let err = coordinator
        .run_download_parts(&mut state, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::TransferExpired { ref key, .. } if key == "big.bin"));
}
