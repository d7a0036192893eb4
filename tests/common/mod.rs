//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use stratus::config::ClientConfig;
use stratus::credentials::{Credentials, StaticCredentialProvider};
use stratus::transfer::{BytesSource, TransferCoordinator};
use stratus::transport::mock::MockStore;
use stratus::{ManualClock, RequestExecutor};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

pub fn credentials() -> Arc<StaticCredentialProvider> {
    Arc::new(StaticCredentialProvider::new(Credentials::new(
        "AKIDEXAMPLE",
        "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
    )))
}

/// Executor over `store` with a manual clock, so backoff never waits
pub fn executor(store: &MockStore, config: ClientConfig) -> (Arc<RequestExecutor>, ManualClock) {
    stratus::logging::init_test_logging();
    let clock = ManualClock::default();
    let executor = RequestExecutor::new(config, Arc::new(store.clone()), credentials())
        .expect("valid config")
        .with_clock(Arc::new(clock.clone()));
    (Arc::new(executor), clock)
}

/// Config with a 1 KiB part minimum so multipart tests stay small
pub fn small_part_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.transfer.min_part_size = KIB as u64;
    config.transfer.multipart_threshold = 2 * KIB as u64;
    config.transfer.concurrency = 4;
    config
}

/// Coordinator for `store` using [`small_part_config`]
pub fn coordinator(store: &MockStore) -> (TransferCoordinator, ManualClock) {
    store.set_min_part_size(KIB as u64);
    let (executor, clock) = executor(store, small_part_config());
    (TransferCoordinator::new(executor), clock)
}

/// Deterministic, non-repeating-per-part test data
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 251) as u8).collect()
}

pub fn source(len: usize) -> Arc<BytesSource> {
    Arc::new(BytesSource::new(pattern(len)))
}
