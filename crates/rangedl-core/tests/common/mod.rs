#![allow(dead_code)]

pub mod range_server;

use rangedl_core::{EngineConfig, TransferEngine, TransferStore};
use rangedl_types::{Transfer, TransferStatus};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const OWNER: Uuid = Uuid::nil();

/// Deterministic, non-repeating-per-segment payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Engine timings shrunk so tests settle in well under a second per step
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        tick_interval_ms: 50,
        status_poll_ms: 40,
        progress_persist_ms: 20,
        worker_pool_size: Some(4),
        ..EngineConfig::default()
    }
}

pub fn engine(store: Arc<dyn TransferStore>) -> TransferEngine {
    TransferEngine::new(store, fast_config()).unwrap()
}

/// Poll the store until `done` holds for the transfer or `timeout` passes
pub async fn wait_for<F>(engine: &TransferEngine, id: Uuid, timeout: Duration, done: F) -> Transfer
where
    F: Fn(&Transfer) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let transfer = engine
            .store()
            .find_transfer(id)
            .await
            .unwrap()
            .expect("transfer exists");
        if done(&transfer) {
            return transfer;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "transfer {} still {} with {} bytes after {:?}",
                id, transfer.status, transfer.received, timeout
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_status(
    engine: &TransferEngine,
    id: Uuid,
    status: TransferStatus,
) -> Transfer {
    wait_for(engine, id, Duration::from_secs(20), |t| t.status == status).await
}
