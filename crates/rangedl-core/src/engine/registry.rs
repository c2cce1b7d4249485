//! Task registry - outstanding worker handles per transfer

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancelable reference to one dispatched segment worker
#[derive(Debug)]
pub struct TaskHandle {
    pub segment_index: u32,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(segment_index: u32, token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            segment_index,
            token,
            join: Some(join),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(segment_index: u32, token: CancellationToken) -> Self {
        Self {
            segment_index,
            token,
            join: None,
        }
    }

    /// Ask the worker to stop at its next check
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker to return
    pub async fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Handles keyed by transfer id.
///
/// One mutex guards the whole map, so a `register` racing a `drain` either
/// lands in the drained list or in a fresh list left for the next drain.
#[derive(Default)]
pub struct TaskRegistry {
    handles: Mutex<HashMap<Uuid, Vec<TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transfer_id: Uuid, handle: TaskHandle) {
        self.handles
            .lock()
            .entry(transfer_id)
            .or_default()
            .push(handle);
    }

    /// Remove and return every handle of `transfer_id`
    pub fn drain(&self, transfer_id: Uuid) -> Vec<TaskHandle> {
        self.handles.lock().remove(&transfer_id).unwrap_or_default()
    }

    /// Drain and signal cancellation to every handle of `transfer_id`
    pub fn cancel_all(&self, transfer_id: Uuid) -> Vec<TaskHandle> {
        let handles = self.drain(transfer_id);
        for handle in &handles {
            handle.cancel();
        }
        handles
    }

    /// Drop handles whose worker already returned
    pub fn prune_finished(&self) {
        let mut handles = self.handles.lock();
        handles.retain(|_, list| {
            list.retain(|h| !h.is_finished());
            !list.is_empty()
        });
    }

    pub fn len(&self, transfer_id: Uuid) -> usize {
        self.handles.lock().get(&transfer_id).map_or(0, Vec::len)
    }

    pub fn transfer_ids(&self) -> Vec<Uuid> {
        self.handles.lock().keys().copied().collect()
    }
}
