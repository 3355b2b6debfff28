use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use complyd_model::ObjectKey;

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
}

/// Deduplicating work queue keyed by scan.
///
/// A key is handed to at most one worker at a time. Adding a key while it is
/// being processed marks it dirty and it is queued again once the worker
/// calls [`WorkQueue::done`].
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    failures: DashMap<ObjectKey, u32>,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            failures: DashMap::new(),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        {
            let mut state = self.lock();
            if state.processing.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            if !state.queued.insert(key.clone()) {
                return;
            }
            state.order.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Adds `key` after `delay` unless the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(key) = self.pop() {
                return Some(key);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    fn pop(&self) -> Option<ObjectKey> {
        let mut state = self.lock();
        let key = state.order.pop_front()?;
        state.queued.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Releases `key` after a worker finished with it.
    pub fn done(&self, key: &ObjectKey) {
        let requeue = {
            let mut state = self.lock();
            state.processing.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.add(key.clone());
        }
    }

    /// Records a failed reconcile and returns the consecutive failure count.
    pub fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut entry = self.failures.entry(key.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
