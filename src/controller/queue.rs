//! Work queue of cluster keys
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! being processed marks it dirty; it is queued again when the worker calls
//! [`WorkQueue::done`]. Duplicate adds of a waiting key collapse into one.

use crate::common::{backoff_delay, METRICS};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        METRICS.queue_depth.set(state.queue.len() as u64);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Add `key` after an exponential backoff that grows with every
    /// consecutive failure. Returns the delay used.
    pub async fn add_rate_limited(
        self: &Arc<Self>,
        key: impl Into<String>,
        base: Duration,
        max: Duration,
    ) -> Duration {
        let key = key.into();
        let attempt = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            *failures - 1
        };
        let delay = backoff_delay(attempt, base, max);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn failures(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    METRICS.queue_depth.set(state.queue.len() as u64);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as processed; a key added meanwhile is queued again
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            METRICS.queue_depth.set(state.queue.len() as u64);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
