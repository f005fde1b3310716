//! Bounded-concurrency admission gate for worker processes.
//!
//! FIFO: work beyond `max_concurrent` queues and is admitted as running slots
//! free up. Failures release their slot like any other completion and never
//! disturb the queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

/// Default number of concurrently running workers.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

struct PoolState {
    running: usize,
    max_concurrent: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Shared admission gate. Cheap to clone.
#[derive(Clone)]
pub struct ProcessPool {
    state: Arc<Mutex<PoolState>>,
}

impl ProcessPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                running: 0,
                max_concurrent: max_concurrent.max(1),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Run `fut` under a pool slot: immediately if capacity allows, otherwise
    /// after queued predecessors finish. The slot is released when the future
    /// resolves, whatever its outcome.
    pub async fn execute<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        fut.await
    }

    async fn acquire(&self) -> SlotGuard {
        let waiter = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.running < state.max_concurrent {
                state.running += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // A closed channel means the pool itself was dropped mid-wait;
            // treat the slot as granted so the caller can still run.
            let _ = rx.await;
        }

        SlotGuard { pool: self.clone() }
    }

    /// Release one slot: hand it to the oldest live waiter, or shrink the
    /// running count. Waiters that gave up (dropped receiver) are skipped.
    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running > state.max_concurrent {
            // The limit was lowered while we ran; absorb the excess slot.
            state.running -= 1;
            return;
        }
        loop {
            match state.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.running -= 1;
                    return;
                }
            }
        }
    }

    /// Update the concurrency limit, admitting queued work up to the new cap.
    pub fn set_pool_size(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.max(1);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            old = state.max_concurrent,
            new = max_concurrent,
            "Updating process pool size"
        );
        state.max_concurrent = max_concurrent;
        while state.running < state.max_concurrent {
            match state.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        state.running += 1;
                    }
                }
                None => break,
            }
        }
    }

    pub fn get_status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        PoolStatus {
            running: state.running,
            queued: state.waiters.len(),
            max_concurrent: state.max_concurrent,
        }
    }
}

struct SlotGuard {
    pool: ProcessPool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}
