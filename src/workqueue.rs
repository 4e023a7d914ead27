/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! A keyed, rate limited work queue. A key is never handed to two workers
//! at once, and a key added while it is being processed is queued again
//! once the worker is done with it.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{IntCounterVec, IntGaugeVec};
use tokio::sync::Notify;
use tracing_futures::Instrument;

use crate::{metrics, signal::ShutdownRx};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);

const QUEUE_LABEL: &str = "queue";

static DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    metrics::register(
        IntGaugeVec::new(
            metrics::opts("depth", "workqueue", "Keys waiting to be processed"),
            &[QUEUE_LABEL],
        )
        .unwrap(),
    )
});

static ADDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    metrics::register(
        IntCounterVec::new(
            metrics::opts("adds_total", "workqueue", "Keys added to the queue"),
            &[QUEUE_LABEL],
        )
        .unwrap(),
    )
});

static RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    metrics::register(
        IntCounterVec::new(
            metrics::opts("retries_total", "workqueue", "Keys requeued after a failure"),
            &[QUEUE_LABEL],
        )
        .unwrap(),
    )
});

/// Processes a single key taken from a [`WorkQueue`].
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> crate::Result<()>;
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                base_delay,
                max_delay,
                state: <_>::default(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queues `key` unless it is already waiting.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }

        ADDS_TOTAL.with_label_values(&[&self.inner.name]).inc();
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            DEPTH
                .with_label_values(&[&self.inner.name])
                .set(state.queue.len() as i64);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            return self.add(key);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queues `key` after a delay that doubles with every consecutive
    /// failure, until [`WorkQueue::forget`] is called.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            let delay = self.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };

        RETRIES_TOTAL.with_label_values(&[&self.inner.name]).inc();
        self.add_after(key, delay);
    }

    fn backoff(&self, failures: u32) -> Duration {
        self.inner
            .base_delay
            .saturating_mul(2u32.saturating_pow(failures.min(31)))
            .min(self.inner.max_delay)
    }

    pub fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next key, `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    DEPTH
                        .with_label_values(&[&self.inner.name])
                        .set(state.queue.len() as i64);
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as processed, queueing it again if it was added while
    /// it was being worked on.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Runs `workers` tasks feeding keys to `reconciler` until `shutdown`
    /// fires. Failed keys are retried with backoff and never dropped.
    pub async fn run<R: Reconciler>(
        self,
        reconciler: Arc<R>,
        workers: usize,
        mut shutdown: ShutdownRx,
    ) {
        tracing::info!(queue = %self.inner.name, workers, "starting workers");
        let tasks: Vec<_> = (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let reconciler = reconciler.clone();
                let span = tracing::debug_span!("worker", queue = %self.inner.name, worker);
                tokio::spawn(
                    async move {
                        while let Some(key) = queue.get().await {
                            match reconciler.reconcile(&key).await {
                                Ok(()) => queue.forget(&key),
                                Err(error) => {
                                    tracing::warn!(%key, %error, "error syncing, requeuing");
                                    queue.add_rate_limited(key.clone());
                                }
                            }
                            queue.done(&key);
                        }
                    }
                    .instrument(span),
                )
            })
            .collect();

        let _ = shutdown.changed().await;
        tracing::info!(queue = %self.inner.name, "shutting down workers");
        self.shutdown();
        futures::future::join_all(tasks).await;
    }
}

/// Queues the key of every added or updated object.
impl<K: crate::store::Object> crate::watch::EventHandler<K> for WorkQueue {
    fn on_add(&self, object: &Arc<K>) {
        self.add(crate::apis::key(&**object));
    }

    fn on_update(&self, _: &Arc<K>, new: &Arc<K>) {
        self.add(crate::apis::key(&**new));
    }
}
