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

//! Local caches of upstream objects, fed by a list and watch loop.
//!
//! An [`Informer`] tails a [`Store`](crate::store::Store) watch, keeps every
//! object in a `namespace/name` keyed map shared through [`Lister`]s, and
//! dispatches changes to registered [`EventHandler`]s from a single task.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{IntCounterVec, IntGaugeVec};

use crate::{
    apis::{self, Selector},
    metrics::{self, KIND_LABEL},
    signal::ShutdownRx,
    store::{DynStore, Event, Object},
};

/// Default period between full replays of the cache.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    metrics::register(
        IntCounterVec::new(
            metrics::opts("events_total", "watch", "Watch events received, by kind and type"),
            &[KIND_LABEL, "type"],
        )
        .unwrap(),
    )
});

static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    metrics::register(
        IntCounterVec::new(
            metrics::opts("errors_total", "watch", "Watch stream errors, by kind"),
            &[KIND_LABEL],
        )
        .unwrap(),
    )
});

static CACHED_OBJECTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    metrics::register(
        IntGaugeVec::new(
            metrics::opts("cached_objects", "watch", "Objects held in the local cache"),
            &[KIND_LABEL],
        )
        .unwrap(),
    )
});

fn kind<K: Object>() -> String {
    K::kind(&()).into_owned()
}

fn track_event<K: Object>(event: &Event<K>) {
    let ty = match event {
        Event::Applied(_) => "applied",
        Event::Deleted(_) => "deleted",
        Event::Restarted(_) => "restarted",
    };

    EVENTS_TOTAL.with_label_values(&[&kind::<K>(), ty]).inc();
}

/// Receives changes from an [`Informer`]. Called from the informer's task,
/// implementations must not block.
pub trait EventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, _object: &Arc<K>) {}

    /// Also called with `old == new` on every periodic resync.
    fn on_update(&self, _old: &Arc<K>, _new: &Arc<K>) {}

    /// `object` is the last cached copy when there is one.
    fn on_delete(&self, _object: &Arc<K>) {}
}

type Cache<K> = Arc<RwLock<BTreeMap<String, Arc<K>>>>;

/// A read only view of an [`Informer`]'s cache.
pub struct Lister<K> {
    cache: Cache<K>,
    synced: tokio::sync::watch::Receiver<bool>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K: Object> Lister<K> {
    /// A synced lister over a fixed set of objects, with no informer behind
    /// it.
    pub fn from_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let cache = objects
            .into_iter()
            .map(|object| (apis::key(&object), Arc::new(object)))
            .collect();

        Self {
            cache: Arc::new(RwLock::new(cache)),
            synced: tokio::sync::watch::channel(true).1,
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_key(&apis::key_of(namespace, name))
    }

    pub fn get_key(&self, key: &str) -> Option<Arc<K>> {
        self.cache.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.cache.read().values().cloned().collect()
    }

    /// Objects in `namespace`, every object when it is empty.
    pub fn list_in(&self, namespace: &str) -> Vec<Arc<K>> {
        self.filter(|object| {
            namespace.is_empty() || object.meta().namespace.as_deref() == Some(namespace)
        })
    }

    pub fn list_matching(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        self.filter(|object| {
            (namespace.is_empty() || object.meta().namespace.as_deref() == Some(namespace))
                && selector.matches(kube::ResourceExt::labels(object))
        })
    }

    pub fn filter(&self, predicate: impl Fn(&K) -> bool) -> Vec<Arc<K>> {
        self.cache
            .read()
            .values()
            .filter(|object| predicate(object))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the first full list has been received.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first full list has been received.
    pub async fn synced(&self) {
        let mut synced = self.synced.clone();
        // An error means the informer is gone, and will never sync.
        let _ = synced.wait_for(|synced| *synced).await;
    }
}

/// Keeps a local cache of one kind in step with the store.
pub struct Informer<K: Object> {
    store: DynStore<K>,
    namespace: String,
    resync_period: Duration,
    cache: Cache<K>,
    synced: tokio::sync::watch::Sender<bool>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
}

impl<K: Object> Informer<K> {
    /// Watches `namespace`, or every namespace when it is empty.
    pub fn new(store: DynStore<K>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            cache: <_>::default(),
            synced: tokio::sync::watch::channel(false).0,
            handlers: Vec::new(),
        }
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn lister(&self) -> Lister<K> {
        Lister {
            cache: self.cache.clone(),
            synced: self.synced.subscribe(),
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn spawn(self, shutdown: ShutdownRx) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Lists, watches and dispatches until `shutdown` fires.
    #[tracing::instrument(skip_all, fields(kind = %kind::<K>(), namespace = %self.namespace))]
    pub async fn run(self, mut shutdown: ShutdownRx) {
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync_period,
            self.resync_period,
        );
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut failures = 0u32;
        loop {
            let mut stream = self.store.watch(&self.namespace);
            tracing::debug!("watch started");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("watch stopped");
                        return;
                    }
                    _ = resync.tick() => self.resync(),
                    event = stream.next() => match event {
                        Some(Ok(event)) => {
                            failures = 0;
                            track_event(&event);
                            self.apply(event);
                        }
                        Some(Err(error)) => {
                            ERRORS_TOTAL.with_label_values(&[&kind::<K>()]).inc();
                            tracing::warn!(%error, "watch error");
                        }
                        None => break,
                    },
                }
            }

            failures += 1;
            let delay = BACKOFF_BASE
                .saturating_mul(2u32.saturating_pow(failures.min(16)))
                .min(BACKOFF_MAX);
            tracing::warn!(?delay, "watch stream ended, relisting");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn apply(&self, event: Event<K>) {
        match event {
            Event::Applied(object) => {
                let object = Arc::new(object);
                let old = self
                    .cache
                    .write()
                    .insert(apis::key(&*object), object.clone());
                match old {
                    Some(old) => self.dispatch(|handler| handler.on_update(&old, &object)),
                    None => self.dispatch(|handler| handler.on_add(&object)),
                }
            }
            Event::Deleted(object) => {
                let key = apis::key(&object);
                let object = self
                    .cache
                    .write()
                    .remove(&key)
                    .unwrap_or_else(|| Arc::new(object));
                self.dispatch(|handler| handler.on_delete(&object));
            }
            Event::Restarted(objects) => {
                let fresh: BTreeMap<String, Arc<K>> = objects
                    .into_iter()
                    .map(|object| (apis::key(&object), Arc::new(object)))
                    .collect();

                let previous = std::mem::replace(&mut *self.cache.write(), fresh.clone());
                for (key, object) in &previous {
                    if !fresh.contains_key(key) {
                        self.dispatch(|handler| handler.on_delete(object));
                    }
                }

                for (key, object) in &fresh {
                    match previous.get(key) {
                        Some(old) => self.dispatch(|handler| handler.on_update(old, object)),
                        None => self.dispatch(|handler| handler.on_add(object)),
                    }
                }

                self.synced.send_replace(true);
            }
        }

        CACHED_OBJECTS
            .with_label_values(&[&kind::<K>()])
            .set(self.cache.read().len() as i64);
    }

    fn resync(&self) {
        let objects: Vec<Arc<K>> = self.cache.read().values().cloned().collect();
        tracing::trace!(objects = objects.len(), "resync");
        for object in &objects {
            self.dispatch(|handler| handler.on_update(object, object));
        }
    }

    fn dispatch(&self, call: impl Fn(&dyn EventHandler<K>)) {
        for handler in &self.handlers {
            call(&**handler);
        }
    }
}
