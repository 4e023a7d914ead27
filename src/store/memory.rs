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

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use base64::Engine;
use futures::StreamExt;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono};
use kube::ResourceExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;

use super::{
    parse_field_selector, Error, Event, ListOptions, Object, ObjectList, Propagation, Store,
    WatchStream,
};
use crate::apis::key_of;

/// Characters used for generated name suffixes, without vowels so that
/// no words are formed.
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LENGTH: usize = 5;
const WATCH_BUFFER: usize = 1024;

type Key = (String, String);

struct Inner<K> {
    objects: BTreeMap<Key, K>,
    version: u64,
}

/// An in-process [`Store`] with the semantics controllers rely on:
/// generated names, uids, resource version conflicts, finalizers,
/// paginated lists and watches that start from a snapshot.
///
/// Deletes do not cascade to dependents, owners are expected to remove
/// what they own before being deleted.
pub struct MemoryStore<K: Object> {
    inner: Arc<Mutex<Inner<K>>>,
    events: broadcast::Sender<Event<K>>,
    injected_conflicts: Arc<AtomicUsize>,
}

impl<K: Object> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
            injected_conflicts: self.injected_conflicts.clone(),
        }
    }
}

impl<K: Object> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key<K: Object>(object: &K) -> Key {
    (object.namespace().unwrap_or_default(), object.name_any())
}

fn in_namespace(key: &Key, namespace: &str) -> bool {
    namespace.is_empty() || key.0 == namespace
}

impl<K: Object> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
            })),
            events: broadcast::channel(WATCH_BUFFER).0,
            injected_conflicts: <_>::default(),
        }
    }

    /// Makes the next `count` updates fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Every stored object, ordered by namespace and name.
    pub fn objects(&self) -> Vec<K> {
        self.inner.lock().objects.values().cloned().collect()
    }

    fn publish(&self, event: Event<K>) {
        // Nobody watching is fine.
        let _ = self.events.send(event);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    fn conflict(key: &Key, message: impl Into<String>) -> Error {
        Error::Conflict {
            kind: K::kind(&()).into_owned(),
            key: key_of(&key.0, &key.1),
            message: message.into(),
        }
    }

    /// Writes `object` over the stored copy, finishing deletion when the
    /// last finalizer is gone.
    fn replace(&self, mut object: K, status_only: bool) -> Result<K, Error> {
        let key = object_key(&object);
        let mut inner = self.inner.lock();
        let version = inner.version + 1;

        let existing = inner
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found::<K>(key_of(&key.0, &key.1)))?;

        if self.take_injected_conflict() {
            return Err(Self::conflict(&key, "injected conflict"));
        }

        match &object.meta().resource_version {
            Some(resource_version) if Some(resource_version) != existing.meta().resource_version.as_ref() => {
                return Err(Self::conflict(
                    &key,
                    "the object has been modified; please apply your changes to the latest version and try again",
                ));
            }
            _ => {}
        }

        if status_only {
            let mut merged = serde_json::to_value(existing)?;
            let status = serde_json::to_value(&object)?
                .get("status")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            merged["status"] = status;
            object = serde_json::from_value(merged)?;
        } else {
            let meta = object.meta_mut();
            meta.uid = existing.meta().uid.clone();
            meta.creation_timestamp = existing.meta().creation_timestamp.clone();
            meta.deletion_timestamp = existing.meta().deletion_timestamp.clone();
            meta.generation = existing
                .meta()
                .generation
                .map(|generation| generation + 1);
        }

        inner.version = version;
        object.meta_mut().resource_version = Some(version.to_string());

        if object.meta().deletion_timestamp.is_some() && object.finalizers().is_empty() {
            inner.objects.remove(&key);
            drop(inner);
            self.publish(Event::Deleted(object.clone()));
        } else {
            inner.objects.insert(key, object.clone());
            drop(inner);
            self.publish(Event::Applied(object.clone()));
        }

        Ok(object)
    }

    fn generate_name(prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..NAME_SUFFIX_LENGTH)
            .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
            .collect();
        format!("{prefix}{suffix}")
    }

    fn snapshot(&self, namespace: &str) -> (Vec<K>, broadcast::Receiver<Event<K>>) {
        let inner = self.inner.lock();
        // Subscribing under the lock means no write lands between the
        // snapshot and the first event.
        let receiver = self.events.subscribe();
        let objects = inner
            .objects
            .iter()
            .filter(|(key, _)| in_namespace(key, namespace))
            .map(|(_, object)| object.clone())
            .collect();
        (objects, receiver)
    }
}

fn matches_fields<K: Object>(object: &K, fields: &[(&str, &str)]) -> bool {
    fields.iter().all(|(field, value)| match *field {
        "metadata.name" => object.name_any() == *value,
        "metadata.namespace" => object.namespace().as_deref().unwrap_or_default() == *value,
        _ => false,
    })
}

fn encode_token(key: &Key) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{}/{}", key.0, key.1))
}

fn decode_token(token: &str) -> Option<Key> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let (namespace, name) = text.split_once('/')?;
    Some((namespace.into(), name.into()))
}

#[async_trait::async_trait]
impl<K: Object> Store<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.inner
            .lock()
            .objects
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| Error::not_found::<K>(key_of(namespace, name)))
    }

    async fn list(&self, namespace: &str, options: &ListOptions) -> Result<ObjectList<K>, Error> {
        let fields = options
            .field_selector
            .as_deref()
            .map(parse_field_selector)
            .transpose()?
            .unwrap_or_default();

        let start = match options.continue_token.as_deref() {
            Some(token) => Some(decode_token(token).ok_or_else(|| Error::Invalid {
                kind: K::kind(&()).into_owned(),
                key: namespace.into(),
                message: format!("invalid continue token {token:?}"),
            })?),
            None => None,
        };

        let inner = self.inner.lock();
        let limit = options.limit.map_or(usize::MAX, |limit| limit.max(1) as usize);
        let mut matching = inner
            .objects
            .iter()
            .filter(|(key, _)| start.as_ref().map_or(true, |start| *key > start))
            .filter(|(key, _)| in_namespace(key, namespace))
            .filter(|(_, object)| options.label_selector.matches(object.labels()))
            .filter(|(_, object)| matches_fields(*object, &fields));

        let items: Vec<(&Key, &K)> = matching.by_ref().take(limit).collect();
        let continue_token = match (items.last(), matching.next()) {
            (Some((last, _)), Some(_)) => Some(encode_token(last)),
            _ => None,
        };

        Ok(ObjectList {
            items: items.into_iter().map(|(_, object)| object.clone()).collect(),
            continue_token,
            resource_version: Some(inner.version.to_string()),
        })
    }

    async fn create(&self, object: &K) -> Result<K, Error> {
        let mut object = object.clone();
        let meta = object.meta_mut();
        if meta.name.as_deref().map_or(true, str::is_empty) {
            let prefix = meta.generate_name.clone().ok_or_else(|| Error::Invalid {
                kind: K::kind(&()).into_owned(),
                key: String::new(),
                message: "name or generateName is required".into(),
            })?;
            meta.name = Some(Self::generate_name(&prefix));
        }

        let key = object_key(&object);
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: K::kind(&()).into_owned(),
                key: key_of(&key.0, &key.1),
            });
        }

        inner.version += 1;
        let meta = object.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(inner.version.to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);

        inner.objects.insert(key, object.clone());
        drop(inner);
        self.publish(Event::Applied(object.clone()));
        Ok(object)
    }

    async fn update(&self, object: &K) -> Result<K, Error> {
        self.replace(object.clone(), false)
    }

    async fn update_status(&self, object: &K) -> Result<K, Error> {
        self.replace(object.clone(), true)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        _propagation: Propagation,
    ) -> Result<(), Error> {
        let key = (namespace.to_owned(), name.to_owned());
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found::<K>(key_of(namespace, name)))?;

        if object.finalizers().is_empty() {
            let mut object = inner.objects.remove(&key).ok_or_else(|| Error::not_found::<K>(key_of(namespace, name)))?;
            inner.version += 1;
            object.meta_mut().resource_version = Some(inner.version.to_string());
            drop(inner);
            self.publish(Event::Deleted(object));
            return Ok(());
        }

        if object.meta().deletion_timestamp.is_some() {
            return Ok(());
        }

        object.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        let version = inner.version + 1;
        inner.version = version;
        let object = inner
            .objects
            .get_mut(&key)
            .map(|object| {
                object.meta_mut().resource_version = Some(version.to_string());
                object.clone()
            })
            .ok_or_else(|| Error::not_found::<K>(key_of(namespace, name)))?;
        drop(inner);
        self.publish(Event::Applied(object));
        Ok(())
    }

    fn watch(&self, namespace: &str) -> WatchStream<K> {
        let store = self.clone();
        let namespace = namespace.to_owned();

        async_stream::stream! {
            let (objects, mut receiver) = store.snapshot(&namespace);
            yield Ok(Event::Restarted(objects));

            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let relevant = match &event {
                            Event::Applied(object) | Event::Deleted(object) => {
                                in_namespace(&object_key(object), &namespace)
                            }
                            Event::Restarted(_) => true,
                        };

                        if relevant {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "memory watch lagged, relisting");
                        let (objects, fresh) = store.snapshot(&namespace);
                        receiver = fresh;
                        yield Ok(Event::Restarted(objects));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::Selector;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..<_>::default()
            },
            ..<_>::default()
        }
    }

    #[tokio::test]
    async fn create_generates_names_and_rejects_duplicates() {
        let store = MemoryStore::<Pod>::new();
        let mut template = pod("", &[]);
        template.metadata.generate_name = Some("gs-".into());

        let created = store.create(&template).await.unwrap();
        let name = created.name_any();
        assert!(name.starts_with("gs-") && name.len() == 3 + NAME_SUFFIX_LENGTH);
        assert!(created.metadata.uid.is_some());
        assert_eq!(Some("1".into()), created.metadata.resource_version);

        let error = store.create(&created).await.unwrap_err();
        assert!(error.is_already_exists());
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::<Pod>::new();
        let created = store.create(&pod("a", &[])).await.unwrap();

        let mut first = created.clone();
        first.metadata.labels = Some([("x".into(), "1".into())].into());
        store.update(&first).await.unwrap();

        let error = store.update(&created).await.unwrap_err();
        assert!(error.is_conflict(), "{error}");

        store.inject_conflicts(1);
        let latest = store.get("default", "a").await.unwrap();
        assert!(store.update(&latest).await.unwrap_err().is_conflict());
        assert!(store.update(&latest).await.is_ok());
    }

    #[tokio::test]
    async fn finalizers_delay_deletion() {
        let store = MemoryStore::<Pod>::new();
        let mut object = pod("a", &[]);
        object.metadata.finalizers = Some(vec!["agones.dev".into()]);
        store.create(&object).await.unwrap();

        store
            .delete("default", "a", Propagation::Background)
            .await
            .unwrap();
        let mut terminating = store.get("default", "a").await.unwrap();
        assert!(terminating.metadata.deletion_timestamp.is_some());

        terminating.metadata.finalizers = None;
        store.update(&terminating).await.unwrap();
        assert!(store.get("default", "a").await.unwrap_err().is_not_found());
        assert!(store
            .delete("default", "a", Propagation::Background)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn paginated_filtered_lists() {
        let store = MemoryStore::<Pod>::new();
        for index in 0..5 {
            let role = if index % 2 == 0 { "gameserver" } else { "other" };
            store
                .create(&pod(&format!("pod-{index}"), &[("role", role)]))
                .await
                .unwrap();
        }

        let options = ListOptions {
            label_selector: "role=gameserver".parse::<Selector>().unwrap(),
            limit: Some(2),
            ..<_>::default()
        };

        let page = store.list("default", &options).await.unwrap();
        assert_eq!(2, page.items.len());
        assert!(page.continue_token.is_some());

        let all = store.list_all("default", &options).await.unwrap();
        let names: Vec<_> = all.iter().map(|pod| pod.name_any()).collect();
        assert_eq!(vec!["pod-0", "pod-2", "pod-4"], names);

        let by_name = ListOptions {
            field_selector: Some("metadata.name=pod-3".into()),
            ..<_>::default()
        };
        assert_eq!(1, store.list("", &by_name).await.unwrap().items.len());
        assert!(store.list("other", &by_name).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn watch_starts_with_snapshot() {
        let store = MemoryStore::<Pod>::new();
        store.create(&pod("a", &[])).await.unwrap();

        let mut watch = store.watch("default");
        match watch.next().await {
            Some(Ok(Event::Restarted(objects))) => assert_eq!(1, objects.len()),
            other => panic!("unexpected {other:?}"),
        }

        let mut elsewhere = pod("b", &[]);
        elsewhere.metadata.namespace = Some("other".into());
        store.create(&elsewhere).await.unwrap();
        store.create(&pod("c", &[])).await.unwrap();
        store
            .delete("default", "a", Propagation::Background)
            .await
            .unwrap();

        match watch.next().await {
            Some(Ok(Event::Applied(object))) => assert_eq!("c", object.name_any()),
            other => panic!("unexpected {other:?}"),
        }
        match watch.next().await {
            Some(Ok(Event::Deleted(object))) => assert_eq!("a", object.name_any()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_updates_keep_spec() {
        use k8s_openapi::api::core::v1::{PodSpec, PodStatus};

        let store = MemoryStore::<Pod>::new();
        let mut object = pod("a", &[]);
        object.spec = Some(PodSpec {
            node_name: Some("n1".into()),
            ..<_>::default()
        });
        let created = store.create(&object).await.unwrap();

        let mut update = created.clone();
        update.spec = None;
        update.status = Some(PodStatus {
            phase: Some("Running".into()),
            ..<_>::default()
        });
        let stored = store.update_status(&update).await.unwrap();

        assert_eq!(Some("n1".into()), stored.spec.unwrap().node_name);
        assert_eq!(Some("Running".into()), stored.status.unwrap().phase);
    }
}
