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

//! The upstream object store every controller reads from and writes to.
//!
//! [`cluster::KubeStore`] talks to a Kubernetes API server, while
//! [`memory::MemoryStore`] keeps everything in process for tests and local
//! runs. Both offer optimistic concurrency through resource versions and a
//! watch stream that begins with a full snapshot.

pub mod cluster;
pub mod memory;

use std::fmt::Debug;

use futures::stream::BoxStream;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

use crate::apis::Selector;

pub use kube::runtime::watcher::Event;

/// Anything that can be kept in a [`Store`].
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {key:?} not found")]
    NotFound { kind: String, key: String },
    #[error("{kind} {key:?} already exists")]
    AlreadyExists { kind: String, key: String },
    #[error("conflict writing {kind} {key:?}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },
    #[error("{kind} {key:?} is invalid: {message}")]
    Invalid {
        kind: String,
        key: String,
        message: String,
    },
    #[error("unsupported selector {0:?}")]
    Selector(String),
    #[error("watch failed: {0}")]
    Watch(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    pub(crate) fn not_found<K: Resource<DynamicType = ()>>(key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: K::kind(&()).into_owned(),
            key: key.into(),
        }
    }

    /// Classifies an API server error by its status code.
    pub(crate) fn from_kube<K: Resource<DynamicType = ()>>(
        key: impl Into<String>,
        error: kube::Error,
    ) -> Self {
        let kind = K::kind(&()).into_owned();
        let key = key.into();
        match error {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound { kind, key },
                409 if response.reason == "AlreadyExists" => Self::AlreadyExists { kind, key },
                409 => Self::Conflict {
                    kind,
                    key,
                    message: response.message,
                },
                422 => Self::Invalid {
                    kind,
                    key,
                    message: response.message,
                },
                _ => Self::Kube(kube::Error::Api(response)),
            },
            error => Self::Kube(error),
        }
    }
}

/// How dependents of a deleted object are cleaned up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub label_selector: Selector,
    /// Only `metadata.name` and `metadata.namespace` equality are supported
    /// by every store.
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

impl ListOptions {
    pub fn labels(selector: Selector) -> Self {
        Self {
            label_selector: selector,
            ..<_>::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    /// Set when more items remain, pass it back to get the next page.
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

/// The stream of changes returned by [`Store::watch`].
pub type WatchStream<K> = BoxStream<'static, Result<Event<K>, Error>>;

/// The operations controllers need from the upstream store. `namespace` is
/// empty for cluster scoped kinds, and for lists and watches across every
/// namespace.
#[async_trait::async_trait]
pub trait Store<K: Object>: Send + Sync + 'static {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error>;

    async fn list(&self, namespace: &str, options: &ListOptions) -> Result<ObjectList<K>, Error>;

    async fn create(&self, object: &K) -> Result<K, Error>;

    /// Replaces the object, failing with a conflict if its resource version
    /// is stale.
    async fn update(&self, object: &K) -> Result<K, Error>;

    async fn update_status(&self, object: &K) -> Result<K, Error>;

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation)
        -> Result<(), Error>;

    /// Every change in `namespace`, starting with a [`Event::Restarted`]
    /// snapshot and again whenever the stream had to re-list.
    fn watch(&self, namespace: &str) -> WatchStream<K>;

    /// Follows continue tokens until every matching object is listed.
    async fn list_all(&self, namespace: &str, options: &ListOptions) -> Result<Vec<K>, Error> {
        let mut options = options.clone();
        let mut items = Vec::new();
        loop {
            let page = self.list(namespace, &options).await?;
            items.extend(page.items);
            match page.continue_token {
                Some(token) => options.continue_token = Some(token),
                None => return Ok(items),
            }
        }
    }
}

/// A shared handle to a store.
pub type DynStore<K> = std::sync::Arc<dyn Store<K>>;

/// Splits a `field=value` field selector into its parts.
pub(crate) fn parse_field_selector(selector: &str) -> Result<Vec<(&str, &str)>, Error> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            let (field, value) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(|| Error::Selector(term.into()))?;
            match field.trim() {
                field @ ("metadata.name" | "metadata.namespace") => Ok((field, value.trim())),
                _ => Err(Error::Selector(term.into())),
            }
        })
        .collect()
}
