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

use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    core::{ClusterResourceScope, NamespaceResourceScope},
    runtime::{watcher, WatchStreamExt},
    Client, Resource, ResourceExt,
};

use super::{Error, ListOptions, Object, ObjectList, Propagation, Store, WatchStream};
use crate::apis::key_of;

/// A [`Store`] backed by the Kubernetes API server.
pub struct KubeStore<K> {
    client: Client,
    api: fn(Client, &str) -> Api<K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            api: self.api,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope>,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api: |client, namespace| {
                if namespace.is_empty() {
                    Api::all(client)
                } else {
                    Api::namespaced(client, namespace)
                }
            },
        }
    }
}

impl<K> KubeStore<K>
where
    K: Object + Resource<Scope = ClusterResourceScope>,
{
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api: |client, _| Api::all(client),
        }
    }
}

impl<K: Object> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some("agones-allocator".into()),
        }
    }
}

impl From<Propagation> for PropagationPolicy {
    fn from(propagation: Propagation) -> Self {
        match propagation {
            Propagation::Background => Self::Background,
            Propagation::Foreground => Self::Foreground,
            Propagation::Orphan => Self::Orphan,
        }
    }
}

#[async_trait::async_trait]
impl<K: Object> Store<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|error| Error::from_kube::<K>(key_of(namespace, name), error))
    }

    async fn list(&self, namespace: &str, options: &ListOptions) -> Result<ObjectList<K>, Error> {
        let mut params = ListParams::default();
        if !options.label_selector.is_empty() {
            params = params.labels(&options.label_selector.to_string());
        }
        if let Some(fields) = &options.field_selector {
            params = params.fields(fields);
        }
        params.limit = options.limit;
        params.continue_token = options.continue_token.clone();

        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|error| Error::from_kube::<K>(namespace, error))?;

        Ok(ObjectList {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
            resource_version: list.metadata.resource_version,
        })
    }

    async fn create(&self, object: &K) -> Result<K, Error> {
        let namespace = object.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&Self::post_params(), object)
            .await
            .map_err(|error| Error::from_kube::<K>(crate::apis::key(object), error))
    }

    async fn update(&self, object: &K) -> Result<K, Error> {
        let namespace = object.namespace().unwrap_or_default();
        self.api(&namespace)
            .replace(&object.name_any(), &Self::post_params(), object)
            .await
            .map_err(|error| Error::from_kube::<K>(crate::apis::key(object), error))
    }

    async fn update_status(&self, object: &K) -> Result<K, Error> {
        let namespace = object.namespace().unwrap_or_default();
        let data = serde_json::to_vec(object)?;
        self.api(&namespace)
            .replace_status(&object.name_any(), &Self::post_params(), data)
            .await
            .map_err(|error| Error::from_kube::<K>(crate::apis::key(object), error))
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error> {
        let params = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..<_>::default()
        };

        self.api(namespace)
            .delete(name, &params)
            .await
            .map(drop)
            .map_err(|error| Error::from_kube::<K>(key_of(namespace, name), error))
    }

    fn watch(&self, namespace: &str) -> WatchStream<K> {
        let mut config = watcher::Config::default()
            // Default timeout is 5 minutes, far too slow for us to react.
            .timeout(15);
        // Retrieve unbounded results.
        config.page_size = None;

        watcher(self.api(namespace), config)
            .default_backoff()
            .map_err(|error| Error::Watch(error.to_string()))
            .boxed()
    }
}
