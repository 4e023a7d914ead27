/*
 * Copyright 2022 Google LLC
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

//! Resource types for game servers, the replica groups that own them and
//! the requests that allocate them.

pub mod allocation;
pub mod error;
pub mod fleet;
pub mod gameserver;
pub mod gameserverset;
pub mod policy;
pub mod selector;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use self::{
    allocation::GameServerAllocation,
    error::{ValidationError, ValidationErrors, ValueInvalidArgs},
    fleet::Fleet,
    gameserver::{GameServer, GameServerState},
    gameserverset::GameServerSet,
    policy::GameServerAllocationPolicy,
    selector::Selector,
};

pub const GROUP: &str = "agones.dev";
/// Finalizer placed on every game server so its pod is removed first.
pub const FINALIZER: &str = GROUP;

pub const ROLE_LABEL: &str = "agones.dev/role";
pub const GAME_SERVER_LABEL_ROLE: &str = "gameserver";
pub const GAME_SERVER_POD_LABEL: &str = "agones.dev/gameserver";
pub const GAME_SERVER_CONTAINER_ANNOTATION: &str = "agones.dev/container";
pub const SDK_VERSION_ANNOTATION: &str = "agones.dev/sdk-version";
pub const FLEET_NAME_LABEL: &str = "agones.dev/fleet";
pub const GAME_SERVER_SET_LABEL: &str = "agones.dev/gameserverset";
pub const LAST_ALLOCATED_ANNOTATION: &str = "agones.dev/last-allocated";
pub const SAFE_TO_EVICT_LABEL: &str = "agones.dev/safe-to-evict";
pub const POD_SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
pub const TEMPLATE_HASH_ANNOTATION: &str = "agones.dev/template-hash";

/// The SDK version stamped onto pods, which is the version of this crate.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// the strategy that a Fleet & GameServers will use when scheduling
/// GameServers' Pods across a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SchedulingStrategy {
    /// Prioritise allocating GameServers on Nodes with the most Allocated, and
    /// then Ready GameServers to bin pack as many Allocated GameServers on a
    /// single node.  This is most useful for dynamic Kubernetes clusters - such
    /// as on Cloud Providers.
    #[default]
    Packed,
    /// prioritise allocating GameServers on Nodes with the least Allocated, and
    /// then Ready GameServers to distribute Allocated GameServers across many
    /// nodes. This is most useful for statically sized Kubernetes clusters -
    /// such as on physical hardware.
    Distributed,
}

/// Which kind of typed state a [`Priority`] sorts by.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PriorityType {
    #[default]
    Counter,
    List,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PriorityOrder {
    #[default]
    Ascending,
    Descending,
}

/// A sort key over the available capacity of a named counter or list.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Priority {
    #[serde(rename = "type")]
    pub r#type: PriorityType,
    pub key: String,
    #[serde(default)]
    pub order: PriorityOrder,
}

/// Labels and annotations merged onto a resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MetaPatch {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl MetaPatch {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    /// Merges the patch over `meta`, with the patch winning on conflicts.
    pub fn apply(&self, meta: &mut ObjectMeta) {
        if !self.labels.is_empty() {
            meta.labels
                .get_or_insert_with(Default::default)
                .extend(self.labels.clone());
        }

        if !self.annotations.is_empty() {
            meta.annotations
                .get_or_insert_with(Default::default)
                .extend(self.annotations.clone());
        }
    }

    /// Whether every label and annotation in the patch is already present.
    pub fn is_applied(&self, meta: &ObjectMeta) -> bool {
        let contains = |source: &Option<BTreeMap<String, String>>,
                        patch: &BTreeMap<String, String>| {
            patch.iter().all(|(key, value)| {
                source
                    .as_ref()
                    .and_then(|map| map.get(key))
                    .map_or(false, |v| v == value)
            })
        };

        contains(&meta.labels, &self.labels) && contains(&meta.annotations, &self.annotations)
    }
}

/// `namespace/name`, the key every cache and work queue uses.
pub fn key<K: Resource>(object: &K) -> String {
    key_of(&object.namespace().unwrap_or_default(), &object.name_any())
}

pub fn key_of(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Splits a key produced by [`key`] back into namespace and name.
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

/// Whether any owner reference of `object` points at `owner_uid`.
pub fn is_owned_by<K: Resource>(object: &K, owner_uid: &str) -> bool {
    object
        .owner_references()
        .iter()
        .any(|reference| reference.uid == owner_uid)
}

/// The owner reference marked as the controller, if any.
pub fn controller_of<K: Resource>(object: &K) -> Option<&OwnerReference> {
    object
        .owner_references()
        .iter()
        .find(|reference| reference.controller == Some(true))
}

/// Builds a controller owner reference pointing at `owner`.
pub fn controller_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

/// Looks up a label on an object.
pub fn label<'a, K: Resource>(object: &'a K, key: &str) -> Option<&'a str> {
    object.labels().get(key).map(String::as_str)
}

pub fn annotation<'a, K: Resource>(object: &'a K, key: &str) -> Option<&'a str> {
    object.annotations().get(key).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        assert_eq!("default/gs-1", key_of("default", "gs-1"));
        assert_eq!(("default", "gs-1"), split_key("default/gs-1"));
        assert_eq!(("", "node-1"), split_key(&key_of("", "node-1")));
    }

    #[test]
    fn meta_patch_merges_over_existing() {
        let mut meta = ObjectMeta {
            labels: Some([("a".into(), "1".into()), ("b".into(), "2".into())].into()),
            ..<_>::default()
        };

        let patch = MetaPatch {
            labels: [("b".into(), "3".into())].into(),
            annotations: [("c".into(), "4".into())].into(),
        };

        assert!(!patch.is_applied(&meta));
        patch.apply(&mut meta);
        assert!(patch.is_applied(&meta));

        let labels = meta.labels.unwrap();
        assert_eq!("1", labels["a"]);
        assert_eq!("3", labels["b"]);
        assert_eq!("4", meta.annotations.unwrap()["c"]);
    }
}
