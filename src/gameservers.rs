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

//! Drives individual game servers through their lifecycle.

pub mod controller;
pub mod health;
pub mod pernodecounter;
pub mod portallocator;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use crate::apis::{self, GameServer};

pub use self::{
    controller::Controller, health::HealthController, pernodecounter::PerNodeCounter,
    portallocator::PortAllocator,
};

/// The key of the game server owning `pod`, if it is a game server pod.
pub fn owner_key(pod: &Pod) -> Option<String> {
    if apis::label(pod, apis::ROLE_LABEL) != Some(apis::GAME_SERVER_LABEL_ROLE) {
        return None;
    }

    apis::controller_of(pod)
        .filter(|owner| owner.kind == <GameServer as kube::Resource>::kind(&()))
        .map(|owner| apis::key_of(&pod.namespace().unwrap_or_default(), &owner.name))
}

/// Whether `pod` is the backing pod of `gs`.
pub fn is_pod_of(pod: &Pod, gs: &GameServer) -> bool {
    pod.namespace() == gs.namespace()
        && apis::label(pod, apis::GAME_SERVER_POD_LABEL) == gs.metadata.name.as_deref()
        && gs
            .metadata
            .uid
            .as_deref()
            .map_or(false, |uid| apis::is_owned_by(pod, uid))
}

/// The address clients reach a node on, its external IP falling back to
/// its internal IP.
pub fn node_address(node: &Node) -> Option<&str> {
    let addresses = node.status.as_ref()?.addresses.as_deref()?;
    ["ExternalIP", "InternalIP"].into_iter().find_map(|kind| {
        addresses
            .iter()
            .find(|address| address.type_ == kind)
            .map(|address| address.address.as_str())
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};

    use super::*;

    #[test]
    fn prefers_external_address() {
        let mut node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        address: "10.0.0.1".into(),
                        type_: "InternalIP".into(),
                    },
                    NodeAddress {
                        address: "node-1.internal".into(),
                        type_: "Hostname".into(),
                    },
                ]),
                ..<_>::default()
            }),
            ..<_>::default()
        };
        assert_eq!(Some("10.0.0.1"), node_address(&node));

        node.status.as_mut().unwrap().addresses.as_mut().unwrap().push(NodeAddress {
            address: "34.1.2.3".into(),
            type_: "ExternalIP".into(),
        });
        assert_eq!(Some("34.1.2.3"), node_address(&node));

        assert_eq!(None, node_address(&Node::default()));
    }

    #[test]
    fn pod_ownership() {
        let mut gs = GameServer::new("gs-1", <_>::default());
        gs.metadata.namespace = Some("default".into());
        gs.metadata.uid = Some("uid-1".into());
        gs.spec.template.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "game".into(),
                ..<_>::default()
            }],
            ..<_>::default()
        });

        let pod = gs.pod(vec![]).unwrap();
        assert!(is_pod_of(&pod, &gs));
        assert_eq!(Some("default/gs-1".to_owned()), owner_key(&pod));

        let mut other = gs.clone();
        other.metadata.uid = Some("uid-2".into());
        assert!(!is_pod_of(&pod, &other));
        assert_eq!(None, owner_key(&Pod::default()));
    }
}
