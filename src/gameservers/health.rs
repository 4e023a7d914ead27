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

//! Marks game servers `Unhealthy` when their pod disappears, their game
//! container exits or their pod cannot be scheduled for lack of ports.

use std::sync::Arc;

use eyre::WrapErr;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::{is_pod_of, owner_key};
use crate::{
    apis::{self, GameServer, GameServerState},
    events::{self, DynRecorder, Event},
    signal::ShutdownRx,
    store::DynStore,
    watch::{EventHandler, Lister},
    workqueue::{Reconciler, WorkQueue},
};

/// Why a game server is considered unhealthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Failure {
    MissingPod,
    ContainerTerminated,
    NoFreePorts,
}

impl Failure {
    fn message(self) -> &'static str {
        match self {
            Self::MissingPod => "Pod is missing",
            Self::ContainerTerminated => "Game server container terminated",
            Self::NoFreePorts => "Insufficient free ports on any node",
        }
    }
}

fn game_container_terminated(pod: &Pod) -> bool {
    let Some(container) = apis::annotation(pod, apis::GAME_SERVER_CONTAINER_ANNOTATION) else {
        return false;
    };

    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .filter(|status| status.name == container)
        .any(|status| {
            status
                .state
                .as_ref()
                .map_or(false, |state| state.terminated.is_some())
        })
}

fn unschedulable_with_no_free_ports(pod: &Pod) -> bool {
    pod.status
        .iter()
        .flat_map(|status| status.conditions.iter().flatten())
        .any(|condition| {
            condition.type_ == "PodScheduled"
                && condition.status == "False"
                && condition.reason.as_deref() == Some("Unschedulable")
                && condition
                    .message
                    .as_deref()
                    .map_or(false, |message| message.contains("free ports"))
        })
}

fn pod_failure(pod: &Pod) -> Option<Failure> {
    if game_container_terminated(pod) {
        Some(Failure::ContainerTerminated)
    } else if unschedulable_with_no_free_ports(pod) {
        Some(Failure::NoFreePorts)
    } else {
        None
    }
}

/// Watches game server pods and fails the game servers they back.
pub struct HealthController {
    game_servers: DynStore<GameServer>,
    game_server_lister: Lister<GameServer>,
    pod_lister: Lister<Pod>,
    recorder: DynRecorder,
    queue: WorkQueue,
}

impl HealthController {
    pub fn new(
        game_servers: DynStore<GameServer>,
        game_server_lister: Lister<GameServer>,
        pod_lister: Lister<Pod>,
        recorder: DynRecorder,
    ) -> Arc<Self> {
        Arc::new(Self {
            game_servers,
            game_server_lister,
            pod_lister,
            recorder,
            queue: WorkQueue::new("gameservers-health"),
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn pod_handler(&self) -> Arc<dyn EventHandler<Pod>> {
        Arc::new(UnhealthyPods(self.queue.clone()))
    }

    /// Catches pods deleted while nothing was watching, on every game
    /// server change and resync.
    pub fn game_server_handler(&self) -> Arc<dyn EventHandler<GameServer>> {
        Arc::new(MissingPods(self.queue.clone()))
    }

    pub async fn run(self: Arc<Self>, workers: usize, shutdown: ShutdownRx) {
        tokio::join!(self.game_server_lister.synced(), self.pod_lister.synced());
        self.queue.clone().run(self, workers, shutdown).await;
    }

    fn failure(&self, gs: &GameServer) -> Option<Failure> {
        let state = gs.state()?;
        let pod = self
            .pod_lister
            .filter(|pod| is_pod_of(pod, gs))
            .into_iter()
            .next();

        match (state, pod) {
            (GameServerState::Starting, Some(pod)) if unschedulable_with_no_free_ports(&pod) => {
                Some(Failure::NoFreePorts)
            }
            (
                GameServerState::Scheduled
                | GameServerState::RequestReady
                | GameServerState::Ready
                | GameServerState::Reserved
                | GameServerState::Allocated,
                pod,
            ) => match pod {
                None => Some(Failure::MissingPod),
                Some(pod) => pod_failure(&pod),
            },
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for HealthController {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn reconcile(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = apis::split_key(key);
        let Some(gs) = self.game_server_lister.get(namespace, name) else {
            return Ok(());
        };

        if gs.is_being_deleted() {
            return Ok(());
        }

        let Some(failure) = self.failure(&gs) else {
            return Ok(());
        };

        tracing::debug!(gs = %gs.name_any(), ?failure, "game server is unhealthy");
        let mut copy = (*gs).clone();
        copy.set_state(GameServerState::Unhealthy);
        let updated = match self.game_servers.update(&copy).await {
            Ok(updated) => updated,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("error marking game server {key} unhealthy"))
            }
        };

        events::record(
            &*self.recorder,
            &updated,
            Event::warning(GameServerState::Unhealthy.to_string(), failure.message()),
        )
        .await;
        Ok(())
    }
}

struct UnhealthyPods(WorkQueue);

impl EventHandler<Pod> for UnhealthyPods {
    fn on_update(&self, _: &Arc<Pod>, new: &Arc<Pod>) {
        if pod_failure(new).is_some() {
            if let Some(key) = owner_key(new) {
                self.0.add(key);
            }
        }
    }

    fn on_delete(&self, pod: &Arc<Pod>) {
        if let Some(key) = owner_key(pod) {
            self.0.add(key);
        }
    }
}

struct MissingPods(WorkQueue);

impl EventHandler<GameServer> for MissingPods {
    fn on_update(&self, _: &Arc<GameServer>, new: &Arc<GameServer>) {
        if new.state().map_or(false, GameServerState::has_pod) && !new.is_being_deleted() {
            self.0.add(apis::key(&**new));
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        store::{Propagation, Store},
        test::{self, Harness},
    };

    async fn ready_game_server(harness: &Harness) -> GameServer {
        let mut gs = test::game_server_template("gs-1");
        gs.apply_defaults();
        gs.set_state(GameServerState::Ready);
        let gs = harness.game_servers.create(&gs).await.unwrap();
        harness.pods.create(&gs.pod(vec![]).unwrap()).await.unwrap();
        gs
    }

    async fn reconcile(harness: &Harness) -> GameServer {
        harness.sync().await;
        harness
            .health_controller
            .reconcile("default/gs-1")
            .await
            .unwrap();
        harness.game_servers.get("default", "gs-1").await.unwrap()
    }

    #[tokio::test]
    async fn healthy_pods_are_left_alone() {
        let harness = Harness::new(10, 20).await;
        ready_game_server(&harness).await;
        assert_eq!(Some(GameServerState::Ready), reconcile(&harness).await.state());
        assert!(harness.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn missing_pod_is_unhealthy() {
        let harness = Harness::new(10, 20).await;
        ready_game_server(&harness).await;
        harness
            .pods
            .delete("default", "gs-1", Propagation::Background)
            .await
            .unwrap();

        assert_eq!(Some(GameServerState::Unhealthy), reconcile(&harness).await.state());
        let events = harness.recorder.events();
        assert_eq!(1, events.len());
        assert_eq!("Pod is missing", events[0].event.note);
    }

    #[tokio::test]
    async fn terminated_container_is_unhealthy() {
        let harness = Harness::new(10, 20).await;
        ready_game_server(&harness).await;
        let mut pod = harness.pods.get("default", "gs-1").await.unwrap();
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "game".into(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        ..<_>::default()
                    }),
                    ..<_>::default()
                }),
                ..<_>::default()
            }]),
            ..<_>::default()
        });
        assert!(pod_failure(&pod).is_some());
        harness.pods.update_status(&pod).await.unwrap();

        assert_eq!(Some(GameServerState::Unhealthy), reconcile(&harness).await.state());
    }

    #[tokio::test]
    async fn deleting_game_servers_are_skipped() {
        let harness = Harness::new(10, 20).await;
        let mut gs = ready_game_server(&harness).await;
        gs.metadata.finalizers = Some(vec![apis::FINALIZER.into()]);
        harness.game_servers.update(&gs).await.unwrap();
        harness
            .game_servers
            .delete("default", "gs-1", Propagation::Background)
            .await
            .unwrap();
        harness
            .pods
            .delete("default", "gs-1", Propagation::Background)
            .await
            .unwrap();

        assert_eq!(Some(GameServerState::Ready), reconcile(&harness).await.state());
    }

    #[test]
    fn no_free_ports() {
        let pod = Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".into(),
                    status: "False".into(),
                    reason: Some("Unschedulable".into()),
                    message: Some("0/3 nodes are available: 3 node(s) didn't have free ports for the requested pod ports.".into()),
                    ..<_>::default()
                }]),
                ..<_>::default()
            }),
            ..<_>::default()
        };
        assert_eq!(Some(Failure::NoFreePorts), pod_failure(&pod));
        assert_eq!(None, pod_failure(&Pod::default()));
    }
}
