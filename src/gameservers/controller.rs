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

use std::{collections::BTreeMap, sync::Arc};

use eyre::WrapErr;
use k8s_openapi::{
    api::core::v1::{
        Container, EnvVar, EnvVarSource, HTTPGetAction, Node, ObjectFieldSelector, Pod, Probe,
        ResourceRequirements,
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
    chrono,
};
use kube::ResourceExt;

use super::{is_pod_of, node_address, owner_key, PortAllocator};
use crate::{
    apis::{self, GameServer, GameServerState},
    config,
    events::{self, DynRecorder, Event},
    signal::ShutdownRx,
    store::{DynStore, Propagation},
    watch::{EventHandler, Lister},
    workqueue::{Reconciler, WorkQueue},
};

pub const SIDECAR_NAME: &str = "agones-gameserver-sidecar";

/// Everything the game server controller reads from and writes to.
pub struct Context {
    pub game_servers: DynStore<GameServer>,
    pub pods: DynStore<Pod>,
    pub game_server_lister: Lister<GameServer>,
    pub pod_lister: Lister<Pod>,
    pub node_lister: Lister<Node>,
    pub port_allocator: Arc<PortAllocator>,
    pub recorder: DynRecorder,
    pub sidecar: config::Sidecar,
}

/// Reconciles each game server towards `Ready`, creating and removing its
/// backing pod along the way.
pub struct Controller {
    context: Context,
    queue: WorkQueue,
}

impl Controller {
    pub fn new(context: Context) -> Arc<Self> {
        Arc::new(Self {
            context,
            queue: WorkQueue::new("gameservers"),
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// The handler to register with the game server informer.
    pub fn game_server_handler(&self) -> Arc<dyn EventHandler<GameServer>> {
        Arc::new(self.queue.clone())
    }

    /// The handler to register with the pod informer.
    pub fn pod_handler(&self) -> Arc<dyn EventHandler<Pod>> {
        Arc::new(PodOwners(self.queue.clone()))
    }

    /// Waits for the caches, rebuilds the port allocations and then runs
    /// `workers` reconcilers until `shutdown` fires.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: ShutdownRx) {
        tracing::info!("waiting for cache sync");
        tokio::join!(
            self.context.game_server_lister.synced(),
            self.context.pod_lister.synced(),
            self.context.node_lister.synced(),
        );

        self.context.port_allocator.sync(
            &self.context.node_lister.list(),
            &self.context.game_server_lister.list(),
        );

        self.queue.clone().run(self, workers, shutdown).await;
    }

    async fn update(&self, gs: &GameServer) -> crate::Result<GameServer> {
        Ok(self.context.game_servers.update(gs).await?)
    }

    async fn record(&self, gs: &GameServer, event: Event) {
        events::record(&*self.context.recorder, gs, event).await;
    }

    async fn record_state(&self, gs: &GameServer, note: impl Into<String>) {
        let reason = gs.state().map(|state| state.to_string()).unwrap_or_default();
        self.record(gs, Event::normal(reason, note)).await;
    }

    async fn move_to_error_state(&self, gs: GameServer, message: String) -> crate::Result<GameServer> {
        let mut copy = gs;
        copy.set_state(GameServerState::Error);
        let gs = self
            .update(&copy)
            .await
            .wrap_err_with(|| format!("error moving game server {} to Error state", copy.name_any()))?;
        self.record(&gs, Event::warning(GameServerState::Error.to_string(), message))
            .await;
        Ok(gs)
    }

    fn pods_of(&self, gs: &GameServer) -> Vec<Arc<Pod>> {
        self.context.pod_lister.filter(|pod| is_pod_of(pod, gs))
    }

    /// A game server that was never reconciled gets its defaults, the
    /// finalizer and its first state.
    async fn sync_blank(&self, gs: GameServer) -> crate::Result<GameServer> {
        if gs.status.is_some() {
            return Ok(gs);
        }

        let mut copy = gs;
        copy.apply_defaults();
        let finalizers = copy.finalizers_mut();
        if !finalizers.iter().any(|finalizer| finalizer == apis::FINALIZER) {
            finalizers.push(apis::FINALIZER.into());
        }

        if let Err(errors) = copy.validate() {
            tracing::warn!(gs = %copy.name_any(), %errors, "invalid game server");
            return self.move_to_error_state(copy, errors.to_string()).await;
        }

        let gs = self
            .update(&copy)
            .await
            .wrap_err_with(|| format!("error applying defaults to game server {}", copy.name_any()))?;
        self.record_state(&gs, "Defaults applied").await;
        Ok(gs)
    }

    async fn sync_port_allocation(&self, gs: GameServer) -> crate::Result<GameServer> {
        if !gs.is_state(GameServerState::PortAllocation) {
            return Ok(gs);
        }

        let mut copy = gs;
        if let Err(error) = self.context.port_allocator.allocate(&mut copy) {
            return self.move_to_error_state(copy, error.to_string()).await;
        }
        copy.set_state(GameServerState::Creating);

        tracing::debug!(gs = %copy.name_any(), "syncing port allocation state");
        match self.update(&copy).await {
            Ok(gs) => {
                self.record(
                    &gs,
                    Event::normal(GameServerState::PortAllocation.to_string(), "Port allocated"),
                )
                .await;
                Ok(gs)
            }
            Err(error) => {
                self.context.port_allocator.deallocate(&copy);
                Err(error.wrap_err(format!(
                    "error updating game server {} after port allocation",
                    copy.name_any()
                )))
            }
        }
    }

    async fn sync_creating(&self, gs: GameServer) -> crate::Result<GameServer> {
        if !gs.is_state(GameServerState::Creating) {
            return Ok(gs);
        }

        tracing::debug!(gs = %gs.name_any(), "syncing create state");
        let gs = if self.pods_of(&gs).is_empty() {
            let gs = self.create_pod(gs).await?;
            if gs.is_state(GameServerState::Error) {
                return Ok(gs);
            }
            gs
        } else {
            gs
        };

        let mut copy = gs;
        copy.set_state(GameServerState::Starting);
        self.update(&copy)
            .await
            .wrap_err_with(|| format!("error updating game server {} to Starting", copy.name_any()))
    }

    async fn create_pod(&self, gs: GameServer) -> crate::Result<GameServer> {
        let pod = match gs.pod(vec![self.sidecar(&gs)]) {
            Ok(pod) => pod,
            Err(error) => {
                tracing::error!(gs = %gs.name_any(), %error, "error creating pod from game server");
                return self.move_to_error_state(gs, error.to_string()).await;
            }
        };

        match self.context.pods.create(&pod).await {
            Ok(pod) => {
                self.record(
                    &gs,
                    Event::normal(
                        GameServerState::Creating.to_string(),
                        format!("Pod {} created", pod.name_any()),
                    ),
                )
                .await;
                Ok(gs)
            }
            Err(error) if error.is_already_exists() => {
                tracing::warn!(gs = %gs.name_any(), "pod already exists, reusing");
                Ok(gs)
            }
            Err(error) if error.is_invalid() => {
                tracing::error!(gs = %gs.name_any(), %error, "pod created is invalid");
                self.move_to_error_state(gs, error.to_string()).await
            }
            Err(error) => Err(eyre::Report::new(error)
                .wrap_err(format!("error creating pod for game server {}", gs.name_any()))),
        }
    }

    /// The SDK server container added to every game server pod.
    fn sidecar(&self, gs: &GameServer) -> Container {
        let config = &self.context.sidecar;
        let quantities = |values: [(&str, &str); 2]| -> Option<BTreeMap<String, Quantity>> {
            let map: BTreeMap<String, Quantity> = values
                .into_iter()
                .filter(|(_, value)| !value.is_empty() && *value != "0")
                .map(|(name, value)| (name.to_owned(), Quantity(value.to_owned())))
                .collect();
            (!map.is_empty()).then_some(map)
        };

        let env = |name: &str, value: String| EnvVar {
            name: name.into(),
            value: Some(value),
            value_from: None,
        };

        Container {
            name: SIDECAR_NAME.into(),
            image: Some(config.image.clone()),
            image_pull_policy: config.always_pull.then(|| "Always".into()),
            env: Some(vec![
                env("GAMESERVER_NAME", gs.name_any()),
                EnvVar {
                    name: "POD_NAMESPACE".into(),
                    value: None,
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.namespace".into(),
                            api_version: None,
                        }),
                        ..<_>::default()
                    }),
                },
                env("SDK_GRPC_PORT", gs.spec.sdk_server.grpc_port.to_string()),
                env("SDK_HTTP_PORT", gs.spec.sdk_server.http_port.to_string()),
                env("SDK_LOG_LEVEL", format!("{:?}", gs.spec.sdk_server.log_level)),
            ]),
            liveness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/healthz".into()),
                    port: IntOrString::Int(apis::gameserver::HEALTH_PORT),
                    ..<_>::default()
                }),
                initial_delay_seconds: Some(3),
                period_seconds: Some(3),
                ..<_>::default()
            }),
            resources: Some(ResourceRequirements {
                requests: quantities([
                    ("cpu", &config.cpu_request),
                    ("memory", &config.memory_request),
                ]),
                limits: quantities([("cpu", &config.cpu_limit), ("memory", &config.memory_limit)]),
                ..<_>::default()
            }),
            ..<_>::default()
        }
    }

    async fn sync_starting(&self, gs: GameServer) -> crate::Result<GameServer> {
        if !gs.is_state(GameServerState::Starting) {
            return Ok(gs);
        }

        let node_name = self
            .pods_of(&gs)
            .first()
            .and_then(|pod| pod.spec.as_ref()?.node_name.clone());

        // The pod update carrying the node will requeue us.
        let Some(node_name) = node_name else {
            tracing::trace!(gs = %gs.name_any(), "pod not scheduled yet");
            return Ok(gs);
        };

        let mut copy = gs;
        copy.status_mut().node_name = node_name;
        copy.set_state(GameServerState::Scheduled);
        let gs = self
            .update(&copy)
            .await
            .wrap_err_with(|| format!("error updating game server {} to Scheduled", copy.name_any()))?;
        self.record_state(&gs, "Pod scheduled").await;
        Ok(gs)
    }

    async fn sync_request_ready(&self, gs: GameServer) -> crate::Result<GameServer> {
        if !gs.is_state(GameServerState::RequestReady) {
            return Ok(gs);
        }

        tracing::debug!(gs = %gs.name_any(), "syncing request ready state");
        let mut copy = gs;
        if copy.node_name().is_empty() {
            let pods = self.pods_of(&copy);
            let node_name = pods
                .first()
                .and_then(|pod| pod.spec.as_ref()?.node_name.clone())
                .ok_or_else(|| eyre::eyre!("pod for game server {} is not scheduled", copy.name_any()))?;
            copy.status_mut().node_name = node_name;
        }

        let node = self
            .context
            .node_lister
            .get("", copy.node_name())
            .ok_or_else(|| eyre::eyre!("error retrieving node {}", copy.node_name()))?;
        let address = node_address(&node)
            .ok_or_else(|| eyre::eyre!("could not find an address for node {}", node.name_any()))?
            .to_owned();

        let ports = copy.status_ports();
        let status = copy.status_mut();
        status.address = address;
        status.ports = ports;
        status.state = GameServerState::Ready;

        let gs = self.update(&copy).await.wrap_err_with(|| {
            format!("error setting Ready, port and address on game server {}", copy.name_any())
        })?;
        self.record_state(&gs, "SDK.Ready() complete").await;
        Ok(gs)
    }

    /// Returns an expired reservation to `Ready`, or checks back when it
    /// expires.
    async fn sync_reserved(&self, gs: GameServer) -> crate::Result<GameServer> {
        if !gs.is_state(GameServerState::Reserved) {
            return Ok(gs);
        }

        let Some(until) = gs.status.as_ref().and_then(|status| status.reserved_until.clone()) else {
            return Ok(gs);
        };

        let remaining = until.0 - chrono::Utc::now();
        if let Ok(remaining) = remaining.to_std() {
            if !remaining.is_zero() {
                self.queue.add_after(apis::key(&gs), remaining);
                return Ok(gs);
            }
        }

        let mut copy = gs;
        copy.status_mut().reserved_until = None;
        copy.set_state(GameServerState::Ready);
        let gs = self
            .update(&copy)
            .await
            .wrap_err_with(|| format!("error returning game server {} to Ready", copy.name_any()))?;
        self.record_state(&gs, "Reserved expired").await;
        Ok(gs)
    }

    async fn sync_shutdown(&self, gs: &GameServer) -> crate::Result<()> {
        if !gs.is_state(GameServerState::Shutdown) {
            return Ok(());
        }

        tracing::debug!(gs = %gs.name_any(), "syncing shutdown state");
        match self
            .context
            .game_servers
            .delete(
                &gs.namespace().unwrap_or_default(),
                &gs.name_any(),
                Propagation::Background,
            )
            .await
        {
            Ok(()) => {
                self.record_state(gs, "Deletion started").await;
                Ok(())
            }
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(eyre::Report::new(error)
                .wrap_err(format!("error deleting game server {}", gs.name_any()))),
        }
    }

    /// Removes the pod first, and only then the finalizer.
    async fn sync_deletion_timestamp(&self, gs: GameServer) -> crate::Result<()> {
        let pods = self.pods_of(&gs);
        if !pods.is_empty() {
            for pod in pods {
                let namespace = pod.namespace().unwrap_or_default();
                match self
                    .context
                    .pods
                    .delete(&namespace, &pod.name_any(), Propagation::Background)
                    .await
                {
                    Ok(()) => {
                        self.record_state(&gs, format!("Deleting Pod {}", pod.name_any()))
                            .await
                    }
                    Err(error) if error.is_not_found() => {}
                    Err(error) => {
                        return Err(eyre::Report::new(error).wrap_err(format!(
                            "error deleting pod for game server {}",
                            gs.name_any()
                        )))
                    }
                }
            }
            return Ok(());
        }

        if !gs.finalizers().iter().any(|finalizer| finalizer == apis::FINALIZER) {
            return Ok(());
        }

        let mut copy = gs;
        copy.finalizers_mut()
            .retain(|finalizer| finalizer != apis::FINALIZER);
        tracing::debug!(gs = %copy.name_any(), "no pods found, removing finalizer");
        match self.context.game_servers.update(&copy).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(eyre::Report::new(error)
                .wrap_err(format!("error removing finalizer for game server {}", copy.name_any()))),
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for Controller {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn reconcile(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = apis::split_key(key);
        let Some(gs) = self.context.game_server_lister.get(namespace, name) else {
            tracing::debug!(%key, "game server is no longer available for syncing");
            return Ok(());
        };
        let gs = (*gs).clone();

        if gs.is_being_deleted() {
            return self.sync_deletion_timestamp(gs).await;
        }

        let gs = self.sync_blank(gs).await?;
        let gs = self.sync_port_allocation(gs).await?;
        let gs = self.sync_creating(gs).await?;
        let gs = self.sync_starting(gs).await?;
        let gs = self.sync_request_ready(gs).await?;
        let gs = self.sync_reserved(gs).await?;
        self.sync_shutdown(&gs).await
    }
}

/// Queues the owning game server whenever one of its pods changes.
struct PodOwners(WorkQueue);

impl PodOwners {
    fn enqueue(&self, pod: &Pod) {
        if let Some(key) = owner_key(pod) {
            self.0.add(key);
        }
    }
}

impl EventHandler<Pod> for PodOwners {
    fn on_add(&self, pod: &Arc<Pod>) {
        self.enqueue(pod);
    }

    fn on_update(&self, _: &Arc<Pod>, new: &Arc<Pod>) {
        self.enqueue(new);
    }

    fn on_delete(&self, pod: &Arc<Pod>) {
        self.enqueue(pod);
    }
}
