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

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};

use crate::{
    allocation::AllocationCache,
    apis::{Fleet, GameServer, GameServerSet},
    config::{Config, Features},
    events::{DynRecorder, KubeRecorder},
    fleets, gameservers,
    gameservers::{HealthController, PerNodeCounter, PortAllocator},
    gameserversets,
    signal::ShutdownRx,
    store::{cluster::KubeStore, DynStore},
    watch::Informer,
};

/// Runs the game server, health, game server set and fleet controllers.
#[derive(clap::Args, Clone, Debug)]
pub struct Controller {
    /// The namespace to watch, every namespace when empty.
    #[clap(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,
}

impl Controller {
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self,
        config: Arc<Config>,
        features: Features,
        shutdown: ShutdownRx,
    ) -> crate::Result<()> {
        let client = kube::Client::try_default().await?;
        let recorder: DynRecorder = Arc::new(KubeRecorder::new(client.clone(), "gameserver-controller"));
        let resync = config.controller.resync_period();

        let game_servers: DynStore<GameServer> = Arc::new(KubeStore::namespaced(client.clone()));
        let pods: DynStore<Pod> = Arc::new(KubeStore::namespaced(client.clone()));
        let nodes: DynStore<Node> = Arc::new(KubeStore::cluster(client.clone()));
        let sets: DynStore<GameServerSet> = Arc::new(KubeStore::namespaced(client.clone()));
        let fleets: DynStore<Fleet> = Arc::new(KubeStore::namespaced(client));

        let mut game_server_informer =
            Informer::new(game_servers.clone(), &*self.namespace).with_resync_period(resync);
        let mut pod_informer =
            Informer::new(pods.clone(), &*self.namespace).with_resync_period(resync);
        let mut node_informer = Informer::new(nodes, "").with_resync_period(resync);
        let mut set_informer =
            Informer::new(sets.clone(), &*self.namespace).with_resync_period(resync);
        let mut fleet_informer =
            Informer::new(fleets.clone(), &*self.namespace).with_resync_period(resync);

        let port_allocator = Arc::new(PortAllocator::new(config.min_port, config.max_port));
        let counter = PerNodeCounter::new();
        let allocation_cache =
            AllocationCache::new(game_server_informer.lister(), counter.clone(), features);

        let game_server_controller = gameservers::Controller::new(gameservers::controller::Context {
            game_servers: game_servers.clone(),
            pods,
            game_server_lister: game_server_informer.lister(),
            pod_lister: pod_informer.lister(),
            node_lister: node_informer.lister(),
            port_allocator: port_allocator.clone(),
            recorder: recorder.clone(),
            sidecar: config.sidecar.clone(),
        });
        let health_controller = HealthController::new(
            game_servers.clone(),
            game_server_informer.lister(),
            pod_informer.lister(),
            recorder.clone(),
        );
        let set_controller = gameserversets::Controller::new(gameserversets::controller::Context {
            game_servers,
            sets: sets.clone(),
            game_server_lister: game_server_informer.lister(),
            set_lister: set_informer.lister(),
            counter: counter.clone(),
            recorder: recorder.clone(),
            features,
            max_creations: config.controller.max_creations_per_batch,
            max_deletions: config.controller.max_deletions_per_batch,
        });
        let fleet_controller = fleets::Controller::new(fleets::controller::Context {
            fleets,
            sets,
            fleet_lister: fleet_informer.lister(),
            set_lister: set_informer.lister(),
            recorder,
        });

        game_server_informer.add_handler(port_allocator);
        game_server_informer.add_handler(Arc::new(counter.clone()));
        game_server_informer.add_handler(allocation_cache.clone());
        game_server_informer.add_handler(game_server_controller.game_server_handler());
        game_server_informer.add_handler(health_controller.game_server_handler());
        game_server_informer.add_handler(set_controller.game_server_handler());
        pod_informer.add_handler(game_server_controller.pod_handler());
        pod_informer.add_handler(health_controller.pod_handler());
        node_informer.add_handler(Arc::new(counter));
        set_informer.add_handler(set_controller.set_handler());
        set_informer.add_handler(fleet_controller.set_handler());
        fleet_informer.add_handler(fleet_controller.fleet_handler());

        let informers = [
            game_server_informer.spawn(shutdown.clone()),
            pod_informer.spawn(shutdown.clone()),
            node_informer.spawn(shutdown.clone()),
            set_informer.spawn(shutdown.clone()),
            fleet_informer.spawn(shutdown.clone()),
        ];

        let workers = &config.controller;
        tracing::info!(namespace = %self.namespace, "starting controllers");
        tokio::join!(
            game_server_controller.run(workers.game_server_workers, shutdown.clone()),
            health_controller.run(workers.game_server_workers, shutdown.clone()),
            set_controller.run(workers.game_server_set_workers, shutdown.clone()),
            fleet_controller.run(workers.fleet_workers, shutdown.clone()),
            allocation_cache.run(shutdown),
        );

        for informer in informers {
            informer.await?;
        }

        tracing::info!("controllers stopped");
        Ok(())
    }
}
