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

use std::{net::SocketAddr, sync::Arc};

use k8s_openapi::api::core::v1::{Node, Secret};

use crate::{
    allocation::{self, remote::GrpcDialer, service, AllocationCache},
    apis::{GameServer, GameServerAllocationPolicy},
    config::{Config, Features},
    events::{DynRecorder, KubeRecorder},
    gameservers::PerNodeCounter,
    signal::{self, ShutdownRx},
    store::{cluster::KubeStore, DynStore},
    watch::Informer,
};

/// Serves allocation requests over gRPC, locally and across clusters.
#[derive(clap::Args, Clone, Debug)]
pub struct Allocator {
    /// The namespace to watch, every namespace when empty.
    #[clap(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,
    /// Overrides the gRPC listen address from the configuration file.
    #[clap(long, env = "ALLOCATOR_ADDRESS")]
    pub address: Option<SocketAddr>,
}

impl Allocator {
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self,
        config: Arc<Config>,
        features: Features,
        shutdown: ShutdownRx,
    ) -> crate::Result<()> {
        let client = kube::Client::try_default().await?;
        let recorder: DynRecorder = Arc::new(KubeRecorder::new(client.clone(), "gameserver-allocator"));
        let resync = config.controller.resync_period();

        let game_servers: DynStore<GameServer> = Arc::new(KubeStore::namespaced(client.clone()));
        let nodes: DynStore<Node> = Arc::new(KubeStore::cluster(client.clone()));
        let policies: DynStore<GameServerAllocationPolicy> =
            Arc::new(KubeStore::namespaced(client.clone()));
        let secrets: DynStore<Secret> = Arc::new(KubeStore::namespaced(client));

        let mut game_server_informer =
            Informer::new(game_servers.clone(), &*self.namespace).with_resync_period(resync);
        let mut node_informer = Informer::new(nodes, "").with_resync_period(resync);
        let policy_informer = Informer::new(policies, &*self.namespace).with_resync_period(resync);
        let secret_informer = Informer::new(secrets, &*self.namespace).with_resync_period(resync);

        let node_lister = node_informer.lister();
        let counter = PerNodeCounter::new();
        let cache = AllocationCache::new(game_server_informer.lister(), counter.clone(), features);
        game_server_informer.add_handler(Arc::new(counter.clone()));
        game_server_informer.add_handler(cache.clone());
        node_informer.add_handler(Arc::new(counter));

        let allocator = allocation::Allocator::new(
            allocation::allocator::Context {
                game_servers,
                cache: cache.clone(),
                policies: policy_informer.lister(),
                secrets: secret_informer.lister(),
                recorder,
                features,
                config: config.allocation.clone(),
                dialer: Arc::new(GrpcDialer::default()),
            },
            shutdown.clone(),
        );

        game_server_informer.spawn(shutdown.clone());
        node_informer.spawn(shutdown.clone());
        policy_informer.spawn(shutdown.clone());
        secret_informer.spawn(shutdown.clone());
        tokio::spawn(cache.run(shutdown.clone()));

        tracing::info!("waiting for caches to sync");
        tokio::select! {
            _ = futures::future::join(allocator.synced(), node_lister.synced()) => {}
            _ = signal::shutdown(shutdown.clone()) => return Ok(()),
        }
        tracing::info!("caches synced, serving allocations");

        let mut grpc = config.grpc.clone();
        if let Some(address) = self.address {
            grpc.address = address;
        }

        service::serve(&grpc, allocator, shutdown).await
    }
}
