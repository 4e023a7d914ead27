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

use std::{sync::Arc, time::Instant};

use k8s_openapi::api::core::v1::Secret;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use tryhard::RetryPolicy;

use super::{
    batch::{self, Batcher},
    cache::AllocationCache,
    metrics,
    remote::{Dialer, RemoteAllocator},
    Error,
};
use crate::{
    apis::{
        allocation::{GameServerAllocationState, GameServerAllocationStatus, LOCAL_SOURCE},
        policy::{ConnectionInfoIterator, GameServerAllocationPolicy},
        GameServer, GameServerAllocation, Selector,
    },
    config::{self, Features},
    events::DynRecorder,
    signal::ShutdownRx,
    store::DynStore,
    watch::Lister,
};

pub struct Context {
    pub game_servers: DynStore<GameServer>,
    pub cache: Arc<AllocationCache>,
    pub policies: Lister<GameServerAllocationPolicy>,
    pub secrets: Lister<Secret>,
    pub recorder: DynRecorder,
    pub features: Features,
    pub config: config::Allocation,
    pub dialer: Arc<dyn Dialer>,
}

/// Answers allocation requests, locally through the batch pipeline or by
/// walking the multi-cluster policies.
pub struct Allocator {
    batcher: Batcher,
    cache: Arc<AllocationCache>,
    policies: Lister<GameServerAllocationPolicy>,
    secrets: Lister<Secret>,
    remote: RemoteAllocator,
    features: Features,
    config: config::Allocation,
    rng: Mutex<StdRng>,
}

impl Allocator {
    pub fn new(context: Context, shutdown: ShutdownRx) -> Arc<Self> {
        let batcher = Batcher::spawn(
            batch::Context {
                game_servers: context.game_servers,
                cache: context.cache.clone(),
                recorder: context.recorder,
                features: context.features,
                config: context.config.clone(),
            },
            shutdown,
        );

        Arc::new(Self {
            batcher,
            cache: context.cache,
            policies: context.policies,
            secrets: context.secrets.clone(),
            remote: RemoteAllocator::new(context.secrets, context.dialer, context.config.clone()),
            features: context.features,
            config: context.config,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Resolves once the allocation cache, the policies and the secrets have
    /// all been listed. Requests answered earlier would see empty caches.
    pub async fn synced(&self) {
        futures::join!(
            self.cache.synced(),
            self.policies.synced(),
            self.secrets.synced()
        );
    }

    /// Allocates a game server for `allocation`. Running out of game
    /// servers, or losing every attempt to a concurrent request, is not an
    /// error, the returned status carries the outcome.
    #[tracing::instrument(skip_all, fields(namespace = ?allocation.metadata.namespace))]
    pub async fn allocate(
        &self,
        mut allocation: GameServerAllocation,
    ) -> Result<GameServerAllocationStatus, Error> {
        let start = Instant::now();
        allocation.apply_defaults(&self.features);
        allocation.validate(&self.features)?;

        let multi_cluster = allocation.spec.multi_cluster_setting.enabled;
        let source = if multi_cluster {
            metrics::REMOTE
        } else {
            metrics::LOCAL
        };

        let total = self.config.total_timeout();
        let result = tokio::time::timeout(total, async {
            if multi_cluster {
                self.allocate_multi_cluster(&allocation).await
            } else {
                self.allocate_local(&allocation).await
            }
        })
        .await
        .unwrap_or(Err(Error::TotalTimeoutExceeded(total)));

        let label = match &result {
            Ok(status) => match status.state {
                GameServerAllocationState::Allocated => "allocated",
                GameServerAllocationState::UnAllocated => "unallocated",
                GameServerAllocationState::Contention => "contention",
            },
            Err(_) => "error",
        };
        metrics::requests_total(source, label).inc();
        metrics::duration(source).observe(start.elapsed().as_secs_f64());

        result
    }

    /// Allocates from this cluster, retrying contention and conflicts.
    async fn allocate_local(
        &self,
        allocation: &GameServerAllocation,
    ) -> Result<GameServerAllocationStatus, Error> {
        let allocation = Arc::new(allocation.clone());
        let matcher = allocation.matcher()?;
        let retry = &self.config.retry;

        let result = tryhard::retry_fn(|| self.batcher.allocate(allocation.clone(), matcher.clone()))
            .retries(retry.steps.saturating_sub(1))
            .custom_backoff(|attempt, error: &Error| {
                if error.is_terminal() {
                    RetryPolicy::Break
                } else {
                    RetryPolicy::Delay(retry.jittered_delay(attempt, &mut *self.rng.lock()))
                }
            })
            .on_retry(|attempt, _, error: &Error| {
                let error = error.to_string();
                async move {
                    tracing::debug!(%attempt, %error, "allocation failed, retrying");
                }
            })
            .await;

        match result {
            Ok(gs) => Ok(GameServerAllocationStatus::allocated(&gs, LOCAL_SOURCE)),
            Err(Error::NoGameServerReady) => Ok(GameServerAllocationStatus::unallocated()),
            Err(Error::Contention) => Ok(GameServerAllocationStatus::contention()),
            Err(Error::Conflict(error)) => {
                tracing::debug!(%error, "allocation kept conflicting, resyncing cache");
                self.cache.resync();
                Ok(GameServerAllocationStatus::contention())
            }
            Err(error) => {
                if !error.is_terminal() {
                    self.cache.resync();
                }
                Err(error)
            }
        }
    }

    /// Walks the matching policies in priority order until one allocates.
    async fn allocate_multi_cluster(
        &self,
        allocation: &GameServerAllocation,
    ) -> Result<GameServerAllocationStatus, Error> {
        let namespace = allocation.namespace_or_default();
        let selector = Selector::try_from(&allocation.spec.multi_cluster_setting.policy_selector)?;
        let policies = self.policies.list_matching(&namespace, &selector);
        if policies.is_empty() {
            return Err(Error::NoPolicy);
        }

        let mut last = Err(Error::NoPolicy);
        for info in ConnectionInfoIterator::new(policies.iter().map(|policy| &**policy)) {
            let result = if info.is_local() {
                let mut local = allocation.clone();
                if !info.namespace.is_empty() {
                    local.metadata.namespace = Some(info.namespace.clone());
                }
                self.allocate_local(&local).await
            } else {
                self.remote.allocate(allocation, &info).await
            };

            match result {
                Ok(status) if status.state == GameServerAllocationState::Allocated => {
                    return Ok(status)
                }
                Ok(status) => last = Ok(status),
                Err(error) => {
                    tracing::warn!(cluster = %info.cluster_name, %error, "cluster allocation failed");
                    last = Err(error);
                }
            }
        }

        last
    }
}
