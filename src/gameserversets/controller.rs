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

use std::{collections::HashMap, sync::Arc};

use eyre::WrapErr;
use futures::StreamExt;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use prometheus::IntCounterVec;

use super::{list_owned, overflow, sort_for_removal, StateCache};
use crate::{
    apis::{
        self, gameserverset::GameServerSetStatus, GameServer, GameServerSet, GameServerState,
    },
    config::Features,
    events::{self, DynRecorder, Event},
    gameservers::{pernodecounter::NodeCount, PerNodeCounter},
    metrics,
    signal::ShutdownRx,
    store::DynStore,
    watch::{EventHandler, Lister},
    workqueue::{Reconciler, WorkQueue},
};

/// Concurrent writes issued by one reconcile.
const BURST: usize = 16;

static GAME_SERVERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    metrics::register(
        IntCounterVec::new(
            metrics::opts(
                "game_servers_total",
                "gameserversets",
                "Game servers created and removed by set reconciles",
            ),
            &[metrics::ACTION_LABEL],
        )
        .unwrap(),
    )
});

pub struct Context {
    pub game_servers: DynStore<GameServer>,
    pub sets: DynStore<GameServerSet>,
    pub game_server_lister: Lister<GameServer>,
    pub set_lister: Lister<GameServerSet>,
    pub counter: PerNodeCounter,
    pub recorder: DynRecorder,
    pub features: Features,
    pub max_creations: usize,
    pub max_deletions: usize,
}

/// What one reconcile of a set will do.
#[derive(Debug, Default)]
pub struct Plan {
    pub to_add: usize,
    /// Unhealthy game servers first, then the surplus.
    pub to_delete: Vec<Arc<GameServer>>,
    /// Set when the batch limits left work for another pass.
    pub partial: bool,
}

/// Works out how far `list` is from `replicas`. `Allocated` and `Reserved`
/// game servers count towards the replicas but are never removed. Surplus
/// game servers that are not yet `Ready` go before `Ready` ones.
pub fn plan(
    set: &GameServerSet,
    list: &[Arc<GameServer>],
    counts: &HashMap<String, NodeCount>,
    max_creations: usize,
    max_deletions: usize,
) -> Plan {
    let mut fixed = 0;
    let mut to_delete = Vec::new();
    let mut starting = Vec::new();
    let mut ready = Vec::new();

    for gs in list.iter().filter(|gs| !gs.is_being_deleted()) {
        match gs.state() {
            Some(GameServerState::Allocated | GameServerState::Reserved) => fixed += 1,
            Some(GameServerState::Unhealthy | GameServerState::Error) => to_delete.push(gs.clone()),
            Some(GameServerState::Shutdown) => {}
            Some(GameServerState::Ready) => ready.push(gs.clone()),
            _ => starting.push(gs.clone()),
        }
    }

    let desired = usize::try_from(set.spec.replicas).unwrap_or_default();
    let up = fixed + starting.len() + ready.len();
    let mut plan = Plan {
        to_add: desired.saturating_sub(up),
        ..<_>::default()
    };

    if up > desired {
        let (scheduling, priorities) = (set.spec.scheduling, &set.spec.priorities);
        sort_for_removal(&mut starting, scheduling, counts, priorities);
        sort_for_removal(&mut ready, scheduling, counts, priorities);
        to_delete.extend(starting.into_iter().chain(ready).take(up - desired));
    }

    if plan.to_add > max_creations {
        plan.to_add = max_creations;
        plan.partial = true;
    }

    if to_delete.len() > max_deletions {
        to_delete.truncate(max_deletions);
        plan.partial = true;
    }

    plan.to_delete = to_delete;
    plan
}

/// Scales game server sets and keeps their status current.
pub struct Controller {
    context: Context,
    state_cache: StateCache,
    queue: WorkQueue,
}

impl Controller {
    pub fn new(context: Context) -> Arc<Self> {
        Arc::new(Self {
            context,
            state_cache: StateCache::new(),
            queue: WorkQueue::new("gameserversets"),
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn set_handler(&self) -> Arc<dyn EventHandler<GameServerSet>> {
        Arc::new(SetEvents {
            queue: self.queue.clone(),
            state_cache: self.state_cache.clone(),
        })
    }

    pub fn game_server_handler(&self) -> Arc<dyn EventHandler<GameServer>> {
        Arc::new(SetOwners(self.queue.clone()))
    }

    pub async fn run(self: Arc<Self>, workers: usize, shutdown: ShutdownRx) {
        tokio::join!(
            self.context.game_server_lister.synced(),
            self.context.set_lister.synced(),
        );
        self.queue.clone().run(self, workers, shutdown).await;
    }

    fn owned(&self, set: &GameServerSet) -> Vec<Arc<GameServer>> {
        self.state_cache
            .for_set(set)
            .reconcile(list_owned(&self.context.game_server_lister, set))
    }

    async fn add_game_servers(&self, set: &GameServerSet, count: usize) -> crate::Result<()> {
        tracing::debug!(set = %set.name_any(), count, "adding game servers");
        let entry = self.state_cache.for_set(set);
        let template = set.game_server();

        let results: Vec<crate::Result<()>> = futures::stream::iter(0..count)
            .map(|_| async {
                let gs = self
                    .context
                    .game_servers
                    .create(&template)
                    .await
                    .wrap_err_with(|| {
                        format!("error creating game server for game server set {}", set.name_any())
                    })?;
                entry.created(&gs);
                GAME_SERVERS_TOTAL.with_label_values(&["create"]).inc();
                events::record(
                    &*self.context.recorder,
                    set,
                    Event::normal(
                        events::SUCCESSFUL_CREATE,
                        format!("Created gameserver: {}", gs.name_any()),
                    ),
                )
                .await;
                Ok::<_, eyre::Report>(())
            })
            .buffer_unordered(BURST)
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Moves game servers to `Shutdown`, leaving their removal to the game
    /// server controller. Writing the state rather than deleting outright
    /// fails on a stale copy, so a game server allocated in the meantime
    /// survives.
    async fn delete_game_servers(
        &self,
        set: &GameServerSet,
        list: Vec<Arc<GameServer>>,
    ) -> crate::Result<()> {
        tracing::debug!(set = %set.name_any(), count = list.len(), "removing game servers");
        let entry = self.state_cache.for_set(set);

        let results: Vec<crate::Result<()>> = futures::stream::iter(list)
            .map(|gs| {
                let entry = entry.clone();
                async move {
                    let previous = gs.state().unwrap_or_default();
                    let mut copy = (*gs).clone();
                    copy.set_state(GameServerState::Shutdown);
                    match self.context.game_servers.update(&copy).await {
                        Ok(updated) => entry.deleted(&updated),
                        Err(error) if error.is_not_found() => {
                            entry.deleted(&gs);
                            return Ok(());
                        }
                        Err(error) => {
                            return Err(eyre::Report::new(error).wrap_err(format!(
                                "error shutting down game server {}",
                                gs.name_any()
                            )))
                        }
                    }

                    GAME_SERVERS_TOTAL.with_label_values(&["delete"]).inc();
                    events::record(
                        &*self.context.recorder,
                        set,
                        Event::normal(
                            events::SUCCESSFUL_DELETE,
                            format!("Deleted gameserver in state {previous}: {}", gs.name_any()),
                        ),
                    )
                    .await;
                    Ok::<_, eyre::Report>(())
                }
            })
            .buffer_unordered(BURST)
            .collect()
            .await;

        results.into_iter().collect()
    }

    async fn sync_overflow(&self, set: &GameServerSet, list: &[Arc<GameServer>]) -> crate::Result<()> {
        for gs in overflow::pending(set, list, &self.context.counter.counts()) {
            self.context
                .game_servers
                .update(&gs)
                .await
                .wrap_err_with(|| {
                    format!(
                        "error updating game server {} with overflow labels and annotations",
                        gs.name_any()
                    )
                })?;
        }

        Ok(())
    }

    async fn sync_status(&self, set: &GameServerSet, list: &[Arc<GameServer>]) -> crate::Result<()> {
        let features = &self.context.features;
        let status = GameServerSetStatus::from_game_servers(
            list.iter().map(|gs| &**gs),
            features.counts_and_lists,
            features.player_allocation_filter,
        );

        if set.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut copy = set.clone();
        copy.status = Some(status);
        match self.context.sets.update_status(&copy).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(eyre::Report::new(error)
                .wrap_err(format!("error updating status on game server set {}", set.name_any()))),
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for Controller {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn reconcile(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = apis::split_key(key);
        let Some(set) = self.context.set_lister.get(namespace, name) else {
            tracing::debug!(%key, "game server set is no longer available for syncing");
            return Ok(());
        };

        if set.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let list = self.owned(&set);
        let plan = plan(
            &set,
            &list,
            &self.context.counter.counts(),
            self.context.max_creations,
            self.context.max_deletions,
        );

        if plan.partial {
            // Picked up again once this pass is done.
            self.queue.add(key);
        }

        if plan.to_add > 0 {
            self.add_game_servers(&set, plan.to_add).await?;
        }

        if !plan.to_delete.is_empty() {
            self.delete_game_servers(&set, plan.to_delete).await?;
        }

        self.sync_overflow(&set, &list).await?;

        let list = self.owned(&set);
        self.sync_status(&set, &list).await
    }
}

struct SetEvents {
    queue: WorkQueue,
    state_cache: StateCache,
}

impl EventHandler<GameServerSet> for SetEvents {
    fn on_add(&self, set: &Arc<GameServerSet>) {
        self.queue.add(apis::key(&**set));
    }

    fn on_update(&self, _: &Arc<GameServerSet>, new: &Arc<GameServerSet>) {
        self.queue.add(apis::key(&**new));
    }

    fn on_delete(&self, set: &Arc<GameServerSet>) {
        self.state_cache.remove_set(set);
    }
}

/// Queues the set owning a game server whenever it changes.
struct SetOwners(WorkQueue);

impl SetOwners {
    fn enqueue(&self, gs: &GameServer) {
        let Some(owner) = apis::controller_of(gs) else {
            return;
        };

        if owner.kind == <GameServerSet as kube::Resource>::kind(&()) {
            self.0
                .add(apis::key_of(&gs.namespace().unwrap_or_default(), &owner.name));
        }
    }
}

impl EventHandler<GameServer> for SetOwners {
    fn on_add(&self, gs: &Arc<GameServer>) {
        self.enqueue(gs);
    }

    fn on_update(&self, _: &Arc<GameServer>, new: &Arc<GameServer>) {
        self.enqueue(new);
    }

    fn on_delete(&self, gs: &Arc<GameServer>) {
        self.enqueue(gs);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::MetaPatch,
        store::Store,
        test::{self, Harness},
    };

    fn game_servers(states: &[(&str, GameServerState)]) -> Vec<Arc<GameServer>> {
        states
            .iter()
            .map(|(name, state)| {
                let mut gs = GameServer::new(name, <_>::default());
                gs.set_state(*state);
                Arc::new(gs)
            })
            .collect()
    }

    fn names(list: &[Arc<GameServer>]) -> Vec<String> {
        list.iter().map(|gs| gs.name_any()).collect()
    }

    fn set(replicas: i32) -> GameServerSet {
        let mut set = GameServerSet::new("set", <_>::default());
        set.spec.replicas = replicas;
        set
    }

    #[test]
    fn plan_scales_up_within_limits() {
        let list = game_servers(&[
            ("a", GameServerState::Ready),
            ("b", GameServerState::Allocated),
            ("c", GameServerState::Shutdown),
        ]);

        let plan = plan(&set(5), &list, &<_>::default(), 64, 64);
        assert_eq!(3, plan.to_add);
        assert!(!plan.partial);

        let plan = super::plan(&set(5), &list, &<_>::default(), 2, 64);
        assert_eq!(2, plan.to_add);
        assert!(plan.partial);
    }

    #[test]
    fn plan_never_removes_allocated_or_reserved() {
        let list = game_servers(&[
            ("allocated", GameServerState::Allocated),
            ("reserved", GameServerState::Reserved),
            ("ready", GameServerState::Ready),
            ("starting", GameServerState::Starting),
            ("unhealthy", GameServerState::Unhealthy),
        ]);

        let plan = plan(&set(0), &list, &<_>::default(), 64, 64);
        assert_eq!(0, plan.to_add);
        assert_eq!(vec!["unhealthy", "starting", "ready"], names(&plan.to_delete));

        let plan = super::plan(&set(3), &list, &<_>::default(), 64, 64);
        assert_eq!(vec!["unhealthy", "starting"], names(&plan.to_delete));

        let plan = super::plan(&set(0), &list, &<_>::default(), 64, 1);
        assert_eq!(vec!["unhealthy"], names(&plan.to_delete));
        assert!(plan.partial);
    }

    #[tokio::test]
    async fn scales_to_replicas_and_reports_status() {
        let harness = Harness::new(10, 20).await;
        let set = harness.sets.create(&test::game_server_set("set", 3)).await.unwrap();

        harness.sync().await;
        harness.set_controller.reconcile("default/set").await.unwrap();
        harness.sync().await;
        assert_eq!(3, harness.game_servers_of(&set).len());
        assert_eq!(
            vec!["SuccessfulCreate"; 3],
            harness.recorder.reasons("default", "set")
        );

        // Mark them ready, then scale down by one.
        for gs in harness.game_servers_of(&set) {
            harness.set_state(&gs, GameServerState::Ready).await;
        }
        let mut scaled = harness.sets.get("default", "set").await.unwrap();
        scaled.spec.replicas = 2;
        harness.sets.update(&scaled).await.unwrap();

        harness.sync().await;
        harness.set_controller.reconcile("default/set").await.unwrap();
        harness.sync().await;

        let list = harness.game_servers_of(&set);
        assert_eq!(
            1,
            list.iter()
                .filter(|gs| gs.is_state(GameServerState::Shutdown))
                .count()
        );

        let status = harness
            .sets
            .get("default", "set")
            .await
            .unwrap()
            .status
            .unwrap();
        assert_eq!(2, status.replicas);
        assert_eq!(2, status.ready_replicas);
        assert_eq!(1, status.shutdown_replicas);
    }

    #[tokio::test]
    async fn pending_creations_are_not_repeated() {
        let harness = Harness::new(10, 20).await;
        harness.sets.create(&test::game_server_set("set", 2)).await.unwrap();
        harness.sync().await;

        // Both passes see the same stale cache. The second status write may
        // conflict, which the queue would retry.
        harness.set_controller.reconcile("default/set").await.unwrap();
        let _ = harness.set_controller.reconcile("default/set").await;
        harness.sync().await;

        assert_eq!(
            2,
            harness.game_servers.list_all("default", &<_>::default()).await.unwrap().len()
        );
    }

    #[tokio::test]
    async fn overflow_is_labelled() {
        let harness = Harness::new(10, 20).await;
        let mut template = test::game_server_set("set", 2);
        template.spec.allocation_overflow = Some(MetaPatch {
            labels: [("overflow".into(), "true".into())].into(),
            ..<_>::default()
        });
        let set = harness.sets.create(&template).await.unwrap();
        harness.sync().await;
        harness.set_controller.reconcile("default/set").await.unwrap();
        harness.sync().await;

        for gs in harness.game_servers_of(&set) {
            harness.set_state(&gs, GameServerState::Allocated).await;
        }
        let mut scaled = harness.sets.get("default", "set").await.unwrap();
        scaled.spec.replicas = 1;
        harness.sets.update(&scaled).await.unwrap();

        harness.sync().await;
        harness.set_controller.reconcile("default/set").await.unwrap();
        harness.sync().await;

        let labelled: Vec<_> = harness
            .game_servers_of(&set)
            .into_iter()
            .filter(|gs| apis::label(&**gs, "overflow") == Some("true"))
            .collect();
        assert_eq!(1, labelled.len());
        assert!(harness
            .game_servers_of(&set)
            .iter()
            .all(|gs| gs.is_state(GameServerState::Allocated)));
    }
}
