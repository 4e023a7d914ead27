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

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    apis::{self, GameServer, GameServerAllocation, GameServerState, Priority, SchedulingStrategy},
    config::Features,
    gameservers::pernodecounter::{NodeCount, PerNodeCounter},
    signal::ShutdownRx,
    watch::{EventHandler, Lister},
    workqueue::{Reconciler, WorkQueue},
};

/// The only key the resync queue ever sees.
const RESYNC_KEY: &str = "allocation-cache/resync";

/// Game servers that can currently be allocated, keyed by `namespace/name`.
pub struct AllocationCache {
    cache: RwLock<HashMap<String, Arc<GameServer>>>,
    lister: Lister<GameServer>,
    counter: PerNodeCounter,
    features: Features,
    queue: WorkQueue,
}

impl AllocationCache {
    pub fn new(lister: Lister<GameServer>, counter: PerNodeCounter, features: Features) -> Arc<Self> {
        Arc::new(Self {
            cache: <_>::default(),
            lister,
            counter,
            features,
            queue: WorkQueue::new("allocation-cache"),
        })
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn counter(&self) -> &PerNodeCounter {
        &self.counter
    }

    fn is_eligible(&self, gs: &GameServer) -> bool {
        if gs.is_being_deleted() {
            return false;
        }

        match gs.state() {
            Some(GameServerState::Ready) => true,
            Some(GameServerState::Allocated) => self.features.state_allocation_filter,
            _ => false,
        }
    }

    fn store(&self, key: String, gs: Arc<GameServer>) {
        let mut cache = self.cache.write();
        cache.insert(key, gs);
        super::metrics::cached_game_servers().set(cache.len() as i64);
    }

    fn delete(&self, key: &str) -> bool {
        let mut cache = self.cache.write();
        let removed = cache.remove(key).is_some();
        super::metrics::cached_game_servers().set(cache.len() as i64);
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.read().contains_key(key)
    }

    /// Puts a game server back, when it is still eligible.
    pub fn insert(&self, gs: Arc<GameServer>) {
        if self.is_eligible(&gs) {
            self.store(apis::key(&*gs), gs);
        }
    }

    /// Takes a game server out of the cache, returning `false` when another
    /// change already removed it.
    pub fn remove(&self, key: &str) -> bool {
        self.delete(key)
    }

    /// Asks the resync worker to rebuild the cache from the lister.
    pub fn resync(&self) {
        self.queue.add(RESYNC_KEY);
    }

    /// Rebuilds the cache from the lister, keeping entries that are already
    /// up to date.
    pub fn sync(&self) {
        let current: HashMap<String, Arc<GameServer>> = self
            .lister
            .list()
            .into_iter()
            .map(|gs| (apis::key(&*gs), gs))
            .collect();

        let mut cache = self.cache.write();
        cache.retain(|key, _| current.contains_key(key));
        for (key, gs) in current {
            if !self.is_eligible(&gs) {
                cache.remove(&key);
                continue;
            }

            let stale = cache.get(&key).map_or(true, |cached| {
                cached.metadata.resource_version != gs.metadata.resource_version
            });
            if stale {
                cache.insert(key, gs);
            }
        }

        super::metrics::cached_game_servers().set(cache.len() as i64);
        tracing::debug!(size = cache.len(), "allocation cache synced");
    }

    /// Resolves once the lister has synced and the cache was filled from it.
    pub async fn synced(&self) {
        self.lister.synced().await;
        self.sync();
    }

    /// Fills the cache once the lister has synced, then serves resync
    /// requests from a single worker until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) {
        self.synced().await;
        self.queue.clone().run(self, 1, shutdown).await;
    }

    /// The cached game servers in `allocation`'s namespace, ordered for its
    /// scheduling.
    ///
    /// Packed requests put game servers on the busiest nodes first.
    /// Distributed requests only sort by their priorities, the selector walks
    /// them in random order when there are none.
    pub fn list_sorted(&self, allocation: &GameServerAllocation) -> Vec<Arc<GameServer>> {
        let namespace = allocation.namespace_or_default();
        let mut list: Vec<Arc<GameServer>> = self
            .cache
            .read()
            .values()
            .filter(|gs| gs.metadata.namespace.as_deref() == Some(namespace.as_str()))
            .cloned()
            .collect();
        let priorities: &[Priority] = if self.features.counts_and_lists {
            &allocation.spec.priorities
        } else {
            &[]
        };

        match allocation.spec.scheduling {
            SchedulingStrategy::Packed => {
                let counts = self.counter.counts();
                list.sort_by(|a, b| {
                    compare_packed(a, b, priorities, &counts, &self.features)
                        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
                });
            }
            SchedulingStrategy::Distributed => {
                list.sort_by(|a, b| {
                    a.compare_priorities(b, priorities)
                        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
                });
            }
        }

        list
    }
}

/// Orders two game servers for packing, earlier is better.
fn compare_packed(
    a: &GameServer,
    b: &GameServer,
    priorities: &[Priority],
    counts: &HashMap<String, NodeCount>,
    features: &Features,
) -> Ordering {
    // Allocated game servers that match a selector are reused first.
    if a.state() != b.state() {
        if a.is_allocated() {
            return Ordering::Less;
        } else if b.is_allocated() {
            return Ordering::Greater;
        }
    }

    let ordering = match (counts.get(a.node_name()), counts.get(b.node_name())) {
        (Some(a), Some(b)) => b
            .allocated
            .cmp(&a.allocated)
            .then_with(|| b.ready.cmp(&a.ready)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    if ordering != Ordering::Equal {
        return ordering;
    }

    if features.player_allocation_filter {
        if let (Some(a), Some(b)) = (a.remaining_player_capacity(), b.remaining_player_capacity()) {
            let ordering = a.cmp(&b);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
    }

    a.compare_priorities(b, priorities)
        .then_with(|| a.node_name().cmp(b.node_name()))
}

#[async_trait::async_trait]
impl Reconciler for AllocationCache {
    async fn reconcile(&self, key: &str) -> crate::Result<()> {
        tracing::debug!(%key, "refreshing allocation cache");
        self.sync();
        Ok(())
    }
}

impl EventHandler<GameServer> for AllocationCache {
    fn on_add(&self, gs: &Arc<GameServer>) {
        if self.is_eligible(gs) {
            self.store(apis::key(&**gs), gs.clone());
        }
    }

    fn on_update(&self, old: &Arc<GameServer>, new: &Arc<GameServer>) {
        if old.metadata.resource_version == new.metadata.resource_version {
            return;
        }

        let key = apis::key(&**new);
        if self.is_eligible(new) {
            self.store(key, new.clone());
        } else {
            self.delete(&key);
        }
    }

    fn on_delete(&self, gs: &Arc<GameServer>) {
        self.delete(&apis::key(&**gs));
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::{
            gameserver::{CounterStatus, PlayerStatus},
            PriorityOrder, PriorityType,
        },
        test,
    };

    fn gs(name: &str, node: &str, state: GameServerState) -> Arc<GameServer> {
        let mut gs = GameServer::new(name, <_>::default());
        gs.metadata.namespace = Some("default".into());
        gs.metadata.resource_version = Some("1".into());
        gs.set_state(state);
        gs.status_mut().node_name = node.into();
        Arc::new(gs)
    }

    fn names(list: &[Arc<GameServer>]) -> Vec<&str> {
        list.iter()
            .map(|gs| gs.metadata.name.as_deref().unwrap_or_default())
            .collect()
    }

    fn cache(features: Features) -> Arc<AllocationCache> {
        AllocationCache::new(test::lister(), PerNodeCounter::new(), features)
    }

    #[test]
    fn events_keep_only_eligible_game_servers() {
        let cache = cache(Features {
            state_allocation_filter: false,
            ..<_>::default()
        });

        let ready = gs("a", "n1", GameServerState::Ready);
        cache.on_add(&ready);
        cache.on_add(&gs("b", "n1", GameServerState::Starting));
        assert_eq!(1, cache.len());

        // Same resource version, nothing changes.
        let mut allocated = (*ready).clone();
        allocated.set_state(GameServerState::Allocated);
        cache.on_update(&ready, &Arc::new(allocated.clone()));
        assert!(cache.contains("default/a"));

        allocated.metadata.resource_version = Some("2".into());
        cache.on_update(&ready, &Arc::new(allocated));
        assert!(cache.is_empty());

        let mut deleting = (*ready).clone();
        deleting.metadata.resource_version = Some("3".into());
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        cache.on_add(&ready);
        cache.on_update(&ready, &Arc::new(deleting));
        assert!(cache.is_empty());

        cache.on_add(&ready);
        cache.on_delete(&ready);
        assert!(!cache.remove("default/a"));
    }

    #[test]
    fn state_filter_keeps_allocated() {
        let cache = cache(Features::default());
        cache.on_add(&gs("a", "n1", GameServerState::Allocated));
        assert_eq!(1, cache.len());
    }

    #[test]
    fn packed_prefers_busy_nodes() {
        let cache = cache(Features::default());
        for gs in [
            gs("a", "n2", GameServerState::Ready),
            gs("b", "n1", GameServerState::Ready),
            gs("c", "n3", GameServerState::Ready),
            gs("d", "", GameServerState::Ready),
            gs("e", "n1", GameServerState::Ready),
        ] {
            cache.on_add(&gs);
            cache.counter().on_add(&gs);
        }
        cache.counter().on_add(&gs("x", "n1", GameServerState::Allocated));
        cache.counter().on_add(&gs("y", "n3", GameServerState::Ready));

        let sorted = cache.list_sorted(&GameServerAllocation::default());
        // n1 has an allocated game server, n3 holds more ready ones than n2.
        assert_eq!(vec!["b", "e", "c", "a", "d"], names(&sorted));

        let counts = cache.counter().counts();
        for pair in sorted.windows(2) {
            let first = counts.get(pair[0].node_name()).copied().unwrap_or_default();
            let second = counts.get(pair[1].node_name()).copied().unwrap_or_default();
            assert!(first.allocated >= second.allocated);
            if first.allocated == second.allocated {
                assert!(first.ready >= second.ready);
            }
        }
    }

    #[test]
    fn packed_reuses_allocated_first() {
        let cache = cache(Features::default());
        cache.on_add(&gs("a", "n1", GameServerState::Ready));
        cache.on_add(&gs("b", "n2", GameServerState::Allocated));

        let sorted = cache.list_sorted(&GameServerAllocation::default());
        assert_eq!(vec!["b", "a"], names(&sorted));
    }

    #[test]
    fn priorities_order_distributed() {
        let cache = cache(Features::default());
        for (name, count) in [("a", 8), ("b", 2), ("c", 5)] {
            let mut gs = (*gs(name, "n1", GameServerState::Ready)).clone();
            gs.status_mut().counters.insert(
                "rooms".into(),
                CounterStatus {
                    count,
                    capacity: 10,
                },
            );
            cache.on_add(&Arc::new(gs));
        }

        let mut allocation = GameServerAllocation::default();
        allocation.spec.scheduling = SchedulingStrategy::Distributed;
        allocation.spec.priorities = vec![Priority {
            r#type: PriorityType::Counter,
            key: "rooms".into(),
            order: PriorityOrder::Ascending,
        }];
        assert_eq!(vec!["a", "c", "b"], names(&cache.list_sorted(&allocation)));

        allocation.spec.priorities[0].order = PriorityOrder::Descending;
        assert_eq!(vec!["b", "c", "a"], names(&cache.list_sorted(&allocation)));
    }

    fn with_rooms(name: &str, node: &str, count: i64) -> Arc<GameServer> {
        let mut gs = (*gs(name, node, GameServerState::Ready)).clone();
        gs.status_mut().counters.insert(
            "rooms".into(),
            CounterStatus {
                count,
                capacity: 10,
            },
        );
        Arc::new(gs)
    }

    #[test]
    fn packed_priorities_break_ties_between_equal_nodes() {
        let cache = cache(Features::default());
        for gs in [with_rooms("a", "n1", 8), with_rooms("b", "n2", 2)] {
            cache.on_add(&gs);
            cache.counter().on_add(&gs);
        }

        let mut allocation = GameServerAllocation::default();
        allocation.spec.priorities = vec![Priority {
            r#type: PriorityType::Counter,
            key: "rooms".into(),
            order: PriorityOrder::Descending,
        }];
        assert_eq!(vec!["b", "a"], names(&cache.list_sorted(&allocation)));

        allocation.spec.priorities[0].order = PriorityOrder::Ascending;
        assert_eq!(vec!["a", "b"], names(&cache.list_sorted(&allocation)));

        // Without priorities the node name decides.
        allocation.spec.priorities.clear();
        assert_eq!(vec!["a", "b"], names(&cache.list_sorted(&allocation)));
    }

    #[test]
    fn packed_prefers_least_player_capacity_between_equal_nodes() {
        let cache = cache(Features {
            player_allocation_filter: true,
            ..<_>::default()
        });
        for (name, node, count) in [("a", "n1", 2), ("b", "n2", 9)] {
            let mut gs = (*gs(name, node, GameServerState::Ready)).clone();
            gs.status_mut().players = Some(PlayerStatus {
                count,
                capacity: 10,
                ids: Vec::new(),
            });
            let gs = Arc::new(gs);
            cache.on_add(&gs);
            cache.counter().on_add(&gs);
        }

        let sorted = cache.list_sorted(&GameServerAllocation::default());
        assert_eq!(vec!["b", "a"], names(&sorted));
    }

    #[tokio::test]
    async fn resync_rebuilds_from_the_lister() {
        let harness = test::Harness::new(10, 20).await;
        let ready = harness.ready_game_server("a", "n1").await;
        let cache = AllocationCache::new(
            harness.game_server_lister.clone(),
            PerNodeCounter::new(),
            Features::default(),
        );

        cache.on_add(&gs("stale", "n1", GameServerState::Ready));
        cache.reconcile(RESYNC_KEY).await.unwrap();
        assert_eq!(1, cache.len());
        assert!(cache.contains(&apis::key(&ready)));
    }
}
