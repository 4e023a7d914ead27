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

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::IntGaugeVec;

use crate::{
    apis::{GameServer, GameServerState},
    metrics,
    watch::EventHandler,
};

static NODE_GAME_SERVERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    metrics::register(
        IntGaugeVec::new(
            metrics::opts(
                "node_game_servers",
                "allocation",
                "Ready and allocated game servers per node",
            ),
            &["node", "state"],
        )
        .unwrap(),
    )
});

/// Ready and allocated game servers on one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCount {
    pub ready: i64,
    pub allocated: i64,
}

impl NodeCount {
    fn of(gs: &GameServer) -> Self {
        match gs.state() {
            Some(GameServerState::Ready) => Self {
                ready: 1,
                allocated: 0,
            },
            Some(GameServerState::Allocated) => Self {
                ready: 0,
                allocated: 1,
            },
            _ => Self::default(),
        }
    }
}

/// Tracks how many ready and allocated game servers each node runs, for
/// packed and distributed placement.
#[derive(Clone, Default)]
pub struct PerNodeCounter {
    counts: Arc<RwLock<HashMap<String, NodeCount>>>,
}

impl PerNodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A point in time copy of every node's counts.
    pub fn counts(&self) -> HashMap<String, NodeCount> {
        self.counts.read().clone()
    }

    pub fn node(&self, name: &str) -> NodeCount {
        self.counts.read().get(name).copied().unwrap_or_default()
    }

    fn adjust(&self, node: &str, ready: i64, allocated: i64) {
        if node.is_empty() || (ready == 0 && allocated == 0) {
            return;
        }

        let mut counts = self.counts.write();
        let count = counts.entry(node.to_owned()).or_default();
        // Clamped, as replays after a relist may arrive out of order.
        count.ready = (count.ready + ready).max(0);
        count.allocated = (count.allocated + allocated).max(0);

        NODE_GAME_SERVERS
            .with_label_values(&[node, "ready"])
            .set(count.ready);
        NODE_GAME_SERVERS
            .with_label_values(&[node, "allocated"])
            .set(count.allocated);
    }
}

impl EventHandler<GameServer> for PerNodeCounter {
    fn on_add(&self, gs: &Arc<GameServer>) {
        let count = NodeCount::of(gs);
        self.adjust(gs.node_name(), count.ready, count.allocated);
    }

    fn on_update(&self, old: &Arc<GameServer>, new: &Arc<GameServer>) {
        let (before, after) = (NodeCount::of(old), NodeCount::of(new));
        if old.node_name() == new.node_name() {
            self.adjust(
                new.node_name(),
                after.ready - before.ready,
                after.allocated - before.allocated,
            );
        } else {
            self.adjust(old.node_name(), -before.ready, -before.allocated);
            self.adjust(new.node_name(), after.ready, after.allocated);
        }
    }

    fn on_delete(&self, gs: &Arc<GameServer>) {
        let count = NodeCount::of(gs);
        self.adjust(gs.node_name(), -count.ready, -count.allocated);
    }
}

impl EventHandler<Node> for PerNodeCounter {
    fn on_delete(&self, node: &Arc<Node>) {
        let name = node.name_any();
        self.counts.write().remove(&name);
        for state in ["ready", "allocated"] {
            let _ = NODE_GAME_SERVERS.remove_label_values(&[&name, state]);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn gs(name: &str, node: &str, state: GameServerState) -> Arc<GameServer> {
        let mut gs = GameServer::new(name, <_>::default());
        gs.metadata.namespace = Some("default".into());
        gs.set_state(state);
        gs.status_mut().node_name = node.into();
        Arc::new(gs)
    }

    #[test]
    fn counts_follow_state_changes() {
        let counter = PerNodeCounter::new();
        let ready = gs("gs-1", "n1", GameServerState::Ready);
        let allocated = gs("gs-1", "n1", GameServerState::Allocated);

        counter.on_add(&ready);
        counter.on_add(&gs("gs-2", "n1", GameServerState::Ready));
        counter.on_add(&gs("gs-3", "n2", GameServerState::Scheduled));
        assert_eq!(NodeCount { ready: 2, allocated: 0 }, counter.node("n1"));
        assert_eq!(NodeCount::default(), counter.node("n2"));

        counter.on_update(&ready, &allocated);
        assert_eq!(NodeCount { ready: 1, allocated: 1 }, counter.node("n1"));

        // Resync replays do not double count.
        counter.on_update(&allocated, &allocated);
        assert_eq!(NodeCount { ready: 1, allocated: 1 }, counter.node("n1"));

        counter.on_delete(&allocated);
        assert_eq!(NodeCount { ready: 1, allocated: 0 }, counter.node("n1"));
    }

    #[test]
    fn counts_are_clamped_and_nodes_removed() {
        let counter = PerNodeCounter::new();
        counter.on_delete(&gs("gs-1", "n1", GameServerState::Ready));
        assert_eq!(NodeCount::default(), counter.node("n1"));

        counter.on_add(&gs("gs-1", "n1", GameServerState::Ready));
        let snapshot = counter.counts();

        let node = Node {
            metadata: kube::api::ObjectMeta {
                name: Some("n1".into()),
                ..<_>::default()
            },
            ..<_>::default()
        };
        EventHandler::<Node>::on_delete(&counter, &Arc::new(node));
        assert!(counter.counts().is_empty());
        assert_eq!(1, snapshot["n1"].ready);
    }

    #[test]
    fn moving_nodes_moves_counts() {
        let counter = PerNodeCounter::new();
        let before = gs("gs-1", "", GameServerState::Scheduled);
        let after = gs("gs-1", "n2", GameServerState::Ready);
        counter.on_add(&before);
        counter.on_update(&before, &after);
        assert_eq!(NodeCount { ready: 1, allocated: 0 }, counter.node("n2"));
    }
}
