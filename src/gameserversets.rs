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

//! Keeps the number of game servers in each set at its desired replicas.

pub mod controller;
pub mod overflow;
pub mod state_cache;

use std::{collections::HashMap, sync::Arc};

use crate::{
    apis::{self, GameServer, GameServerSet, Priority, SchedulingStrategy},
    gameservers::pernodecounter::NodeCount,
    watch::Lister,
};

pub use self::{controller::Controller, state_cache::StateCache};

/// The game servers `set` controls, matched on its label and owner uid.
pub fn list_owned(lister: &Lister<GameServer>, set: &GameServerSet) -> Vec<Arc<GameServer>> {
    let Some(uid) = set.metadata.uid.as_deref() else {
        return Vec::new();
    };

    lister
        .list_matching(
            set.metadata.namespace.as_deref().unwrap_or_default(),
            &set.game_server_selector(),
        )
        .into_iter()
        .filter(|gs| apis::is_owned_by(&**gs, uid))
        .collect()
}

/// Orders game servers so the ones to remove first come first.
///
/// Under `Packed`, game servers on the emptiest nodes go first, with
/// unscheduled ones ahead of everything, so that busy nodes stay busy and
/// empty nodes can be scaled away. Under `Distributed` the newest go first.
/// Priorities, when given, break ties in reverse.
pub fn sort_for_removal(
    list: &mut [Arc<GameServer>],
    scheduling: SchedulingStrategy,
    counts: &HashMap<String, NodeCount>,
    priorities: &[Priority],
) {
    let load = |gs: &GameServer| {
        counts
            .get(gs.node_name())
            .map(|count| count.ready + count.allocated)
    };

    list.sort_by(|a, b| {
        let ordering = match scheduling {
            SchedulingStrategy::Packed => match (load(a), load(b)) {
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (a, b) => a.cmp(&b),
            },
            SchedulingStrategy::Distributed => b
                .metadata
                .creation_timestamp
                .cmp(&a.metadata.creation_timestamp),
        };

        ordering
            .then_with(|| b.compare_priorities(a, priorities))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono};
    use kube::ResourceExt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn gs(name: &str, node: &str, age_secs: i64) -> Arc<GameServer> {
        let mut gs = GameServer::new(name, <_>::default());
        gs.status_mut().node_name = node.into();
        gs.metadata.creation_timestamp =
            Some(Time(chrono::Utc::now() - chrono::Duration::seconds(age_secs)));
        Arc::new(gs)
    }

    fn names(list: &[Arc<GameServer>]) -> Vec<String> {
        list.iter().map(|gs| gs.name_any()).collect()
    }

    #[test]
    fn packed_removes_from_emptiest_nodes() {
        let counts = HashMap::from([
            ("busy".to_owned(), NodeCount { ready: 3, allocated: 4 }),
            ("quiet".to_owned(), NodeCount { ready: 1, allocated: 0 }),
        ]);
        let mut list = vec![
            gs("a", "busy", 0),
            gs("b", "quiet", 0),
            gs("c", "", 0),
        ];
        sort_for_removal(&mut list, SchedulingStrategy::Packed, &counts, &[]);
        assert_eq!(vec!["c", "b", "a"], names(&list));
    }

    #[test]
    fn distributed_removes_newest() {
        let mut list = vec![gs("old", "n", 100), gs("new", "n", 1), gs("mid", "n", 50)];
        sort_for_removal(&mut list, SchedulingStrategy::Distributed, &<_>::default(), &[]);
        assert_eq!(vec!["new", "mid", "old"], names(&list));
    }
}
