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

use crate::{
    apis::{GameServer, GameServerSet},
    gameservers::pernodecounter::NodeCount,
};

/// Allocated game servers beyond the set's replicas that still need the
/// set's overflow labels and annotations, already patched.
pub fn pending(
    set: &GameServerSet,
    list: &[Arc<GameServer>],
    counts: &HashMap<String, NodeCount>,
) -> Vec<GameServer> {
    let Some(patch) = set.spec.allocation_overflow.as_ref().filter(|patch| !patch.is_empty()) else {
        return Vec::new();
    };

    let allocated: Vec<&Arc<GameServer>> = list
        .iter()
        .filter(|gs| gs.is_allocated() && !gs.is_being_deleted())
        .collect();
    let replicas = usize::try_from(set.spec.replicas).unwrap_or_default();
    let Some(overflow) = allocated.len().checked_sub(replicas).filter(|n| *n > 0) else {
        return Vec::new();
    };

    let (matched, mut rest): (Vec<Arc<GameServer>>, Vec<Arc<GameServer>>) = allocated
        .into_iter()
        .cloned()
        .partition(|gs| patch.is_applied(&gs.metadata));
    if matched.len() >= overflow {
        return Vec::new();
    }

    super::sort_for_removal(&mut rest, set.spec.scheduling, counts, &set.spec.priorities);
    rest.into_iter()
        .take(overflow - matched.len())
        .map(|gs| {
            let mut copy = (*gs).clone();
            copy.patch_meta(patch);
            copy
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::{GameServerState, MetaPatch};

    fn gs(name: &str, state: GameServerState, labels: &[(&str, &str)]) -> Arc<GameServer> {
        let mut gs = GameServer::new(name, <_>::default());
        gs.set_state(state);
        gs.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        Arc::new(gs)
    }

    fn set(replicas: i32, overflow: Option<MetaPatch>) -> GameServerSet {
        let mut set = GameServerSet::new("set", <_>::default());
        set.spec.replicas = replicas;
        set.spec.allocation_overflow = overflow;
        set
    }

    #[test]
    fn labels_only_the_overflow() {
        let patch = MetaPatch {
            labels: [("overflow".into(), "true".into())].into(),
            ..<_>::default()
        };
        let list = vec![
            gs("a", GameServerState::Allocated, &[]),
            gs("b", GameServerState::Allocated, &[("overflow", "true")]),
            gs("c", GameServerState::Allocated, &[]),
            gs("d", GameServerState::Allocated, &[]),
            gs("e", GameServerState::Ready, &[]),
        ];

        let patched = pending(&set(1, Some(patch.clone())), &list, &<_>::default());
        assert_eq!(2, patched.len());
        assert!(patched.iter().all(|gs| patch.is_applied(&gs.metadata)));

        assert!(pending(&set(3, Some(patch.clone())), &list, &<_>::default()).is_empty());
        assert!(pending(&set(0, None), &list, &<_>::default()).is_empty());
    }
}
