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

//! Replica arithmetic for moving a fleet from its older sets to the active
//! one.

use std::sync::Arc;

use crate::apis::{fleet::FleetStrategyType, Fleet, GameServerSet};

/// The replicas each set should be scaled to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deployment {
    pub active: i32,
    /// `(index into rest, replicas)` for every older set that changes.
    pub rest: Vec<(usize, i32)>,
}

fn status(set: &GameServerSet) -> (i32, i32, i32) {
    set.status.as_ref().map_or((0, 0, 0), |status| {
        (status.replicas, status.ready_replicas, status.allocated_replicas)
    })
}

fn sum(sets: &[Arc<GameServerSet>], value: impl Fn(&GameServerSet) -> i32) -> i32 {
    sets.iter().map(|set| value(set)).sum()
}

/// Plans the next step of the fleet's strategy, given its active set and
/// its older sets (oldest first).
pub fn apply(fleet: &Fleet, active: &GameServerSet, rest: &[Arc<GameServerSet>]) -> Deployment {
    if rest.is_empty() {
        return Deployment {
            active: fleet.spec.replicas,
            rest: Vec::new(),
        };
    }

    match fleet.spec.strategy.r#type {
        FleetStrategyType::Recreate => recreate(fleet, active, rest),
        FleetStrategyType::RollingUpdate => rolling_update(fleet, active, rest),
    }
}

/// Room left for the active set once older allocated game servers, which
/// are never removed, are accounted for.
fn active_target(fleet: &Fleet, rest: &[Arc<GameServerSet>]) -> i32 {
    (fleet.spec.replicas - sum(rest, |set| status(set).2)).max(0)
}

fn recreate(fleet: &Fleet, active: &GameServerSet, rest: &[Arc<GameServerSet>]) -> Deployment {
    let scale_down: Vec<(usize, i32)> = rest
        .iter()
        .enumerate()
        .filter(|(_, set)| set.spec.replicas != 0)
        .map(|(index, _)| (index, 0))
        .collect();

    // Only allocated game servers may remain in the older sets.
    let drained = scale_down.is_empty()
        && rest.iter().all(|set| {
            let (replicas, _, allocated) = status(set);
            replicas <= allocated
        });

    Deployment {
        active: if drained {
            active_target(fleet, rest)
        } else {
            active.spec.replicas
        },
        rest: scale_down,
    }
}

fn rolling_update(fleet: &Fleet, active: &GameServerSet, rest: &[Arc<GameServerSet>]) -> Deployment {
    Deployment {
        active: rolling_update_active(fleet, active, rest),
        rest: rolling_update_rest(fleet, active, rest),
    }
}

/// Grows the active set by no more than the surge allows.
fn rolling_update_active(fleet: &Fleet, active: &GameServerSet, rest: &[Arc<GameServerSet>]) -> i32 {
    let replicas = active.spec.replicas;
    if fleet.spec.replicas == 0 {
        return 0;
    }

    // Still creating the last step.
    if replicas != status(active).0 {
        return replicas;
    }

    let target = active_target(fleet, rest);
    if replicas >= target {
        return target;
    }

    let total = replicas + sum(rest, |set| set.spec.replicas.max(status(set).0));
    let room = fleet.spec.replicas + fleet.max_surge() - total;
    if room <= 0 {
        return replicas;
    }

    (replicas + room).min(target)
}

/// Shrinks older sets, oldest first, while keeping at least
/// `replicas - max_unavailable` game servers available.
fn rolling_update_rest(
    fleet: &Fleet,
    active: &GameServerSet,
    rest: &[Arc<GameServerSet>],
) -> Vec<(usize, i32)> {
    let min_available = fleet.spec.replicas - fleet.max_unavailable();
    let (_, active_ready, active_allocated) = status(active);
    let active_unavailable = (active.spec.replicas - active_ready - active_allocated).max(0);
    let all = active.spec.replicas + sum(rest, |set| set.spec.replicas);

    let mut budget = all - min_available - active_unavailable;
    let mut changes = Vec::new();
    for (index, set) in rest.iter().enumerate() {
        if budget <= 0 {
            break;
        }

        if set.spec.replicas == 0 {
            continue;
        }

        // Allocated game servers stay, so shrinking below them frees nothing.
        let (_, _, allocated) = status(set);
        let removable = (set.spec.replicas - allocated).max(0);
        let step = removable.min(budget);
        if step == 0 {
            continue;
        }

        changes.push((index, set.spec.replicas - step));
        budget -= step;
    }

    changes
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::{
        fleet::{FleetStrategy, FleetStrategyRollingUpdate},
        gameserverset::GameServerSetStatus,
    };

    fn fleet(replicas: i32, r#type: FleetStrategyType) -> Fleet {
        let mut fleet = Fleet::new("fleet", <_>::default());
        fleet.spec.replicas = replicas;
        fleet.spec.strategy = FleetStrategy {
            r#type,
            rolling_update: Some(FleetStrategyRollingUpdate {
                max_surge: Some(IntOrString::String("25%".into())),
                max_unavailable: Some(IntOrString::String("25%".into())),
            }),
        };
        fleet
    }

    fn set(spec: i32, replicas: i32, ready: i32, allocated: i32) -> Arc<GameServerSet> {
        let mut set = GameServerSet::new("set", <_>::default());
        set.spec.replicas = spec;
        set.status = Some(GameServerSetStatus {
            replicas,
            ready_replicas: ready,
            allocated_replicas: allocated,
            ..<_>::default()
        });
        Arc::new(set)
    }

    #[test]
    fn without_older_sets_the_active_set_takes_everything() {
        let fleet = fleet(10, FleetStrategyType::RollingUpdate);
        assert_eq!(
            Deployment {
                active: 10,
                rest: vec![]
            },
            apply(&fleet, &set(4, 4, 4, 0), &[])
        );
    }

    /// Plays a rolling update forward, assuming every requested game
    /// server becomes ready between steps and surplus ones leave at once.
    #[test]
    fn rolling_update_respects_bounds() {
        let fleet = fleet(10, FleetStrategyType::RollingUpdate);
        let mut active = (0, 0);
        let mut old = (10, 10);

        for _ in 0..20 {
            let deployment = apply(
                &fleet,
                &set(active.0, active.1, active.1, 0),
                &[set(old.0, old.1, old.1, 0)],
            );

            if let Some((_, replicas)) = deployment.rest.first() {
                old = (*replicas, *replicas);
            }
            active.0 = deployment.active;
            assert!(active.0 <= 10);

            // Surge bound on what is requested.
            assert!(active.0 + old.0 <= 13, "{active:?} {old:?}");
            // Unavailability bound on what is running.
            assert!(active.1 + old.1 >= 7, "{active:?} {old:?}");

            active.1 = active.0;
        }

        assert_eq!((10, 10), active);
        assert_eq!(0, old.0);
    }

    #[test]
    fn rolling_update_waits_for_the_active_set() {
        let fleet = fleet(10, FleetStrategyType::RollingUpdate);
        let deployment = apply(&fleet, &set(3, 1, 1, 0), &[set(7, 7, 7, 0)]);
        assert_eq!(3, deployment.active);
        // Two of the three new game servers are not available yet.
        assert_eq!(vec![(0, 6)], deployment.rest);
    }

    #[test]
    fn rolling_update_keeps_room_for_allocated() {
        let fleet = fleet(10, FleetStrategyType::RollingUpdate);
        let deployment = apply(&fleet, &set(5, 5, 5, 0), &[set(0, 4, 0, 4)]);
        assert_eq!(6, deployment.active);
        assert!(deployment.rest.is_empty());
    }

    #[test]
    fn recreate_drains_before_growing() {
        let fleet = fleet(10, FleetStrategyType::Recreate);
        let deployment = apply(&fleet, &set(0, 0, 0, 0), &[set(10, 10, 10, 0)]);
        assert_eq!(
            Deployment {
                active: 0,
                rest: vec![(0, 0)]
            },
            deployment
        );

        let deployment = apply(&fleet, &set(0, 0, 0, 0), &[set(0, 3, 0, 0)]);
        assert_eq!(0, deployment.active);

        let deployment = apply(&fleet, &set(0, 0, 0, 0), &[set(0, 2, 0, 2)]);
        assert_eq!(8, deployment.active);
    }
}
