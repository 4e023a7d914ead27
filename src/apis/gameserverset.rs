/*
 * Copyright 2022 Google LLC
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

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    gameserver::{GameServer, GameServerState, GameServerTemplateSpec},
    MetaPatch, Priority, SchedulingStrategy, Selector, ValidationError, ValidationErrors,
};

/// Labels and annotations applied to allocated game servers that exceed
/// the desired replica count of their set.
pub type AllocationOverflow = MetaPatch;

/// A replica group of identical game servers.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "GameServerSet",
    plural = "gameserversets",
    shortname = "gss",
    derive = "PartialEq"
)]
#[kube(namespaced)]
#[kube(status = "GameServerSetStatus")]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_overflow: Option<AllocationOverflow>,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<Priority>,
    pub template: GameServerTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub reserved_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
    #[serde(default)]
    pub shutdown_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<AggregatedPlayerStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, AggregatedCounterStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, AggregatedListStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub struct AggregatedPlayerStatus {
    pub count: i64,
    pub capacity: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCounterStatus {
    pub allocated_count: i64,
    pub allocated_capacity: i64,
    pub count: i64,
    pub capacity: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedListStatus {
    pub allocated_count: i64,
    pub allocated_capacity: i64,
    pub count: i64,
    pub capacity: i64,
}

impl AggregatedCounterStatus {
    fn add(&mut self, other: &Self) {
        self.allocated_count += other.allocated_count;
        self.allocated_capacity += other.allocated_capacity;
        self.count += other.count;
        self.capacity += other.capacity;
    }
}

impl AggregatedListStatus {
    fn add(&mut self, other: &Self) {
        self.allocated_count += other.allocated_count;
        self.allocated_capacity += other.allocated_capacity;
        self.count += other.count;
        self.capacity += other.capacity;
    }
}

impl GameServerSetStatus {
    /// Computes the observed status of a set from the game servers it owns.
    pub fn from_game_servers<'a>(
        game_servers: impl IntoIterator<Item = &'a GameServer>,
        counts_and_lists: bool,
        players: bool,
    ) -> Self {
        let mut status = Self::default();
        if players {
            status.players = Some(AggregatedPlayerStatus::default());
        }

        for gs in game_servers {
            if gs.is_being_deleted() || gs.is_state(GameServerState::Shutdown) {
                status.shutdown_replicas += 1;
                continue;
            }

            status.replicas += 1;
            let allocated = gs.is_allocated();
            match gs.state() {
                Some(GameServerState::Ready) => status.ready_replicas += 1,
                Some(GameServerState::Allocated) => status.allocated_replicas += 1,
                Some(GameServerState::Reserved) => status.reserved_replicas += 1,
                _ => {}
            }

            let Some(gs_status) = gs.status.as_ref() else {
                continue;
            };

            if let (Some(aggregate), Some(player)) =
                (status.players.as_mut(), gs_status.players.as_ref())
            {
                aggregate.count += player.count;
                aggregate.capacity += player.capacity;
            }

            if !counts_and_lists {
                continue;
            }

            for (name, counter) in &gs_status.counters {
                let aggregate = status.counters.entry(name.clone()).or_default();
                aggregate.count += counter.count;
                aggregate.capacity += counter.capacity;
                if allocated {
                    aggregate.allocated_count += counter.count;
                    aggregate.allocated_capacity += counter.capacity;
                }
            }

            for (name, list) in &gs_status.lists {
                let aggregate = status.lists.entry(name.clone()).or_default();
                aggregate.count += list.values.len() as i64;
                aggregate.capacity += list.capacity;
                if allocated {
                    aggregate.allocated_count += list.values.len() as i64;
                    aggregate.allocated_capacity += list.capacity;
                }
            }
        }

        status
    }

    /// Adds another set's status into this one, used for fleet totals.
    pub fn add(&mut self, other: &Self) {
        self.replicas += other.replicas;
        self.ready_replicas += other.ready_replicas;
        self.reserved_replicas += other.reserved_replicas;
        self.allocated_replicas += other.allocated_replicas;
        self.shutdown_replicas += other.shutdown_replicas;

        if let Some(players) = &other.players {
            let aggregate = self.players.get_or_insert_with(Default::default);
            aggregate.count += players.count;
            aggregate.capacity += players.capacity;
        }

        for (name, counter) in &other.counters {
            self.counters.entry(name.clone()).or_default().add(counter);
        }

        for (name, list) in &other.lists {
            self.lists.entry(name.clone()).or_default().add(list);
        }
    }
}

impl GameServerSet {
    /// Stamps out a new, unnamed game server from the set's template.
    pub fn game_server(&self) -> GameServer {
        let template = &self.spec.template;
        let mut metadata = template.metadata.clone().unwrap_or_default();
        let set_name = self.name_any();

        metadata.name = None;
        metadata.generate_name = Some(format!("{set_name}-"));
        metadata.namespace = self.namespace();
        metadata.resource_version = None;
        metadata.uid = None;
        metadata.owner_references = super::controller_reference(self).map(|owner| vec![owner]);

        let labels = metadata.labels.get_or_insert_with(Default::default);
        labels.insert(super::GAME_SERVER_SET_LABEL.into(), set_name);
        if let Some(fleet) = super::label(self, super::FLEET_NAME_LABEL) {
            labels.insert(super::FLEET_NAME_LABEL.into(), fleet.into());
        }

        let mut spec = template.spec.clone();
        spec.scheduling = self.spec.scheduling;

        GameServer {
            metadata,
            spec,
            status: None,
        }
    }

    /// The selector matching every game server this set created.
    pub fn game_server_selector(&self) -> Selector {
        Selector::everything().with(super::selector::Requirement::equals(
            super::GAME_SERVER_SET_LABEL,
            &self.name_any(),
        ))
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.spec.replicas < 0 {
            errors.push(ValidationError::invalid(
                "spec.replicas",
                "must be greater than or equal to 0",
            ));
        }

        let mut gs = self.game_server();
        gs.apply_defaults();
        if let Err(template_errors) = gs.validate() {
            errors.extend(template_errors.0);
        }

        errors.into_result()
    }

    /// Validates a change from `self` to `new`. Only replicas and
    /// metadata may change once a set exists.
    pub fn validate_update(&self, new: &Self) -> Result<(), ValidationErrors> {
        let mut errors = match new.validate() {
            Ok(()) => ValidationErrors::default(),
            Err(errors) => errors,
        };

        if self.spec.template != new.spec.template {
            errors.push(ValidationError::Immutable("spec.template".into()));
        }

        errors.into_result()
    }

    pub fn status_or_default(&self) -> GameServerSetStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Builds a set with the given name and template, used by fleets and tests.
pub fn new_game_server_set(
    name: &str,
    namespace: &str,
    spec: GameServerSetSpec,
) -> GameServerSet {
    let mut set = GameServerSet::new(name, spec);
    set.metadata = ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        ..<_>::default()
    };
    set
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::gameserver::{CounterStatus, GameServerSpec};

    pub(crate) fn set() -> GameServerSet {
        let mut set = new_game_server_set(
            "set",
            "default",
            GameServerSetSpec {
                replicas: 3,
                scheduling: SchedulingStrategy::Distributed,
                template: GameServerTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some([("app".into(), "game".into())].into()),
                        ..<_>::default()
                    }),
                    spec: GameServerSpec {
                        template: PodTemplateSpec {
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: "game".into(),
                                    ..<_>::default()
                                }],
                                ..<_>::default()
                            }),
                            ..<_>::default()
                        },
                        ..<_>::default()
                    },
                },
                ..<_>::default()
            },
        );
        set.metadata.uid = Some("set-uid".into());
        set.metadata.labels = Some([(crate::apis::FLEET_NAME_LABEL.into(), "fleet".into())].into());
        set
    }

    #[test]
    fn game_server_from_template() {
        let set = set();
        let gs = set.game_server();

        assert_eq!(None, gs.metadata.name);
        assert_eq!(Some("set-".into()), gs.metadata.generate_name);
        assert_eq!(Some("default".into()), gs.metadata.namespace);
        assert_eq!(SchedulingStrategy::Distributed, gs.spec.scheduling);

        let labels = gs.metadata.labels.as_ref().unwrap();
        assert_eq!("game", labels["app"]);
        assert_eq!("set", labels[crate::apis::GAME_SERVER_SET_LABEL]);
        assert_eq!("fleet", labels[crate::apis::FLEET_NAME_LABEL]);
        assert!(crate::apis::is_owned_by(&gs, "set-uid"));
        assert!(set.game_server_selector().matches(gs.metadata.labels.as_ref().unwrap()));
    }

    #[test]
    fn template_is_immutable() {
        let old = set();
        let mut new = old.clone();
        new.spec.replicas = 10;
        assert!(old.validate_update(&new).is_ok());

        new.spec.template.spec.container = Some("other".into());
        let errors = old.validate_update(&new).unwrap_err();
        assert!(errors.0.contains(&ValidationError::Immutable("spec.template".into())));
    }

    #[test]
    fn status_aggregation() {
        let mut gameservers = Vec::new();
        for (index, state) in [
            GameServerState::Ready,
            GameServerState::Allocated,
            GameServerState::Reserved,
            GameServerState::Shutdown,
            GameServerState::Starting,
        ]
        .into_iter()
        .enumerate()
        {
            let mut gs = set().game_server();
            gs.metadata.name = Some(format!("gs-{index}"));
            let status = gs.status_mut();
            status.state = state;
            status.counters.insert(
                "rooms".into(),
                CounterStatus {
                    count: 1,
                    capacity: 4,
                },
            );
            gameservers.push(gs);
        }

        let status = GameServerSetStatus::from_game_servers(&gameservers, true, false);
        assert_eq!(4, status.replicas);
        assert_eq!(1, status.ready_replicas);
        assert_eq!(1, status.allocated_replicas);
        assert_eq!(1, status.reserved_replicas);
        assert_eq!(1, status.shutdown_replicas);
        assert_eq!(
            AggregatedCounterStatus {
                allocated_count: 1,
                allocated_capacity: 4,
                count: 4,
                capacity: 16,
            },
            status.counters["rooms"]
        );

        let mut total = GameServerSetStatus::default();
        total.add(&status);
        total.add(&status);
        assert_eq!(8, total.replicas);
        assert_eq!(32, total.counters["rooms"].capacity);
    }
}
