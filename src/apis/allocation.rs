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

//! The allocation request resource, its selectors and the counter and list
//! actions applied to the allocated game server.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    gameserver::{
        CountsAndListsError, GameServer, GameServerState, GameServerStatusPort, COUNTER_DECREMENT,
        COUNTER_INCREMENT, MAX_LIST_CAPACITY,
    },
    selector, MetaPatch, Priority, SchedulingStrategy, Selector, ValidationError,
    ValidationErrors,
};
use crate::config::Features;

/// A request to allocate a single game server.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "allocation.agones.dev",
    version = "v1",
    kind = "GameServerAllocation",
    plural = "gameserverallocations",
    derive = "PartialEq",
    derive = "Default"
)]
#[kube(namespaced)]
#[kube(status = "GameServerAllocationStatus")]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationSpec {
    #[serde(default)]
    pub multi_cluster_setting: MultiClusterSetting,
    /// Every candidate must match this selector.
    #[serde(default)]
    pub required: GameServerSelector,
    /// Tried in order among the candidates matching `required`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<GameServerSelector>,
    /// Ordered selectors that replace `required` and `preferred` when set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<GameServerSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<Priority>,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    #[serde(default)]
    pub metadata: MetaPatch,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterAction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListAction>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterSetting {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub policy_selector: LabelSelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSelector {
    #[serde(flatten)]
    pub label_selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_server_state: Option<GameServerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<PlayerSelector>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterSelector>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSelector {
    #[serde(default)]
    pub min_available: i64,
    #[serde(default)]
    pub max_available: i64,
}

/// Bounds on a counter. A zero maximum is unbounded.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CounterSelector {
    #[serde(default)]
    pub min_count: i64,
    #[serde(default)]
    pub max_count: i64,
    #[serde(default)]
    pub min_available: i64,
    #[serde(default)]
    pub max_available: i64,
}

/// Bounds on a list. A zero maximum is unbounded.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListSelector {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contains_value: String,
    #[serde(default)]
    pub min_available: i64,
    #[serde(default)]
    pub max_available: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub struct CounterAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListAction {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i64>,
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    JsonSchema,
    Default,
    PartialEq,
    Eq,
    strum_macros::Display,
)]
pub enum GameServerAllocationState {
    Allocated,
    #[default]
    UnAllocated,
    Contention,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationStatus {
    pub state: GameServerAllocationState,
    #[serde(default)]
    pub game_server_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
    /// `local` or the endpoint of the remote cluster that served the request.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetaPatch>,
}

pub const LOCAL_SOURCE: &str = "local";

impl GameServerAllocationStatus {
    pub fn unallocated() -> Self {
        Self::default()
    }

    pub fn contention() -> Self {
        Self {
            state: GameServerAllocationState::Contention,
            ..Self::default()
        }
    }

    /// The status describing a successfully allocated game server.
    pub fn allocated(gs: &GameServer, source: impl Into<String>) -> Self {
        let status = gs.status.clone().unwrap_or_default();
        Self {
            state: GameServerAllocationState::Allocated,
            game_server_name: gs.metadata.name.clone().unwrap_or_default(),
            ports: status.ports,
            address: status.address,
            node_name: status.node_name,
            source: source.into(),
            metadata: Some(MetaPatch {
                labels: gs.metadata.labels.clone().unwrap_or_default(),
                annotations: gs.metadata.annotations.clone().unwrap_or_default(),
            }),
        }
    }
}

impl GameServerAllocation {
    /// Creates an unnamed request for game servers in `namespace`.
    pub fn for_namespace(namespace: &str, spec: GameServerAllocationSpec) -> Self {
        let mut allocation = Self::new("", spec);
        allocation.metadata.name = None;
        allocation.metadata.namespace = Some(namespace.into());
        allocation
    }

    pub fn namespace_or_default(&self) -> String {
        self.metadata
            .namespace
            .clone()
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(|| "default".into())
    }

    pub fn apply_defaults(&mut self, features: &Features) {
        let selectors = std::iter::once(&mut self.spec.required)
            .chain(self.spec.preferred.iter_mut())
            .chain(self.spec.selectors.iter_mut());

        for selector in selectors {
            selector.apply_defaults(features);
        }
    }

    pub fn validate(&self, features: &Features) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        self.spec
            .required
            .validate("spec.required", features, &mut errors);
        for (index, selector) in self.spec.preferred.iter().enumerate() {
            selector.validate(&format!("spec.preferred[{index}]"), features, &mut errors);
        }
        for (index, selector) in self.spec.selectors.iter().enumerate() {
            selector.validate(&format!("spec.selectors[{index}]"), features, &mut errors);
        }

        let patch = &self.spec.metadata;
        for key in patch.labels.keys().chain(patch.annotations.keys()) {
            if selector::validate_label_key(key).is_err() {
                errors.push(ValidationError::invalid(
                    "spec.metadata",
                    format!("invalid key {key:?}"),
                ));
            }
        }

        for value in patch.labels.values() {
            if selector::validate_label_value(value).is_err() {
                errors.push(ValidationError::invalid(
                    "spec.metadata.labels",
                    format!("invalid value {value:?}"),
                ));
            }
        }

        if !features.counts_and_lists
            && (!self.spec.priorities.is_empty()
                || !self.spec.counters.is_empty()
                || !self.spec.lists.is_empty())
        {
            errors.push(ValidationError::invalid(
                "spec",
                "priorities, counters and lists require the CountsAndLists feature",
            ));
        }

        for (index, priority) in self.spec.priorities.iter().enumerate() {
            if priority.key.is_empty() {
                errors.push(ValidationError::Required(format!(
                    "spec.priorities[{index}].key"
                )));
            }
        }

        for (name, action) in &self.spec.counters {
            action.validate(&format!("spec.counters[{name}]"), &mut errors);
        }

        for (name, action) in &self.spec.lists {
            action.validate(&format!("spec.lists[{name}]"), &mut errors);
        }

        errors.into_result()
    }

    /// Identifies the snapshot a request needs, requests with equal keys
    /// can share a sorted snapshot of the cache.
    pub fn sort_key(&self) -> u64 {
        let bytes = serde_json::to_vec(&(
            self.namespace_or_default(),
            &self.spec.scheduling,
            &self.spec.priorities,
        ))
        .unwrap_or_default();
        seahash::hash(&bytes)
    }

    /// Compiles the request's selectors for matching.
    pub fn matcher(&self) -> Result<AllocationMatcher, selector::Error> {
        if !self.spec.selectors.is_empty() {
            return Ok(AllocationMatcher {
                required: None,
                preferred: self
                    .spec
                    .selectors
                    .iter()
                    .map(CompiledSelector::new)
                    .collect::<Result<_, _>>()?,
            });
        }

        Ok(AllocationMatcher {
            required: Some(CompiledSelector::new(&self.spec.required)?),
            preferred: self
                .spec
                .preferred
                .iter()
                .map(CompiledSelector::new)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl GameServerSelector {
    /// A selector requiring each of `labels`.
    pub fn from_labels(labels: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            label_selector: LabelSelector {
                match_labels: Some(labels.into_iter().collect()),
                match_expressions: None,
            },
            ..<_>::default()
        }
    }

    fn apply_defaults(&mut self, features: &Features) {
        if features.state_allocation_filter && self.game_server_state.is_none() {
            self.game_server_state = Some(GameServerState::Ready);
        }

        if let Some(players) = self.players.as_mut() {
            if players.max_available == 0 {
                players.max_available = i64::MAX;
            }
        }
    }

    fn validate(&self, field: &str, features: &Features, errors: &mut ValidationErrors) {
        if let Err(error) = Selector::try_from(&self.label_selector) {
            errors.push(ValidationError::invalid(field, error.to_string()));
        }

        match self.game_server_state {
            None | Some(GameServerState::Ready) => {}
            Some(GameServerState::Allocated) if features.state_allocation_filter => {}
            Some(state) => errors.push(ValidationError::invalid(
                format!("{field}.gameServerState"),
                format!("{state} is not an allocatable state"),
            )),
        }

        if let Some(players) = &self.players {
            if !features.player_allocation_filter {
                errors.push(ValidationError::invalid(
                    format!("{field}.players"),
                    "requires the PlayerAllocationFilter feature",
                ));
            }
            if players.min_available < 0 || players.max_available < players.min_available {
                errors.push(ValidationError::invalid(
                    format!("{field}.players"),
                    "maxAvailable must be greater than or equal to minAvailable",
                ));
            }
        }

        for (name, counter) in &self.counters {
            let bounded = |min: i64, max: i64| min >= 0 && max >= 0 && (max == 0 || max >= min);
            if !bounded(counter.min_count, counter.max_count)
                || !bounded(counter.min_available, counter.max_available)
            {
                errors.push(ValidationError::invalid(
                    format!("{field}.counters[{name}]"),
                    "minimums must be positive and not exceed their maximums",
                ));
            }
        }

        for (name, list) in &self.lists {
            if list.min_available < 0
                || list.max_available < 0
                || (list.max_available != 0 && list.max_available < list.min_available)
                || list.max_available > MAX_LIST_CAPACITY
            {
                errors.push(ValidationError::invalid(
                    format!("{field}.lists[{name}]"),
                    "minAvailable must be positive and not exceed maxAvailable",
                ));
            }
        }
    }
}

impl CounterAction {
    fn validate(&self, field: &str, errors: &mut ValidationErrors) {
        match self.action.as_deref() {
            None | Some(COUNTER_INCREMENT) | Some(COUNTER_DECREMENT) => {}
            Some(_) => errors.push(
                super::ValueInvalidArgs::new(format!("{field}.action"), "unknown action")
                    .with_examples(&[COUNTER_INCREMENT, COUNTER_DECREMENT]),
            ),
        }

        if self.amount.map_or(false, |amount| amount < 0) {
            errors.push(ValidationError::invalid(
                format!("{field}.amount"),
                "must be greater than or equal to 0",
            ));
        }

        if self.capacity.map_or(false, |capacity| capacity < 0) {
            errors.push(ValidationError::invalid(
                format!("{field}.capacity"),
                "must be greater than or equal to 0",
            ));
        }
    }

    pub fn apply(&self, name: &str, gs: &mut GameServer) -> Vec<CountsAndListsError> {
        let mut errors = Vec::new();
        if let Some(capacity) = self.capacity {
            errors.extend(gs.update_counter_capacity(name, capacity).err());
        }
        if let (Some(action), Some(amount)) = (&self.action, self.amount) {
            errors.extend(gs.update_count(name, action, amount).err());
        }
        errors
    }
}

impl ListAction {
    fn validate(&self, field: &str, errors: &mut ValidationErrors) {
        if self
            .capacity
            .map_or(false, |capacity| !(0..=MAX_LIST_CAPACITY).contains(&capacity))
        {
            errors.push(ValidationError::invalid(
                format!("{field}.capacity"),
                format!("must be within [0, {MAX_LIST_CAPACITY}]"),
            ));
        }
    }

    pub fn apply(&self, name: &str, gs: &mut GameServer) -> Vec<CountsAndListsError> {
        let mut errors = Vec::new();
        if let Some(capacity) = self.capacity {
            errors.extend(gs.update_list_capacity(name, capacity).err());
        }
        if !self.delete_values.is_empty() {
            errors.extend(gs.delete_list_values(name, &self.delete_values).err());
        }
        if !self.add_values.is_empty() {
            errors.extend(gs.append_list_values(name, &self.add_values).err());
        }
        errors
    }
}

/// A [`GameServerSelector`] with its label selector parsed.
#[derive(Clone, Debug)]
pub struct CompiledSelector {
    labels: Selector,
    state: Option<GameServerState>,
    players: Option<PlayerSelector>,
    counters: BTreeMap<String, CounterSelector>,
    lists: BTreeMap<String, ListSelector>,
}

fn within(value: i64, min: i64, max: i64) -> bool {
    value >= min && (max == 0 || value <= max)
}

impl CompiledSelector {
    pub fn new(selector: &GameServerSelector) -> Result<Self, selector::Error> {
        Ok(Self {
            labels: Selector::try_from(&selector.label_selector)?,
            state: selector.game_server_state,
            players: selector.players.clone(),
            counters: selector.counters.clone(),
            lists: selector.lists.clone(),
        })
    }

    pub fn matches(&self, gs: &GameServer, features: &Features) -> bool {
        let empty = BTreeMap::new();
        if !self.labels.matches(gs.metadata.labels.as_ref().unwrap_or(&empty)) {
            return false;
        }

        let wanted = if features.state_allocation_filter {
            self.state.unwrap_or(GameServerState::Ready)
        } else {
            GameServerState::Ready
        };
        if gs.state() != Some(wanted) {
            return false;
        }

        if features.player_allocation_filter {
            if let (Some(players), Some(available)) =
                (&self.players, gs.remaining_player_capacity())
            {
                if available < players.min_available || available > players.max_available {
                    return false;
                }
            }
        }

        if features.counts_and_lists {
            let counters = self.counters.iter().all(|(name, selector)| {
                gs.counter(name).map_or(false, |counter| {
                    within(counter.count, selector.min_count, selector.max_count)
                        && within(
                            counter.capacity - counter.count,
                            selector.min_available,
                            selector.max_available,
                        )
                })
            });

            let lists = self.lists.iter().all(|(name, selector)| {
                gs.list(name).map_or(false, |list| {
                    (selector.contains_value.is_empty()
                        || list.values.contains(&selector.contains_value))
                        && within(
                            list.capacity - list.values.len() as i64,
                            selector.min_available,
                            selector.max_available,
                        )
                })
            });

            if !counters || !lists {
                return false;
            }
        }

        true
    }
}

/// The compiled selection logic of one allocation request.
///
/// Every candidate must pass `required` when it is set. Candidates matching
/// an earlier `preferred` selector win over later ones, and when nothing
/// preferred matches the first `required` match is used. Without a
/// `required` selector only the `preferred` list is consulted.
#[derive(Clone, Debug)]
pub struct AllocationMatcher {
    required: Option<CompiledSelector>,
    preferred: Vec<CompiledSelector>,
}

impl AllocationMatcher {
    /// Walks `candidates` in order and returns the index of the best match.
    pub fn find<'a>(
        &self,
        candidates: impl IntoIterator<Item = (usize, &'a GameServer)>,
        features: &Features,
    ) -> Option<usize> {
        let mut required_match = None;
        let mut preferred_matches: Vec<Option<usize>> = vec![None; self.preferred.len()];

        for (index, gs) in candidates {
            if let Some(required) = &self.required {
                if !required.matches(gs, features) {
                    continue;
                }

                if required_match.is_none() {
                    required_match = Some(index);
                    if self.preferred.is_empty() {
                        break;
                    }
                }
            }

            for (slot, selector) in preferred_matches.iter_mut().zip(&self.preferred) {
                if slot.is_none() && selector.matches(gs, features) {
                    *slot = Some(index);
                }
            }

            if preferred_matches.first().map_or(false, Option::is_some) {
                break;
            }
        }

        preferred_matches
            .into_iter()
            .flatten()
            .next()
            .or(required_match)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::gameserver::{CounterStatus, ListStatus};

    fn gs(name: &str, state: GameServerState, labels: &[(&str, &str)]) -> GameServer {
        let mut gs = GameServer::new(name, <_>::default());
        gs.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        gs.set_state(state);
        gs
    }

    fn selector(labels: &[(&str, &str)]) -> GameServerSelector {
        GameServerSelector::from_labels(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn preferred_outranks_required() {
        let features = Features::default();
        let pool = [
            gs("a", GameServerState::Ready, &[("role", "gs")]),
            gs("b", GameServerState::Ready, &[("role", "gs"), ("tier", "gold")]),
            gs("c", GameServerState::Ready, &[("role", "gs"), ("preferred", "true")]),
        ];

        let allocation = GameServerAllocation::for_namespace(
            "default",
            GameServerAllocationSpec {
                required: selector(&[("role", "gs")]),
                preferred: vec![selector(&[("preferred", "true")]), selector(&[("tier", "gold")])],
                ..<_>::default()
            },
        );

        let matcher = allocation.matcher().unwrap();
        assert_eq!(Some(2), matcher.find(pool.iter().enumerate(), &features));
        assert_eq!(Some(1), matcher.find(pool.iter().enumerate().take(2), &features));
        assert_eq!(Some(0), matcher.find(pool.iter().enumerate().take(1), &features));
    }

    #[test]
    fn ordered_selectors_have_no_fallback() {
        let features = Features::default();
        let pool = [gs("a", GameServerState::Ready, &[("role", "gs")])];
        let allocation = GameServerAllocation::for_namespace(
            "default",
            GameServerAllocationSpec {
                selectors: vec![selector(&[("mode", "ctf")])],
                ..<_>::default()
            },
        );

        assert_eq!(None, allocation.matcher().unwrap().find(pool.iter().enumerate(), &features));
    }

    #[test]
    fn state_filter() {
        let mut features = Features::default();
        let allocated = gs("a", GameServerState::Allocated, &[]);
        let mut allocation = GameServerAllocation::for_namespace(
            "default",
            GameServerAllocationSpec {
                required: GameServerSelector {
                    game_server_state: Some(GameServerState::Allocated),
                    ..<_>::default()
                },
                ..<_>::default()
            },
        );
        allocation.apply_defaults(&features);
        assert!(allocation.validate(&features).is_ok());
        let matcher = allocation.matcher().unwrap();
        assert_eq!(Some(0), matcher.find([(0, &allocated)], &features));

        features.state_allocation_filter = false;
        assert_eq!(None, matcher.find([(0, &allocated)], &features));
        assert!(allocation.validate(&features).is_err());
    }

    #[test]
    fn counter_and_list_selectors() {
        let features = Features::default();
        let mut candidate = gs("a", GameServerState::Ready, &[]);
        candidate.status_mut().counters.insert(
            "rooms".into(),
            CounterStatus {
                count: 2,
                capacity: 10,
            },
        );
        candidate.status_mut().lists.insert(
            "players".into(),
            ListStatus {
                capacity: 4,
                values: vec!["p1".into()],
            },
        );

        let compile = |selector: GameServerSelector| CompiledSelector::new(&selector).unwrap();
        let mut selector = GameServerSelector::default();
        selector.counters.insert(
            "rooms".into(),
            CounterSelector {
                min_available: 8,
                ..<_>::default()
            },
        );
        selector.lists.insert(
            "players".into(),
            ListSelector {
                contains_value: "p1".into(),
                max_available: 3,
                ..<_>::default()
            },
        );
        assert!(compile(selector.clone()).matches(&candidate, &features));

        selector.counters.get_mut("rooms").unwrap().max_count = 1;
        assert!(!compile(selector.clone()).matches(&candidate, &features));

        selector.counters.clear();
        selector.lists.get_mut("players").unwrap().contains_value = "p2".into();
        assert!(!compile(selector).matches(&candidate, &features));
    }

    #[test]
    fn validation_collects_every_error() {
        let features = Features::default();
        let mut spec = GameServerAllocationSpec::default();
        spec.counters.insert(
            "rooms".into(),
            CounterAction {
                action: Some("Multiply".into()),
                amount: Some(-1),
                capacity: None,
            },
        );
        spec.lists.insert(
            "players".into(),
            ListAction {
                capacity: Some(MAX_LIST_CAPACITY + 1),
                ..<_>::default()
            },
        );
        spec.metadata.labels.insert("bad key".into(), "value".into());

        let errors = GameServerAllocation::for_namespace("default", spec)
            .validate(&features)
            .unwrap_err();
        assert_eq!(4, errors.0.len(), "{errors}");
    }

    #[test]
    fn actions_report_failures_without_stopping() {
        let mut gs = gs("a", GameServerState::Ready, &[]);
        gs.status_mut().counters.insert(
            "rooms".into(),
            CounterStatus {
                count: 0,
                capacity: 1,
            },
        );

        let mut spec = GameServerAllocationSpec::default();
        spec.counters.insert(
            "rooms".into(),
            CounterAction {
                action: Some(COUNTER_INCREMENT.into()),
                amount: Some(1),
                capacity: None,
            },
        );
        spec.lists.insert(
            "missing".into(),
            ListAction {
                add_values: vec!["x".into()],
                ..<_>::default()
            },
        );

        let mut errors = spec.counters["rooms"].apply("rooms", &mut gs);
        errors.extend(spec.lists["missing"].apply("missing", &mut gs));
        assert_eq!(1, errors.len());
        assert_eq!(1, gs.counter("rooms").unwrap().count);
    }

    #[test]
    fn sort_key_depends_on_ordering_only() {
        let a = GameServerAllocation::for_namespace("default", <_>::default());
        let mut b = a.clone();
        b.spec.required = selector(&[("role", "gs")]);
        assert_eq!(a.sort_key(), b.sort_key());

        b.spec.scheduling = SchedulingStrategy::Distributed;
        assert_ne!(a.sort_key(), b.sort_key());
    }
}
