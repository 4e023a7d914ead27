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

//! Conversions between the wire messages and the allocation resources.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::{
    apis::{
        allocation::{
            CounterAction, CounterSelector, GameServerAllocationSpec,
            GameServerAllocationState, GameServerAllocationStatus, GameServerSelector,
            ListAction, ListSelector, MultiClusterSetting, PlayerSelector,
        },
        gameserver::GameServerStatusPort,
        GameServerAllocation, GameServerState, MetaPatch, Priority, PriorityOrder, PriorityType,
        SchedulingStrategy,
    },
    generated::allocation as pb,
};

/// Builds the allocation resource a request describes.
pub fn to_allocation(request: pb::AllocationRequest) -> GameServerAllocation {
    let scheduling = match request.scheduling() {
        pb::allocation_request::SchedulingStrategy::Packed => SchedulingStrategy::Packed,
        pb::allocation_request::SchedulingStrategy::Distributed => SchedulingStrategy::Distributed,
    };

    let multi_cluster_setting = request
        .multi_cluster_setting
        .map(|setting| MultiClusterSetting {
            enabled: setting.enabled,
            policy_selector: setting
                .policy_selector
                .map(|selector| label_selector(selector.match_labels.into_iter().collect()))
                .unwrap_or_default(),
        })
        .unwrap_or_default();

    let spec = GameServerAllocationSpec {
        multi_cluster_setting,
        required: request
            .required_game_server_selector
            .map(to_selector)
            .unwrap_or_default(),
        preferred: request
            .preferred_game_server_selectors
            .into_iter()
            .map(to_selector)
            .collect(),
        selectors: request
            .game_server_selectors
            .into_iter()
            .map(to_selector)
            .collect(),
        priorities: request
            .priorities
            .into_iter()
            .map(|priority| Priority {
                r#type: match priority.r#type() {
                    pb::priority::Type::Counter => PriorityType::Counter,
                    pb::priority::Type::List => PriorityType::List,
                },
                order: match priority.order() {
                    pb::priority::Order::Ascending => PriorityOrder::Ascending,
                    pb::priority::Order::Descending => PriorityOrder::Descending,
                },
                key: priority.key,
            })
            .collect(),
        scheduling,
        metadata: request
            .metadata
            .map(|patch| MetaPatch {
                labels: patch.labels.into_iter().collect(),
                annotations: patch.annotations.into_iter().collect(),
            })
            .unwrap_or_default(),
        counters: request
            .counters
            .into_iter()
            .map(|(name, action)| {
                (
                    name,
                    CounterAction {
                        action: Some(action.action).filter(|action| !action.is_empty()),
                        amount: action.amount,
                        capacity: action.capacity,
                    },
                )
            })
            .collect(),
        lists: request
            .lists
            .into_iter()
            .map(|(name, action)| {
                (
                    name,
                    ListAction {
                        add_values: action.add_values,
                        delete_values: action.delete_values,
                        capacity: action.capacity,
                    },
                )
            })
            .collect(),
    };

    GameServerAllocation::for_namespace(&request.namespace, spec)
}

fn label_selector(match_labels: BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(match_labels).filter(|labels| !labels.is_empty()),
        match_expressions: None,
    }
}

fn to_selector(selector: pb::GameServerSelector) -> GameServerSelector {
    let state = match selector.game_server_state() {
        pb::game_server_selector::GameServerState::Ready => GameServerState::Ready,
        pb::game_server_selector::GameServerState::Allocated => GameServerState::Allocated,
    };

    GameServerSelector {
        label_selector: label_selector(selector.match_labels.into_iter().collect()),
        game_server_state: Some(state),
        players: selector.players.map(|players| PlayerSelector {
            min_available: saturating_i64(players.min_available),
            max_available: saturating_i64(players.max_available),
        }),
        counters: selector
            .counters
            .into_iter()
            .map(|(name, counter)| {
                (
                    name,
                    CounterSelector {
                        min_count: counter.min_count,
                        max_count: counter.max_count,
                        min_available: counter.min_available,
                        max_available: counter.max_available,
                    },
                )
            })
            .collect(),
        lists: selector
            .lists
            .into_iter()
            .map(|(name, list)| {
                (
                    name,
                    ListSelector {
                        contains_value: list.contains_value,
                        min_available: list.min_available,
                        max_available: list.max_available,
                    },
                )
            })
            .collect(),
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// The request that forwards `allocation` to another cluster.
pub fn to_request(allocation: &GameServerAllocation) -> pb::AllocationRequest {
    let spec = &allocation.spec;
    let mut request = pb::AllocationRequest {
        namespace: allocation.metadata.namespace.clone().unwrap_or_default(),
        multi_cluster_setting: Some(pb::MultiClusterSetting {
            enabled: spec.multi_cluster_setting.enabled,
            policy_selector: Some(pb::LabelSelector {
                match_labels: spec
                    .multi_cluster_setting
                    .policy_selector
                    .match_labels
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
            }),
        }),
        required_game_server_selector: Some(from_selector(&spec.required)),
        preferred_game_server_selectors: spec.preferred.iter().map(from_selector).collect(),
        game_server_selectors: spec.selectors.iter().map(from_selector).collect(),
        metadata: Some(pb::MetaPatch {
            labels: spec.metadata.labels.clone().into_iter().collect(),
            annotations: spec.metadata.annotations.clone().into_iter().collect(),
        }),
        counters: spec
            .counters
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    pb::CounterAction {
                        action: action.action.clone().unwrap_or_default(),
                        amount: action.amount,
                        capacity: action.capacity,
                    },
                )
            })
            .collect(),
        lists: spec
            .lists
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    pb::ListAction {
                        add_values: action.add_values.clone(),
                        delete_values: action.delete_values.clone(),
                        capacity: action.capacity,
                    },
                )
            })
            .collect(),
        ..<_>::default()
    };

    request.set_scheduling(match spec.scheduling {
        SchedulingStrategy::Packed => pb::allocation_request::SchedulingStrategy::Packed,
        SchedulingStrategy::Distributed => pb::allocation_request::SchedulingStrategy::Distributed,
    });

    request.priorities = spec
        .priorities
        .iter()
        .map(|priority| {
            let mut out = pb::Priority {
                key: priority.key.clone(),
                ..<_>::default()
            };
            out.set_type(match priority.r#type {
                PriorityType::Counter => pb::priority::Type::Counter,
                PriorityType::List => pb::priority::Type::List,
            });
            out.set_order(match priority.order {
                PriorityOrder::Ascending => pb::priority::Order::Ascending,
                PriorityOrder::Descending => pb::priority::Order::Descending,
            });
            out
        })
        .collect();

    request
}

fn from_selector(selector: &GameServerSelector) -> pb::GameServerSelector {
    let mut out = pb::GameServerSelector {
        match_labels: selector
            .label_selector
            .match_labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        players: selector.players.as_ref().map(|players| pb::PlayerSelector {
            min_available: players.min_available.max(0) as u64,
            max_available: players.max_available.max(0) as u64,
        }),
        counters: selector
            .counters
            .iter()
            .map(|(name, counter)| {
                (
                    name.clone(),
                    pb::CounterSelector {
                        min_count: counter.min_count,
                        max_count: counter.max_count,
                        min_available: counter.min_available,
                        max_available: counter.max_available,
                    },
                )
            })
            .collect(),
        lists: selector
            .lists
            .iter()
            .map(|(name, list)| {
                (
                    name.clone(),
                    pb::ListSelector {
                        contains_value: list.contains_value.clone(),
                        min_available: list.min_available,
                        max_available: list.max_available,
                    },
                )
            })
            .collect(),
        ..<_>::default()
    };

    out.set_game_server_state(match selector.game_server_state {
        Some(GameServerState::Allocated) => pb::game_server_selector::GameServerState::Allocated,
        _ => pb::game_server_selector::GameServerState::Ready,
    });
    out
}

pub fn to_response(status: &GameServerAllocationStatus) -> pb::AllocationResponse {
    let mut response = pb::AllocationResponse {
        game_server_name: status.game_server_name.clone(),
        ports: status
            .ports
            .iter()
            .map(|port| pb::allocation_response::GameServerStatusPort {
                name: port.name.clone(),
                port: i32::from(port.port),
            })
            .collect(),
        address: status.address.clone(),
        node_name: status.node_name.clone(),
        source: status.source.clone(),
        ..<_>::default()
    };

    response.set_state(match status.state {
        GameServerAllocationState::Allocated => pb::allocation_response::AllocationState::Allocated,
        GameServerAllocationState::UnAllocated => {
            pb::allocation_response::AllocationState::UnAllocated
        }
        GameServerAllocationState::Contention => {
            pb::allocation_response::AllocationState::Contention
        }
    });
    response
}

pub fn to_status(response: pb::AllocationResponse) -> GameServerAllocationStatus {
    let state = match response.state() {
        pb::allocation_response::AllocationState::Allocated => GameServerAllocationState::Allocated,
        pb::allocation_response::AllocationState::UnAllocated => {
            GameServerAllocationState::UnAllocated
        }
        pb::allocation_response::AllocationState::Contention => {
            GameServerAllocationState::Contention
        }
    };

    GameServerAllocationStatus {
        state,
        game_server_name: response.game_server_name,
        ports: response
            .ports
            .into_iter()
            .filter_map(|port| {
                Some(GameServerStatusPort {
                    name: port.name,
                    port: u16::try_from(port.port).ok()?,
                })
            })
            .collect(),
        address: response.address,
        node_name: response.node_name,
        source: response.source,
        metadata: None,
    }
}

/// Carries the outcome of an allocation in a batch response.
pub fn to_result(
    result: Result<GameServerAllocationStatus, super::Error>,
) -> pb::response_wrapper::Result {
    match result {
        Ok(status) => pb::response_wrapper::Result::Response(to_response(&status)),
        Err(error) => {
            let status = error.to_status();
            pb::response_wrapper::Result::Error(pb::ErrorStatus {
                code: status.code() as i32,
                message: status.message().to_owned(),
            })
        }
    }
}

pub fn from_result(
    result: Option<pb::response_wrapper::Result>,
) -> Result<pb::AllocationResponse, tonic::Status> {
    match result {
        Some(pb::response_wrapper::Result::Response(response)) => Ok(response),
        Some(pb::response_wrapper::Result::Error(error)) => Err(tonic::Status::new(
            tonic::Code::from_i32(error.code),
            error.message,
        )),
        None => Err(tonic::Status::internal("empty response in batch")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request() -> pb::AllocationRequest {
        let mut request = pb::AllocationRequest {
            namespace: "games".into(),
            required_game_server_selector: Some(pb::GameServerSelector {
                match_labels: [("agones.dev/fleet".to_owned(), "simple".to_owned())].into(),
                ..<_>::default()
            }),
            preferred_game_server_selectors: vec![pb::GameServerSelector {
                match_labels: [("mode".to_owned(), "ranked".to_owned())].into(),
                players: Some(pb::PlayerSelector {
                    min_available: 2,
                    max_available: u64::MAX,
                }),
                ..<_>::default()
            }],
            metadata: Some(pb::MetaPatch {
                labels: [("match".to_owned(), "m1".to_owned())].into(),
                ..<_>::default()
            }),
            counters: [(
                "rooms".to_owned(),
                pb::CounterAction {
                    action: "Increment".into(),
                    amount: Some(1),
                    capacity: None,
                },
            )]
            .into(),
            ..<_>::default()
        };
        request.set_scheduling(pb::allocation_request::SchedulingStrategy::Distributed);
        request.preferred_game_server_selectors[0]
            .set_game_server_state(pb::game_server_selector::GameServerState::Allocated);
        request
    }

    #[test]
    fn request_to_allocation() {
        let allocation = to_allocation(request());
        assert_eq!(Some("games"), allocation.metadata.namespace.as_deref());
        assert_eq!(SchedulingStrategy::Distributed, allocation.spec.scheduling);
        assert_eq!(
            Some(GameServerState::Ready),
            allocation.spec.required.game_server_state
        );

        let preferred = &allocation.spec.preferred[0];
        assert_eq!(Some(GameServerState::Allocated), preferred.game_server_state);
        assert_eq!(i64::MAX, preferred.players.as_ref().unwrap().max_available);
        assert_eq!("m1", allocation.spec.metadata.labels["match"]);
        assert_eq!(
            Some("Increment"),
            allocation.spec.counters["rooms"].action.as_deref()
        );
        assert!(!allocation.spec.multi_cluster_setting.enabled);
    }

    #[test]
    fn allocation_back_to_request() {
        let original = request();
        let forwarded = to_request(&to_allocation(original.clone()));
        assert_eq!(original.namespace, forwarded.namespace);
        assert_eq!(original.scheduling, forwarded.scheduling);
        assert_eq!(
            original.required_game_server_selector.unwrap().match_labels,
            forwarded.required_game_server_selector.unwrap().match_labels
        );
        assert_eq!(original.counters, forwarded.counters);
        assert_eq!(original.metadata, forwarded.metadata);
    }

    #[test]
    fn statuses_become_responses() {
        let status = GameServerAllocationStatus {
            state: GameServerAllocationState::Allocated,
            game_server_name: "gs-1".into(),
            ports: vec![GameServerStatusPort {
                name: "default".into(),
                port: 7777,
            }],
            address: "10.0.0.1".into(),
            node_name: "node-1".into(),
            source: "local".into(),
            metadata: None,
        };

        let response = to_response(&status);
        assert_eq!(
            pb::allocation_response::AllocationState::Allocated,
            response.state()
        );
        assert_eq!(7777, response.ports[0].port);
        assert_eq!(status, to_status(response));

        let contention = to_response(&GameServerAllocationStatus::contention());
        assert_eq!(
            pb::allocation_response::AllocationState::Contention,
            contention.state()
        );
    }

    #[test]
    fn batch_results() {
        let error = to_result(Err(super::super::Error::NoPolicy));
        let status = from_result(Some(error)).unwrap_err();
        assert_eq!(tonic::Code::FailedPrecondition, status.code());
        assert!(from_result(None).is_err());
    }
}
