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

use std::collections::HashSet;

use pretty_assertions::assert_eq;

use agones_allocator::{
    apis::{
        allocation::{
            GameServerAllocation, GameServerAllocationSpec, GameServerAllocationState,
            GameServerSelector,
        },
        self, GameServerState, SchedulingStrategy,
    },
    config,
    store::Store,
    test::{self, Harness},
};

fn request() -> GameServerAllocation {
    GameServerAllocation::for_namespace("default", <_>::default())
}

fn labelled(name: &str, key: &str, value: &str) -> agones_allocator::apis::GameServer {
    let mut gs = test::game_server_template(name);
    gs.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.into(), value.into());
    gs
}

#[tokio::test]
async fn concurrent_requests_never_share_a_game_server() {
    let harness = Harness::new(7000, 8000).await;
    for index in 0..5 {
        harness
            .ready_game_server(&format!("gs-{index}"), &format!("node-{}", index % 2))
            .await;
    }
    let allocator = harness.allocator(Vec::new());

    let results = futures::future::join_all((0..8).map(|_| allocator.allocate(request()))).await;
    let statuses: Vec<_> = results.into_iter().map(Result::unwrap).collect();

    let allocated: Vec<_> = statuses
        .iter()
        .filter(|status| status.state == GameServerAllocationState::Allocated)
        .map(|status| status.game_server_name.clone())
        .collect();
    let distinct: HashSet<_> = allocated.iter().cloned().collect();
    assert_eq!(5, allocated.len());
    assert_eq!(5, distinct.len());
    assert_eq!(
        3,
        statuses
            .iter()
            .filter(|status| status.state == GameServerAllocationState::UnAllocated)
            .count()
    );

    for name in distinct {
        let gs = harness.game_servers.get("default", &name).await.unwrap();
        assert_eq!(Some(GameServerState::Allocated), gs.state());
    }
}

#[tokio::test]
async fn preferred_selectors_win_over_required() {
    let harness = Harness::new(7000, 8000).await;
    harness
        .ready_game_server_from(labelled("old", "version", "1"), "node-1")
        .await;
    harness
        .ready_game_server_from(labelled("new", "version", "2"), "node-1")
        .await;
    let allocator = harness.allocator(Vec::new());

    let allocation = GameServerAllocation::for_namespace(
        "default",
        GameServerAllocationSpec {
            preferred: vec![GameServerSelector::from_labels([(
                "version".to_owned(),
                "2".to_owned(),
            )])],
            ..<_>::default()
        },
    );

    let status = allocator.allocate(allocation.clone()).await.unwrap();
    assert_eq!("new", status.game_server_name);

    // Nothing preferred is left, so the required selector decides.
    let status = allocator.allocate(allocation).await.unwrap();
    assert_eq!("old", status.game_server_name);
}

#[tokio::test]
async fn packed_requests_fill_the_busiest_node() {
    let harness = Harness::new(7000, 8000).await;
    let busy = harness.ready_game_server("busy-allocated", "busy").await;
    harness.set_state(&busy, GameServerState::Allocated).await;
    harness.ready_game_server("idle-1", "idle").await;
    harness.ready_game_server("busy-ready", "busy").await;
    harness.sync().await;
    let counter = &harness.counter;
    test::eventually(|| async move { counter.node("busy").allocated == 1 }).await;

    let allocator = harness.allocator(Vec::new());
    let status = allocator
        .allocate(GameServerAllocation::for_namespace(
            "default",
            GameServerAllocationSpec {
                scheduling: SchedulingStrategy::Packed,
                ..<_>::default()
            },
        ))
        .await
        .unwrap();

    assert_eq!("busy-ready", status.game_server_name);
    assert_eq!("busy", status.node_name);
}

#[tokio::test]
async fn other_namespaces_are_invisible() {
    let harness = Harness::new(7000, 8000).await;
    harness.ready_game_server("gs-1", "node-1").await;
    let allocator = harness.allocator(Vec::new());

    let status = allocator
        .allocate(GameServerAllocation::for_namespace("elsewhere", <_>::default()))
        .await
        .unwrap();
    assert_eq!(GameServerAllocationState::UnAllocated, status.state);
}

#[tokio::test]
async fn a_conflict_moves_on_to_the_next_game_server() {
    let harness = Harness::new(7000, 8000).await;
    harness.ready_game_server("gs-1", "node-1").await;
    harness.ready_game_server("gs-2", "node-1").await;
    let allocator = harness.allocator(Vec::new());

    harness.game_servers.inject_conflicts(1);
    let status = allocator.allocate(request()).await.unwrap();
    assert_eq!(GameServerAllocationState::Allocated, status.state);
}

#[tokio::test]
async fn endless_conflicts_report_contention() {
    let harness = Harness::new(7000, 8000).await;
    let mut config = config::Allocation::default();
    config.retry.base_ms = 1;
    for index in 0..config.retry.steps {
        harness
            .ready_game_server(&format!("gs-{index}"), "node-1")
            .await;
    }
    let allocator = harness.allocator_with(Vec::new(), config.clone());

    harness.game_servers.inject_conflicts(usize::MAX);
    let status = allocator.allocate(request()).await.unwrap();
    assert_eq!(GameServerAllocationState::Contention, status.state);

    // The cache is rebuilt from the informer afterwards.
    harness.game_servers.inject_conflicts(0);
    let (cache, steps) = (&harness.allocation_cache, config.retry.steps as usize);
    test::eventually(|| async move { cache.len() == steps }).await;
    let status = allocator.allocate(request()).await.unwrap();
    assert_eq!(GameServerAllocationState::Allocated, status.state);
}

#[tokio::test]
async fn distributed_requests_spread_across_nodes() {
    let harness = Harness::new(7000, 8000).await;
    for node in 0..3 {
        for index in 0..10 {
            harness
                .ready_game_server(&format!("gs-{node}-{index}"), &format!("node-{node}"))
                .await;
        }
    }
    let allocator = harness.allocator(Vec::new());

    let allocation = GameServerAllocation::for_namespace(
        "default",
        GameServerAllocationSpec {
            scheduling: SchedulingStrategy::Distributed,
            ..<_>::default()
        },
    );
    let mut nodes = HashSet::new();
    for _ in 0..10 {
        let status = allocator.allocate(allocation.clone()).await.unwrap();
        assert_eq!(GameServerAllocationState::Allocated, status.state);
        nodes.insert(status.node_name);
    }
    assert!(nodes.len() >= 2, "allocated only on {nodes:?}");
}

#[tokio::test]
async fn allocated_game_servers_can_be_allocated_again() {
    let harness = Harness::new(7000, 8000).await;
    harness.ready_game_server("gs-1", "node-1").await;
    let allocator = harness.allocator(Vec::new());

    let status = allocator.allocate(request()).await.unwrap();
    assert_eq!("gs-1", status.game_server_name);
    let first = harness.game_servers.get("default", "gs-1").await.unwrap();
    let first_allocated = apis::annotation(&first, apis::LAST_ALLOCATED_ANNOTATION)
        .unwrap()
        .to_owned();

    // Ready game servers only, by default.
    let status = allocator.allocate(request()).await.unwrap();
    assert_eq!(GameServerAllocationState::UnAllocated, status.state);

    // The allocated copy comes back into the cache through the informer.
    let (cache, version) = (&harness.allocation_cache, first.metadata.resource_version.clone());
    test::eventually(|| {
        let version = version.clone();
        async move {
            cache
                .list_sorted(&request())
                .iter()
                .any(|gs| gs.metadata.resource_version == version)
        }
    })
    .await;

    let allocation = GameServerAllocation::for_namespace(
        "default",
        GameServerAllocationSpec {
            required: GameServerSelector {
                game_server_state: Some(GameServerState::Allocated),
                ..<_>::default()
            },
            ..<_>::default()
        },
    );
    let status = allocator.allocate(allocation).await.unwrap();
    assert_eq!(GameServerAllocationState::Allocated, status.state);
    assert_eq!("gs-1", status.game_server_name);

    let second = harness.game_servers.get("default", "gs-1").await.unwrap();
    assert_eq!(Some(GameServerState::Allocated), second.state());
    let second_allocated = apis::annotation(&second, apis::LAST_ALLOCATED_ANNOTATION).unwrap();
    assert!(second_allocated > first_allocated.as_str());
}
