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

//! The batch pipeline that serialises every local allocation.
//!
//! A single selector task takes requests from a bounded channel and matches
//! each against a sorted snapshot of the cache, removing whatever it picks so
//! that no two requests can receive the same game server. Picked game
//! servers are handed to a pool of update workers, which write the allocation
//! upstream and answer the caller.

use std::{sync::Arc, time::Instant};

use k8s_openapi::chrono;
use kube::ResourceExt;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::sync::oneshot;

use super::{cache::AllocationCache, metrics, Error};
use crate::{
    apis::{
        self, allocation::AllocationMatcher, gameserver::CountsAndListsError, GameServer,
        GameServerAllocation, GameServerState, SchedulingStrategy,
    },
    config::{self, Features},
    events::{self, DynRecorder, Event},
    signal::ShutdownRx,
    store::DynStore,
};

pub struct Context {
    pub game_servers: DynStore<GameServer>,
    pub cache: Arc<AllocationCache>,
    pub recorder: DynRecorder,
    pub features: Features,
    pub config: config::Allocation,
}

struct Request {
    allocation: Arc<GameServerAllocation>,
    matcher: AllocationMatcher,
    respond: oneshot::Sender<Result<GameServer, Error>>,
}

/// A game server taken out of the cache for a request.
struct Selected {
    request: Request,
    gs: Arc<GameServer>,
}

/// The sending half of the pipeline.
#[derive(Clone)]
pub struct Batcher {
    pending: async_channel::Sender<Request>,
}

impl Batcher {
    /// Starts the selector and the update workers. Both stop once
    /// `shutdown` fires, after finishing the updates already handed out.
    pub fn spawn(context: Context, shutdown: ShutdownRx) -> Self {
        let context = Arc::new(context);
        let (pending, pending_rx) = async_channel::bounded(context.config.pending_capacity.max(1));
        // async-channel has no zero capacity channel, so at most one selected
        // candidate waits here outside the cache for a free worker.
        let (updates, updates_rx) = async_channel::bounded(1);

        for _ in 0..context.config.update_workers.max(1) {
            tokio::spawn(update_worker(context.clone(), updates_rx.clone()));
        }

        let selector = Selector::new(
            context.cache.clone(),
            context.features,
            context.config.refresh_every,
            StdRng::from_entropy(),
        );
        tokio::spawn(select_loop(context, selector, pending_rx, updates, shutdown));

        Self { pending }
    }

    /// Queues one allocation attempt and waits for its outcome.
    pub async fn allocate(
        &self,
        allocation: Arc<GameServerAllocation>,
        matcher: AllocationMatcher,
    ) -> Result<GameServer, Error> {
        let (respond, response) = oneshot::channel();
        self.pending
            .send(Request {
                allocation,
                matcher,
                respond,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;

        response.await.map_err(|_| Error::ShuttingDown)?
    }
}

#[tracing::instrument(skip_all)]
async fn select_loop(
    context: Arc<Context>,
    mut selector: Selector,
    pending: async_channel::Receiver<Request>,
    updates: async_channel::Sender<Selected>,
    mut shutdown: ShutdownRx,
) {
    let quiet_window = context.config.batch_wait_time();
    loop {
        let request = tokio::select! {
            request = pending.recv() => match request {
                Ok(request) => request,
                Err(_) => return,
            },
            _ = shutdown.changed() => {
                tracing::debug!("stopping allocation selector");
                return;
            }
        };

        let mut batch = 1;
        select(&mut selector, request, &updates).await;
        loop {
            while let Ok(request) = pending.try_recv() {
                batch += 1;
                select(&mut selector, request, &updates).await;
            }

            match tokio::time::timeout(quiet_window, pending.recv()).await {
                Ok(Ok(request)) => {
                    batch += 1;
                    select(&mut selector, request, &updates).await;
                }
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }

        metrics::batch_size().observe(batch as f64);
        selector.flush();
    }
}

async fn select(
    selector: &mut Selector,
    request: Request,
    updates: &async_channel::Sender<Selected>,
) {
    match selector.next(&request.allocation, &request.matcher) {
        Ok(gs) => {
            if let Err(async_channel::SendError(selected)) =
                updates.send(Selected { request, gs }).await
            {
                selector.cache.insert(selected.gs);
                let _ = selected.request.respond.send(Err(Error::ShuttingDown));
            }
        }
        Err(error) => {
            let _ = request.respond.send(Err(error));
        }
    }
}

/// Walks the working list on behalf of the select loop.
struct Selector {
    cache: Arc<AllocationCache>,
    features: Features,
    refresh_every: usize,
    list: Option<Vec<Arc<GameServer>>>,
    sort_key: Option<u64>,
    selections: usize,
    rng: StdRng,
}

impl Selector {
    fn new(cache: Arc<AllocationCache>, features: Features, refresh_every: usize, rng: StdRng) -> Self {
        Self {
            cache,
            features,
            refresh_every: refresh_every.max(1),
            list: None,
            sort_key: None,
            selections: 0,
            rng,
        }
    }

    /// Drops the working list, the next request takes a fresh snapshot.
    fn flush(&mut self) {
        self.list = None;
        self.selections = 0;
    }

    fn next(
        &mut self,
        allocation: &GameServerAllocation,
        matcher: &AllocationMatcher,
    ) -> Result<Arc<GameServer>, Error> {
        if self.selections >= self.refresh_every {
            self.flush();
        }

        let sort_key = allocation.sort_key();
        if self.sort_key != Some(sort_key) {
            self.flush();
            self.sort_key = Some(sort_key);
        }

        let cache = &self.cache;
        let list = self
            .list
            .get_or_insert_with(|| cache.list_sorted(allocation));

        let shuffle = allocation.spec.scheduling == SchedulingStrategy::Distributed
            && (allocation.spec.priorities.is_empty() || !self.features.counts_and_lists);
        let found = if shuffle {
            let mut order: Vec<usize> = (0..list.len()).collect();
            order.shuffle(&mut self.rng);
            matcher.find(order.into_iter().map(|index| (index, &*list[index])), &self.features)
        } else {
            matcher.find(
                list.iter().enumerate().map(|(index, gs)| (index, &**gs)),
                &self.features,
            )
        };

        let index = found.ok_or(Error::NoGameServerReady)?;
        let gs = list.remove(index);
        self.selections += 1;

        if !self.cache.remove(&apis::key(&*gs)) {
            // Changed since the snapshot was taken.
            return Err(Error::Contention);
        }

        Ok(gs)
    }
}

async fn update_worker(context: Arc<Context>, updates: async_channel::Receiver<Selected>) {
    while let Ok(Selected { request, gs }) = updates.recv().await {
        let result = update(&context, &request.allocation, &gs).await;
        // The caller may have given up already.
        let _ = request.respond.send(result);
    }
}

/// Writes the allocation of `selected` upstream.
async fn update(
    context: &Context,
    allocation: &GameServerAllocation,
    selected: &Arc<GameServer>,
) -> Result<GameServer, Error> {
    let mut gs = (**selected).clone();
    let (counter_errors, list_errors) = apply(allocation, &mut gs, &context.features);

    let start = Instant::now();
    match context.game_servers.update(&gs).await {
        Ok(updated) => {
            metrics::update_duration("success").observe(start.elapsed().as_secs_f64());
            context.cache.insert(Arc::new(updated.clone()));

            let recorder = &*context.recorder;
            if !counter_errors.is_empty() {
                events::record(
                    recorder,
                    &updated,
                    Event::warning(events::COUNTER_ACTION_ERROR, join(&counter_errors)),
                )
                .await;
            }
            if !list_errors.is_empty() {
                events::record(
                    recorder,
                    &updated,
                    Event::warning(events::LIST_ACTION_ERROR, join(&list_errors)),
                )
                .await;
            }
            events::record(recorder, &updated, Event::normal(events::ALLOCATED, "Allocated")).await;

            tracing::debug!(game_server = %updated.name_any(), "allocated game server");
            Ok(updated)
        }
        // The cache is behind, it catches up through the watch.
        Err(error) if error.is_conflict() => {
            metrics::update_duration("conflict").observe(start.elapsed().as_secs_f64());
            Err(Error::Conflict(error))
        }
        Err(error) => {
            metrics::update_duration("error").observe(start.elapsed().as_secs_f64());
            context.cache.insert(selected.clone());
            Err(Error::Store(error))
        }
    }
}

fn join(errors: &[CountsAndListsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Applies an allocation to a local copy of a game server, returning the
/// counter and list actions that failed.
pub fn apply(
    allocation: &GameServerAllocation,
    gs: &mut GameServer,
    features: &Features,
) -> (Vec<CountsAndListsError>, Vec<CountsAndListsError>) {
    gs.set_state(GameServerState::Allocated);
    gs.patch_meta(&allocation.spec.metadata);
    // Refreshed on every allocation, even of an allocated game server.
    gs.metadata.annotations.get_or_insert_with(Default::default).insert(
        apis::LAST_ALLOCATED_ANNOTATION.into(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
    );

    if !features.counts_and_lists {
        return (Vec::new(), Vec::new());
    }

    let mut counter_errors = Vec::new();
    for (name, action) in &allocation.spec.counters {
        counter_errors.extend(action.apply(name, gs));
    }

    let mut list_errors = Vec::new();
    for (name, action) in &allocation.spec.lists {
        list_errors.extend(action.apply(name, gs));
    }

    (counter_errors, list_errors)
}
