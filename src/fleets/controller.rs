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

use std::sync::Arc;

use eyre::WrapErr;
use kube::ResourceExt;

use super::{list_owned, split_active, strategy};
use crate::{
    apis::{self, fleet::FleetStatus, Fleet, GameServerSet},
    events::{self, DynRecorder, Event},
    signal::ShutdownRx,
    store::{DynStore, Propagation},
    watch::{EventHandler, Lister},
    workqueue::{Reconciler, WorkQueue},
};

pub struct Context {
    pub fleets: DynStore<Fleet>,
    pub sets: DynStore<GameServerSet>,
    pub fleet_lister: Lister<Fleet>,
    pub set_lister: Lister<GameServerSet>,
    pub recorder: DynRecorder,
}

/// Keeps one active set per fleet at the fleet's template, and moves
/// replicas to it from older sets.
pub struct Controller {
    context: Context,
    queue: WorkQueue,
}

impl Controller {
    pub fn new(context: Context) -> Arc<Self> {
        Arc::new(Self {
            context,
            queue: WorkQueue::new("fleets"),
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn fleet_handler(&self) -> Arc<dyn EventHandler<Fleet>> {
        Arc::new(self.queue.clone())
    }

    pub fn set_handler(&self) -> Arc<dyn EventHandler<GameServerSet>> {
        Arc::new(FleetOwners(self.queue.clone()))
    }

    pub async fn run(self: Arc<Self>, workers: usize, shutdown: ShutdownRx) {
        tokio::join!(
            self.context.fleet_lister.synced(),
            self.context.set_lister.synced(),
        );
        self.queue.clone().run(self, workers, shutdown).await;
    }

    async fn record(&self, fleet: &Fleet, event: Event) {
        events::record(&*self.context.recorder, fleet, event).await;
    }

    async fn create_active(&self, fleet: &Fleet) -> crate::Result<GameServerSet> {
        let set = self
            .context
            .sets
            .create(&fleet.game_server_set())
            .await
            .wrap_err_with(|| format!("error creating game server set for fleet {}", fleet.name_any()))?;

        self.record(
            fleet,
            Event::normal(
                events::CREATING_GAME_SERVER_SET,
                format!("Created GameServerSet {}", set.name_any()),
            ),
        )
        .await;
        Ok(set)
    }

    async fn scale(&self, fleet: &Fleet, set: &GameServerSet, replicas: i32, role: &str) -> crate::Result<()> {
        let mut copy = set.clone();
        copy.spec.replicas = replicas;
        self.context
            .sets
            .update(&copy)
            .await
            .wrap_err_with(|| format!("error scaling game server set {}", set.name_any()))?;

        self.record(
            fleet,
            Event::normal(
                events::SCALING_GAME_SERVER_SET,
                format!(
                    "Scaling {role} GameServerSet {} from {} to {replicas}",
                    set.name_any(),
                    set.spec.replicas
                ),
            ),
        )
        .await;
        Ok(())
    }

    /// Brings the active set in line with the fleet's replicas and the
    /// settings it passes down.
    async fn upsert_active(&self, fleet: &Fleet, active: &GameServerSet, replicas: i32) -> crate::Result<()> {
        let settings_changed = active.spec.scheduling != fleet.spec.scheduling
            || active.spec.priorities != fleet.spec.priorities
            || active.spec.allocation_overflow != fleet.spec.allocation_overflow;

        if !settings_changed {
            if active.spec.replicas != replicas {
                self.scale(fleet, active, replicas, "active").await?;
            }
            return Ok(());
        }

        let mut copy = active.clone();
        copy.spec.scheduling = fleet.spec.scheduling;
        copy.spec.priorities = fleet.spec.priorities.clone();
        copy.spec.allocation_overflow = fleet.spec.allocation_overflow.clone();
        if active.spec.replicas == replicas {
            self.context
                .sets
                .update(&copy)
                .await
                .wrap_err_with(|| format!("error updating game server set {}", active.name_any()))?;
            return Ok(());
        }

        self.scale(fleet, &copy, replicas, "active").await
    }

    /// Removes older sets with nothing left in them.
    async fn delete_empty(&self, fleet: &Fleet, rest: &[Arc<GameServerSet>]) -> crate::Result<()> {
        for set in rest {
            let status = set.status_or_default();
            if set.spec.replicas != 0 || status.replicas != 0 || status.allocated_replicas != 0 {
                continue;
            }

            match self
                .context
                .sets
                .delete(
                    &set.namespace().unwrap_or_default(),
                    &set.name_any(),
                    Propagation::Background,
                )
                .await
            {
                Ok(()) => {}
                Err(error) if error.is_not_found() => continue,
                Err(error) => {
                    return Err(error).wrap_err_with(|| {
                        format!("error deleting game server set {}", set.name_any())
                    })
                }
            }

            self.record(
                fleet,
                Event::normal(
                    events::DELETING_GAME_SERVER_SET,
                    format!("Deleting inactive GameServerSet {}", set.name_any()),
                ),
            )
            .await;
        }

        Ok(())
    }

    async fn sync_status(&self, fleet: &Fleet) -> crate::Result<()> {
        let sets = list_owned(&self.context.set_lister, fleet);
        let status = FleetStatus::from_sets(sets.iter().map(|set| &**set));
        if fleet.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut copy = fleet.clone();
        copy.status = Some(status);
        match self.context.fleets.update_status(&copy).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error)
                .wrap_err_with(|| format!("error updating status of fleet {}", fleet.name_any())),
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for Controller {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn reconcile(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = apis::split_key(key);
        let Some(fleet) = self.context.fleet_lister.get(namespace, name) else {
            tracing::debug!(%key, "fleet is no longer available for syncing");
            return Ok(());
        };

        if fleet.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let (active, rest) = split_active(&fleet, list_owned(&self.context.set_lister, &fleet));
        let active = match active {
            Some(active) => active,
            None => Arc::new(self.create_active(&fleet).await?),
        };

        let deployment = strategy::apply(&fleet, &active, &rest);
        for (index, replicas) in &deployment.rest {
            if let Some(set) = rest.get(*index) {
                self.scale(&fleet, set, *replicas, "inactive").await?;
            }
        }

        self.delete_empty(&fleet, &rest).await?;
        self.upsert_active(&fleet, &active, deployment.active).await?;
        self.sync_status(&fleet).await
    }
}

/// Queues the fleet owning a set whenever it changes.
struct FleetOwners(WorkQueue);

impl FleetOwners {
    fn enqueue(&self, set: &GameServerSet) {
        let Some(owner) = apis::controller_of(set) else {
            return;
        };

        if owner.kind == <Fleet as kube::Resource>::kind(&()) {
            self.0
                .add(apis::key_of(&set.namespace().unwrap_or_default(), &owner.name));
        }
    }
}

impl EventHandler<GameServerSet> for FleetOwners {
    fn on_add(&self, set: &Arc<GameServerSet>) {
        self.enqueue(set);
    }

    fn on_update(&self, _: &Arc<GameServerSet>, new: &Arc<GameServerSet>) {
        self.enqueue(new);
    }

    fn on_delete(&self, set: &Arc<GameServerSet>) {
        self.enqueue(set);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::{fleet::FleetStrategyType, gameserverset::GameServerSetStatus},
        store::Store,
        test::{self, Harness},
    };

    async fn reconcile(harness: &Harness) -> Vec<GameServerSet> {
        harness.sync().await;
        harness.fleet_controller.reconcile("default/fleet").await.unwrap();
        harness.sync().await;
        harness.sets.list_all("default", &<_>::default()).await.unwrap()
    }

    #[tokio::test]
    async fn creates_and_scales_the_active_set() {
        let harness = Harness::new(10, 20).await;
        harness.fleets.create(&test::fleet("fleet", 5)).await.unwrap();

        let sets = reconcile(&harness).await;
        assert_eq!(1, sets.len());
        assert_eq!(5, sets[0].spec.replicas);
        assert_eq!(Some("fleet"), apis::label(&sets[0], apis::FLEET_NAME_LABEL));
        assert_eq!(
            vec!["CreatingGameServerSet", "ScalingGameServerSet"],
            harness.recorder.reasons("default", "fleet")
        );

        // Status is summed from the sets.
        let mut set = sets[0].clone();
        set.status = Some(GameServerSetStatus {
            replicas: 5,
            ready_replicas: 4,
            allocated_replicas: 1,
            ..<_>::default()
        });
        harness.sets.update_status(&set).await.unwrap();
        reconcile(&harness).await;
        let status = harness.fleets.get("default", "fleet").await.unwrap().status.unwrap();
        assert_eq!(5, status.replicas);
        assert_eq!(4, status.ready_replicas);
        assert_eq!(1, status.allocated_replicas);
    }

    #[tokio::test]
    async fn template_change_starts_a_rolling_update() {
        let harness = Harness::new(10, 20).await;
        harness.fleets.create(&test::fleet("fleet", 8)).await.unwrap();
        let mut old = reconcile(&harness).await.remove(0);
        old.status = Some(GameServerSetStatus {
            replicas: 8,
            ready_replicas: 8,
            ..<_>::default()
        });
        harness.sets.update_status(&old).await.unwrap();

        let mut fleet = harness.fleets.get("default", "fleet").await.unwrap();
        fleet
            .spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default)
            .insert("version".into(), "2".into());
        harness.fleets.update(&fleet).await.unwrap();

        let sets = reconcile(&harness).await;
        assert_eq!(2, sets.len());
        let (active, old): (Vec<_>, Vec<_>) = sets.into_iter().partition(|set| fleet.is_current(set));
        // 25% of 8 is 2 either way.
        assert_eq!(2, active[0].spec.replicas);
        assert_eq!(6, old[0].spec.replicas);
    }

    #[tokio::test]
    async fn empty_older_sets_are_deleted() {
        let harness = Harness::new(10, 20).await;
        let mut fleet = test::fleet("fleet", 2);
        fleet.spec.strategy.r#type = FleetStrategyType::Recreate;
        harness.fleets.create(&fleet).await.unwrap();
        reconcile(&harness).await;

        let mut fleet = harness.fleets.get("default", "fleet").await.unwrap();
        fleet
            .spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default)
            .insert("version".into(), "2".into());
        harness.fleets.update(&fleet).await.unwrap();

        // Scaled to zero first, deleted once its status is empty.
        let sets = reconcile(&harness).await;
        assert_eq!(2, sets.len());
        assert!(sets.iter().all(|set| set.spec.replicas == 0));

        let sets = reconcile(&harness).await;
        assert_eq!(1, sets.len());
        assert!(fleet.is_current(&sets[0]));
        assert_eq!(2, sets[0].spec.replicas);
        assert!(harness
            .recorder
            .reasons("default", "fleet")
            .contains(&"DeletingGameServerSet".to_owned()));
    }
}
