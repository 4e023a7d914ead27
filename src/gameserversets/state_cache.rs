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

//! Game servers a set controller created or removed that its informer has
//! not caught up with yet.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono};
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::apis::{self, GameServer};

#[derive(Default)]
struct Overlay {
    pending_creation: HashMap<String, Arc<GameServer>>,
    pending_deletion: HashMap<String, Arc<GameServer>>,
}

/// The local writes of one game server set.
#[derive(Clone, Default)]
pub struct Entry {
    overlay: Arc<Mutex<Overlay>>,
}

impl Entry {
    pub fn created(&self, gs: &GameServer) {
        self.overlay
            .lock()
            .pending_creation
            .insert(gs.name_any(), Arc::new(gs.clone()));
    }

    pub fn deleted(&self, gs: &GameServer) {
        let mut overlay = self.overlay.lock();
        overlay.pending_creation.remove(&gs.name_any());

        let mut copy = gs.clone();
        copy.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        overlay.pending_deletion.insert(gs.name_any(), Arc::new(copy));
    }

    /// Merges the informer's `list` with the pending writes. Entries the
    /// list has caught up with are dropped from the overlay.
    pub fn reconcile(&self, list: Vec<Arc<GameServer>>) -> Vec<Arc<GameServer>> {
        let mut overlay = self.overlay.lock();
        let mut found = std::collections::HashSet::new();
        let mut result = Vec::with_capacity(list.len() + overlay.pending_creation.len());

        for gs in list {
            let name = gs.name_any();
            match overlay.pending_deletion.get(&name).cloned() {
                Some(deleted) => {
                    if gs.is_being_deleted() {
                        overlay.pending_deletion.remove(&name);
                    }
                    result.push(deleted);
                }
                None => result.push(gs),
            }

            overlay.pending_creation.remove(&name);
            found.insert(name);
        }

        overlay
            .pending_deletion
            .retain(|name, _| found.contains(name));
        result.extend(overlay.pending_creation.values().cloned());
        result
    }
}

/// One [`Entry`] per game server set, by key.
#[derive(Clone, Default)]
pub struct StateCache {
    entries: Arc<DashMap<String, Entry>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_set(&self, set: &apis::GameServerSet) -> Entry {
        self.entries.entry(apis::key(set)).or_default().clone()
    }

    pub fn remove_set(&self, set: &apis::GameServerSet) {
        self.entries.remove(&apis::key(set));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn gs(name: &str) -> Arc<GameServer> {
        Arc::new(GameServer::new(name, <_>::default()))
    }

    fn names(list: &[Arc<GameServer>]) -> Vec<String> {
        let mut names: Vec<_> = list.iter().map(|gs| gs.name_any()).collect();
        names.sort();
        names
    }

    #[test]
    fn pending_creations_fill_the_gap() {
        let entry = Entry::default();
        entry.created(&gs("a"));
        entry.created(&gs("b"));

        let list = entry.reconcile(vec![gs("a")]);
        assert_eq!(vec!["a", "b"], names(&list));

        // `a` showed up, so only `b` is still pending.
        assert_eq!(vec!["b"], names(&entry.reconcile(vec![])));
    }

    #[test]
    fn pending_deletions_overlay_the_list() {
        let entry = Entry::default();
        entry.created(&gs("a"));
        entry.deleted(&gs("a"));
        entry.deleted(&gs("b"));

        let list = entry.reconcile(vec![gs("b")]);
        assert_eq!(1, list.len());
        assert!(list[0].is_being_deleted());

        let mut deleting = (*gs("b")).clone();
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(entry.reconcile(vec![Arc::new(deleting)])[0].is_being_deleted());

        // The informer caught up, nothing is pending.
        assert!(!entry.reconcile(vec![gs("b")])[0].is_being_deleted());
    }

    #[test]
    fn entries_are_per_set() {
        let cache = StateCache::new();
        let mut set = apis::GameServerSet::new("set", <_>::default());
        set.metadata.namespace = Some("default".into());
        cache.for_set(&set).created(&gs("a"));
        assert_eq!(1, cache.for_set(&set).reconcile(vec![]).len());

        cache.remove_set(&set);
        assert!(cache.for_set(&set).reconcile(vec![]).is_empty());
    }
}
