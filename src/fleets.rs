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

//! Rolls fleets between game server sets as their template changes.

pub mod controller;
pub mod strategy;

use std::sync::Arc;

use crate::{
    apis::{self, selector::Requirement, Fleet, GameServerSet, Selector},
    watch::Lister,
};

pub use self::controller::Controller;

/// The sets `fleet` controls, oldest first.
pub fn list_owned(lister: &Lister<GameServerSet>, fleet: &Fleet) -> Vec<Arc<GameServerSet>> {
    let Some(uid) = fleet.metadata.uid.as_deref() else {
        return Vec::new();
    };

    let name = fleet.metadata.name.as_deref().unwrap_or_default();
    let selector = Selector::everything().with(Requirement::equals(apis::FLEET_NAME_LABEL, name));
    let mut sets: Vec<_> = lister
        .list_matching(fleet.metadata.namespace.as_deref().unwrap_or_default(), &selector)
        .into_iter()
        .filter(|set| apis::is_owned_by(&**set, uid))
        .collect();

    sets.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    sets
}

/// Splits `sets` into the one matching the fleet's current template, if
/// any, and the rest.
pub fn split_active(
    fleet: &Fleet,
    sets: Vec<Arc<GameServerSet>>,
) -> (Option<Arc<GameServerSet>>, Vec<Arc<GameServerSet>>) {
    let mut active = None;
    let mut rest = Vec::with_capacity(sets.len());
    for set in sets {
        if active.is_none() && fleet.is_current(&set) {
            active = Some(set);
        } else {
            rest.push(set);
        }
    }

    (active, rest)
}
