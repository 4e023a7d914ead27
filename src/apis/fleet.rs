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

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    gameserver::GameServerTemplateSpec,
    gameserverset::{
        AggregatedCounterStatus, AggregatedListStatus, AggregatedPlayerStatus, AllocationOverflow,
        GameServerSet, GameServerSetSpec, GameServerSetStatus,
    },
    Priority, SchedulingStrategy, ValidationError, ValidationErrors,
};

/// FleetSpec is the spec for a Fleet. More info: <https://agones.dev/site/docs/reference/agones_crd_api_reference/#agones.dev/v1.Fleet>
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "Fleet",
    plural = "fleets",
    shortname = "flt",
    derive = "PartialEq"
)]
#[kube(namespaced)]
#[kube(status = "FleetStatus")]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_overflow: Option<AllocationOverflow>,
    #[serde(default)]
    pub strategy: FleetStrategy,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<Priority>,
    /// GameServer is the data structure for a GameServer resource.
    pub template: GameServerTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetStrategy {
    #[serde(default)]
    pub r#type: FleetStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<FleetStrategyRollingUpdate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetStrategyRollingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum FleetStrategyType {
    /// Scale every older set to zero before the current one grows.
    Recreate,
    #[default]
    RollingUpdate,
}

/// FleetStatus is the status of a Fleet. More info: <https://agones.dev/site/docs/reference/agones_crd_api_reference/#agones.dev/v1.Fleet>
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub reserved_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<AggregatedPlayerStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, AggregatedCounterStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, AggregatedListStatus>,
}

impl FleetStatus {
    /// Sums the observed status of every set a fleet owns.
    pub fn from_sets<'a>(sets: impl IntoIterator<Item = &'a GameServerSet>) -> Self {
        let mut total = GameServerSetStatus::default();
        for set in sets {
            if let Some(status) = &set.status {
                total.add(status);
            }
        }

        Self {
            replicas: total.replicas,
            ready_replicas: total.ready_replicas,
            reserved_replicas: total.reserved_replicas,
            allocated_replicas: total.allocated_replicas,
            players: total.players,
            counters: total.counters,
            lists: total.lists,
        }
    }
}

/// Default for both rolling update bounds.
pub const DEFAULT_ROLLING_UPDATE_BOUND: &str = "25%";

impl Fleet {
    /// Hash of the template, used to tell the current set from older ones.
    pub fn template_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.spec.template).unwrap_or_default();
        format!("{:016x}", seahash::hash(&bytes))
    }

    /// A new set for the fleet's current template, with zero replicas.
    pub fn game_server_set(&self) -> GameServerSet {
        let mut metadata = self.spec.template.metadata.clone().unwrap_or_default();
        let name = self.name_any();

        metadata.name = None;
        metadata.generate_name = Some(format!("{name}-"));
        metadata.namespace = self.namespace();
        metadata.resource_version = None;
        metadata.uid = None;
        metadata.owner_references = super::controller_reference(self).map(|owner| vec![owner]);
        metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(super::FLEET_NAME_LABEL.into(), name);
        metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(super::TEMPLATE_HASH_ANNOTATION.into(), self.template_hash());

        GameServerSet {
            metadata,
            spec: GameServerSetSpec {
                replicas: 0,
                allocation_overflow: self.spec.allocation_overflow.clone(),
                scheduling: self.spec.scheduling,
                priorities: self.spec.priorities.clone(),
                template: self.spec.template.clone(),
            },
            status: None,
        }
    }

    /// Whether `set` was created from the fleet's current template.
    pub fn is_current(&self, set: &GameServerSet) -> bool {
        super::annotation(set, super::TEMPLATE_HASH_ANNOTATION)
            .map_or(false, |hash| hash == self.template_hash())
    }

    pub fn apply_defaults(&mut self) {
        let strategy = &mut self.spec.strategy;
        if strategy.r#type == FleetStrategyType::RollingUpdate {
            let rolling_update = strategy.rolling_update.get_or_insert_with(Default::default);
            rolling_update
                .max_surge
                .get_or_insert_with(|| IntOrString::String(DEFAULT_ROLLING_UPDATE_BOUND.into()));
            rolling_update
                .max_unavailable
                .get_or_insert_with(|| IntOrString::String(DEFAULT_ROLLING_UPDATE_BOUND.into()));
        }

        self.spec.template.spec.scheduling = self.spec.scheduling;
    }

    /// The surge bound as an absolute replica count.
    pub fn max_surge(&self) -> i32 {
        self.bound(|update| update.max_surge.as_ref())
    }

    /// The unavailability bound as an absolute replica count.
    pub fn max_unavailable(&self) -> i32 {
        self.bound(|update| update.max_unavailable.as_ref())
    }

    fn bound(
        &self,
        select: impl Fn(&FleetStrategyRollingUpdate) -> Option<&IntOrString>,
    ) -> i32 {
        let default = IntOrString::String(DEFAULT_ROLLING_UPDATE_BOUND.into());
        let value = self
            .spec
            .strategy
            .rolling_update
            .as_ref()
            .and_then(select)
            .unwrap_or(&default);

        // An invalid bound is rejected on admission, fall back to one replica.
        scaled_value(value, self.spec.replicas).unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.spec.replicas < 0 {
            errors.push(ValidationError::invalid(
                "spec.replicas",
                "must be greater than or equal to 0",
            ));
        }

        if let Some(update) = &self.spec.strategy.rolling_update {
            for (field, value) in [
                ("spec.strategy.rollingUpdate.maxSurge", &update.max_surge),
                (
                    "spec.strategy.rollingUpdate.maxUnavailable",
                    &update.max_unavailable,
                ),
            ] {
                if let Some(value) = value {
                    if let Err(error) = validate_bound(field, value) {
                        errors.push(error);
                    }
                }
            }
        }

        if let Err(template_errors) = self.game_server_set().validate() {
            errors.extend(template_errors.0);
        }

        errors.into_result()
    }
}

fn parse_percent(value: &str) -> Option<i32> {
    value.strip_suffix('%')?.parse().ok()
}

fn validate_bound(field: &str, value: &IntOrString) -> Result<(), ValidationError> {
    match value {
        IntOrString::Int(v) if *v < 1 => Err(ValidationError::invalid(
            field,
            "must be at least 1 when an absolute number",
        )),
        IntOrString::String(v) => match parse_percent(v) {
            Some(1..=99) => Ok(()),
            _ => Err(super::ValueInvalidArgs::new(field, "must be a percentage between 1% and 99%")
                .with_examples(&["25%", "50%"])
                .into()),
        },
        IntOrString::Int(_) => Ok(()),
    }
}

/// Resolves an absolute or percentage bound against `total`, rounding
/// percentages up.
pub fn scaled_value(value: &IntOrString, total: i32) -> Option<i32> {
    match value {
        IntOrString::Int(v) => Some(*v),
        IntOrString::String(v) => {
            let percent = i64::from(parse_percent(v)?);
            let scaled = (percent * i64::from(total) + 99) / 100;
            i32::try_from(scaled).ok()
        }
    }
}
