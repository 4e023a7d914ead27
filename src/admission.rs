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

//! Mutating and validating admission callbacks.
//!
//! Mutation answers with a JSON patch that applies the same defaults the
//! controllers would. Validation answers with every problem found, joined
//! into the denial message.

use kube_core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    apis::{Fleet, GameServer, GameServerAllocation, GameServerSet, ValidationErrors},
    config::Features,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request has no object")]
    MissingObject,
    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: String,
        source: serde_json::Error,
    },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: String,
        source: serde_json::Error,
    },
}

/// The kinds admission knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    GameServer,
    GameServerSet,
    Fleet,
    GameServerAllocation,
}

impl Kind {
    pub fn from_request(request: &AdmissionRequest<DynamicObject>) -> Option<Self> {
        match request.kind.kind.as_str() {
            "GameServer" => Some(Self::GameServer),
            "GameServerSet" => Some(Self::GameServerSet),
            "Fleet" => Some(Self::Fleet),
            "GameServerAllocation" => Some(Self::GameServerAllocation),
            _ => None,
        }
    }
}

fn decode<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, Error> {
    let kind = || {
        object
            .types
            .as_ref()
            .map_or_else(String::new, |types| types.kind.clone())
    };

    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|source| Error::Decode {
            kind: kind(),
            source,
        })
}

fn encode<K: Serialize>(kind: Kind, object: &K) -> Result<serde_json::Value, Error> {
    serde_json::to_value(object).map_err(|source| Error::Encode {
        kind: format!("{kind:?}"),
        source,
    })
}

/// The patch from `original` to `original` after `defaults`.
fn defaults_patch<K: DeserializeOwned + Serialize>(
    kind: Kind,
    object: &DynamicObject,
    defaults: impl FnOnce(&mut K),
) -> Result<json_patch::Patch, Error> {
    let mut typed: K = decode(object)?;
    let before = encode(kind, &typed)?;
    defaults(&mut typed);
    let after = encode(kind, &typed)?;
    Ok(json_patch::diff(&before, &after))
}

/// The defaulting patch for the request's object. Kinds without defaults
/// get an empty patch.
pub fn mutation(
    request: &AdmissionRequest<DynamicObject>,
    features: &Features,
) -> Result<json_patch::Patch, Error> {
    let object = request.object.as_ref().ok_or(Error::MissingObject)?;
    match Kind::from_request(request) {
        Some(kind @ Kind::GameServer) => {
            defaults_patch(kind, object, |gs: &mut GameServer| gs.apply_defaults())
        }
        Some(kind @ Kind::Fleet) => {
            defaults_patch(kind, object, |fleet: &mut Fleet| fleet.apply_defaults())
        }
        Some(kind @ Kind::GameServerAllocation) => {
            defaults_patch(kind, object, |allocation: &mut GameServerAllocation| {
                allocation.apply_defaults(features)
            })
        }
        Some(Kind::GameServerSet) | None => Ok(json_patch::Patch(Vec::new())),
    }
}

/// Every problem with the request's object. Objects are validated with
/// their defaults applied, as they will be stored.
pub fn validation(
    request: &AdmissionRequest<DynamicObject>,
    features: &Features,
) -> Result<Result<(), ValidationErrors>, Error> {
    let object = request.object.as_ref().ok_or(Error::MissingObject)?;
    let result = match Kind::from_request(request) {
        Some(Kind::GameServer) => {
            let mut gs: GameServer = decode(object)?;
            gs.apply_defaults();
            gs.validate()
        }
        Some(Kind::Fleet) => {
            let mut fleet: Fleet = decode(object)?;
            fleet.apply_defaults();
            fleet.validate()
        }
        Some(Kind::GameServerSet) => {
            let set: GameServerSet = decode(object)?;
            match (&request.operation, &request.old_object) {
                (Operation::Update, Some(old)) => decode::<GameServerSet>(old)?.validate_update(&set),
                _ => set.validate(),
            }
        }
        Some(Kind::GameServerAllocation) => {
            let mut allocation: GameServerAllocation = decode(object)?;
            allocation.apply_defaults(features);
            allocation.validate(features)
        }
        None => Ok(()),
    };

    Ok(result)
}

/// Answers a mutating admission request.
pub fn mutate(request: &AdmissionRequest<DynamicObject>, features: &Features) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    match mutation(request, features) {
        Ok(patch) if patch.0.is_empty() => response,
        Ok(patch) => response.with_patch(patch).unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to serialize admission patch");
            AdmissionResponse::from(request).deny(error.to_string())
        }),
        Err(error) => {
            tracing::debug!(%error, uid = %request.uid, "rejecting mutation");
            response.deny(error.to_string())
        }
    }
}

/// Answers a validating admission request.
pub fn validate(
    request: &AdmissionRequest<DynamicObject>,
    features: &Features,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    match validation(request, features) {
        Ok(Ok(())) => response,
        Ok(Err(errors)) => {
            tracing::debug!(%errors, uid = %request.uid, "object failed validation");
            response.deny(errors.to_string())
        }
        Err(error) => response.deny(error.to_string()),
    }
}

/// Unwraps `review`, answers it with `handler` and wraps the response.
pub fn review(
    review: AdmissionReview<DynamicObject>,
    features: &Features,
    handler: fn(&AdmissionRequest<DynamicObject>, &Features) -> AdmissionResponse,
) -> AdmissionReview<DynamicObject> {
    let request: Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
    let response = match request {
        Ok(request) => handler(&request, features),
        Err(error) => {
            tracing::warn!(%error, "invalid admission review");
            AdmissionResponse::invalid(error.to_string())
        }
    };

    response.into_review()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn request(
        kind: &str,
        operation: &str,
        object: serde_json::Value,
        old_object: Option<serde_json::Value>,
    ) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0df28fbd-5f5f-11e8-bc74-36e6bb280816",
                "kind": { "group": "agones.dev", "version": "v1", "kind": kind },
                "resource": { "group": "agones.dev", "version": "v1", "resource": "things" },
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn game_server(ports: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "agones.dev/v1",
            "kind": "GameServer",
            "metadata": { "name": "gs-1", "namespace": "default" },
            "spec": {
                "ports": ports,
                "template": { "spec": { "containers": [{ "name": "game", "image": "game:1" }] } }
            }
        })
    }

    fn game_server_set(replicas: i32, image: &str) -> serde_json::Value {
        json!({
            "apiVersion": "agones.dev/v1",
            "kind": "GameServerSet",
            "metadata": { "name": "set", "namespace": "default" },
            "spec": {
                "replicas": replicas,
                "template": {
                    "spec": {
                        "template": { "spec": { "containers": [{ "name": "game", "image": image }] } }
                    }
                }
            }
        })
    }

    fn paths(patch: &json_patch::Patch) -> Vec<String> {
        patch
            .0
            .iter()
            .map(|operation| match operation {
                json_patch::PatchOperation::Add(add) => add.path.clone(),
                json_patch::PatchOperation::Replace(replace) => replace.path.clone(),
                json_patch::PatchOperation::Remove(remove) => remove.path.clone(),
                other => panic!("unexpected operation {other:?}"),
            })
            .collect()
    }

    #[test]
    fn game_servers_are_defaulted() {
        let request = request("GameServer", "CREATE", game_server(json!([])), None);
        let patch = mutation(&request, &Features::default()).unwrap();
        let paths = paths(&patch);

        assert!(paths.contains(&"/spec/container".to_owned()), "{paths:?}");
        assert!(paths.contains(&"/status".to_owned()), "{paths:?}");

        let mut patched = serde_json::to_value(request.object.as_ref().unwrap()).unwrap();
        json_patch::patch(&mut patched, &patch).unwrap();
        assert_eq!(json!("game"), patched["spec"]["container"]);
        assert_eq!(json!("Creating"), patched["status"]["state"]);

        assert!(mutate(&request, &Features::default()).allowed);
    }

    #[test]
    fn sets_have_no_defaults() {
        let request = request("GameServerSet", "CREATE", game_server_set(2, "game:1"), None);
        assert!(mutation(&request, &Features::default()).unwrap().0.is_empty());
    }

    #[test]
    fn static_ports_need_a_host_port() {
        let request = request(
            "GameServer",
            "CREATE",
            game_server(json!([{ "name": "game", "portPolicy": "Static", "containerPort": 7777 }])),
            None,
        );

        let errors = validation(&request, &Features::default()).unwrap().unwrap_err();
        assert!(!errors.is_empty());
        let response = validate(&request, &Features::default());
        assert!(!response.allowed);
        assert_eq!(errors.to_string(), response.result.message);
    }

    #[test]
    fn set_templates_are_immutable() {
        let update = request(
            "GameServerSet",
            "UPDATE",
            game_server_set(3, "game:2"),
            Some(game_server_set(2, "game:1")),
        );
        let errors = validation(&update, &Features::default()).unwrap().unwrap_err();
        assert_eq!(vec!["spec.template"], errors.0.iter().map(|e| e.field()).collect::<Vec<_>>());

        let scale = request(
            "GameServerSet",
            "UPDATE",
            game_server_set(3, "game:1"),
            Some(game_server_set(2, "game:1")),
        );
        assert!(validate(&scale, &Features::default()).allowed);
    }

    #[test]
    fn fleet_rolling_update_bounds() {
        let fleet = json!({
            "apiVersion": "agones.dev/v1",
            "kind": "Fleet",
            "metadata": { "name": "fleet", "namespace": "default" },
            "spec": {
                "replicas": 2,
                "strategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": { "maxSurge": "0%", "maxUnavailable": "25%" }
                },
                "template": {
                    "spec": {
                        "template": { "spec": { "containers": [{ "name": "game", "image": "game:1" }] } }
                    }
                }
            }
        });

        let request = request("Fleet", "CREATE", fleet, None);
        assert!(!validate(&request, &Features::default()).allowed);
    }

    #[test]
    fn unknown_kinds_pass_through() {
        let request = request(
            "ConfigMap",
            "CREATE",
            json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" } }),
            None,
        );
        assert!(mutate(&request, &Features::default()).allowed);
        assert!(validate(&request, &Features::default()).allowed);
    }
}
