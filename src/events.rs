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

//! Kubernetes events describing what the controllers and the allocator did
//! to an object.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter},
    Client, Resource,
};
use parking_lot::Mutex;

pub const ALLOCATED: &str = "Allocated";
pub const COUNTER_ACTION_ERROR: &str = "CounterActionError";
pub const LIST_ACTION_ERROR: &str = "ListActionError";
pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
pub const CREATING_GAME_SERVER_SET: &str = "CreatingGameServerSet";
pub const SCALING_GAME_SERVER_SET: &str = "ScalingGameServerSet";
pub const DELETING_GAME_SERVER_SET: &str = "DeletingGameServerSet";

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Severity {
    Normal,
    Warning,
}

/// A single event about an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub severity: Severity,
    pub reason: String,
    pub note: String,
}

impl Event {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            severity: Severity::Normal,
            reason: reason.into(),
            note: note.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            reason: reason.into(),
            note: note.into(),
        }
    }
}

/// Where events end up. Recording never fails the caller, implementations
/// log what they could not publish.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync + 'static {
    async fn record(&self, reference: ObjectReference, event: Event);
}

pub type DynRecorder = Arc<dyn EventRecorder>;

/// Records `event` against `object`.
pub async fn record<K: Resource<DynamicType = ()>>(
    recorder: &dyn EventRecorder,
    object: &K,
    event: Event,
) {
    recorder.record(object.object_ref(&()), event).await;
}

/// Publishes events through the Kubernetes events API.
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, reference: ObjectReference, event: Event) {
        let name = reference.name.clone().unwrap_or_default();
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let result = recorder
            .publish(KubeEvent {
                type_: match event.severity {
                    Severity::Normal => EventType::Normal,
                    Severity::Warning => EventType::Warning,
                },
                reason: event.reason.clone(),
                note: Some(event.note),
                action: event.reason,
                secondary: None,
            })
            .await;

        if let Err(error) = result {
            tracing::warn!(%error, object = %name, "failed to publish event");
        }
    }
}

/// An event kept by [`MemoryRecorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recorded {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub event: Event,
}

/// Keeps every event in memory, for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// The reasons recorded against the named object, in order.
    pub fn reasons(&self, namespace: &str, name: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|recorded| recorded.namespace == namespace && recorded.name == name)
            .map(|recorded| recorded.event.reason.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, reference: ObjectReference, event: Event) {
        tracing::debug!(
            kind = reference.kind.as_deref().unwrap_or_default(),
            name = reference.name.as_deref().unwrap_or_default(),
            reason = %event.reason,
            note = %event.note,
            "event"
        );

        self.events.lock().push(Recorded {
            kind: reference.kind.unwrap_or_default(),
            namespace: reference.namespace.unwrap_or_default(),
            name: reference.name.unwrap_or_default(),
            event,
        });
    }
}
