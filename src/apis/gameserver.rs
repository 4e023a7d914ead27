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

use std::{cmp::Ordering, collections::BTreeMap};

use k8s_openapi::{
    api::core::v1::{
        Affinity, Container, ContainerPort, HTTPGetAction, Pod, PodAffinity, PodAffinityTerm,
        PodSpec, PodTemplateSpec, Probe, WeightedPodAffinityTerm,
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceValidation,
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta, Time},
        util::intstr::IntOrString,
    },
};
use kube::core::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    MetaPatch, Priority, PriorityOrder, PriorityType, SchedulingStrategy, ValidationError,
    ValidationErrors,
};

/// Port the sidecar serves health checks on, proxied to the game server.
pub const HEALTH_PORT: i32 = 8080;
pub const HEALTH_PATH: &str = "/gshealthz";
/// Largest capacity a list may declare.
pub const MAX_LIST_CAPACITY: i64 = 1000;

/// A single dedicated game server, backed by exactly one pod.
#[derive(Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServer {
    #[schemars(skip)]
    pub metadata: ObjectMeta,
    pub spec: GameServerSpec,
    pub status: Option<GameServerStatus>,
}

#[derive(Clone, Debug, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
struct Inner {
    #[schemars(skip)]
    #[serde(default)]
    metadata: ObjectMeta,
    spec: GameServerSpec,
    #[serde(default)]
    status: Option<GameServerStatus>,
}

impl<'de> serde::Deserialize<'de> for GameServer {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let value = serde_json::Value::deserialize(de)?;

        serde_json::from_value::<Inner>(value)
            .map_err(|error| {
                tracing::trace!(%error, "gameserver failed to deserialize");
                Error::custom(error)
            })
            .map(
                |Inner {
                     metadata,
                     spec,
                     status,
                 }| Self {
                    metadata,
                    spec,
                    status,
                },
            )
    }
}

impl serde::Serialize for GameServer {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut obj = ser.serialize_struct("GameServer", 5)?;
        obj.serialize_field("apiVersion", &GameServer::api_version(&()))?;
        obj.serialize_field("kind", &GameServer::kind(&()))?;
        obj.serialize_field("metadata", &self.metadata)?;
        obj.serialize_field("spec", &self.spec)?;
        obj.serialize_field("status", &self.status)?;
        obj.end()
    }
}

impl Resource for GameServer {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        "agones.dev".into()
    }

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "GameServer".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        "v1".into()
    }

    fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
        "agones.dev/v1".into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "gameservers".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl kube::core::crd::v1::CustomResourceExt for GameServer {
    fn crd() -> CustomResourceDefinition {
        let open_api_v3_schema = schemars::gen::SchemaSettings::openapi3()
            .with(|s| {
                s.inline_subschemas = true;
                s.meta_schema = None;
            })
            .with_visitor(kube::core::schema::StructuralSchemaRewriter)
            .into_generator()
            .into_root_schema_for::<Self>();

        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some("gameservers.agones.dev".into()),
                ..<_>::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: "agones.dev".into(),
                scope: "Namespaced".into(),
                names: CustomResourceDefinitionNames {
                    plural: "gameservers".into(),
                    singular: Some("gameserver".into()),
                    kind: "GameServer".into(),
                    short_names: Some(vec!["gs".into()]),
                    ..<_>::default()
                },
                versions: vec![CustomResourceDefinitionVersion {
                    name: "v1".into(),
                    served: true,
                    storage: true,
                    schema: Some(CustomResourceValidation {
                        // k8s and schemars have different root JSON schema
                        // types, the JSON representation is shared.
                        open_api_v3_schema: serde_json::to_value(&open_api_v3_schema)
                            .and_then(serde_json::from_value)
                            .ok(),
                    }),
                    ..<_>::default()
                }],
                ..<_>::default()
            },
            status: None,
        }
    }

    fn crd_name() -> &'static str {
        "gameservers.agones.dev"
    }

    fn api_resource() -> kube::core::dynamic::ApiResource {
        kube::core::dynamic::ApiResource::erase::<Self>(&())
    }

    fn shortnames() -> &'static [&'static str] {
        &["gs"]
    }
}

impl kube::core::object::HasSpec for GameServer {
    type Spec = GameServerSpec;

    fn spec(&self) -> &GameServerSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut GameServerSpec {
        &mut self.spec
    }
}

impl kube::core::object::HasStatus for GameServer {
    type Status = GameServerStatus;

    fn status(&self) -> Option<&GameServerStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<GameServerStatus> {
        &mut self.status
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Container specifies which Pod container is the game server. Only
    /// required if there is more than one container defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Ports are the array of ports that can be exposed via the game server
    #[serde(default)]
    pub ports: Vec<GameServerPort>,
    /// Configures health checking
    #[serde(default)]
    pub health: Health,
    /// Scheduling strategy. Defaults to "Packed"
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Specifies parameters for the SDK Server sidecar container.
    #[serde(default)]
    pub sdk_server: SdkServer,
    /// Describes the Pod that will be created for the [`GameServer`].
    #[serde(default)]
    pub template: PodTemplateSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<PlayersSpec>,
    /// Initial state of each named counter.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,
    /// Initial state of each named list.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<Eviction>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Health {
    /// Whether health checking is disabled or not
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in
    #[serde(rename = "periodSeconds", default = "default_period_seconds")]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy
    #[serde(rename = "failureThreshold", default = "default_failure_threshold")]
    pub failure_threshold: i32,
    /// Initial delay before checking health
    #[serde(
        rename = "initialDelaySeconds",
        default = "default_initial_delay_seconds"
    )]
    pub initial_delay_seconds: i32,
}

fn default_period_seconds() -> i32 {
    5
}
fn default_initial_delay_seconds() -> i32 {
    5
}
fn default_failure_threshold() -> i32 {
    3
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            period_seconds: default_period_seconds(),
            failure_threshold: default_failure_threshold(),
            initial_delay_seconds: default_initial_delay_seconds(),
        }
    }
}

/// Defines a set of Ports that are to be exposed via the [`GameServer`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// Name is the descriptive name of the port
    pub name: String,
    /// PortPolicy defines the policy for how the HostPort is populated.
    /// Dynamic port will allocate a HostPort within the configured port
    /// range. When `Static` portPolicy is specified, `HostPort` is required,
    /// to specify the port that game clients will connect to
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// The name of the container on which to open the port. Defaults to the
    /// game server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// The port that is being opened on the specified container's process
    #[serde(default)]
    pub container_port: u16,
    /// The port exposed on the host for clients to connect to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    /// Protocol is the network protocol being used. Defaults to UDP. TCP and TCPUDP are other options.
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PortPolicy {
    /// The user defines the host port to be used in the configuration.
    Static,
    /// The system will choose an open port for the [`GameServer`] in question.
    #[default]
    Dynamic,
    /// Dynamically sets the container port to the same value as the dynamically
    /// selected host port.
    Passthrough,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "TCPUDP")]
    UdpTcp,
}

impl Protocol {
    fn as_k8s(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            // Expanded into a TCP and a UDP port during port allocation.
            Self::UdpTcp => "UDP",
        }
    }
}

/// Parameters for the SDK Server sidecar container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdkServer {
    /// LogLevel for SDK server (sidecar) logs. Defaults to "Info"
    #[serde(default)]
    pub log_level: SdkServerLogLevel,
    /// GRPCPort is the port on which the SDK Server binds the gRPC server to accept incoming connections
    #[serde(default = "default_sdk_grpc_port")]
    pub grpc_port: u16,
    /// HTTPPort is the port on which the SDK Server binds the HTTP gRPC gateway server to accept incoming connections
    #[serde(default = "default_sdk_http_port")]
    pub http_port: u16,
}

fn default_sdk_grpc_port() -> u16 {
    9357
}
fn default_sdk_http_port() -> u16 {
    9358
}

impl Default for SdkServer {
    fn default() -> Self {
        Self {
            log_level: Default::default(),
            grpc_port: default_sdk_grpc_port(),
            http_port: default_sdk_http_port(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SdkServerLogLevel {
    /// Output all messages except for debug messages.
    #[default]
    Info,
    /// Output all messages including debug messages.
    Debug,
    /// Only output error messages.
    Error,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayersSpec {
    #[serde(default)]
    pub initial_capacity: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CounterStatus {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub capacity: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ListStatus {
    #[serde(default)]
    pub capacity: i64,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EvictionSafe {
    Always,
    OnUpgrade,
    #[default]
    Never,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Eviction {
    #[serde(default)]
    pub safe: EvictionSafe,
}

/// The status for a [`GameServer`] resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current state of a [`GameServer`].
    pub state: GameServerState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<PlayerStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<Eviction>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PlayerStatus {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub capacity: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
pub enum GameServerState {
    /// A dynamically allocating GameServer is being created, an open port needs
    /// to be allocated
    PortAllocation,
    /// The Pod for the GameServer is being created.
    #[default]
    Creating,
    /// The Pods for the GameServer are being created but are not yet Scheduled
    Starting,
    /// We have determined that the Pod has been scheduled in the cluster --
    /// basically, we have a NodeName
    Scheduled,
    /// The GameServer has declared that it is ready
    RequestReady,
    /// The GameServer is ready to take connections from game clients.
    Ready,
    /// The GameServer has shutdown and everything needs to be deleted from the cluster
    Shutdown,
    /// Something has gone wrong with the Gameserver and it cannot be resolved
    Error,
    /// The GameServer has failed its health checks
    Unhealthy,
    /// The GameServer is reserved and therefore can be allocated but not removed
    Reserved,
    /// The GameServer has been allocated to a session
    Allocated,
}

impl GameServerState {
    /// States that come before `Ready` in the lifecycle.
    pub fn is_before_ready(self) -> bool {
        matches!(
            self,
            Self::PortAllocation
                | Self::Creating
                | Self::Starting
                | Self::Scheduled
                | Self::RequestReady
        )
    }

    /// States in which the backing pod is expected to exist.
    pub fn has_pod(self) -> bool {
        matches!(
            self,
            Self::Starting
                | Self::Scheduled
                | Self::RequestReady
                | Self::Ready
                | Self::Reserved
                | Self::Allocated
                | Self::Unhealthy
        )
    }
}

/// The port that was allocated to a GameServer.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GameServerStatusPort {
    pub name: String,
    pub port: u16,
}

/// The template a replica group stamps game servers out of.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct GameServerTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: GameServerSpec,
}

/// Failures applying counter and list changes to a game server.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CountsAndListsError {
    #[error("{kind} {name:?} not found in game server")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name:?}: {detail}")]
    OutOfRange {
        kind: &'static str,
        name: String,
        detail: String,
    },
    #[error("unknown counter action {0:?}, expected Increment or Decrement")]
    UnknownAction(String),
}

pub const COUNTER_INCREMENT: &str = "Increment";
pub const COUNTER_DECREMENT: &str = "Decrement";

impl GameServer {
    pub fn new(name: &str, spec: GameServerSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// The lifecycle state, `None` for a game server that was never reconciled.
    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().map(|status| status.state)
    }

    pub fn is_state(&self, state: GameServerState) -> bool {
        self.state() == Some(state)
    }

    pub fn is_allocated(&self) -> bool {
        self.is_state(GameServerState::Allocated)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Game servers that have not yet reached `Ready`, including blank ones.
    pub fn is_before_ready(&self) -> bool {
        self.state().map_or(true, GameServerState::is_before_ready)
    }

    pub fn node_name(&self) -> &str {
        self.status
            .as_ref()
            .map_or("", |status| status.node_name.as_str())
    }

    pub fn status_mut(&mut self) -> &mut GameServerStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn set_state(&mut self, state: GameServerState) {
        self.status_mut().state = state;
    }

    pub fn needs_port_allocation(&self) -> bool {
        self.spec.ports.iter().any(|port| {
            matches!(
                port.port_policy,
                PortPolicy::Dynamic | PortPolicy::Passthrough
            )
        })
    }

    /// The name of the container running the game server process.
    pub fn container_name(&self) -> Option<&str> {
        self.spec.container.as_deref().or_else(|| {
            match self.spec.template.spec.as_ref().map(|spec| &*spec.containers) {
                Some([container]) => Some(container.name.as_str()),
                _ => None,
            }
        })
    }

    /// Fills in defaults and, for a game server that was never reconciled,
    /// its initial status.
    pub fn apply_defaults(&mut self) {
        if self.spec.container.is_none() {
            self.spec.container = self.container_name().map(String::from);
        }

        let container = self.spec.container.clone();
        for port in &mut self.spec.ports {
            if port.container.is_none() {
                port.container = container.clone();
            }
        }

        if self.spec.eviction.is_none() {
            self.spec.eviction = Some(Eviction::default());
        }

        if self.status.is_none() {
            let state = if self.needs_port_allocation() {
                GameServerState::PortAllocation
            } else {
                GameServerState::Creating
            };

            self.status = Some(GameServerStatus {
                state,
                players: self.spec.players.as_ref().map(|players| PlayerStatus {
                    capacity: players.initial_capacity,
                    ..<_>::default()
                }),
                counters: self.spec.counters.clone(),
                lists: self.spec.lists.clone(),
                eviction: self.spec.eviction.clone(),
                ..<_>::default()
            });
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let containers: Vec<&str> = self
            .spec
            .template
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter().map(|c| c.name.as_str()))
            .collect();

        match self.spec.container.as_deref() {
            None if containers.len() > 1 => errors.push(ValidationError::invalid(
                "spec.container",
                "container is required when using multiple containers",
            )),
            None if containers.is_empty() => {
                errors.push(ValidationError::Required("spec.template.spec.containers".into()))
            }
            Some(name) if !containers.contains(&name) => errors.push(ValidationError::invalid(
                "spec.container",
                format!("could not find a container named {name}"),
            )),
            _ => {}
        }

        let mut names = std::collections::BTreeSet::new();
        for (index, port) in self.spec.ports.iter().enumerate() {
            let field = format!("spec.ports[{index}]");
            if !names.insert(&port.name) {
                errors.push(ValidationError::NotUnique(format!("{field}.name")));
            }

            match port.port_policy {
                PortPolicy::Static if port.host_port.is_none() => errors.push(
                    ValidationError::invalid(&field, "hostPort is required with a Static portPolicy"),
                ),
                PortPolicy::Dynamic | PortPolicy::Passthrough if port.host_port.is_some() => {
                    errors.push(ValidationError::invalid(
                        &field,
                        "hostPort cannot be specified with a Dynamic or Passthrough portPolicy",
                    ))
                }
                PortPolicy::Passthrough if port.container_port > 0 => {
                    errors.push(ValidationError::invalid(
                        &field,
                        "containerPort cannot be specified with a Passthrough portPolicy",
                    ))
                }
                _ => {}
            }

            if let Some(container) = port.container.as_deref() {
                if !containers.contains(&container) {
                    errors.push(ValidationError::invalid(
                        format!("{field}.container"),
                        format!("could not find a container named {container}"),
                    ));
                }
            }
        }

        for (name, counter) in &self.spec.counters {
            if counter.capacity < 0 || counter.count < 0 || counter.count > counter.capacity {
                errors.push(ValidationError::invalid(
                    format!("spec.counters[{name}]"),
                    "count must be within [0, capacity]",
                ));
            }
        }

        for (name, list) in &self.spec.lists {
            if !(0..=MAX_LIST_CAPACITY).contains(&list.capacity)
                || list.values.len() as i64 > list.capacity
            {
                errors.push(ValidationError::invalid(
                    format!("spec.lists[{name}]"),
                    format!("capacity must be within [0, {MAX_LIST_CAPACITY}] and hold all values"),
                ));
            }
        }

        errors.into_result()
    }

    /// The status ports derived from the spec's host ports.
    pub fn status_ports(&self) -> Vec<GameServerStatusPort> {
        self.spec
            .ports
            .iter()
            .filter_map(|port| {
                port.host_port.map(|host_port| GameServerStatusPort {
                    name: port.name.clone(),
                    port: host_port,
                })
            })
            .collect()
    }

    /// Renders the backing pod with `sidecars` appended after the
    /// template's containers.
    pub fn pod(&self, sidecars: Vec<Container>) -> Result<Pod, ValidationError> {
        let template = &self.spec.template;
        let mut metadata = template.metadata.clone().unwrap_or_default();
        let mut spec = template.spec.clone().unwrap_or_default();
        let name = self.metadata.name.clone().unwrap_or_default();

        metadata.name = Some(name.clone());
        metadata.namespace = self.metadata.namespace.clone();
        metadata.generate_name = None;
        metadata.resource_version = None;
        metadata.uid = None;
        metadata.owner_references = super::controller_reference(self).map(|owner| vec![owner]);

        let labels = metadata.labels.get_or_insert_with(Default::default);
        labels.insert(super::ROLE_LABEL.into(), super::GAME_SERVER_LABEL_ROLE.into());
        labels.insert(super::GAME_SERVER_POD_LABEL.into(), name);

        let container_name = self
            .container_name()
            .ok_or_else(|| ValidationError::Required("spec.container".into()))?
            .to_owned();

        let annotations = metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(
            super::GAME_SERVER_CONTAINER_ANNOTATION.into(),
            container_name.clone(),
        );
        annotations.insert(super::SDK_VERSION_ANNOTATION.into(), super::SDK_VERSION.into());

        for port in &self.spec.ports {
            let target = port.container.as_deref().unwrap_or(&container_name);
            let container = find_container(&mut spec, target)?;
            container
                .ports
                .get_or_insert_with(Default::default)
                .push(ContainerPort {
                    name: Some(port.name.clone()),
                    container_port: port.container_port.into(),
                    host_port: port.host_port.map(Into::into),
                    protocol: Some(port.protocol.as_k8s().into()),
                    ..<_>::default()
                });
        }

        if !self.spec.health.disabled {
            let health = &self.spec.health;
            let container = find_container(&mut spec, &container_name)?;
            if container.liveness_probe.is_none() {
                container.liveness_probe = Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some(HEALTH_PATH.into()),
                        port: IntOrString::Int(HEALTH_PORT),
                        ..<_>::default()
                    }),
                    initial_delay_seconds: Some(health.initial_delay_seconds),
                    period_seconds: Some(health.period_seconds),
                    failure_threshold: Some(health.failure_threshold),
                    ..<_>::default()
                });
            }
        }

        spec.containers.extend(sidecars);

        let mut pod = Pod {
            metadata,
            spec: Some(spec),
            status: None,
        };
        self.pod_eviction(&mut pod);
        self.pod_scheduling(&mut pod);
        Ok(pod)
    }

    fn pod_eviction(&self, pod: &mut Pod) {
        let safe = self
            .spec
            .eviction
            .as_ref()
            .map(|eviction| eviction.safe)
            .unwrap_or_default();
        let value = match safe {
            EvictionSafe::Always => "true",
            EvictionSafe::OnUpgrade | EvictionSafe::Never => "false",
        };

        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(super::SAFE_TO_EVICT_LABEL.into(), value.into());

        if self.spec.eviction.is_some() {
            pod.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .entry(super::POD_SAFE_TO_EVICT_ANNOTATION.into())
                .or_insert_with(|| value.into());
        }
    }

    fn pod_scheduling(&self, pod: &mut Pod) {
        if self.spec.scheduling != SchedulingStrategy::Packed {
            return;
        }

        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .entry(super::POD_SAFE_TO_EVICT_ANNOTATION.into())
            .or_insert_with(|| "false".into());

        let Some(spec) = pod.spec.as_mut() else {
            return;
        };

        let affinity = spec.affinity.get_or_insert_with(Affinity::default);
        let pod_affinity = affinity.pod_affinity.get_or_insert_with(PodAffinity::default);
        pod_affinity
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Default::default)
            .push(WeightedPodAffinityTerm {
                weight: 100,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(
                            [(
                                super::ROLE_LABEL.to_owned(),
                                super::GAME_SERVER_LABEL_ROLE.to_owned(),
                            )]
                            .into(),
                        ),
                        ..<_>::default()
                    }),
                    topology_key: "kubernetes.io/hostname".into(),
                    ..<_>::default()
                },
            });
    }

    /// Merges labels and annotations over the game server's own.
    pub fn patch_meta(&mut self, patch: &MetaPatch) {
        patch.apply(&mut self.metadata);
    }

    /// Remaining player capacity, when player tracking is in use.
    pub fn remaining_player_capacity(&self) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|status| status.players.as_ref())
            .map(|players| players.capacity - players.count)
    }

    pub fn counter(&self, name: &str) -> Option<&CounterStatus> {
        self.status.as_ref()?.counters.get(name)
    }

    pub fn list(&self, name: &str) -> Option<&ListStatus> {
        self.status.as_ref()?.lists.get(name)
    }

    fn counter_mut(&mut self, name: &str) -> Result<&mut CounterStatus, CountsAndListsError> {
        self.status
            .as_mut()
            .and_then(|status| status.counters.get_mut(name))
            .ok_or_else(|| CountsAndListsError::NotFound {
                kind: "counter",
                name: name.into(),
            })
    }

    fn list_mut(&mut self, name: &str) -> Result<&mut ListStatus, CountsAndListsError> {
        self.status
            .as_mut()
            .and_then(|status| status.lists.get_mut(name))
            .ok_or_else(|| CountsAndListsError::NotFound {
                kind: "list",
                name: name.into(),
            })
    }

    /// Increments or decrements a counter, keeping it within `[0, capacity]`.
    pub fn update_count(
        &mut self,
        name: &str,
        action: &str,
        amount: i64,
    ) -> Result<(), CountsAndListsError> {
        let delta = match action {
            COUNTER_INCREMENT => amount,
            COUNTER_DECREMENT => -amount,
            other => return Err(CountsAndListsError::UnknownAction(other.into())),
        };

        let counter = self.counter_mut(name)?;
        if amount < 0 {
            return Err(CountsAndListsError::OutOfRange {
                kind: "counter",
                name: name.into(),
                detail: format!("amount {amount} must be positive"),
            });
        }

        let count = counter.count + delta;
        if count < 0 || count > counter.capacity {
            return Err(CountsAndListsError::OutOfRange {
                kind: "counter",
                name: name.into(),
                detail: format!("count {count} out of range [0,{}]", counter.capacity),
            });
        }

        counter.count = count;
        Ok(())
    }

    pub fn update_counter_capacity(
        &mut self,
        name: &str,
        capacity: i64,
    ) -> Result<(), CountsAndListsError> {
        let counter = self.counter_mut(name)?;
        if capacity < 0 {
            return Err(CountsAndListsError::OutOfRange {
                kind: "counter",
                name: name.into(),
                detail: format!("capacity {capacity} must be positive"),
            });
        }

        counter.capacity = capacity;
        Ok(())
    }

    /// Sets a list's capacity, truncating values that no longer fit.
    pub fn update_list_capacity(
        &mut self,
        name: &str,
        capacity: i64,
    ) -> Result<(), CountsAndListsError> {
        let list = self.list_mut(name)?;
        if !(0..=MAX_LIST_CAPACITY).contains(&capacity) {
            return Err(CountsAndListsError::OutOfRange {
                kind: "list",
                name: name.into(),
                detail: format!("capacity {capacity} out of range [0,{MAX_LIST_CAPACITY}]"),
            });
        }

        list.capacity = capacity;
        list.values.truncate(capacity as usize);
        Ok(())
    }

    /// Appends unique values, failing if the result would exceed capacity or
    /// if every value is already present.
    pub fn append_list_values(
        &mut self,
        name: &str,
        values: &[String],
    ) -> Result<(), CountsAndListsError> {
        let list = self.list_mut(name)?;
        let mut merged = list.values.clone();
        for value in values {
            if !merged.contains(value) {
                merged.push(value.clone());
            }
        }

        if merged.len() as i64 > list.capacity {
            return Err(CountsAndListsError::OutOfRange {
                kind: "list",
                name: name.into(),
                detail: format!(
                    "appended list length {} exceeds capacity {}",
                    merged.len(),
                    list.capacity
                ),
            });
        }

        if merged.len() == list.values.len() && !values.is_empty() {
            return Err(CountsAndListsError::OutOfRange {
                kind: "list",
                name: name.into(),
                detail: "all appended values are already present".into(),
            });
        }

        list.values = merged;
        Ok(())
    }

    pub fn delete_list_values(
        &mut self,
        name: &str,
        values: &[String],
    ) -> Result<(), CountsAndListsError> {
        let list = self.list_mut(name)?;
        list.values.retain(|value| !values.contains(value));
        Ok(())
    }

    /// Available capacity of the counter or list a priority refers to.
    pub fn available(&self, priority: &Priority) -> Option<i64> {
        match priority.r#type {
            PriorityType::Counter => self
                .counter(&priority.key)
                .map(|counter| counter.capacity - counter.count),
            PriorityType::List => self
                .list(&priority.key)
                .map(|list| list.capacity - list.values.len() as i64),
        }
    }

    /// Orders two game servers by the available capacity of each priority
    /// in turn. A game server carrying a key sorts ahead of one that does not.
    pub fn compare_priorities(&self, other: &Self, priorities: &[Priority]) -> Ordering {
        for priority in priorities {
            let ordering = match (self.available(priority), other.available(priority)) {
                (Some(a), Some(b)) => match priority.order {
                    PriorityOrder::Ascending => a.cmp(&b),
                    PriorityOrder::Descending => b.cmp(&a),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    }
}

fn find_container<'spec>(
    spec: &'spec mut PodSpec,
    name: &str,
) -> Result<&'spec mut Container, ValidationError> {
    spec.containers
        .iter_mut()
        .find(|container| container.name == name)
        .ok_or_else(|| {
            ValidationError::invalid(
                "spec.container",
                format!("could not find a container named {name}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn game_server() -> GameServer {
        let mut gs = GameServer::new(
            "gs-1",
            GameServerSpec {
                ports: vec![GameServerPort {
                    name: "default".into(),
                    container_port: 7777,
                    ..<_>::default()
                }],
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "game".into(),
                            image: Some("game:latest".into()),
                            ..<_>::default()
                        }],
                        ..<_>::default()
                    }),
                    ..<_>::default()
                },
                ..<_>::default()
            },
        );
        gs.metadata.namespace = Some("default".into());
        gs.metadata.uid = Some("1234".into());
        gs
    }

    #[test]
    fn deserialize_minimal() {
        let gs: GameServer = serde_json::from_value(serde_json::json!({
            "apiVersion": "agones.dev/v1",
            "kind": "GameServer",
            "metadata": { "name": "gs" },
            "spec": {
                "ports": [{ "name": "default", "containerPort": 7654 }],
                "template": { "spec": { "containers": [{ "name": "game" }] } }
            },
            "status": { "state": "Ready", "address": "10.0.0.1", "nodeName": "n1" }
        }))
        .unwrap();

        assert_eq!(PortPolicy::Dynamic, gs.spec.ports[0].port_policy);
        assert_eq!(Protocol::Udp, gs.spec.ports[0].protocol);
        assert_eq!(Health::default(), gs.spec.health);
        assert_eq!(Some(GameServerState::Ready), gs.state());
        assert_eq!("n1", gs.node_name());

        let value = serde_json::to_value(&gs).unwrap();
        assert_eq!("GameServer", value["kind"]);
    }

    #[test]
    fn defaults_pick_initial_state() {
        let mut gs = game_server();
        gs.apply_defaults();
        assert_eq!(Some("game"), gs.spec.container.as_deref());
        assert_eq!(Some("game"), gs.spec.ports[0].container.as_deref());
        assert_eq!(Some(GameServerState::PortAllocation), gs.state());

        let mut gs = game_server();
        gs.spec.ports[0].port_policy = PortPolicy::Static;
        gs.spec.ports[0].host_port = Some(7000);
        gs.apply_defaults();
        assert_eq!(Some(GameServerState::Creating), gs.state());
        assert!(gs.validate().is_ok());
    }

    #[test]
    fn validation() {
        let mut gs = game_server();
        gs.spec.ports[0].host_port = Some(7000);
        gs.spec.ports.push(GameServerPort {
            name: "default".into(),
            port_policy: PortPolicy::Static,
            ..<_>::default()
        });
        gs.spec.container = Some("missing".into());

        let errors = gs.validate().unwrap_err().0;
        assert_eq!(4, errors.len(), "{errors:?}");
        assert!(errors.iter().any(|e| e.field() == "spec.container"));
        assert!(errors.iter().any(|e| e.field() == "spec.ports[1].name"));
    }

    #[test]
    fn pod_rendering() {
        let mut gs = game_server();
        gs.spec.ports[0].host_port = Some(7005);
        gs.apply_defaults();
        let sidecar = Container {
            name: "sidecar".into(),
            ..<_>::default()
        };

        let pod = gs.pod(vec![sidecar]).unwrap();
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!("gameserver", labels[crate::apis::ROLE_LABEL]);
        assert_eq!("gs-1", labels[crate::apis::GAME_SERVER_POD_LABEL]);
        assert_eq!("false", labels[crate::apis::SAFE_TO_EVICT_LABEL]);

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!("game", annotations[crate::apis::GAME_SERVER_CONTAINER_ANNOTATION]);
        assert_eq!("false", annotations[crate::apis::POD_SAFE_TO_EVICT_ANNOTATION]);

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!("1234", owner.uid);
        assert_eq!(Some(true), owner.controller);

        let spec = pod.spec.unwrap();
        assert_eq!(2, spec.containers.len());
        assert_eq!("sidecar", spec.containers[1].name);
        let port = &spec.containers[0].ports.as_ref().unwrap()[0];
        assert_eq!(7777, port.container_port);
        assert_eq!(Some(7005), port.host_port);
        let probe = spec.containers[0].liveness_probe.as_ref().unwrap();
        assert_eq!(Some(HEALTH_PATH.into()), probe.http_get.as_ref().unwrap().path);
        assert!(spec.affinity.unwrap().pod_affinity.is_some());
    }

    #[test]
    fn distributed_pods_skip_affinity() {
        let mut gs = game_server();
        gs.spec.scheduling = SchedulingStrategy::Distributed;
        gs.spec.eviction = Some(Eviction {
            safe: EvictionSafe::Always,
        });

        let pod = gs.pod(vec![]).unwrap();
        assert!(pod.spec.unwrap().affinity.is_none());
        assert_eq!(
            "true",
            pod.metadata.annotations.unwrap()[crate::apis::POD_SAFE_TO_EVICT_ANNOTATION]
        );
    }

    #[test]
    fn counters_and_lists() {
        let mut gs = game_server();
        gs.spec.counters.insert(
            "rooms".into(),
            CounterStatus {
                count: 1,
                capacity: 3,
            },
        );
        gs.spec.lists.insert(
            "players".into(),
            ListStatus {
                capacity: 2,
                values: vec!["a".into()],
            },
        );
        gs.apply_defaults();

        gs.update_count("rooms", COUNTER_INCREMENT, 2).unwrap();
        assert_eq!(3, gs.counter("rooms").unwrap().count);
        assert!(gs.update_count("rooms", COUNTER_INCREMENT, 1).is_err());
        assert!(gs.update_count("rooms", "Double", 1).is_err());
        assert!(gs.update_count("missing", COUNTER_DECREMENT, 1).is_err());

        gs.append_list_values("players", &["b".into()]).unwrap();
        assert!(gs.append_list_values("players", &["c".into()]).is_err());
        assert!(gs.append_list_values("players", &["a".into()]).is_err());
        gs.delete_list_values("players", &["a".into()]).unwrap();
        gs.update_list_capacity("players", 0).unwrap();
        assert!(gs.list("players").unwrap().values.is_empty());
    }

    #[test]
    fn priorities_order_by_available_capacity() {
        let with_rooms = |count| {
            let mut gs = game_server();
            gs.status_mut().counters.insert(
                "rooms".into(),
                CounterStatus {
                    count,
                    capacity: 10,
                },
            );
            gs
        };

        let full = with_rooms(9);
        let empty = with_rooms(1);
        let missing = game_server();
        let mut priorities = vec![Priority {
            r#type: PriorityType::Counter,
            key: "rooms".into(),
            order: PriorityOrder::Ascending,
        }];

        assert_eq!(Ordering::Less, full.compare_priorities(&empty, &priorities));
        assert_eq!(Ordering::Less, empty.compare_priorities(&missing, &priorities));

        priorities[0].order = PriorityOrder::Descending;
        assert_eq!(Ordering::Greater, full.compare_priorities(&empty, &priorities));
        assert_eq!(Ordering::Less, full.compare_priorities(&missing, &priorities));
    }
}
