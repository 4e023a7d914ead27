/*
 * Copyright 2020 Google LLC All Rights Reserved.
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

//! Process configuration, loaded from YAML and overridden by CLI flags.

pub mod features;

use std::{io, net::SocketAddr, path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::{ValidationError, ValidationErrors};

pub use self::features::Features;

/// Config is the configuration for the controller and allocator processes.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Lowest host port handed out to dynamic ports.
    pub min_port: u16,
    /// Highest host port handed out to dynamic ports.
    pub max_port: u16,
    pub sidecar: Sidecar,
    pub controller: Controller,
    pub allocation: Allocation,
    /// Feature gates, e.g. `CountsAndLists=true&PlayerAllocationFilter=false`.
    pub feature_gates: String,
    pub grpc: Grpc,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_port: 7000,
            max_port: 8000,
            sidecar: <_>::default(),
            controller: <_>::default(),
            allocation: <_>::default(),
            feature_gates: String::new(),
            grpc: <_>::default(),
        }
    }
}

/// The sidecar container appended to every game server pod.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Sidecar {
    pub image: String,
    pub always_pull: bool,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for Sidecar {
    fn default() -> Self {
        Self {
            image: format!(
                "us-docker.pkg.dev/agones-images/release/agones-sdk:{}",
                crate::apis::SDK_VERSION
            ),
            always_pull: false,
            cpu_request: "30m".into(),
            cpu_limit: "0".into(),
            memory_request: "0".into(),
            memory_limit: "0".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Controller {
    pub game_server_workers: usize,
    pub game_server_set_workers: usize,
    pub fleet_workers: usize,
    /// Period between full replays of every watched object.
    pub resync_period_secs: u64,
    /// Most game servers a set creates in one reconcile.
    pub max_creations_per_batch: usize,
    /// Most game servers a set deletes in one reconcile.
    pub max_deletions_per_batch: usize,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            game_server_workers: 16,
            game_server_set_workers: 8,
            fleet_workers: 8,
            resync_period_secs: 30,
            max_creations_per_batch: 64,
            max_deletions_per_batch: 64,
        }
    }
}

impl Controller {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Allocation {
    /// Capacity of the channel feeding the batch loop.
    pub pending_capacity: usize,
    /// Quiet window the batch loop waits for more requests.
    pub batch_wait_time_ms: u64,
    /// Selections after which the batch loop takes a fresh snapshot.
    pub refresh_every: usize,
    pub update_workers: usize,
    pub retry: Retry,
    /// Upper bound on a whole allocation, retries included.
    pub total_timeout_ms: u64,
    pub remote_allocation_timeout_ms: u64,
    pub total_remote_allocation_timeout_ms: u64,
    pub remote_retry: Retry,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            pending_capacity: 100,
            batch_wait_time_ms: 5,
            refresh_every: 100,
            update_workers: 8,
            retry: Retry {
                steps: 5,
                base_ms: 10,
                factor: 1.0,
                jitter: 0.1,
            },
            total_timeout_ms: 30_000,
            remote_allocation_timeout_ms: 1_000,
            total_remote_allocation_timeout_ms: 5_000,
            remote_retry: Retry {
                steps: 7,
                base_ms: 100,
                factor: 2.0,
                jitter: 0.0,
            },
        }
    }
}

impl Allocation {
    pub fn batch_wait_time(&self) -> Duration {
        Duration::from_millis(self.batch_wait_time_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn remote_allocation_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_allocation_timeout_ms)
    }

    pub fn total_remote_allocation_timeout(&self) -> Duration {
        Duration::from_millis(self.total_remote_allocation_timeout_ms)
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Retry {
    /// Total attempts, including the first.
    pub steps: u32,
    pub base_ms: u64,
    pub factor: f64,
    /// Fraction of each delay added as random jitter.
    pub jitter: f64,
}

impl Retry {
    /// The delay before attempt `attempt`, counting from 1, without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        Duration::from_millis(self.base_ms).mul_f64(self.factor.max(1.0).powi(exponent))
    }

    /// [`Retry::delay`] with jitter drawn from `rng`.
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl rand::Rng) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        delay + delay.mul_f64(rng.gen_range(0.0..self.jitter))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Grpc {
    pub address: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,
    /// How often the processor asks connected clients for their batches.
    pub pull_interval_ms: u64,
}

impl Default for Grpc {
    fn default() -> Self {
        Self {
            address: (std::net::Ipv4Addr::UNSPECIFIED, 8443).into(),
            tls: None,
            pull_interval_ms: 200,
        }
    }
}

impl Grpc {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }
}

/// Server certificate and, for mutual TLS, the client CA.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Tls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_file: Option<PathBuf>,
}

impl Config {
    /// from_reader returns a config from a given Reader
    pub fn from_reader<R: io::Read>(input: R) -> Result<Config, serde_yaml::Error> {
        serde_yaml::from_reader(input)
    }

    /// Parses the feature gates on top of the defaults.
    pub fn features(&self) -> Result<Features, features::ParseError> {
        self.feature_gates.parse()
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.min_port == 0 || self.min_port > self.max_port {
            errors.push(ValidationError::invalid(
                "minPort",
                "must be positive and no greater than maxPort",
            ));
        }

        let workers = [
            ("controller.gameServerWorkers", self.controller.game_server_workers),
            ("controller.gameServerSetWorkers", self.controller.game_server_set_workers),
            ("controller.fleetWorkers", self.controller.fleet_workers),
            ("allocation.updateWorkers", self.allocation.update_workers),
            ("allocation.pendingCapacity", self.allocation.pending_capacity),
            ("allocation.refreshEvery", self.allocation.refresh_every),
        ];
        for (field, value) in workers {
            if value == 0 {
                errors.push(ValidationError::invalid(field, "must be at least 1"));
            }
        }

        for (field, retry) in [
            ("allocation.retry", &self.allocation.retry),
            ("allocation.remoteRetry", &self.allocation.remote_retry),
        ] {
            if retry.steps == 0 || !(0.0..1.0).contains(&retry.jitter) {
                errors.push(ValidationError::invalid(
                    field,
                    "steps must be at least 1 and jitter within [0, 1)",
                ));
            }
        }

        if let Err(error) = self.features() {
            errors.push(ValidationError::invalid("featureGates", error.to_string()));
        }

        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(Features::default(), config.features().unwrap());
    }

    #[test]
    fn parse_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "
minPort: 10
maxPort: 20
featureGates: PlayerAllocationFilter=true
allocation:
  updateWorkers: 2
grpc:
  address: 127.0.0.1:9000
"
        )
        .unwrap();

        let config = Config::from_reader(std::fs::File::open(file.path()).unwrap()).unwrap();
        assert_eq!(10, config.min_port);
        assert_eq!(2, config.allocation.update_workers);
        assert_eq!(100, config.allocation.pending_capacity);
        assert_eq!(9000, config.grpc.address.port());
        assert!(config.features().unwrap().player_allocation_filter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_ranges() {
        assert!(Config::from_reader("minPorts: 10".as_bytes()).is_err());

        let config = Config {
            min_port: 30,
            max_port: 20,
            feature_gates: "Teleport=true".into(),
            ..<_>::default()
        };
        assert_eq!(2, config.validate().unwrap_err().0.len());
    }

    #[test]
    fn retry_delays() {
        let retry = Allocation::default().remote_retry;
        assert_eq!(Duration::from_millis(100), retry.delay(1));
        assert_eq!(Duration::from_millis(400), retry.delay(3));

        let retry = Allocation::default().retry;
        assert_eq!(Duration::from_millis(10), retry.delay(4));
        let jittered = retry.jittered_delay(1, &mut rand::thread_rng());
        assert!(jittered >= Duration::from_millis(10) && jittered < Duration::from_millis(11));
    }
}
