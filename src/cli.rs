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

mod allocator;
mod controller;
mod generate_config_schema;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::{Config, Features},
    signal::{self, ShutdownRx},
};

pub use self::{
    allocator::Allocator, controller::Controller, generate_config_schema::GenerateConfigSchema,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ETC_CONFIG_PATH: &str = "/etc/agones/agones.yaml";

/// The Command-Line Interface for the game server controller and allocator.
#[derive(clap::Parser)]
#[clap(version, about)]
#[non_exhaustive]
pub struct Cli {
    /// The path to the configuration file.
    #[clap(short, long, env = "AGONES_CONFIG", default_value = "agones.yaml")]
    pub config: PathBuf,
    /// Whether to report any logs to stdout/stderr.
    #[clap(short, long, env)]
    pub quiet: bool,
    /// Overrides the feature gates from the configuration file, e.g.
    /// `CountsAndLists=true&PlayerAllocationFilter=true`.
    #[clap(long, env = "FEATURE_GATES")]
    pub feature_gates: Option<String>,
    /// Lowest host port handed out to dynamic ports.
    #[clap(long, env = "MIN_PORT")]
    pub min_port: Option<u16>,
    /// Highest host port handed out to dynamic ports.
    #[clap(long, env = "MAX_PORT")]
    pub max_port: Option<u16>,
    #[clap(subcommand)]
    pub command: Commands,
}

/// The various commands.
#[derive(Clone, clap::Subcommand)]
pub enum Commands {
    Controller(Controller),
    Allocator(Allocator),
    GenerateConfigSchema(GenerateConfigSchema),
}

impl Commands {
    async fn run(
        self,
        config: Arc<Config>,
        features: Features,
        shutdown: ShutdownRx,
    ) -> crate::Result<()> {
        match self {
            Self::Controller(controller) => controller.run(config, features, shutdown).await,
            Self::Allocator(allocator) => allocator.run(config, features, shutdown).await,
            Self::GenerateConfigSchema(generator) => generator.generate_config_schema(),
        }
    }
}

impl Cli {
    /// Drives the application lifecycle using the command line arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(
            version = &*version,
            commit = option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
            "Starting agones-allocator"
        );

        let mut config = Self::read_config(&self.config)?;
        if let Some(feature_gates) = self.feature_gates {
            config.feature_gates = feature_gates;
        }
        if let Some(min_port) = self.min_port {
            config.min_port = min_port;
        }
        if let Some(max_port) = self.max_port {
            config.max_port = max_port;
        }
        config.validate()?;
        let features = config.features()?;
        tracing::info!(?features, "feature gates");

        let config = Arc::new(config);
        let mut shutdown_rx = signal::spawn_handler();

        let command = self.command;
        let fut = tryhard::retry_fn({
            let shutdown_rx = shutdown_rx.clone();
            move || {
                command
                    .clone()
                    .run(config.clone(), features, shutdown_rx.clone())
            }
        })
        .retries(3)
        .on_retry(|_, _, error| {
            let error = error.to_string();
            async move {
                tracing::warn!(%error, "error would have caused fatal crash");
            }
        });

        tokio::select! {
            result = fut => result,
            _ = shutdown_rx.changed() => Ok(())
        }
    }

    /// Reads the configuration file, falling back to the `/etc` path and
    /// then to defaults when neither exists.
    fn read_config<A: AsRef<Path>>(path: A) -> Result<Config, eyre::Error> {
        let path = path.as_ref();
        let from_reader = |file| Config::from_reader(file).map_err(From::from);

        match std::fs::File::open(path) {
            Ok(file) => (from_reader)(file),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path=%path.display(), "provided path not found");
                match cfg!(unix).then(|| std::fs::File::open(ETC_CONFIG_PATH)) {
                    Some(Ok(file)) => (from_reader)(file),
                    Some(Err(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                        tracing::debug!(path=%path.display(), "/etc path not found");
                        Ok(Config::default())
                    }
                    Some(Err(error)) => Err(error.into()),
                    None => Ok(Config::default()),
                }
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_subcommands_and_overrides() {
        let cli = Cli::parse_from([
            "agones-allocator",
            "--quiet",
            "--feature-gates",
            "PlayerAllocationFilter=true",
            "allocator",
            "--namespace",
            "games",
        ]);

        assert!(cli.quiet);
        assert_eq!(Some("PlayerAllocationFilter=true"), cli.feature_gates.as_deref());
        assert!(matches!(cli.command, Commands::Allocator(ref allocator) if allocator.namespace == "games"));
    }

    #[test]
    fn missing_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Cli::read_config(dir.path().join("missing.yaml")).unwrap();
        if !Path::new(ETC_CONFIG_PATH).exists() {
            assert_eq!(Config::default(), config);
        }
    }

    #[test]
    fn reads_yaml_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "minPort: 9000\nmaxPort: 9100\nfeatureGates: CountsAndLists=false").unwrap();

        let config = Cli::read_config(file.path()).unwrap();
        assert_eq!(9000, config.min_port);
        assert_eq!(9100, config.max_port);
        assert!(!config.features().unwrap().counts_and_lists);
    }
}
