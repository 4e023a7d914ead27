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

use crate::{
    apis::{Fleet, GameServer, GameServerAllocation, GameServerAllocationPolicy, GameServerSet},
    config::Config,
};

/// Generates JSON schema files for the configuration file and the custom
/// resources.
#[derive(clap::Args, Clone, Debug)]
pub struct GenerateConfigSchema {
    /// The directory to write schema files.
    #[clap(short, long, default_value = ".")]
    pub output_directory: std::path::PathBuf,
}

impl GenerateConfigSchema {
    pub fn generate_config_schema(&self) -> crate::Result<()> {
        let schemas = [
            ("config", schemars::schema_for!(Config)),
            ("gameserver", schemars::schema_for!(GameServer)),
            ("gameserverset", schemars::schema_for!(GameServerSet)),
            ("fleet", schemars::schema_for!(Fleet)),
            ("gameserverallocation", schemars::schema_for!(GameServerAllocation)),
            ("gameserverallocationpolicy", schemars::schema_for!(GameServerAllocationPolicy)),
        ];

        for (id, schema) in schemas {
            let mut path = self.output_directory.join(id);
            path.set_extension("yaml");

            tracing::info!("Writing {id} schema to {}", path.display());

            std::fs::write(path, serde_yaml::to_string(&schema)?)?;
        }

        Ok(())
    }
}
