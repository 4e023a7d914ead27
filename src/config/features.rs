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

use std::{fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const STATE_ALLOCATION_FILTER: &str = "StateAllocationFilter";
const PLAYER_ALLOCATION_FILTER: &str = "PlayerAllocationFilter";
const COUNTS_AND_LISTS: &str = "CountsAndLists";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown feature gate {0:?}")]
    UnknownFeature(String),
    #[error("feature gate {name:?} has invalid value {value:?}, expected true or false")]
    InvalidValue { name: String, value: String },
}

/// Optional behaviour, handed to every component that needs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// Selectors may match `Allocated` game servers, which stay allocatable.
    pub state_allocation_filter: bool,
    /// Selectors may filter on remaining player capacity.
    pub player_allocation_filter: bool,
    /// Counters, lists and priorities on game servers and allocations.
    pub counts_and_lists: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            state_allocation_filter: true,
            player_allocation_filter: false,
            counts_and_lists: true,
        }
    }
}

impl Features {
    fn gate_mut(&mut self, name: &str) -> Option<&mut bool> {
        match name {
            STATE_ALLOCATION_FILTER => Some(&mut self.state_allocation_filter),
            PLAYER_ALLOCATION_FILTER => Some(&mut self.player_allocation_filter),
            COUNTS_AND_LISTS => Some(&mut self.counts_and_lists),
            _ => None,
        }
    }
}

/// Parses `Name=true&Other=false` on top of [`Features::default`].
impl FromStr for Features {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut features = Self::default();
        for (name, value) in form_urlencoded::parse(input.trim().as_bytes()) {
            let enabled = value.parse::<bool>().map_err(|_| ParseError::InvalidValue {
                name: name.to_string(),
                value: value.to_string(),
            })?;

            *features
                .gate_mut(&name)
                .ok_or_else(|| ParseError::UnknownFeature(name.to_string()))? = enabled;
        }

        Ok(features)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{STATE_ALLOCATION_FILTER}={}&{PLAYER_ALLOCATION_FILTER}={}&{COUNTS_AND_LISTS}={}",
            self.state_allocation_filter, self.player_allocation_filter, self.counts_and_lists
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(Features::default(), "".parse().unwrap());

        let features: Features = "CountsAndLists=false&PlayerAllocationFilter=true"
            .parse()
            .unwrap();
        assert!(!features.counts_and_lists);
        assert!(features.player_allocation_filter);
        assert!(features.state_allocation_filter);

        assert_eq!(features, features.to_string().parse().unwrap());
    }

    #[test]
    fn errors() {
        assert_eq!(
            Err(ParseError::UnknownFeature("Teleport".into())),
            "Teleport=true".parse::<Features>()
        );
        assert_eq!(
            Err(ParseError::InvalidValue {
                name: "CountsAndLists".into(),
                value: "maybe".into()
            }),
            "CountsAndLists=maybe".parse::<Features>()
        );
    }
}
