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

//! Label selectors, in both their structured (`matchLabels` /
//! `matchExpressions`) and string (`a=b,c notin (d)`) forms.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use once_cell::sync::Lazy;
use regex::Regex;

const QUALIFIED_NAME_MAX_LENGTH: usize = 63;
const DNS_SUBDOMAIN_MAX_LENGTH: usize = 253;

static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap());
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid label key {0:?}")]
    InvalidKey(String),
    #[error("invalid label value {0:?}")]
    InvalidValue(String),
    #[error("unknown selector operator {0:?}")]
    UnknownOperator(String),
    #[error("operator {operator} on {key:?} requires {expected}")]
    ValueCount {
        key: String,
        operator: Operator,
        expected: &'static str,
    },
    #[error("unable to parse selector term {0:?}")]
    Parse(String),
}

/// Checks a label key: an optional DNS subdomain prefix and a qualified name.
pub fn validate_label_key(key: &str) -> Result<(), Error> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    let prefix_valid = prefix.map_or(true, |prefix| {
        !prefix.is_empty()
            && prefix.len() <= DNS_SUBDOMAIN_MAX_LENGTH
            && DNS_SUBDOMAIN.is_match(prefix)
    });

    if prefix_valid && name.len() <= QUALIFIED_NAME_MAX_LENGTH && QUALIFIED_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.into()))
    }
}

/// Checks a label value, which may be empty.
pub fn validate_label_value(value: &str) -> Result<(), Error> {
    if value.is_empty()
        || (value.len() <= QUALIFIED_NAME_MAX_LENGTH && QUALIFIED_NAME.is_match(value))
    {
        Ok(())
    } else {
        Err(Error::InvalidValue(value.into()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Operator {
    #[strum(serialize = "=")]
    Equals,
    #[strum(serialize = "!=")]
    NotEquals,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "notin")]
    NotIn,
    #[strum(serialize = "exists")]
    Exists,
    #[strum(serialize = "!")]
    DoesNotExist,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = String>,
    ) -> Result<Self, Error> {
        let key = key.into();
        let values: BTreeSet<String> = values.into_iter().collect();
        validate_label_key(&key)?;

        let expected = match operator {
            Operator::Equals | Operator::NotEquals if values.len() != 1 => Some("exactly one value"),
            Operator::In | Operator::NotIn if values.is_empty() => Some("at least one value"),
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => Some("no values"),
            _ => None,
        };

        if let Some(expected) = expected {
            return Err(Error::ValueCount {
                key,
                operator,
                expected,
            });
        }

        for value in &values {
            validate_label_value(value)?;
        }

        Ok(Self {
            key,
            operator,
            values,
        })
    }

    /// An equality requirement on a label this crate sets itself, so no
    /// validation is needed.
    pub fn equals(key: &str, value: &str) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Equals,
            values: [value.to_owned()].into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => value.map_or(false, |v| self.values.contains(v)),
            Operator::NotEquals | Operator::NotIn => {
                value.map_or(true, |v| !self.values.contains(v))
            }
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Equals | Operator::NotEquals => {
                write!(f, "{}{}{}", self.key, self.operator, values())
            }
            Operator::In | Operator::NotIn => {
                write!(f, "{} {} ({})", self.key, self.operator, values())
            }
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A parsed label selector. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Vec<Requirement>);

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// A selector requiring each label to equal the given value.
    pub fn from_labels<'a>(
        labels: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, Error> {
        labels
            .into_iter()
            .map(|(key, value)| Requirement::new(key.clone(), Operator::Equals, [value.clone()]))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.0.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|requirement| requirement.matches(labels))
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = Error;

    fn try_from(selector: &LabelSelector) -> Result<Self, Self::Error> {
        let mut requirements = Self::from_labels(selector.match_labels.iter().flatten())?.0;

        for expression in selector.match_expressions.iter().flatten() {
            let operator = match &*expression.operator {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                unknown => return Err(Error::UnknownOperator(unknown.into())),
            };

            requirements.push(Requirement::new(
                expression.key.clone(),
                operator,
                expression.values.clone().unwrap_or_default(),
            )?);
        }

        Ok(Self(requirements))
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut terms = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;
        for (index, c) in input.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    terms.push(&input[start..index]);
                    start = index + 1;
                }
                _ => {}
            }
        }
        terms.push(&input[start..]);

        terms
            .into_iter()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(parse_term)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

fn parse_term(term: &str) -> Result<Requirement, Error> {
    let set_values = |rest: &str| -> Result<Vec<String>, Error> {
        let rest = rest.trim();
        let inner = rest
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| Error::Parse(term.into()))?;
        Ok(inner
            .split(',')
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .collect())
    };

    if let Some(key) = term.strip_prefix('!') {
        return Requirement::new(key.trim(), Operator::DoesNotExist, []);
    }

    if let Some((key, rest)) = term.split_once(" notin ") {
        return Requirement::new(key.trim(), Operator::NotIn, set_values(rest)?);
    }

    if let Some((key, rest)) = term.split_once(" in ") {
        return Requirement::new(key.trim(), Operator::In, set_values(rest)?);
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Requirement::new(key.trim(), Operator::NotEquals, [value.trim().to_owned()]);
    }

    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Requirement::new(key.trim(), Operator::Equals, [value.trim().to_owned()]);
    }

    if term.contains(char::is_whitespace) {
        return Err(Error::Parse(term.into()));
    }

    Requirement::new(term, Operator::Exists, [])
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&terms.join(","))
    }
}
