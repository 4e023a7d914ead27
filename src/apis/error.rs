/*
 * Copyright 2020 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{field} has invalid value{clarification}{examples}",
    clarification = clarification
                    .as_ref()
                    .map(|v| format!(": {}", v))
                    .unwrap_or_default(),
    examples = examples
                    .as_ref()
                    .map(|v| format!(": {}", v.join(", ")))
                    .unwrap_or_default(),

    )]
pub struct ValueInvalidArgs {
    pub field: String,
    pub clarification: Option<String>,
    pub examples: Option<Vec<String>>,
}

impl ValueInvalidArgs {
    pub fn new(field: impl Into<String>, clarification: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            clarification: Some(clarification.into()),
            examples: None,
        }
    }

    pub fn with_examples(mut self, examples: &[&str]) -> Self {
        self.examples = Some(examples.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// Validation failure for a resource or an allocation request.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("field {0} is not unique")]
    NotUnique(String),
    #[error("field {0} is required")]
    Required(String),
    #[error("field {0} cannot be changed")]
    Immutable(String),
    #[error(transparent)]
    ValueInvalid(#[from] ValueInvalidArgs),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, clarification: impl Into<String>) -> Self {
        Self::ValueInvalid(ValueInvalidArgs::new(field, clarification))
    }

    /// The field path the error refers to.
    pub fn field(&self) -> &str {
        match self {
            Self::NotUnique(field) | Self::Required(field) | Self::Immutable(field) => field,
            Self::ValueInvalid(args) => &args.field,
        }
    }
}

/// Every problem found while validating a single object.
#[derive(Clone, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, error: impl Into<ValidationError>) {
        self.0.push(error.into());
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = ValidationError>) {
        self.0.extend(errors);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}
