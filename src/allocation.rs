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

//! Allocation of ready game servers.
//!
//! Requests are funnelled through a single selector task ([`batch`]) that
//! walks a sorted snapshot of the [`cache::AllocationCache`], so no game
//! server is ever handed to two callers. The [`Allocator`] wraps the
//! pipeline with validation, caller side retries and multi-cluster
//! forwarding through [`remote`].

pub mod allocator;
pub mod batch;
pub mod cache;
pub mod convert;
pub(crate) mod metrics;
pub mod processor;
pub mod remote;
pub mod service;

use std::time::Duration;

use crate::{
    apis::{selector, ValidationErrors},
    store,
};

pub use self::{allocator::Allocator, cache::AllocationCache};

/// Secret keys holding the client certificate used for remote clusters.
pub const SECRET_CLIENT_CERT: &str = "tls.crt";
pub const SECRET_CLIENT_KEY: &str = "tls.key";
pub const SECRET_CA_CERT: &str = "ca.crt";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not find a ready game server")]
    NoGameServerReady,
    #[error("the game server was already allocated")]
    Contention,
    #[error("allocation did not complete within {0:?}")]
    TotalTimeoutExceeded(Duration),
    #[error("game server allocation is invalid: {0}")]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Selector(#[from] selector::Error),
    #[error("error updating allocated game server: {0}")]
    Conflict(#[source] store::Error),
    #[error("error updating allocated game server: {0}")]
    Store(#[source] store::Error),
    #[error("no multi-cluster allocation policy is specified")]
    NoPolicy,
    #[error("secret {0} not found")]
    MissingSecret(String),
    #[error("missing client certificate key pair in secret {0}")]
    MissingKeyPair(String),
    #[error("secret {0} does not have data")]
    EmptySecret(String),
    #[error("only PEM format is accepted for {0}")]
    InvalidPem(&'static str),
    #[error("remote allocation failed: {0}")]
    Remote(#[from] tonic::Status),
    #[error("could not connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("allocator is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Errors that another attempt cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoGameServerReady
                | Self::TotalTimeoutExceeded(_)
                | Self::Validation(_)
                | Self::Selector(_)
                | Self::ShuttingDown
                | Self::NoPolicy
                | Self::MissingSecret(_)
                | Self::MissingKeyPair(_)
                | Self::EmptySecret(_)
                | Self::InvalidPem(_)
        )
    }

    /// The gRPC status this error is reported with.
    pub fn to_status(&self) -> tonic::Status {
        match self {
            Self::Validation(_) | Self::Selector(_) => {
                tonic::Status::invalid_argument(self.to_string())
            }
            Self::TotalTimeoutExceeded(_) => tonic::Status::deadline_exceeded(self.to_string()),
            Self::NoPolicy
            | Self::MissingSecret(_)
            | Self::MissingKeyPair(_)
            | Self::EmptySecret(_)
            | Self::InvalidPem(_) => {
                tonic::Status::failed_precondition(self.to_string())
            }
            Self::Remote(status) => status.clone(),
            Self::ShuttingDown => tonic::Status::unavailable(self.to_string()),
            Self::Store(store::Error::NotFound { .. }) => tonic::Status::not_found(self.to_string()),
            _ => tonic::Status::internal(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors() {
        assert!(Error::NoGameServerReady.is_terminal());
        assert!(Error::TotalTimeoutExceeded(Duration::from_secs(1)).is_terminal());
        assert!(!Error::Contention.is_terminal());
        assert!(!Error::Remote(tonic::Status::unavailable("down")).is_terminal());
    }

    #[test]
    fn statuses() {
        assert_eq!(
            tonic::Code::DeadlineExceeded,
            Error::TotalTimeoutExceeded(Duration::from_secs(1))
                .to_status()
                .code()
        );
        assert_eq!(
            tonic::Code::FailedPrecondition,
            Error::MissingKeyPair("creds".into()).to_status().code()
        );
        assert!(Error::MissingKeyPair("creds".into())
            .to_string()
            .contains("missing client certificate key pair"));
    }
}
