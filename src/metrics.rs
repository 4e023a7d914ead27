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

use once_cell::sync::Lazy;
use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{HistogramOpts, IntGauge, Opts, Registry, DEFAULT_BUCKETS};

pub const NAMESPACE: &str = "agones";
pub const KIND_LABEL: &str = "kind";
pub const RESULT_LABEL: &str = "result";
pub const ACTION_LABEL: &str = "action";

/// The registry every metric in this crate is registered with.
pub fn registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

pub fn histogram_opts(
    name: &str,
    subsystem: &str,
    description: &str,
    buckets: impl Into<Option<Vec<f64>>>,
) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets: buckets
            .into()
            .unwrap_or_else(|| Vec::from(DEFAULT_BUCKETS as &'static [f64])),
    }
}

/// Registers `collector` with [`registry`], tolerating double registration.
/// Only used from metric initialisers, where a failure is a programming error.
pub fn register<T: Collector + Clone + 'static>(collector: T) -> T {
    collector.register_if_not_exists(registry()).unwrap()
}

pub fn shutdown_initiated() -> &'static IntGauge {
    static SHUTDOWN_INITIATED: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "shutdown_initiated",
                "",
                "Shutdown process has been started",
            ))
            .unwrap(),
        )
    });

    &SHUTDOWN_INITIATED
}

pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            Err(prometheus::Error::Msg(msg)) if msg.contains("already exists") => {
                // `AlreadyReg` is not returned for every duplicate.
                //  https://github.com/tikv/rust-prometheus/issues/247
                Ok(self)
            }
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}
