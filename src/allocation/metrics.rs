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

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramVec, IntCounterVec, IntGauge};

use crate::metrics::{histogram_opts, opts, register, RESULT_LABEL};

const SUBSYSTEM: &str = "allocation";
const SOURCE_LABEL: &str = "source";

pub(crate) const LOCAL: &str = "local";
pub(crate) const REMOTE: &str = "remote";

pub(crate) fn requests_total(source: &str, result: &str) -> prometheus::IntCounter {
    static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "requests_total",
                    SUBSYSTEM,
                    "Allocation requests, by where they were served and their result",
                ),
                &[SOURCE_LABEL, RESULT_LABEL],
            )
            .unwrap(),
        )
    });

    REQUESTS_TOTAL.with_label_values(&[source, result])
}

pub(crate) fn duration(source: &str) -> Histogram {
    static DURATION: Lazy<HistogramVec> = Lazy::new(|| {
        register(
            HistogramVec::new(
                histogram_opts(
                    "duration_seconds",
                    SUBSYSTEM,
                    "Time taken to answer an allocation request",
                    None,
                ),
                &[SOURCE_LABEL],
            )
            .unwrap(),
        )
    });

    DURATION.with_label_values(&[source])
}

pub(crate) fn batch_size() -> &'static Histogram {
    static BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
        register(
            Histogram::with_opts(histogram_opts(
                "batch_size",
                SUBSYSTEM,
                "Requests handled between two quiet windows of the selector",
                vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0],
            ))
            .unwrap(),
        )
    });

    &BATCH_SIZE
}

pub(crate) fn update_duration(result: &str) -> Histogram {
    static UPDATE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
        register(
            HistogramVec::new(
                histogram_opts(
                    "update_duration_seconds",
                    SUBSYSTEM,
                    "Time taken to write an allocated game server upstream",
                    None,
                ),
                &[RESULT_LABEL],
            )
            .unwrap(),
        )
    });

    UPDATE_DURATION.with_label_values(&[result])
}

pub(crate) fn cached_game_servers() -> &'static IntGauge {
    static CACHED: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "cached_game_servers",
                SUBSYSTEM,
                "Game servers currently eligible for allocation",
            ))
            .unwrap(),
        )
    });

    &CACHED
}
