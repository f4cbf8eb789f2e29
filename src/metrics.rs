// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Process-wide counters and timers.
//!
//! The engine increments these from any task; exposing them (over a
//! Prometheus scrape endpoint, a push gateway, a periodic log dump,
//! ...) is the embedder's job; everything here registers in the
//! default registry, so `prometheus::gather()` sees it all.

use lazy_static::lazy_static;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

/// Histogram buckets for DNS response times. Nearly all answers are
/// served from memory or a single KV round trip, so the buckets
/// concentrate below 100 ms.
pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, // 0.1 ms
    0.0005, // 0.5 ms
    0.0010, // 1   ms
    0.0025, // 2.5 ms
    0.0050, // 5   ms
    0.0100, // 10  ms
    0.0250, // 25  ms
    0.0500, // 50  ms
    0.1000, // 100 ms
    0.2500, // 250 ms
    0.5000, // 500 ms
    1.0000, // 1    s
];

lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_requests_total",
            "Total number of DNS requests received."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref FILTER_ACCEPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_filter_accepts_total",
            "Queries accepted by the accept/reject filters."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref FILTER_REJECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_filter_rejects_total",
            "Queries rejected by the accept/reject filters."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref RESPONSE_TIME_SECONDS: HistogramVec = register_histogram_vec!(
        "dns_response_time_seconds",
        "Time taken to produce a response, whether valid or invalid.",
        &["protocol"],
        RESPONSE_TIME_BUCKETS.to_vec()
    )
    .unwrap();
    pub static ref QUESTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "resolver_questions_total",
            "Questions answered, by query type."
        ),
        &["qtype"]
    )
    .unwrap();
    pub static ref STORE_QUERIES_TOTAL: IntCounter = register_int_counter!(
        "resolver_store_queries_total",
        "Reads issued to the KV store."
    )
    .unwrap();
    pub static ref STORE_QUERY_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "resolver_store_query_errors_total",
        "Reads to the KV store that returned an error (including 'key not found')."
    )
    .unwrap();
    pub static ref ANSWERS_HIT_TOTAL: IntCounter = register_int_counter!(
        "resolver_answers_hit_total",
        "Queries answered with at least one record."
    )
    .unwrap();
    pub static ref ANSWERS_MISS_TOTAL: IntCounter = register_int_counter!(
        "resolver_answers_miss_total",
        "Queries answered with no records."
    )
    .unwrap();
    pub static ref ANSWERS_ERROR_TOTAL: IntCounter = register_int_counter!(
        "resolver_answers_error_total",
        "Queries that failed with SERVFAIL."
    )
    .unwrap();
    pub static ref MISSING_SOA_TOTAL: IntCounter = register_int_counter!(
        "resolver_missing_soa_total",
        "Negative answers for which no authority SOA could be found."
    )
    .unwrap();
    pub static ref CACHE_HITS_TOTAL: IntCounter =
        register_int_counter!("cache_hits_total", "Response cache hits.").unwrap();
    pub static ref CACHE_MISSES_TOTAL: IntCounter =
        register_int_counter!("cache_misses_total", "Response cache misses.").unwrap();
    pub static ref UPDATES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("update_requests_total", "Dynamic updates, by result RCODE."),
        &["rcode"]
    )
    .unwrap();
    pub static ref UPDATE_LOCK_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        "update_lock_timeouts_total",
        "Dynamic updates that timed out waiting for the update lock."
    )
    .unwrap();
}
