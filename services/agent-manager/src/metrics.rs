// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the agent manager
//!
//! Exports metrics for:
//! - Requests sent to hosts and synchronous calls that timed out
//! - Responses dropped because their sequence was unknown
//! - Disconnects, labelled by the event that caused them
//! - Frames relayed to peer management servers
//! - Attaches currently registered

use prometheus::{Counter, CounterVec, IntGauge, Opts, Registry, TextEncoder};

// Metric names and labels are constants; a failure here is a typo.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();

        pub static ref COMMANDS_SENT: Counter = Counter::with_opts(Opts::new(
            "agent_manager_requests_sent_total",
            "Requests written to an attache transport"
        ))
        .expect("valid metric name");

        pub static ref SEND_TIMEOUTS: Counter = Counter::with_opts(Opts::new(
            "agent_manager_send_timeouts_total",
            "Synchronous sends that timed out waiting for answers"
        ))
        .expect("valid metric name");

        pub static ref UNKNOWN_SEQUENCES: Counter = Counter::with_opts(Opts::new(
            "agent_manager_unknown_sequence_responses_total",
            "Responses dropped because no request was waiting on their sequence"
        ))
        .expect("valid metric name");

        pub static ref DISCONNECTS: CounterVec = CounterVec::new(
            Opts::new(
                "agent_manager_disconnects_total",
                "Hosts disconnected, by triggering event"
            ),
            &["event"]
        )
        .expect("valid metric name");

        pub static ref FRAMES_FORWARDED: Counter = Counter::with_opts(Opts::new(
            "agent_manager_frames_forwarded_total",
            "Frames relayed to a peer management server"
        ))
        .expect("valid metric name");

        pub static ref ATTACHES: IntGauge = IntGauge::with_opts(Opts::new(
            "agent_manager_attaches",
            "Attaches currently registered"
        ))
        .expect("valid metric name");
    }
}

pub use metrics_impl::{
    ATTACHES, COMMANDS_SENT, DISCONNECTS, FRAMES_FORWARDED, REGISTRY, SEND_TIMEOUTS,
    UNKNOWN_SEQUENCES,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(COMMANDS_SENT.clone()))
        .expect("Failed to register COMMANDS_SENT");
    REGISTRY
        .register(Box::new(SEND_TIMEOUTS.clone()))
        .expect("Failed to register SEND_TIMEOUTS");
    REGISTRY
        .register(Box::new(UNKNOWN_SEQUENCES.clone()))
        .expect("Failed to register UNKNOWN_SEQUENCES");
    REGISTRY
        .register(Box::new(DISCONNECTS.clone()))
        .expect("Failed to register DISCONNECTS");
    REGISTRY
        .register(Box::new(FRAMES_FORWARDED.clone()))
        .expect("Failed to register FRAMES_FORWARDED");
    REGISTRY
        .register(Box::new(ATTACHES.clone()))
        .expect("Failed to register ATTACHES");
}

/// Render the registry in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

pub fn record_command_sent() {
    COMMANDS_SENT.inc();
}

pub fn record_send_timeout() {
    SEND_TIMEOUTS.inc();
}

pub fn record_unknown_sequence() {
    UNKNOWN_SEQUENCES.inc();
}

pub fn record_disconnect(event: &str) {
    DISCONNECTS.with_label_values(&[event]).inc();
}

pub fn record_frame_forwarded() {
    FRAMES_FORWARDED.inc();
}

pub fn set_attaches(count: usize) {
    ATTACHES.set(count as i64);
}
