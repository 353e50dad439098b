// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! High-availability, investigation and alerting collaborators

use async_trait::async_trait;
use strum::Display;

use host_types::{Host, HostStatus};

/// Diagnoses the real state of a host that stopped answering.
#[async_trait]
pub trait Investigator: Send + Sync {
    /// `None` means the state could not be determined.
    async fn investigate(&self, host: &Host) -> Option<HostStatus>;
}

/// Restarts the workloads of a host confirmed down.
pub trait HaScheduler: Send + Sync {
    fn schedule_restart(&self, host: &Host, investigate: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AlertKind {
    HostAlert,
    HostDown,
    HostDisconnected,
}

pub trait AlertSink: Send + Sync {
    fn send_alert(&self, host: &Host, kind: AlertKind, message: &str);
}

/// Investigator that never reaches a verdict.
pub struct UndeterminedInvestigator;

#[async_trait]
impl Investigator for UndeterminedInvestigator {
    async fn investigate(&self, _host: &Host) -> Option<HostStatus> {
        None
    }
}

/// HA scheduler that only records the request in the log.
pub struct LoggingHaScheduler;

impl HaScheduler for LoggingHaScheduler {
    fn schedule_restart(&self, host: &Host, investigate: bool) {
        tracing::warn!(
            host_id = host.id,
            host = %host.name,
            investigate,
            "Scheduling HA restart of workloads"
        );
    }
}

pub struct LoggingAlertSink;

impl AlertSink for LoggingAlertSink {
    fn send_alert(&self, host: &Host, kind: AlertKind, message: &str) {
        tracing::warn!(
            host_id = host.id,
            host = %host.name,
            kind = %kind,
            "{}",
            message
        );
    }
}
