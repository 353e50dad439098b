// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Commands, answers and command batches
//!
//! The payload of a command or answer is opaque to the transport. Only a
//! handful of well-known command names (see [`names`]) are interpreted by the
//! management side: startup handshakes, pings, health checks and the control
//! messages used for cancellation and cluster notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use host_types::{HostEvent, HostId};

use crate::error::ProtocolError;

/// Names of the commands the transport itself understands.
pub mod names {
    /// Prefix shared by every startup command an agent sends first.
    pub const STARTUP_PREFIX: &str = "Startup";
    pub const STARTUP_ROUTING: &str = "StartupRoutingCommand";
    pub const STARTUP_STORAGE: &str = "StartupStorageCommand";
    pub const PING: &str = "PingCommand";
    pub const CHECK_HEALTH: &str = "CheckHealthCommand";
    pub const READY: &str = "ReadyCommand";
    pub const SHUTDOWN: &str = "ShutdownCommand";
    pub const MAINTAIN: &str = "MaintainCommand";
    pub const CANCEL: &str = "CancelCommand";
    pub const CHANGE_AGENT: &str = "ChangeAgentCommand";
}

/// Commands an attache still accepts while it is in maintenance mode.
const ALLOWED_IN_MAINTENANCE: &[&str] = &[
    names::MAINTAIN,
    names::CHECK_HEALTH,
    names::PING,
    names::READY,
    names::SHUTDOWN,
    names::CANCEL,
];

/// A unit of work sent to a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, used by listeners and resources to dispatch
    pub name: String,
    /// Opaque payload
    #[serde(default)]
    pub payload: Value,
    /// Must not be reordered with other in-sequence commands
    #[serde(default)]
    pub in_sequence: bool,
    /// Per-command wait hint in seconds (0 uses the manager default)
    #[serde(default)]
    pub wait_secs: u32,
}

impl Command {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Command {
            name: name.into(),
            payload,
            in_sequence: false,
            wait_secs: 0,
        }
    }

    /// Mark this command as requiring in-order execution.
    pub fn in_sequence(mut self) -> Self {
        self.in_sequence = true;
        self
    }

    pub fn with_wait(mut self, wait_secs: u32) -> Self {
        self.wait_secs = wait_secs;
        self
    }

    pub fn ping(host_id: HostId) -> Self {
        Command::new(names::PING, json!({ "host_id": host_id }))
    }

    pub fn check_health() -> Self {
        Command::new(names::CHECK_HEALTH, Value::Null)
    }

    pub fn ready(host_id: HostId) -> Self {
        Command::new(names::READY, json!({ "host_id": host_id }))
    }

    pub fn shutdown(reason: &str) -> Self {
        Command::new(names::SHUTDOWN, json!({ "reason": reason }))
    }

    /// Control command asking the holder of `seq` to abandon it.
    pub fn cancel(seq: u64, reason: &str) -> Self {
        Command::new(names::CANCEL, json!({ "seq": seq, "reason": reason }))
    }

    /// Control command telling cluster peers that a host changed state here.
    pub fn change_agent(host_id: HostId, event: HostEvent) -> Self {
        Command::new(
            names::CHANGE_AGENT,
            json!({ "host_id": host_id, "event": event }),
        )
    }

    pub fn is_startup(&self) -> bool {
        self.name.starts_with(names::STARTUP_PREFIX)
    }

    pub fn is_ping(&self) -> bool {
        self.name == names::PING
    }

    pub fn is_shutdown(&self) -> bool {
        self.name == names::SHUTDOWN
    }

    pub fn is_cancel(&self) -> bool {
        self.name == names::CANCEL
    }

    pub fn is_change_agent(&self) -> bool {
        self.name == names::CHANGE_AGENT
    }

    pub fn allowed_in_maintenance(&self) -> bool {
        ALLOWED_IN_MAINTENANCE.contains(&self.name.as_str())
    }

    /// Sequence referenced by a cancel command.
    pub fn cancelled_seq(&self) -> Option<u64> {
        if !self.is_cancel() {
            return None;
        }
        self.payload.get("seq").and_then(Value::as_u64)
    }

    /// Host and event carried by a change-agent command.
    pub fn change_agent_event(&self) -> Option<(HostId, HostEvent)> {
        if !self.is_change_agent() {
            return None;
        }
        let host_id = self.payload.get("host_id").and_then(Value::as_u64)?;
        let event = self
            .payload
            .get("event")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())?;
        Some((host_id, event))
    }
}

/// The result of executing a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Name of the command this answers
    pub name: String,
    /// Whether the command succeeded
    pub result: bool,
    /// Failure description or extra detail
    #[serde(default)]
    pub details: Option<String>,
    /// Opaque payload
    #[serde(default)]
    pub payload: Value,
}

impl Answer {
    pub fn success(cmd: &Command, payload: Value) -> Self {
        Answer {
            name: cmd.name.clone(),
            result: true,
            details: None,
            payload,
        }
    }

    pub fn failure(cmd: &Command, details: impl Into<String>) -> Self {
        Answer {
            name: cmd.name.clone(),
            result: false,
            details: Some(details.into()),
            payload: Value::Null,
        }
    }

    /// Answer for a command nobody on the receiving side handles.
    pub fn unsupported(cmd: &Command) -> Self {
        Answer::failure(cmd, format!("Unsupported command: {}", cmd.name))
    }

    /// Answer for a command skipped because an earlier one in its batch failed.
    pub fn not_executed(cmd: &Command) -> Self {
        Answer::failure(cmd, "Not executed: an earlier command in the batch failed")
    }

    /// Answer to a startup command, carrying the ping interval to use.
    pub fn startup(cmd: &Command, ping_interval_secs: u64) -> Self {
        Answer::success(cmd, json!({ "ping_interval_secs": ping_interval_secs }))
    }

    pub fn ping_interval_secs(&self) -> Option<u64> {
        self.payload.get("ping_interval_secs").and_then(Value::as_u64)
    }
}

/// What to do with the rest of a batch once one command fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnError {
    /// Abort the remaining commands
    #[default]
    Stop,
    /// Abort the remaining commands and ask the agent to undo completed ones
    Revert,
    /// Run every command regardless of failures
    Continue,
}

impl OnError {
    pub fn stops(self) -> bool {
        matches!(self, OnError::Stop | OnError::Revert)
    }
}

/// Run `cmds` through `exec`, honouring stop-on-error.
///
/// Commands skipped after a failure still get a [`Answer::not_executed`]
/// answer, so the result always has exactly one answer per command.
pub fn execute_batch<F>(cmds: &[Command], stop_on_error: bool, mut exec: F) -> Vec<Answer>
where
    F: FnMut(&Command) -> Answer,
{
    let mut answers = Vec::with_capacity(cmds.len());
    let mut failed = false;

    for cmd in cmds {
        if failed {
            answers.push(Answer::not_executed(cmd));
            continue;
        }
        let answer = exec(cmd);
        if stop_on_error && !answer.result {
            failed = true;
        }
        answers.push(answer);
    }

    answers
}

/// An ordered batch of commands with its error-handling policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commands {
    commands: Vec<Command>,
    on_error: OnError,
    answers: Option<Vec<Answer>>,
}

impl Commands {
    pub fn new(on_error: OnError) -> Self {
        Commands {
            commands: Vec::new(),
            on_error,
            answers: None,
        }
    }

    /// Single-command batch with the default `Stop` policy.
    pub fn single(cmd: Command) -> Self {
        let mut cmds = Commands::new(OnError::Stop);
        cmds.add(cmd);
        cmds
    }

    pub fn add(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    pub fn on_error(&self) -> OnError {
        self.on_error
    }

    pub fn stop_on_error(&self) -> bool {
        self.on_error.stops()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Whether any command in the batch demands in-order execution.
    pub fn in_sequence(&self) -> bool {
        self.commands.iter().any(|c| c.in_sequence)
    }

    pub fn to_commands(&self) -> &[Command] {
        &self.commands
    }

    /// Attach answers to the batch.
    ///
    /// Fails if the number of answers differs from the number of commands.
    pub fn set_answers(&mut self, answers: Vec<Answer>) -> Result<(), ProtocolError> {
        if answers.len() != self.commands.len() {
            return Err(ProtocolError::AnswerCountMismatch {
                expected: self.commands.len(),
                actual: answers.len(),
            });
        }
        self.answers = Some(answers);
        Ok(())
    }

    pub fn answers(&self) -> Option<&[Answer]> {
        self.answers.as_deref()
    }

    /// First answer for a command with the given name.
    pub fn answer_for(&self, name: &str) -> Option<&Answer> {
        self.answers
            .as_ref()?
            .iter()
            .find(|answer| answer.name == name)
    }

    /// Whether the batch succeeded under its error-handling policy.
    ///
    /// `Stop` and `Revert` require every answer to succeed; `Continue` only
    /// requires one.
    pub fn is_successful(&self) -> bool {
        let Some(answers) = &self.answers else {
            return false;
        };
        match self.on_error {
            OnError::Stop | OnError::Revert => answers.iter().all(|a| a.result),
            OnError::Continue => answers.iter().any(|a| a.result),
        }
    }
}
