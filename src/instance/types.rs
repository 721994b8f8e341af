//! Instance-related type definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    AwaitingLogin,
    Running,
    Stopping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::AwaitingLogin => "awaiting_login",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the bot process reported, or its exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    QrChallenge { payload: String },
    QuickLoginError { message: String },
    LoginSuccess { account_id: u64 },
    AccountOffline,
    ProcessExited { code: Option<i32> },
}

/// Informational messages for the operator. None of them require action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    AutoRestarting { attempt: u32, reason: String },
    RestartLimitReached { restarts: u32 },
    StartFailed { code: Option<i32> },
    UnexpectedExit { code: Option<i32> },
    LoginSucceeded { account_id: u64 },
    AccountOffline,
    ScheduledRestart,
}

/// Everything published on the supervisor feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    PhaseChanged { id: u64, from: Phase, to: Phase },
    Lifecycle { id: u64, event: LifecycleEvent },
    Output { id: u64, line: String },
    Notice { id: u64, notice: Notice },
}

impl SupervisorEvent {
    pub fn instance_id(&self) -> u64 {
        match self {
            Self::PhaseChanged { id, .. }
            | Self::Lifecycle { id, .. }
            | Self::Output { id, .. }
            | Self::Notice { id, .. } => *id,
        }
    }
}

/// Read-only view of an instance, as handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub id: u64,
    pub name: String,
    pub phase: Phase,
    pub last_qr_payload: Option<String>,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}
