//! Supervisor error types.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::instance::Phase;

/// Supervisor error that can be serialized for the UI layer.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance not found
    InstanceNotFound,
    /// An instance with this id is already configured
    InstanceAlreadyExists,
    /// `start` issued while the instance is not stopped
    AlreadyRunning,
    /// Command not allowed in the current phase
    InvalidTransition,
    /// Instance must be stopped for this operation
    InstanceBusy,
    /// At least one instance is not stopped
    AnyInstanceRunning,
    /// A global update holds the start gate
    UpdateInProgress,
    /// Process could not be launched
    Spawn,
    /// Script destination already exists
    AlreadyExists,
    /// Script target is not executable on this host
    UnsupportedTarget,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Process control error
    Process,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceNotFound => 1001,
            Self::InstanceAlreadyExists => 1002,
            Self::AlreadyRunning => 1003,
            Self::InvalidTransition => 1004,
            Self::InstanceBusy => 1005,
            Self::AnyInstanceRunning => 1006,
            Self::UpdateInProgress => 1007,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::AlreadyExists => 2003,
            Self::UnsupportedTarget => 2004,
            Self::Spawn => 3001,
            Self::Process => 3002,
        }
    }
}

/// Why a launch attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnErrorKind {
    ExecutableNotFound,
    PermissionDenied,
    Other,
}

impl SpawnErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound => "executable_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Other => "other",
        }
    }

    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ExecutableNotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Other,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    fn with_id(kind: ErrorKind, id: u64) -> Self {
        Self::new(kind, HashMap::from([("id".to_string(), id.to_string())]))
    }

    pub fn instance_not_found(id: u64) -> Self {
        Self::with_id(ErrorKind::InstanceNotFound, id)
    }

    pub fn instance_already_exists(id: u64) -> Self {
        Self::with_id(ErrorKind::InstanceAlreadyExists, id)
    }

    pub fn already_running(id: u64, phase: Phase) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            HashMap::from([
                ("id".to_string(), id.to_string()),
                ("phase".to_string(), phase.to_string()),
            ]),
        )
    }

    pub fn invalid_transition(id: u64, command: &str, phase: Phase) -> Self {
        Self::new(
            ErrorKind::InvalidTransition,
            HashMap::from([
                ("id".to_string(), id.to_string()),
                ("command".to_string(), command.to_string()),
                ("phase".to_string(), phase.to_string()),
            ]),
        )
    }

    pub fn instance_busy(id: u64, phase: Phase) -> Self {
        Self::new(
            ErrorKind::InstanceBusy,
            HashMap::from([
                ("id".to_string(), id.to_string()),
                ("phase".to_string(), phase.to_string()),
            ]),
        )
    }

    pub fn any_instance_running(ids: &[u64]) -> Self {
        let ids: Vec<String> = ids.iter().map(u64::to_string).collect();
        Self::new(
            ErrorKind::AnyInstanceRunning,
            HashMap::from([("ids".to_string(), ids.join(","))]),
        )
    }

    pub fn update_in_progress() -> Self {
        Self::new(ErrorKind::UpdateInProgress, HashMap::new())
    }

    pub fn spawn(id: u64, reason: SpawnErrorKind, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Spawn,
            HashMap::from([
                ("id".to_string(), id.to_string()),
                ("reason".to_string(), reason.as_str().to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn already_exists(path: &Path) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            HashMap::from([("path".to_string(), path.display().to_string())]),
        )
    }

    pub fn unsupported_target(target: &str, os: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedTarget,
            HashMap::from([
                ("target".to_string(), target.to_string()),
                ("os".to_string(), os.to_string()),
            ]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Look up a payload field, e.g. `"id"` or `"reason"`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    /// `AlreadyRunning` is the start-specific form of an invalid transition.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InvalidTransition | ErrorKind::AlreadyRunning
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
