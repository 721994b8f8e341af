//! Lifecycle supervisor for headless NapCat bot instances.
//!
//! The [`Supervisor`] owns every configured instance, launches and stops its
//! process, turns the process output into [`LifecycleEvent`]s and reacts to
//! them: showing login QR codes, restarting after a quick-login failure,
//! confirming a successful login. Observers follow along through
//! [`Supervisor::subscribe`] and [`Supervisor::watch`].
//!
//! The crate logs through the `log` facade and never installs a logger.

mod config;
mod error;
mod instance;
pub mod parser;
mod process;
pub mod script;
mod supervisor;
mod validation;

pub use config::{
    load_settings, AdvancedSettings, AutoRestartSchedule, ConnectionSettings, Endpoint,
    InstanceConfig, Interval, LogLevel, RestartPolicy, SupervisorSettings,
};
pub use error::{AppError, ErrorKind, Result, SpawnErrorKind};
pub use instance::{
    Effect, InstanceSnapshot, InstanceStateMachine, LifecycleEvent, Notice, Outcome, Phase,
    SupervisorEvent,
};
pub use process::{OutputChunk, ProcessHandle, ProcessOutput};
pub use script::{HostOs, ScriptTarget};
pub use supervisor::{Supervisor, UpdateGuard};
pub use validation::{validate_instance_config, validate_instance_id};
