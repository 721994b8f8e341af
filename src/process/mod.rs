//! OS process plumbing for bot instances.

mod control;
mod handle;

#[cfg(target_os = "windows")]
pub(crate) mod win_api;

use std::time::Duration;

use crate::instance::LifecycleEvent;

pub use handle::ProcessHandle;

/// How long to wait after a force kill before giving up on the exit report.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

/// How long the exit watcher waits for the output reader to hit EOF.
/// A grandchild holding the pipe open must not delay the exit report forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One item of a process's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// A line of combined stdout/stderr, ANSI-stripped, plus its classification.
    Line {
        line: String,
        event: Option<LifecycleEvent>,
    },
    /// Sent exactly once, after every line.
    Exited { code: Option<i32> },
}

/// Output tagged with the spawn generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub generation: u64,
    pub output: ProcessOutput,
}
