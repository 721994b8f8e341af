//! Platform-specific signalling.

use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    super::win_api::is_process_alive(pid)
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Sends CTRL+C via a sidecar helper next to the current executable.
#[cfg(target_os = "windows")]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let exe_dir = std::env::current_exe()
        .map_err(|e| AppError::process(format!("Failed to get current exe path: {e}")))?
        .parent()
        .ok_or_else(|| AppError::process("Failed to get exe directory"))?
        .to_path_buf();
    let helper = exe_dir.join("ctrlc_sender.exe");

    std::process::Command::new(&helper)
        .arg(pid.to_string())
        .creation_flags(CREATE_NO_WINDOW.0)
        .spawn()
        .map_err(|e| {
            AppError::process(format!(
                "Failed to spawn ctrlc helper at {}: {e}",
                helper.display()
            ))
        })?;

    Ok(())
}

/// SIGTERM the bot's process group, falling back to the PID alone.
#[cfg(not(target_os = "windows"))]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = match stderr.trim() {
        "" => stdout.trim(),
        detail => detail,
    };
    Err(AppError::process(format!(
        "taskkill failed for pid {pid}: {}",
        if detail.is_empty() { "(no output)" } else { detail }
    )))
}

#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(target_os = "windows"))]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, signal).map_err(|e| {
            AppError::process(format!(
                "Failed to send {signal} to process group {} (from pid {pid}): {e}",
                pgid.as_raw()
            ))
        }),
        Err(e) => kill(target, signal).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to send {signal} to pid {pid} (getpgid failed: {e}): {kill_err}"
            ))
        }),
    }
}
