use std::time::Duration;

use crate::config::{Endpoint, InstanceConfig};
use crate::error::{AppError, Result};

const MIN_ACCOUNT_DIGITS: usize = 5;
const MAX_ACCOUNT_DIGITS: usize = 12;
const MAX_JITTER_SECS: u32 = 3600;
const MAX_RESTART_INTERVAL: Duration = Duration::from_secs(365 * 86400);

pub fn validate_instance_id(account_id: u64) -> Result<()> {
    let digits = account_id.to_string().len();
    if !(MIN_ACCOUNT_DIGITS..=MAX_ACCOUNT_DIGITS).contains(&digits) {
        return Err(AppError::config(format!(
            "Invalid account id {account_id}: expected {}-{} digits",
            MIN_ACCOUNT_DIGITS, MAX_ACCOUNT_DIGITS
        )));
    }
    Ok(())
}

pub fn validate_instance_config(config: &InstanceConfig) -> Result<()> {
    validate_instance_id(config.account_id)?;

    if config.executable.as_os_str().is_empty() {
        return Err(AppError::config("Executable path is empty"));
    }
    if config.working_dir.as_os_str().is_empty() {
        return Err(AppError::config("Working directory is empty"));
    }

    validate_endpoint("http", &config.connection.http)?;
    validate_endpoint("websocket", &config.connection.websocket)?;

    for (key, value) in &config.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(AppError::config(format!(
                "Invalid environment variable name '{key}'"
            )));
        }
        if value.contains('\0') {
            return Err(AppError::config(format!(
                "Environment variable '{key}' contains a NUL byte"
            )));
        }
    }

    if config.auto_restart.jitter_secs > MAX_JITTER_SECS {
        return Err(AppError::config(format!(
            "Auto-restart jitter must be at most {MAX_JITTER_SECS}s"
        )));
    }

    if config.auto_restart.interval.as_duration() > MAX_RESTART_INTERVAL {
        return Err(AppError::config(format!(
            "Auto-restart interval must be at most {}d",
            MAX_RESTART_INTERVAL.as_secs() / 86400
        )));
    }

    Ok(())
}

fn validate_endpoint(label: &str, endpoint: &Endpoint) -> Result<()> {
    if !endpoint.enable {
        return Ok(());
    }
    if endpoint.host.trim().is_empty() {
        return Err(AppError::config(format!("{label} endpoint host is empty")));
    }
    if endpoint.port == 0 {
        return Err(AppError::config(format!("{label} endpoint port is zero")));
    }
    Ok(())
}
