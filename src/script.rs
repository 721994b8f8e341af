//! Launch scripts that start a bot outside the supervisor.
//!
//! Every script declares the executable and working directory on their own
//! lines, so [`declared_paths`] can read them back.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::InstanceConfig;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptTarget {
    PowerShell,
    BatchFile,
    ShellScript,
}

impl ScriptTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerShell => "powershell",
            Self::BatchFile => "batch",
            Self::ShellScript => "shell",
        }
    }

    pub fn default_file_name(&self) -> &'static str {
        match self {
            Self::PowerShell => "start.ps1",
            Self::BatchFile => "start.bat",
            Self::ShellScript => "start.sh",
        }
    }

    pub fn is_supported_on(&self, host: HostOs) -> bool {
        match self {
            Self::PowerShell | Self::BatchFile => host == HostOs::Windows,
            Self::ShellScript => host == HostOs::Unix,
        }
    }

    fn line_ending(&self) -> &'static str {
        match self {
            Self::PowerShell | Self::BatchFile => "\r\n",
            Self::ShellScript => "\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Windows,
    Unix,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Unix => "unix",
        }
    }
}

/// Paths a rendered script launches with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredPaths {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
}

const SH_EXECUTABLE: &str = "BOT_EXECUTABLE=";
const SH_WORKDIR: &str = "BOT_WORKDIR=";
const PS_EXECUTABLE: &str = "$BotExecutable = ";
const PS_WORKDIR: &str = "$BotWorkDir = ";
const BAT_EXECUTABLE: &str = "set \"BOT_EXECUTABLE=";
const BAT_WORKDIR: &str = "set \"BOT_WORKDIR=";

pub fn default_file_name(target: ScriptTarget) -> &'static str {
    target.default_file_name()
}

/// Render a launch script for the current host.
pub fn render(config: &InstanceConfig, target: ScriptTarget) -> Result<String> {
    render_for(config, target, HostOs::current())
}

/// Render a launch script as if running on `host`.
pub fn render_for(config: &InstanceConfig, target: ScriptTarget, host: HostOs) -> Result<String> {
    if !target.is_supported_on(host) {
        return Err(AppError::unsupported_target(target.as_str(), host.as_str()));
    }

    let executable = path_str(&config.executable)?;
    let working_dir = path_str(&config.working_dir)?;
    let args = config.launch_args();
    let env = config.launch_env();

    for value in [executable, working_dir, config.name.as_str()]
        .into_iter()
        .chain(args.iter().map(String::as_str))
        .chain(env.values().map(String::as_str))
    {
        check_value(value, target)?;
    }
    if let Some(key) = env.keys().find(|key| !is_identifier(key)) {
        return Err(AppError::config(format!(
            "Environment variable '{key}' cannot be written to a launch script"
        )));
    }

    let header = format!(
        "Launch script for bot {} ({})",
        config.account_id, config.name
    );
    let mut lines: Vec<String> = Vec::new();
    match target {
        ScriptTarget::ShellScript => {
            lines.push("#!/bin/sh".to_string());
            lines.push(format!("# {header}"));
            lines.push(format!("{SH_EXECUTABLE}{}", sh_quote(executable)));
            lines.push(format!("{SH_WORKDIR}{}", sh_quote(working_dir)));
            for (key, value) in &env {
                lines.push(format!("export {key}={}", sh_quote(value)));
            }
            lines.push("cd \"$BOT_WORKDIR\" || exit 1".to_string());
            let args: Vec<String> = args.iter().map(|a| sh_quote(a)).collect();
            lines.push(format!("exec \"$BOT_EXECUTABLE\" {}", args.join(" ")));
        }
        ScriptTarget::PowerShell => {
            lines.push(format!("# {header}"));
            lines.push("[Console]::OutputEncoding = [System.Text.Encoding]::UTF8".to_string());
            lines.push(format!("{PS_EXECUTABLE}{}", ps_quote(executable)));
            lines.push(format!("{PS_WORKDIR}{}", ps_quote(working_dir)));
            for (key, value) in &env {
                lines.push(format!("$env:{key} = {}", ps_quote(value)));
            }
            lines.push("Set-Location -LiteralPath $BotWorkDir".to_string());
            let args: Vec<String> = args.iter().map(|a| ps_quote(a)).collect();
            lines.push(format!("& $BotExecutable {}", args.join(" ")));
        }
        ScriptTarget::BatchFile => {
            lines.push("@echo off".to_string());
            lines.push("chcp 65001 > nul".to_string());
            lines.push(format!("rem {header}"));
            lines.push(format!("{BAT_EXECUTABLE}{}\"", bat_escape(executable)));
            lines.push(format!("{BAT_WORKDIR}{}\"", bat_escape(working_dir)));
            for (key, value) in &env {
                lines.push(format!("set \"{key}={}\"", bat_escape(value)));
            }
            lines.push("cd /d \"%BOT_WORKDIR%\"".to_string());
            let args: Vec<String> = args
                .iter()
                .map(|a| format!("\"{}\"", bat_escape(a)))
                .collect();
            lines.push(format!("\"%BOT_EXECUTABLE%\" {}", args.join(" ")));
        }
    }

    let eol = target.line_ending();
    let mut text = lines.join(eol);
    text.push_str(eol);
    Ok(text)
}

/// Read back the executable and working directory a rendered script declares.
pub fn declared_paths(text: &str, target: ScriptTarget) -> Result<DeclaredPaths> {
    let (exe_prefix, dir_prefix) = match target {
        ScriptTarget::ShellScript => (SH_EXECUTABLE, SH_WORKDIR),
        ScriptTarget::PowerShell => (PS_EXECUTABLE, PS_WORKDIR),
        ScriptTarget::BatchFile => (BAT_EXECUTABLE, BAT_WORKDIR),
    };
    let find = |prefix: &str| -> Result<String> {
        let raw = text
            .lines()
            .find_map(|line| line.strip_prefix(prefix))
            .ok_or_else(|| {
                AppError::config(format!("Script does not declare '{}'", prefix.trim()))
            })?;
        match target {
            ScriptTarget::ShellScript => sh_unquote(raw),
            ScriptTarget::PowerShell => ps_unquote(raw),
            ScriptTarget::BatchFile => bat_unescape(raw),
        }
    };

    Ok(DeclaredPaths {
        executable: PathBuf::from(find(exe_prefix)?),
        working_dir: PathBuf::from(find(dir_prefix)?),
    })
}

/// Write a rendered script. An existing file is only replaced when
/// `overwrite` is set; otherwise nothing is written.
pub fn write(path: &Path, text: &str, overwrite: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::io(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    let mut file = options.open(path).map_err(|e| {
        if e.kind() == IoErrorKind::AlreadyExists {
            AppError::already_exists(path)
        } else {
            AppError::io(format!("Failed to open {}: {}", path.display(), e))
        }
    })?;
    file.write_all(text.as_bytes())
        .map_err(|e| AppError::io(format!("Failed to write {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    if path.extension().is_some_and(|ext| ext == "sh") {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| AppError::io(format!("Failed to chmod {}: {}", path.display(), e)))?;
    }

    log::info!("Wrote launch script {}", path.display());
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| AppError::config(format!("Path {} is not valid UTF-8", path.display())))
}

fn check_value(value: &str, target: ScriptTarget) -> Result<()> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(AppError::config(format!(
            "Value {value:?} cannot be written to a launch script"
        )));
    }
    if target == ScriptTarget::BatchFile && value.contains('"') {
        return Err(AppError::config(format!(
            "Value {value:?} contains a double quote, which batch files cannot carry"
        )));
    }
    Ok(())
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn sh_unquote(raw: &str) -> Result<String> {
    let malformed = || AppError::config(format!("Malformed shell value: {raw}"));
    let mut out = String::new();
    let mut chars = raw.trim_end().chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) => out.push(c),
                    None => return Err(malformed()),
                }
            },
            '\\' => out.push(chars.next().ok_or_else(malformed)?),
            c => out.push(c),
        }
    }
    Ok(out)
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ps_unquote(raw: &str) -> Result<String> {
    raw.trim_end()
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("''", "'"))
        .ok_or_else(|| AppError::config(format!("Malformed PowerShell value: {raw}")))
}

fn bat_escape(value: &str) -> String {
    value.replace('%', "%%")
}

fn bat_unescape(raw: &str) -> Result<String> {
    raw.trim_end()
        .strip_suffix('"')
        .map(|s| s.replace("%%", "%"))
        .ok_or_else(|| AppError::config(format!("Malformed batch value: {raw}")))
}
