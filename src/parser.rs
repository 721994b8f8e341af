//! Classification of bot output lines into lifecycle events.
//!
//! The markers below are the wire contract with the launched bot. Patterns are
//! tried in priority order and the first match wins:
//! QR challenge, quick-login error, login success, account offline.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use crate::instance::LifecycleEvent;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])"));

static QR_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        compile(r"(?:^|[\s\]])QR:\s*(\S+)"),
        compile(r"二维码解码URL[:：]\s*(\S+)"),
        compile(r"二维码已保存到\s*(.+?)\s*$"),
    ]
});

static QUICK_LOGIN_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        compile(r"(?i)quick\s*login\s*(?:error|failed|failure)[\s:：,-]*(.*)$"),
        compile(r"快速登录(?:错误|失败)[\s:：,-]*(.*)$"),
    ]
});

static LOGIN_SUCCESS_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        compile(r"(?i)login\s+success(?:ful)?[^0-9]*?([0-9]{5,12})(?:[^0-9]|$)"),
        compile(r"登录成功[^0-9]*?([0-9]{5,12})(?:[^0-9]|$)"),
    ]
});

static OFFLINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"账号状态变更为离线|(?i:account\s+status\s+changed\s+to\s+offline)")
});

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in marker pattern must compile")
}

/// Remove ANSI colour and cursor sequences.
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// Turn one raw output line into at most one lifecycle event.
///
/// Stateless: the same line always yields the same result.
pub fn classify(line: &str) -> Option<LifecycleEvent> {
    let line = strip_ansi(line);
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(payload) = first_capture(QR_PATTERNS.as_slice(), line) {
        return Some(LifecycleEvent::QrChallenge {
            payload: payload.to_string(),
        });
    }

    if let Some(message) = first_capture(QUICK_LOGIN_PATTERNS.as_slice(), line) {
        let message = if message.trim().is_empty() {
            line.trim()
        } else {
            message.trim()
        };
        return Some(LifecycleEvent::QuickLoginError {
            message: message.to_string(),
        });
    }

    if let Some(id) = first_capture(LOGIN_SUCCESS_PATTERNS.as_slice(), line) {
        if let Ok(account_id) = id.parse() {
            return Some(LifecycleEvent::LoginSuccess { account_id });
        }
    }

    if OFFLINE_PATTERN.is_match(line) {
        return Some(LifecycleEvent::AccountOffline);
    }

    None
}

fn first_capture<'a>(patterns: &[Regex], line: &'a str) -> Option<&'a str> {
    patterns.iter().find_map(|re| {
        re.captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    })
}
