//! Per-instance transition rules.
//!
//! The machine performs no I/O. Each transition returns an [`Outcome`] listing
//! the effects (spawn, terminate, notify) the owning actor must carry out, in
//! order.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};

use super::types::{InstanceSnapshot, LifecycleEvent, Notice, Phase};
use crate::config::RestartPolicy;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Spawn,
    Terminate { graceful: bool },
    Notify(Notice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub from: Phase,
    pub to: Phase,
    pub effects: Vec<Effect>,
}

impl Outcome {
    fn unchanged(phase: Phase) -> Self {
        Self {
            from: phase,
            to: phase,
            effects: Vec::new(),
        }
    }

    pub fn phase_changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug)]
pub struct InstanceStateMachine {
    id: u64,
    phase: Phase,
    last_qr_payload: Option<String>,
    restart_count: u32,
    started_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
    policy: RestartPolicy,
    /// Auto-restart timestamps inside the policy window.
    recent_restarts: VecDeque<Instant>,
}

impl InstanceStateMachine {
    pub fn new(id: u64, policy: RestartPolicy) -> Self {
        Self {
            id,
            phase: Phase::Stopped,
            last_qr_payload: None,
            restart_count: 0,
            started_at: None,
            pid: None,
            policy,
            recent_restarts: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_qr_payload(&self) -> Option<&str> {
        self.last_qr_payload.as_deref()
    }

    pub fn snapshot(&self, name: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            name: name.to_string(),
            phase: self.phase,
            last_qr_payload: self.last_qr_payload.clone(),
            restart_count: self.restart_count,
            started_at: self.started_at,
            pid: self.pid,
        }
    }

    fn transition(&mut self, to: Phase, effects: Vec<Effect>) -> Outcome {
        let from = self.phase;
        self.phase = to;
        if to != Phase::AwaitingLogin {
            self.last_qr_payload = None;
        }
        if to == Phase::Stopped {
            self.pid = None;
            self.started_at = None;
        }
        Outcome { from, to, effects }
    }

    /// Operator `start`. Only legal from `Stopped`.
    pub fn start(&mut self) -> Result<Outcome> {
        if !self.phase.is_stopped() {
            return Err(AppError::already_running(self.id, self.phase));
        }
        self.recent_restarts.clear();
        Ok(self.transition(Phase::Starting, vec![Effect::Spawn]))
    }

    /// Operator `stop`. A nascent process is killed outright.
    pub fn stop(&mut self) -> Result<Outcome> {
        let graceful = match self.phase {
            Phase::Starting => false,
            Phase::AwaitingLogin | Phase::Running => true,
            Phase::Stopped | Phase::Stopping => {
                return Err(AppError::invalid_transition(self.id, "stop", self.phase))
            }
        };
        self.restart_count = 0;
        self.recent_restarts.clear();
        Ok(self.transition(Phase::Stopping, vec![Effect::Terminate { graceful }]))
    }

    /// `reboot` is legal everywhere except while a stop is already underway.
    pub fn check_reboot(&self) -> Result<()> {
        if self.phase == Phase::Stopping {
            return Err(AppError::invalid_transition(self.id, "reboot", self.phase));
        }
        Ok(())
    }

    /// Gate for destructive operations (config update, delete).
    pub fn check_idle(&self) -> Result<()> {
        if !self.phase.is_stopped() {
            return Err(AppError::instance_busy(self.id, self.phase));
        }
        Ok(())
    }

    /// Record a successful spawn.
    pub fn spawned(&mut self, pid: Option<u32>, at: DateTime<Utc>) {
        self.pid = pid;
        self.started_at = Some(at);
    }

    /// Spawn attempt failed; the instance falls back to `Stopped`.
    pub fn spawn_failed(&mut self) -> Outcome {
        if self.phase == Phase::Stopped {
            return Outcome::unchanged(self.phase);
        }
        self.transition(Phase::Stopped, Vec::new())
    }

    /// Feed one classified event from the current process.
    pub fn handle_event(&mut self, event: &LifecycleEvent, now: Instant) -> Outcome {
        match (event, self.phase) {
            (LifecycleEvent::QrChallenge { payload }, Phase::Starting | Phase::AwaitingLogin) => {
                let outcome = self.transition(Phase::AwaitingLogin, Vec::new());
                self.last_qr_payload = Some(payload.clone());
                outcome
            }
            (
                LifecycleEvent::QuickLoginError { message },
                Phase::AwaitingLogin | Phase::Running,
            ) => self.auto_restart(message, now),
            (
                LifecycleEvent::LoginSuccess { account_id },
                Phase::Starting | Phase::AwaitingLogin,
            ) => {
                if *account_id != self.id {
                    log::warn!(
                        "Instance {} reported login success for account {}",
                        self.id,
                        account_id
                    );
                }
                self.transition(
                    Phase::Running,
                    vec![Effect::Notify(Notice::LoginSucceeded {
                        account_id: *account_id,
                    })],
                )
            }
            (
                LifecycleEvent::AccountOffline,
                Phase::Starting | Phase::AwaitingLogin | Phase::Running,
            ) => Outcome {
                from: self.phase,
                to: self.phase,
                effects: vec![Effect::Notify(Notice::AccountOffline)],
            },
            (LifecycleEvent::ProcessExited { code }, phase) => match phase {
                Phase::Stopped => Outcome::unchanged(phase),
                Phase::Stopping => self.transition(Phase::Stopped, Vec::new()),
                Phase::Starting => self.transition(
                    Phase::Stopped,
                    vec![Effect::Notify(Notice::StartFailed { code: *code })],
                ),
                Phase::AwaitingLogin | Phase::Running => self.transition(
                    Phase::Stopped,
                    vec![Effect::Notify(Notice::UnexpectedExit { code: *code })],
                ),
            },
            (_, phase) => Outcome::unchanged(phase),
        }
    }

    fn auto_restart(&mut self, reason: &str, now: Instant) -> Outcome {
        let window = self.policy.window();
        while let Some(&oldest) = self.recent_restarts.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.recent_restarts.pop_front();
            } else {
                break;
            }
        }

        if self.recent_restarts.len() >= self.policy.max_restarts as usize {
            log::error!(
                "Instance {} hit the restart limit ({} within {}s), stopping",
                self.id,
                self.recent_restarts.len(),
                self.policy.window_secs
            );
            let restarts = self.restart_count;
            return self.transition(
                Phase::Stopping,
                vec![
                    Effect::Terminate { graceful: false },
                    Effect::Notify(Notice::RestartLimitReached { restarts }),
                ],
            );
        }

        self.recent_restarts.push_back(now);
        self.restart_count += 1;
        log::warn!(
            "Instance {} quick login failed ({}), restarting (attempt {})",
            self.id,
            reason,
            self.restart_count
        );
        let attempt = self.restart_count;
        self.transition(
            Phase::Starting,
            vec![
                Effect::Terminate { graceful: false },
                Effect::Spawn,
                Effect::Notify(Notice::AutoRestarting {
                    attempt,
                    reason: reason.to_string(),
                }),
            ],
        )
    }
}
