//! The per-instance owner task.
//!
//! Every command, every output line and the scheduled-restart timer for one
//! account id are handled by a single task, so a `stop` and an auto-restart can
//! never race on the same process.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{Registry, Shared};
use crate::config::InstanceConfig;
use crate::error::{AppError, Result};
use crate::instance::{
    Effect, InstanceSnapshot, InstanceStateMachine, LifecycleEvent, Notice, Outcome,
    SupervisorEvent,
};
use crate::process::{OutputChunk, ProcessHandle, ProcessOutput};

pub(super) type Responder = oneshot::Sender<Result<()>>;

pub(super) enum Command {
    Start(Responder),
    Stop(Responder),
    Reboot(Responder),
    UpdateConfig(Box<InstanceConfig>, Responder),
    Delete(Responder),
}

/// A start queued behind an in-flight stop.
enum PendingStart {
    Requested(Responder),
    Scheduled,
}

pub(super) struct InstanceActor {
    id: u64,
    machine: InstanceStateMachine,
    config: watch::Sender<Arc<InstanceConfig>>,
    snapshot: watch::Sender<InstanceSnapshot>,
    history: Arc<Mutex<VecDeque<String>>>,
    shared: Arc<Shared>,
    registry: Weak<Registry>,
    commands: mpsc::Receiver<Command>,
    output_tx: mpsc::UnboundedSender<OutputChunk>,
    output_rx: mpsc::UnboundedReceiver<OutputChunk>,
    handle: Option<ProcessHandle>,
    generation: u64,
    stop_waiters: Vec<Responder>,
    pending_start: Option<PendingStart>,
    restart_at: Option<Instant>,
}

impl InstanceActor {
    pub(super) fn new(
        machine: InstanceStateMachine,
        config: watch::Sender<Arc<InstanceConfig>>,
        snapshot: watch::Sender<InstanceSnapshot>,
        history: Arc<Mutex<VecDeque<String>>>,
        shared: Arc<Shared>,
        registry: Weak<Registry>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let id = config.borrow().account_id;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            id,
            machine,
            config,
            snapshot,
            history,
            shared,
            registry,
            commands,
            output_tx,
            output_rx,
            handle: None,
            generation: 0,
            stop_waiters: Vec::new(),
            pending_start: None,
            restart_at: None,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some(chunk) = self.output_rx.recv() => self.handle_output(chunk).await,
                () = wait_until(self.restart_at), if self.restart_at.is_some() => {
                    self.scheduled_restart().await;
                }
            }
        }
        log::debug!("Instance {} actor finished", self.id);
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start(respond) => {
                let result = self.start(true).await;
                let _ = respond.send(result);
            }
            Command::Stop(respond) => self.stop(respond).await,
            Command::Reboot(respond) => self.reboot(respond).await,
            Command::UpdateConfig(config, respond) => {
                let _ = respond.send(self.update_config(*config));
            }
            Command::Delete(respond) => {
                if let Err(e) = self.machine.check_idle() {
                    let _ = respond.send(Err(e));
                } else {
                    self.unregister();
                    let _ = respond.send(Ok(()));
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(&mut self, operator: bool) -> Result<()> {
        let outcome = {
            // Holding the gate while leaving `Stopped` keeps `begin_global_update`
            // from observing an all-stopped collection that is about to change.
            let gate = self
                .shared
                .update_gate
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if *gate {
                return Err(AppError::update_in_progress());
            }
            let outcome = self.machine.start()?;
            self.publish_snapshot();
            outcome
        };

        if operator {
            self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        log::info!("Starting instance {}", self.id);
        self.publish_transition(&outcome);
        self.run_effects(outcome.effects).await?;
        self.arm_schedule();
        Ok(())
    }

    async fn stop(&mut self, respond: Responder) {
        // An operator stop cancels a scheduled restart that is mid-flight.
        if matches!(self.pending_start, Some(PendingStart::Scheduled)) {
            self.pending_start = None;
            self.stop_waiters.push(respond);
            return;
        }
        let outcome = match self.machine.stop() {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = respond.send(Err(e));
                return;
            }
        };
        self.restart_at = None;
        log::info!("Stopping instance {}", self.id);
        if let Err(e) = self.begin_stop(outcome).await {
            let _ = respond.send(Err(e));
            return;
        }
        if self.machine.phase().is_stopped() {
            let _ = respond.send(Ok(()));
        } else {
            self.stop_waiters.push(respond);
        }
    }

    async fn reboot(&mut self, respond: Responder) {
        if self.machine.phase().is_stopped() {
            let result = self.start(true).await;
            let _ = respond.send(result);
            return;
        }
        if let Err(e) = self.machine.check_reboot() {
            let _ = respond.send(Err(e));
            return;
        }
        let outcome = match self.machine.stop() {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = respond.send(Err(e));
                return;
            }
        };
        log::info!("Rebooting instance {}", self.id);
        if let Err(e) = self.begin_stop(outcome).await {
            let _ = respond.send(Err(e));
            return;
        }
        self.pending_start = Some(PendingStart::Requested(respond));
    }

    async fn scheduled_restart(&mut self) {
        self.restart_at = None;
        if self.machine.phase().is_stopped() || self.pending_start.is_some() {
            return;
        }
        let outcome = match self.machine.stop() {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Scheduled restart of instance {} skipped: {}", self.id, e);
                return;
            }
        };
        log::info!("Scheduled restart of instance {}", self.id);
        self.publish(SupervisorEvent::Notice {
            id: self.id,
            notice: Notice::ScheduledRestart,
        });
        if let Err(e) = self.begin_stop(outcome).await {
            log::error!("Scheduled restart of instance {} failed: {}", self.id, e);
            return;
        }
        self.pending_start = Some(PendingStart::Scheduled);
    }

    async fn begin_stop(&mut self, outcome: Outcome) -> Result<()> {
        self.publish_transition(&outcome);
        self.run_effects(outcome.effects).await
    }

    fn update_config(&self, config: InstanceConfig) -> Result<()> {
        self.machine.check_idle()?;
        self.config.send_replace(Arc::new(config));
        self.publish_snapshot();
        log::info!("Updated config of instance {}", self.id);
        Ok(())
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut instances = registry.write().unwrap_or_else(|e| e.into_inner());
            instances.remove(&self.id);
        }
        log::info!("Deleted instance {}", self.id);
    }

    async fn handle_output(&mut self, chunk: OutputChunk) {
        if chunk.generation != self.generation {
            return;
        }
        match chunk.output {
            ProcessOutput::Line { line, event } => {
                self.remember(&line);
                self.publish(SupervisorEvent::Output { id: self.id, line });
                if let Some(event) = event {
                    self.apply_event(event).await;
                }
            }
            ProcessOutput::Exited { code } => {
                self.handle = None;
                self.apply_event(LifecycleEvent::ProcessExited { code }).await;
            }
        }
    }

    async fn apply_event(&mut self, event: LifecycleEvent) {
        let outcome = self
            .machine
            .handle_event(&event, std::time::Instant::now());
        self.publish(SupervisorEvent::Lifecycle { id: self.id, event });
        self.publish_transition(&outcome);

        let stopped = outcome.phase_changed() && outcome.to.is_stopped();
        if let Err(e) = self.run_effects(outcome.effects).await {
            log::error!("Instance {} automatic action failed: {}", self.id, e);
        }
        if stopped {
            self.on_stopped().await;
        }
    }

    async fn on_stopped(&mut self) {
        self.restart_at = None;
        self.release_stop_waiters();
        match self.pending_start.take() {
            Some(PendingStart::Requested(respond)) => {
                let result = self.start(true).await;
                let _ = respond.send(result);
            }
            Some(PendingStart::Scheduled) => {
                if let Err(e) = self.start(false).await {
                    log::error!(
                        "Instance {} failed to come back after scheduled restart: {}",
                        self.id,
                        e
                    );
                }
            }
            None => {}
        }
    }

    fn release_stop_waiters(&mut self) {
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Carry out effects in order. A failed terminate or spawn aborts the rest.
    async fn run_effects(&mut self, effects: Vec<Effect>) -> Result<()> {
        let timeout = self.shared.settings.graceful_shutdown_timeout();
        for effect in effects {
            match effect {
                Effect::Terminate { graceful } => {
                    if let Some(handle) = self.handle.as_mut() {
                        handle.terminate(graceful, timeout).await.inspect_err(|e| {
                            log::error!("Failed to terminate instance {}: {}", self.id, e);
                        })?;
                    }
                }
                Effect::Spawn => self.spawn()?,
                Effect::Notify(notice) => self.publish(SupervisorEvent::Notice {
                    id: self.id,
                    notice,
                }),
            }
        }
        Ok(())
    }

    fn spawn(&mut self) -> Result<()> {
        self.generation += 1;
        let config = Arc::clone(&*self.config.borrow());
        match ProcessHandle::spawn(&config, self.generation, self.output_tx.clone()) {
            Ok(handle) => {
                self.machine.spawned(handle.pid(), Utc::now());
                self.handle = Some(handle);
                self.publish_snapshot();
                Ok(())
            }
            Err(e) => {
                self.handle = None;
                let outcome = self.machine.spawn_failed();
                self.publish_transition(&outcome);
                self.publish(SupervisorEvent::Notice {
                    id: self.id,
                    notice: Notice::StartFailed { code: None },
                });
                self.restart_at = None;
                self.release_stop_waiters();
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            log::info!("Supervisor dropped, killing instance {}", self.id);
            if let Err(e) = handle
                .terminate(false, self.shared.settings.graceful_shutdown_timeout())
                .await
            {
                log::error!("Failed to kill instance {}: {}", self.id, e);
            }
        }
    }

    fn arm_schedule(&mut self) {
        self.restart_at = None;
        let Some(delay) = self.config.borrow().auto_restart.next_delay() else {
            return;
        };
        match Instant::now().checked_add(delay) {
            Some(at) => {
                log::info!(
                    "Instance {} will restart in {}s",
                    self.id,
                    delay.as_secs()
                );
                self.restart_at = Some(at);
            }
            None => log::warn!(
                "Instance {} restart interval of {}s is out of range, schedule not armed",
                self.id,
                delay.as_secs()
            ),
        }
    }

    fn remember(&self, line: &str) {
        let capacity = self.shared.settings.output_history_lines;
        if capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(line.to_string());
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is not an error.
        let _ = self.shared.events.send(event);
    }

    fn publish_transition(&self, outcome: &Outcome) {
        if outcome.phase_changed() {
            log::info!("Instance {}: {} -> {}", self.id, outcome.from, outcome.to);
            self.publish(SupervisorEvent::PhaseChanged {
                id: self.id,
                from: outcome.from,
                to: outcome.to,
            });
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let name = self.config.borrow().name.clone();
        self.snapshot.send_replace(self.machine.snapshot(&name));
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
