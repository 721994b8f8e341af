//! The supervisor: owns every configured instance and its process.
//!
//! Each instance is served by its own actor task (see [`actor`]); the
//! supervisor itself only routes commands, hands out observation channels and
//! enforces cross-instance gating.

mod actor;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use self::actor::{Command, InstanceActor, Responder};
use crate::config::{InstanceConfig, SupervisorSettings};
use crate::error::{AppError, ErrorKind, Result};
use crate::instance::{InstanceSnapshot, InstanceStateMachine, Phase, SupervisorEvent};
use crate::validation::validate_instance_config;

const COMMAND_CAPACITY: usize = 32;

type Registry = RwLock<HashMap<u64, InstanceEntry>>;

struct InstanceEntry {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<InstanceSnapshot>,
    config: watch::Receiver<Arc<InstanceConfig>>,
    history: Arc<Mutex<VecDeque<String>>>,
}

/// State shared with every actor. Holds no command senders, so dropping the
/// last [`Supervisor`] closes every actor's queue.
struct Shared {
    events: broadcast::Sender<SupervisorEvent>,
    settings: SupervisorSettings,
    update_gate: Arc<RwLock<bool>>,
}

#[derive(Clone)]
pub struct Supervisor {
    instances: Arc<Registry>,
    shared: Arc<Shared>,
}

/// Held while the shared bot binary is being replaced.
/// `start` and `reboot` fail with `UpdateInProgress` until it is dropped.
#[derive(Debug)]
pub struct UpdateGuard {
    gate: Arc<RwLock<bool>>,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        *self.gate.write().unwrap_or_else(|e| e.into_inner()) = false;
        log::info!("Global update finished, starts allowed again");
    }
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            shared: Arc::new(Shared {
                events,
                settings,
                update_gate: Arc::new(RwLock::new(false)),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Register a new instance in `Stopped`.
    ///
    /// Spawns the instance's actor, so it must be called inside a Tokio runtime.
    pub fn add_instance(&self, config: InstanceConfig) -> Result<()> {
        validate_instance_config(&config)?;
        let config = config.with_default_name();
        let id = config.account_id;

        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(&id) {
            return Err(AppError::instance_already_exists(id));
        }

        let machine = InstanceStateMachine::new(id, self.shared.settings.restart_policy);
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot(&config.name));
        let (config_tx, config_rx) = watch::channel(Arc::new(config));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let history = Arc::new(Mutex::new(VecDeque::new()));

        let actor = InstanceActor::new(
            machine,
            config_tx,
            snapshot_tx,
            Arc::clone(&history),
            Arc::clone(&self.shared),
            Arc::downgrade(&self.instances),
            command_rx,
        );
        tokio::spawn(actor.run());

        instances.insert(
            id,
            InstanceEntry {
                commands: command_tx,
                snapshot: snapshot_rx,
                config: config_rx,
                history,
            },
        );
        log::info!("Added instance {}", id);
        Ok(())
    }

    pub async fn start(&self, id: u64) -> Result<()> {
        self.request(id, Command::Start).await
    }

    /// Stop the instance and wait until it is `Stopped`.
    pub async fn stop(&self, id: u64) -> Result<()> {
        self.request(id, Command::Stop).await
    }

    /// Stop then start. From `Stopped` this is a plain start.
    pub async fn reboot(&self, id: u64) -> Result<()> {
        self.request(id, Command::Reboot).await
    }

    /// Replace the stored config. Only allowed while `Stopped`.
    pub async fn update_config(&self, id: u64, config: InstanceConfig) -> Result<()> {
        if config.account_id != id {
            return Err(AppError::config(format!(
                "Config for account {} cannot replace instance {}",
                config.account_id, id
            )));
        }
        validate_instance_config(&config)?;
        let config = Box::new(config.with_default_name());
        self.request(id, |respond| Command::UpdateConfig(config, respond))
            .await
    }

    /// Remove config and state together. Only allowed while `Stopped`;
    /// the instance is never stopped on the caller's behalf.
    pub async fn delete_instance(&self, id: u64) -> Result<()> {
        self.request(id, Command::Delete).await
    }

    /// Advisory check before replacing the shared bot binary.
    pub fn check_global_update_allowed(&self) -> Result<()> {
        let running = self.running_ids();
        if running.is_empty() {
            Ok(())
        } else {
            Err(AppError::any_instance_running(&running))
        }
    }

    /// Like [`check_global_update_allowed`](Self::check_global_update_allowed),
    /// but also blocks new starts until the returned guard is dropped.
    pub fn begin_global_update(&self) -> Result<UpdateGuard> {
        let mut gate = self
            .shared
            .update_gate
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *gate {
            return Err(AppError::update_in_progress());
        }
        let running = self.running_ids();
        if !running.is_empty() {
            return Err(AppError::any_instance_running(&running));
        }
        *gate = true;
        log::info!("Global update started, starts are blocked");
        Ok(UpdateGuard {
            gate: Arc::clone(&self.shared.update_gate),
        })
    }

    /// Stop every instance that is not already stopped, concurrently.
    pub async fn stop_all(&self) -> Result<()> {
        let targets: Vec<u64> = self
            .snapshots()
            .into_iter()
            .filter(|s| matches!(s.phase, Phase::Starting | Phase::AwaitingLogin | Phase::Running))
            .map(|s| s.id)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        log::info!("Stopping {} instance(s)", targets.len());

        let results = join_all(targets.iter().map(|&id| self.stop(id))).await;
        let mut first_error = None;
        for (id, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {}
                // Raced with a stop or exit that got there first.
                Err(e) if e.kind() == ErrorKind::InvalidTransition => {}
                Err(e) => {
                    log::error!("Failed to stop instance {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self, id: u64) -> Result<InstanceSnapshot> {
        self.with_entry(id, |entry| entry.snapshot.borrow().clone())
    }

    /// Snapshots of every instance, ordered by id.
    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = instances
            .values()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// A channel that always holds the instance's latest snapshot.
    pub fn watch(&self, id: u64) -> Result<watch::Receiver<InstanceSnapshot>> {
        self.with_entry(id, |entry| entry.snapshot.clone())
    }

    pub fn config(&self, id: u64) -> Result<InstanceConfig> {
        self.with_entry(id, |entry| InstanceConfig::clone(&entry.config.borrow()))
    }

    /// Most recent output lines, oldest first.
    pub fn recent_output(&self, id: u64) -> Result<Vec<String>> {
        self.with_entry(id, |entry| {
            let history = entry.history.lock().unwrap_or_else(|e| e.into_inner());
            history.iter().cloned().collect()
        })
    }

    pub fn instance_ids(&self) -> Vec<u64> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<u64> = instances.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn running_ids(&self) -> Vec<u64> {
        self.snapshots()
            .into_iter()
            .filter(|s| !s.phase.is_stopped())
            .map(|s| s.id)
            .collect()
    }

    fn with_entry<T>(&self, id: u64, f: impl FnOnce(&InstanceEntry) -> T) -> Result<T> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances
            .get(&id)
            .map(f)
            .ok_or_else(|| AppError::instance_not_found(id))
    }

    async fn request(&self, id: u64, make: impl FnOnce(Responder) -> Command) -> Result<()> {
        let commands = self.with_entry(id, |entry| entry.commands.clone())?;
        let (respond, response) = oneshot::channel();
        commands
            .send(make(respond))
            .await
            .map_err(|_| AppError::instance_not_found(id))?;
        response
            .await
            .map_err(|_| AppError::instance_not_found(id))?
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("instances", &self.instance_ids())
            .finish()
    }
}
