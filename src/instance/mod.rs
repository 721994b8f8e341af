//! Per-instance lifecycle: phases, events and the transition rules.

mod machine;
mod types;

pub use machine::{Effect, InstanceStateMachine, Outcome};
pub use types::{InstanceSnapshot, LifecycleEvent, Notice, Phase, SupervisorEvent};
