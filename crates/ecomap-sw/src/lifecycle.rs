//! Lifecycle state machine.
//!
//! [`transition`] is a pure function from the current registration state and
//! one event to the next state plus the side effects the controller must run.
//! Installing, waiting and active are separate slots, so a registration can
//! never hold two instances in the same role.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Unique identifier for a service worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, not yet installing.
    #[default]
    Parsed,
    /// Populating its shell store.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Cleaning up old generations and claiming clients.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, failed to install, or unregistered.
    Redundant,
}

/// One version of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInstance {
    pub id: WorkerId,
    pub version: String,
    pub state: ServiceWorkerState,
    pub shell_store: String,
    pub runtime_store: String,
}

/// Per-registration lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationState {
    pub installing: Option<WorkerInstance>,
    pub waiting: Option<WorkerInstance>,
    /// Activating or activated instance.
    pub active: Option<WorkerInstance>,
    /// Open window clients.
    pub open_clients: usize,
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A registration with a (possibly) new version was seen.
    UpdateFound {
        worker: WorkerId,
        version: String,
        shell_store: String,
        runtime_store: String,
        shell_urls: Vec<Url>,
    },
    InstallSucceeded {
        worker: WorkerId,
    },
    InstallFailed {
        worker: WorkerId,
        reason: String,
    },
    /// A client asked the waiting instance to take over now.
    SkipWaiting,
    /// Activation effects have run.
    ActivationFinished {
        worker: WorkerId,
    },
    ClientOpened,
    ClientClosed,
    Unregister,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch every shell URL and store them all, or none.
    PopulateShell {
        worker: WorkerId,
        store: String,
        urls: Vec<Url>,
    },
    /// Delete every store generation not named in `keep`.
    DeleteObsoleteStores { keep: Vec<String> },
    /// Take control of every open client.
    ClaimClients { worker: WorkerId },
    /// Tell every window client a new version is in control.
    BroadcastUpdate { version: String },
    StateChanged {
        worker: WorkerId,
        state: ServiceWorkerState,
    },
}

impl RegistrationState {
    /// Every instance currently held, in installing/waiting/active order.
    pub fn instances(&self) -> impl Iterator<Item = &WorkerInstance> {
        self.installing
            .iter()
            .chain(self.waiting.iter())
            .chain(self.active.iter())
    }

    /// Find a held instance by id.
    pub fn instance(&self, worker: WorkerId) -> Option<&WorkerInstance> {
        self.instances().find(|i| i.id == worker)
    }

    /// Check the slot invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(ref w) = self.installing {
            if w.state != ServiceWorkerState::Installing {
                return Err(format!("installing slot holds {:?}", w.state));
            }
        }
        if let Some(ref w) = self.waiting {
            if w.state != ServiceWorkerState::Installed {
                return Err(format!("waiting slot holds {:?}", w.state));
            }
            if self.active.is_none() {
                return Err("waiting instance without an active one".to_string());
            }
        }
        if let Some(ref w) = self.active {
            if !matches!(
                w.state,
                ServiceWorkerState::Activating | ServiceWorkerState::Activated
            ) {
                return Err(format!("active slot holds {:?}", w.state));
            }
        }

        let mut ids: Vec<WorkerId> = self.instances().map(|i| i.id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.instances().count() {
            return Err("one instance occupies two slots".to_string());
        }
        Ok(())
    }
}

/// Advance the lifecycle by one event.
pub fn transition(
    mut state: RegistrationState,
    event: LifecycleEvent,
) -> (RegistrationState, Vec<Effect>) {
    let mut effects = Vec::new();

    match event {
        LifecycleEvent::UpdateFound {
            worker,
            version,
            shell_store,
            runtime_store,
            shell_urls,
        } => {
            // Same source as an instance we already hold: nothing to install.
            if state.instances().any(|i| i.version == version) {
                return (state, effects);
            }

            if let Some(previous) = state.installing.take() {
                retire(previous, &mut effects);
            }

            let instance = WorkerInstance {
                id: worker,
                version,
                state: ServiceWorkerState::Installing,
                shell_store: shell_store.clone(),
                runtime_store,
            };
            effects.push(Effect::StateChanged {
                worker,
                state: ServiceWorkerState::Installing,
            });
            effects.push(Effect::PopulateShell {
                worker,
                store: shell_store,
                urls: shell_urls,
            });
            state.installing = Some(instance);
        }

        LifecycleEvent::InstallSucceeded { worker } => {
            let Some(mut instance) = take_if(&mut state.installing, worker) else {
                return (state, effects);
            };
            set_state(&mut instance, ServiceWorkerState::Installed, &mut effects);

            if let Some(previous) = state.waiting.take() {
                retire(previous, &mut effects);
            }

            if state.active.is_some() && state.open_clients > 0 {
                state.waiting = Some(instance);
            } else {
                activate(&mut state, instance, &mut effects);
            }
        }

        LifecycleEvent::InstallFailed { worker, .. } => {
            if let Some(instance) = take_if(&mut state.installing, worker) {
                retire(instance, &mut effects);
            }
        }

        LifecycleEvent::SkipWaiting => {
            if let Some(instance) = state.waiting.take() {
                activate(&mut state, instance, &mut effects);
            }
        }

        LifecycleEvent::ActivationFinished { worker } => {
            if let Some(ref mut active) = state.active {
                if active.id == worker && active.state == ServiceWorkerState::Activating {
                    set_state(active, ServiceWorkerState::Activated, &mut effects);
                    effects.push(Effect::BroadcastUpdate {
                        version: active.version.clone(),
                    });
                }
            }
        }

        LifecycleEvent::ClientOpened => {
            state.open_clients += 1;
        }

        LifecycleEvent::ClientClosed => {
            state.open_clients = state.open_clients.saturating_sub(1);
            if state.open_clients == 0 {
                if let Some(instance) = state.waiting.take() {
                    activate(&mut state, instance, &mut effects);
                }
            }
        }

        LifecycleEvent::Unregister => {
            for slot in [&mut state.installing, &mut state.waiting, &mut state.active] {
                if let Some(instance) = slot.take() {
                    retire(instance, &mut effects);
                }
            }
        }
    }

    (state, effects)
}

fn take_if(slot: &mut Option<WorkerInstance>, worker: WorkerId) -> Option<WorkerInstance> {
    if slot.as_ref().is_some_and(|i| i.id == worker) {
        slot.take()
    } else {
        None
    }
}

fn set_state(instance: &mut WorkerInstance, to: ServiceWorkerState, effects: &mut Vec<Effect>) {
    instance.state = to;
    effects.push(Effect::StateChanged {
        worker: instance.id,
        state: to,
    });
}

fn retire(mut instance: WorkerInstance, effects: &mut Vec<Effect>) {
    set_state(&mut instance, ServiceWorkerState::Redundant, effects);
}

fn activate(
    state: &mut RegistrationState,
    mut instance: WorkerInstance,
    effects: &mut Vec<Effect>,
) {
    if let Some(previous) = state.active.take() {
        retire(previous, effects);
    }

    set_state(&mut instance, ServiceWorkerState::Activating, effects);
    // A newer install may already have written its shell.
    let keep = std::iter::once(&instance)
        .chain(state.installing.iter())
        .flat_map(|i| [i.shell_store.clone(), i.runtime_store.clone()])
        .collect();
    effects.push(Effect::DeleteObsoleteStores { keep });
    effects.push(Effect::ClaimClients {
        worker: instance.id,
    });
    effects.push(Effect::BroadcastUpdate {
        version: instance.version.clone(),
    });
    state.active = Some(instance);
}
