//! Power state: Awake ⇄ Asleep, derived from the capture engine's silence
//! timer once per control-loop iteration. Transitions are edge-triggered and
//! fanned out synchronously to every registered component before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PowerState {
    Awake,
    Asleep,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Awake => write!(f, "Awake"),
            PowerState::Asleep => write!(f, "Asleep"),
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransitionCause {
    Silence,
    AudioDetected,
    WakeRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerTransition {
    pub from: PowerState,
    pub to: PowerState,
    pub cause: TransitionCause,
}

/// A component whose behaviour changes with the power state. Must be
/// idempotent: the same state may be applied more than once.
pub trait PowerAware: Send + Sync {
    fn set_power_state(&self, state: PowerState);
}

/// Owner of the process-wide power state. Only this type writes it.
pub struct PowerCoordinator {
    state: RwLock<PowerState>,
    wake_requested: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn PowerAware>>>,
    state_tx: watch::Sender<PowerState>,
    state_rx: watch::Receiver<PowerState>,
}

impl Default for PowerCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerCoordinator {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(PowerState::Awake);
        Self {
            state: RwLock::new(PowerState::Awake),
            wake_requested: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            state_tx,
            state_rx,
        }
    }

    /// Register a component to receive mode switches.
    pub fn register(&self, listener: Arc<dyn PowerAware>) {
        self.listeners.write().push(listener);
    }

    /// Current state (non-blocking read).
    pub fn current(&self) -> PowerState {
        *self.state.read()
    }

    /// Ask for a wake on the next evaluation, regardless of audio presence.
    /// Safe to call from any thread.
    pub fn request_wake(&self) {
        self.wake_requested.store(true, Ordering::SeqCst);
    }

    /// Evaluate the transition rules once. Returns the transition taken, if any;
    /// listeners have already been switched when this returns.
    pub fn evaluate(&self, has_audio: bool) -> Option<PowerTransition> {
        let wake_requested = self.wake_requested.swap(false, Ordering::SeqCst);
        let current = self.current();

        let (next, cause) = match current {
            PowerState::Awake if !has_audio && !wake_requested => {
                (PowerState::Asleep, TransitionCause::Silence)
            }
            PowerState::Asleep if wake_requested => {
                (PowerState::Awake, TransitionCause::WakeRequest)
            }
            PowerState::Asleep if has_audio => (PowerState::Awake, TransitionCause::AudioDetected),
            _ => return None,
        };

        self.apply(current, next, cause)
    }

    fn apply(
        &self,
        from: PowerState,
        to: PowerState,
        cause: TransitionCause,
    ) -> Option<PowerTransition> {
        {
            let mut state = self.state.write();
            if *state != from {
                return None;
            }
            *state = to;
        }

        for listener in self.listeners.read().iter() {
            listener.set_power_state(to);
        }
        let _ = self.state_tx.send(to);
        info!(from = %from, to = %to, cause = ?cause, "power_transition");

        Some(PowerTransition { from, to, cause })
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PowerState> {
        self.state_rx.clone()
    }
}
