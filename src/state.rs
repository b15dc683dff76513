//! Connection lifecycle and state-callback fan-out.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{HandlerError, TransitionError};

/// Connection state of an agent towards its broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No broker connection. The initial state.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Commands may be registered and dispatched.
    Connected,
    /// The transport failed; it may retry (`Connecting`) or give up (`Disconnected`).
    Error,
}

impl ConnectionState {
    /// Returns `true` if `next` is a regular successor of `self`.
    ///
    /// The retry policy belongs to the transport, so the state machine
    /// records every transition; edges outside this set are only logged.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        })
    }
}

/// A callback invoked with the new state on every transition.
pub type StateCallback = Arc<dyn Fn(ConnectionState) -> Result<(), HandlerError> + Send + Sync>;

/// Records the current connection state and notifies callbacks on change.
#[derive(Default)]
pub struct ConnectionStateMachine {
    current: RwLock<ConnectionState>,
    has_connected: AtomicBool,
    callbacks: RwLock<Vec<StateCallback>>,
}

impl ConnectionStateMachine {
    /// A machine in [`ConnectionState::Disconnected`] with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state.
    pub fn current(&self) -> ConnectionState {
        *self.current.read()
    }

    /// Returns `true` once [`ConnectionState::Connected`] has been entered.
    pub fn has_connected(&self) -> bool {
        self.has_connected.load(Ordering::Acquire)
    }

    /// Append a callback. Callbacks run in registration order.
    pub fn register_state_callback(&self, callback: StateCallback) {
        let mut callbacks = self.callbacks.write();
        callbacks.push(callback);
        tracing::debug!(count = callbacks.len(), "state callback registered");
    }

    /// Number of registered callbacks.
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Move to `next` and notify every callback.
    ///
    /// The state is stored before any callback runs. A transition to the
    /// current state does nothing. Callbacks registered while the fan-out
    /// is running are first invoked on the next transition.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] carrying every callback failure. All
    /// callbacks run regardless, and the new state stays in place.
    pub fn transition(&self, next: ConnectionState) -> Result<(), TransitionError> {
        self.transition_with(next, |_, _| {})
    }

    /// Like [`transition`](Self::transition), running `hook` with the
    /// previous and new state after the new state is stored and before any
    /// callback runs.
    ///
    /// `hook` does not run for a transition to the current state.
    ///
    /// # Errors
    ///
    /// Same as [`transition`](Self::transition).
    pub fn transition_with<H>(&self, next: ConnectionState, hook: H) -> Result<(), TransitionError>
    where
        H: FnOnce(ConnectionState, ConnectionState),
    {
        let previous = {
            let mut current = self.current.write();
            let previous = *current;
            if previous == next {
                return Ok(());
            }
            *current = next;
            previous
        };
        if next == ConnectionState::Connected {
            self.has_connected.store(true, Ordering::Release);
        }

        if previous.can_transition_to(next) {
            tracing::info!(from = %previous, to = %next, "connection state changed");
        } else {
            tracing::warn!(from = %previous, to = %next, "unexpected connection state transition");
        }
        hook(previous, next);

        let callbacks: Vec<StateCallback> = self.callbacks.read().clone();
        let failures: Vec<HandlerError> = callbacks
            .iter()
            .filter_map(|callback| callback(next).err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                tracing::error!(state = %next, error = %failure, "state callback failed");
            }
            Err(TransitionError {
                state: next,
                failures,
            })
        }
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("current", &self.current())
            .field("has_connected", &self.has_connected())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}
