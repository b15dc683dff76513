//! The transport loop: feeds connection changes and inbound commands into
//! an [`Agent`].
//!
//! The network side of a broker connection reports what happens as
//! [`TransportEvent`]s on a channel. [`run_transport_loop`] applies them in
//! order until the channel closes or shutdown is signalled, and
//! [`LiveHandle`] wraps a spawned loop for graceful shutdown.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::agent::Agent;
use crate::error::DispatchError;
use crate::state::ConnectionState;
use crate::transport::InboundMessage;

/// Something the transport observed.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection moved to a new state.
    State(ConnectionState),
    /// A command arrived.
    Message(InboundMessage),
}

/// Counters describing what a transport loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// State events applied, including those whose callbacks failed.
    pub transitions: usize,
    /// Commands whose handler ran and succeeded.
    pub dispatched: usize,
    /// Failed transitions and dropped or failed commands.
    pub failed: usize,
}

/// Run the transport loop until `events` closes or `shutdown` becomes `true`.
///
/// Every failure is logged and counted; a bad message never ends the loop.
/// Commands are dispatched on the loop's task, one at a time, in arrival
/// order.
///
/// # Arguments
///
/// * `agent` - The agent to drive.
/// * `events` - State changes and inbound commands from the transport.
/// * `shutdown` - Watch receiver that signals the loop to stop. If its
///   sender is dropped the loop keeps running until `events` closes.
///
/// # Returns
///
/// A [`LoopReport`] with the loop's counters.
pub async fn run_transport_loop(
    agent: Agent,
    mut events: mpsc::Receiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopReport {
    let mut report = LoopReport::default();
    let mut watching = true;

    loop {
        if *shutdown.borrow() {
            tracing::info!(agent = %agent.name(), "transport loop: shutdown requested");
            break;
        }

        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    tracing::info!(agent = %agent.name(), "transport loop: event channel closed");
                    break;
                }
            },
            changed = shutdown.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
                continue;
            }
        };

        apply(&agent, event, &mut report);
    }

    tracing::info!(
        agent = %agent.name(),
        transitions = report.transitions,
        dispatched = report.dispatched,
        failed = report.failed,
        "transport loop stopped"
    );
    report
}

fn apply(agent: &Agent, event: TransportEvent, report: &mut LoopReport) {
    match event {
        TransportEvent::State(state) => {
            report.transitions += 1;
            if let Err(e) = agent.transition(state) {
                report.failed += 1;
                tracing::error!(
                    agent = %agent.name(),
                    state = %state,
                    error = %e,
                    "transport loop: state callbacks failed"
                );
            }
        }
        TransportEvent::Message(message) => {
            let command = message.command.clone();
            match agent.dispatch(message) {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    report.failed += 1;
                    match &e {
                        DispatchError::Handler { .. } => tracing::error!(
                            agent = %agent.name(),
                            command = %command,
                            error = %e,
                            "transport loop: command handler failed"
                        ),
                        _ => tracing::warn!(
                            agent = %agent.name(),
                            command = %command,
                            error = %e,
                            "transport loop: dropping command"
                        ),
                    }
                }
            }
        }
    }
}

/// Handle for a transport loop running on its own task.
///
/// Dropping the handle does **not** stop the loop; call
/// [`shutdown`](LiveHandle::shutdown), or close the event channel.
#[derive(Debug)]
pub struct LiveHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<LoopReport>,
}

impl LiveHandle {
    /// Spawn [`run_transport_loop`] on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(agent: Agent, events: mpsc::Receiver<TransportEvent>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_transport_loop(agent, events, shutdown_rx));
        Self { shutdown_tx, task }
    }

    /// Returns `true` if the loop has already stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait for its report.
    ///
    /// Events already queued but not yet received are not processed.
    ///
    /// # Errors
    ///
    /// Returns the task's `JoinError` if the loop panicked.
    pub async fn shutdown(self) -> Result<LoopReport, tokio::task::JoinError> {
        // The loop may have exited already and dropped its receiver.
        let _ = self.shutdown_tx.send(true);
        self.task.await
    }

    /// Wait for the loop to stop on its own, when the event channel closes.
    ///
    /// # Errors
    ///
    /// Returns the task's `JoinError` if the loop panicked.
    pub async fn join(self) -> Result<LoopReport, tokio::task::JoinError> {
        self.task.await
    }
}
