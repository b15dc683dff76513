//! Command handlers, their invocation context, and dispatch.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::binder::TypeBinder;
use crate::error::{DispatchError, HandlerError, RegisterError, SendError};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::{InboundMessage, OutboundMessage, Transport};

/// Reply capability shared by every context of one dispatcher.
#[derive(Clone)]
struct Replier {
    binder: Arc<TypeBinder>,
    transport: Arc<dyn Transport>,
}

/// Per-invocation context handed to a command handler.
///
/// Carries the decoded command and a reply channel scoped to the
/// command's correlation id. Dropped when the handler returns.
pub struct CommandCtx<C> {
    message: C,
    command: String,
    correlation_id: String,
    replier: Replier,
}

impl<C> CommandCtx<C> {
    /// The decoded command.
    pub fn message(&self) -> &C {
        &self.message
    }

    /// Take ownership of the decoded command.
    pub fn into_message(self) -> C {
        self.message
    }

    /// Schema name of the command being handled.
    pub fn command_name(&self) -> &str {
        &self.command
    }

    /// Correlation id of the command, either from the sender or generated.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Encode `event` under the schema `name` and hand it to the transport.
    ///
    /// May be called any number of times per command, including zero.
    ///
    /// # Arguments
    ///
    /// * `name` - Schema name the event is bound to.
    /// * `event` - The event value; its type must match the binding.
    ///
    /// # Errors
    ///
    /// * [`SendError::Codec`] -- `name` has no binding or `event` does not
    ///   fit its schema.
    /// * [`SendError::Transport`] -- the transport refused the message.
    pub fn send_event<E: Serialize + 'static>(&self, name: &str, event: &E) -> Result<(), SendError> {
        let payload = self.replier.binder.encode(name, event)?;
        let size = payload.len();
        self.replier.transport.send(OutboundMessage {
            event: name.to_owned(),
            in_reply_to: self.command.clone(),
            correlation_id: self.correlation_id.clone(),
            payload,
        })?;
        tracing::debug!(
            event = %name,
            command = %self.command,
            correlation_id = %self.correlation_id,
            size,
            "event sent"
        );
        Ok(())
    }
}

impl<C: fmt::Debug> fmt::Debug for CommandCtx<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCtx")
            .field("command", &self.command)
            .field("correlation_id", &self.correlation_id)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Type-erased handler stored in the dispatch table.
///
/// The typed handler decodes the payload into its own command type, so
/// the table can hold handlers for different commands side by side.
trait CommandHandler: Send + Sync {
    fn handle(
        &self,
        command: &str,
        correlation_id: String,
        payload: &[u8],
        replier: Replier,
    ) -> Result<(), DispatchError>;
}

struct TypedHandler<C, F> {
    handler: F,
    _command: PhantomData<fn() -> C>,
}

impl<C, F> CommandHandler for TypedHandler<C, F>
where
    C: DeserializeOwned + 'static,
    F: Fn(CommandCtx<C>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(
        &self,
        command: &str,
        correlation_id: String,
        payload: &[u8],
        replier: Replier,
    ) -> Result<(), DispatchError> {
        let message = replier
            .binder
            .decode_as::<C>(command, payload)
            .map_err(DispatchError::Decode)?;
        let ctx = CommandCtx {
            message,
            command: command.to_owned(),
            correlation_id,
            replier,
        };
        (self.handler)(ctx).map_err(|source| DispatchError::Handler {
            command: command.to_owned(),
            source,
        })
    }
}

/// Receipt for a registered handler, used to deregister it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    command: String,
    id: Uuid,
}

impl Registration {
    /// The command this registration handles.
    pub fn command(&self) -> &str {
        &self.command
    }
}

type HandlerTable = HashMap<String, (Uuid, Arc<dyn CommandHandler>)>;

/// Routes inbound commands to exactly one handler per command name.
pub struct CommandDispatcher {
    handlers: RwLock<HandlerTable>,
    replier: Replier,
    state: Arc<ConnectionStateMachine>,
}

impl CommandDispatcher {
    /// Create a dispatcher that decodes with `binder`, gates on `state`
    /// and replies through `transport`.
    pub fn new(
        binder: Arc<TypeBinder>,
        state: Arc<ConnectionStateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            replier: Replier { binder, transport },
            state,
        }
    }

    /// Register the handler for `command`.
    ///
    /// # Arguments
    ///
    /// * `command` - Schema name of the command; must have a type binding.
    /// * `handler` - Invoked with a [`CommandCtx`] for each decoded command.
    ///
    /// # Returns
    ///
    /// A [`Registration`] that can later be passed to
    /// [`deregister`](CommandDispatcher::deregister).
    ///
    /// # Errors
    ///
    /// * [`RegisterError::UnknownCommandType`] -- `command` has no binding.
    /// * [`RegisterError::TypeMismatch`] -- `command` is bound to a Rust
    ///   type other than `C`.
    /// * [`RegisterError::AlreadyRegistered`] -- a handler already exists.
    pub fn register<C, F>(&self, command: &str, handler: F) -> Result<Registration, RegisterError>
    where
        C: DeserializeOwned + 'static,
        F: Fn(CommandCtx<C>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(command, handler, false)
    }

    /// Register the handler for `command` only if the state is
    /// [`ConnectionState::Connected`].
    ///
    /// The state is read while the handler table is locked, so a concurrent
    /// transition away from Connected either sees this handler and clears it
    /// or causes this call to fail.
    ///
    /// # Errors
    ///
    /// * [`RegisterError::NotConnected`] -- the state is not Connected.
    /// * Otherwise see [`register`](CommandDispatcher::register).
    pub fn register_while_connected<C, F>(
        &self,
        command: &str,
        handler: F,
    ) -> Result<Registration, RegisterError>
    where
        C: DeserializeOwned + 'static,
        F: Fn(CommandCtx<C>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(command, handler, true)
    }

    fn insert<C, F>(
        &self,
        command: &str,
        handler: F,
        require_connected: bool,
    ) -> Result<Registration, RegisterError>
    where
        C: DeserializeOwned + 'static,
        F: Fn(CommandCtx<C>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let binding = self
            .replier
            .binder
            .binding(command)
            .ok_or_else(|| RegisterError::UnknownCommandType(command.to_owned()))?;
        if !binding.accepts::<C>() {
            return Err(RegisterError::TypeMismatch {
                command: command.to_owned(),
                bound: binding.type_name().unwrap_or("<shape>"),
                expected: type_name::<C>(),
            });
        }

        let mut handlers = self.handlers.write();
        if require_connected {
            let state = self.state.current();
            if state != ConnectionState::Connected {
                return Err(RegisterError::NotConnected {
                    command: command.to_owned(),
                    state,
                });
            }
        }
        if handlers.contains_key(command) {
            return Err(RegisterError::AlreadyRegistered(command.to_owned()));
        }
        let id = Uuid::new_v4();
        let handler: Arc<dyn CommandHandler> = Arc::new(TypedHandler {
            handler,
            _command: PhantomData::<fn() -> C>,
        });
        handlers.insert(command.to_owned(), (id, handler));

        tracing::debug!(command = %command, registration = %id, "command handler registered");
        Ok(Registration {
            command: command.to_owned(),
            id,
        })
    }

    /// Remove a handler.
    ///
    /// Returns `false` if the registration is no longer active, for example
    /// because the bindings were cleared and the command re-registered.
    pub fn deregister(&self, registration: &Registration) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get(&registration.command) {
            Some((id, _)) if *id == registration.id => {
                handlers.remove(&registration.command);
                tracing::debug!(command = %registration.command, "command handler deregistered");
                true
            }
            _ => false,
        }
    }

    /// Drop every handler.
    pub fn clear(&self) {
        let mut handlers = self.handlers.write();
        if !handlers.is_empty() {
            tracing::debug!(count = handlers.len(), "clearing command handlers");
            handlers.clear();
        }
    }

    /// Returns `true` if a handler is registered for `command`.
    pub fn is_registered(&self, command: &str) -> bool {
        self.handlers.read().contains_key(command)
    }

    /// Decode an inbound command and run its handler.
    ///
    /// A missing correlation id is replaced by a fresh UUID. The handler
    /// runs on the calling thread with no dispatcher lock held.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::NotConnected`] -- the agent is not connected.
    /// * [`DispatchError::NoHandler`] -- nothing is registered for the command.
    /// * [`DispatchError::Decode`] -- the payload did not decode; the
    ///   handler was not invoked.
    /// * [`DispatchError::Handler`] -- the handler returned an error.
    pub fn dispatch(&self, inbound: InboundMessage) -> Result<(), DispatchError> {
        let InboundMessage {
            command,
            correlation_id,
            payload,
        } = inbound;

        let state = self.state.current();
        if state != ConnectionState::Connected {
            return Err(DispatchError::NotConnected { command, state });
        }

        let handler = self
            .handlers
            .read()
            .get(&command)
            .map(|(_, handler)| Arc::clone(handler));
        let Some(handler) = handler else {
            return Err(DispatchError::NoHandler(command));
        };

        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!(
            command = %command,
            correlation_id = %correlation_id,
            size = payload.len(),
            "dispatching command"
        );
        handler.handle(&command, correlation_id, &payload, self.replier.clone())
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<String> = self.handlers.read().keys().cloned().collect();
        commands.sort();
        f.debug_struct("CommandDispatcher")
            .field("commands", &commands)
            .finish_non_exhaustive()
    }
}
