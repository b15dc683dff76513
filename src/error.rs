//! Crate-level error types for registration, encoding and dispatch.

use crate::state::ConnectionState;

/// Error type returned by command handlers and state callbacks.
///
/// Boxed so business logic can use `?` on any error type it likes,
/// including [`SendError`] from [`CommandCtx::send_event`](crate::CommandCtx::send_event).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when registering a schema definition fails.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A schema with this name is already registered.
    #[error("schema '{0}' is already registered")]
    Duplicate(String),

    /// The raw definition could not be parsed into an accepted schema.
    ///
    /// Covers malformed JSON, unsupported types, unresolved named
    /// references and a declared name that differs from the registered one.
    #[error("invalid schema '{name}': {reason}")]
    Invalid {
        /// Name the schema was registered under.
        name: String,
        /// Human-readable parse failure.
        reason: String,
    },
}

/// Error returned when binding a native shape to a schema fails.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// No schema with this name exists in the store.
    #[error("unknown schema '{0}'")]
    UnknownSchema(String),

    /// The native shape is structurally incompatible with the schema.
    #[error("shape does not match schema '{name}': {reason}")]
    ShapeMismatch {
        /// Schema name.
        name: String,
        /// First incompatibility found, prefixed with its field path.
        reason: String,
    },

    /// A binding already exists for this schema name.
    #[error("schema '{0}' is already bound to a type")]
    AlreadyBound(String),
}

/// Error returned when encoding or decoding a message fails.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No type binding exists for this name.
    #[error("no type bound to schema '{0}'")]
    UnknownSchema(String),

    /// The bytes are malformed or do not produce a value of the bound type.
    #[error("failed to decode '{name}': {reason}")]
    Decode {
        /// Schema name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The value does not fit the bound schema.
    #[error("failed to encode '{name}': {reason}")]
    Encode {
        /// Schema name.
        name: String,
        /// What went wrong.
        reason: String,
    },
}

/// Error returned when registering a command handler fails.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// The command name has no type binding to decode with.
    #[error("unknown command type '{0}'")]
    UnknownCommandType(String),

    /// The command name is bound to a different Rust type than the handler expects.
    #[error("command '{command}' is bound to {bound}, handler expects {expected}")]
    TypeMismatch {
        /// Command name.
        command: String,
        /// Type recorded by the binding.
        bound: &'static str,
        /// Type the handler decodes into.
        expected: &'static str,
    },

    /// A handler is already registered for this command.
    #[error("a handler is already registered for command '{0}'")]
    AlreadyRegistered(String),

    /// Command handlers may only be registered while connected.
    #[error("cannot register handler for '{command}' while {state}")]
    NotConnected {
        /// Command name.
        command: String,
        /// State at the time of the call.
        state: ConnectionState,
    },
}

/// Error returned when dispatching an inbound command fails.
///
/// None of these are fatal: the transport loop logs them and moves on
/// to the next message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The agent is not connected, so no handler may run.
    #[error("cannot dispatch '{command}' while {state}")]
    NotConnected {
        /// Command name.
        command: String,
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// No handler is registered for the command.
    #[error("no handler registered for command '{0}'")]
    NoHandler(String),

    /// The payload could not be decoded; the handler was not invoked.
    #[error(transparent)]
    Decode(CodecError),

    /// The handler ran and returned an error.
    #[error("handler for '{command}' failed: {source}")]
    Handler {
        /// Command name.
        command: String,
        /// Error returned by the handler.
        source: HandlerError,
    },
}

/// Error returned by [`CommandCtx::send_event`](crate::CommandCtx::send_event).
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The event could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The transport refused the encoded event.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error returned by a [`Transport`](crate::Transport) send primitive.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The outbound channel has no receiver left.
    #[error("transport is closed")]
    Closed,

    /// The transport rejected the message.
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// Error returned when one or more state callbacks fail during a transition.
///
/// The transition itself has already been applied when this is returned.
#[derive(Debug, thiserror::Error)]
#[error("{} state callback(s) failed on transition to {state}", .failures.len())]
pub struct TransitionError {
    /// The state that was entered.
    pub state: ConnectionState,
    /// Errors returned by the failing callbacks, in registration order.
    pub failures: Vec<HandlerError>,
}

/// Error returned when building an [`Agent`](crate::Agent) fails.
///
/// Any of these aborts startup: an agent never runs half-initialized.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// A resource could not be read.
    #[error("failed to load resource '{path}': {source}")]
    Resource {
        /// Resource path as requested.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The manifest is malformed.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// A schema failed to register.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A type failed to bind.
    #[error(transparent)]
    Bind(#[from] BindError),
}
