//! Runtime for agents that exchange schema-typed commands and events with
//! a broker.
//!
//! An agent registers Avro record schemas, binds native Rust types to them,
//! follows its connection state, and routes inbound commands to typed
//! handlers that reply with typed events.

mod agent;
pub use agent::{Agent, AgentBuilder};
mod binder;
pub use binder::{
    Field, FieldKind, MAX_PAYLOAD_BYTES, Message, Shape, TypeBinder, TypeBinding, TypeHandle,
};
mod command;
mod error;
mod live;
mod manifest;
mod resources;
mod schema;
mod state;
mod transport;

pub use command::{CommandCtx, CommandDispatcher, Registration};
pub use error::{
    BindError, CodecError, DispatchError, HandlerError, RegisterError, SchemaError, SendError,
    StartupError, TransitionError, TransportError,
};
pub use live::{LiveHandle, LoopReport, TransportEvent, run_transport_loop};
pub use manifest::{Manifest, SchemaEntry};
pub use resources::{DirResources, MemoryResources, ResourceLoader};
pub use schema::{Fingerprint, Schema, SchemaHandle, SchemaStore};
pub use state::{ConnectionState, ConnectionStateMachine, StateCallback};
pub use transport::{ChannelTransport, InboundMessage, OutboundMessage, Transport};

/// Dynamic Avro value produced by [`TypeBinder::decode`].
pub use apache_avro::types::Value as Datum;
