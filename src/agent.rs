//! The agent: composition root over schemas, bindings, connection state
//! and command dispatch.
//!
//! An [`Agent`] is built once via [`AgentBuilder`], which registers the
//! schemas listed in the agent's [`Manifest`]. Business logic then binds
//! its native types, registers a state callback, and registers command
//! handlers once the transport reports [`ConnectionState::Connected`].

use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::binder::{Message, Shape, TypeBinder, TypeHandle};
use crate::command::{CommandCtx, CommandDispatcher, Registration};
use crate::error::{
    BindError, CodecError, DispatchError, HandlerError, RegisterError, SchemaError,
    StartupError, TransitionError,
};
use crate::manifest::Manifest;
use crate::resources::{MemoryResources, ResourceLoader};
use crate::schema::{SchemaHandle, SchemaStore};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::{InboundMessage, Transport};

struct AgentInner {
    manifest: Manifest,
    resources: Arc<dyn ResourceLoader>,
    schemas: Arc<SchemaStore>,
    binder: Arc<TypeBinder>,
    state: Arc<ConnectionStateMachine>,
    dispatcher: CommandDispatcher,
}

/// A running agent instance.
///
/// `Clone` is cheap: all state lives behind one `Arc`.
///
/// # Examples
///
/// ```
/// use schema_agent::{AgentBuilder, ChannelTransport, ConnectionState, Manifest};
///
/// let (transport, _outbound) = ChannelTransport::new();
/// let agent = AgentBuilder::new(transport)
///     .manifest(Manifest::new("crucibuild/agent-pong", "1.0.0"))
///     .build()
///     .unwrap();
/// assert_eq!(agent.state(), ConnectionState::Disconnected);
/// ```
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.inner.manifest.name)
            .field("state", &self.state())
            .field("schemas", &self.inner.schemas.len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// The manifest the agent was built from.
    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// Agent name from the manifest.
    pub fn name(&self) -> &str {
        &self.inner.manifest.name
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Returns `true` once the agent has been connected at least once.
    pub fn has_connected(&self) -> bool {
        self.inner.state.has_connected()
    }

    // --- Schemas ---

    /// Register a raw schema definition under `name`.
    ///
    /// # Errors
    ///
    /// See [`SchemaStore::register`].
    pub fn schema_register(&self, name: &str, raw: &[u8]) -> Result<SchemaHandle, SchemaError> {
        self.inner.schemas.register(name, raw)
    }

    /// Load the schema resource at `path` and register it as `name`.
    ///
    /// # Errors
    ///
    /// * [`StartupError::Resource`] -- the resource could not be read.
    /// * [`StartupError::Schema`] -- the definition was rejected.
    pub fn load_schema(&self, name: &str, path: &str) -> Result<SchemaHandle, StartupError> {
        load_schema(self.inner.resources.as_ref(), &self.inner.schemas, name, path)
    }

    /// Look up a registered schema.
    pub fn schema(&self, name: &str) -> Option<SchemaHandle> {
        self.inner.schemas.lookup(name)
    }

    // --- Types ---

    /// Bind the Rust type `T` to the schema `name`.
    ///
    /// # Errors
    ///
    /// See [`TypeBinder::bind`].
    pub fn type_register<T: Message>(&self, name: &str) -> Result<TypeHandle, BindError> {
        self.inner.binder.bind_type::<T>(name)
    }

    /// Bind a bare shape to the schema `name`, without a Rust type.
    ///
    /// # Errors
    ///
    /// See [`TypeBinder::bind`].
    pub fn type_register_shape(&self, name: &str, shape: Shape) -> Result<TypeHandle, BindError> {
        self.inner.binder.bind(name, shape)
    }

    /// Encode a value with the type bound to `name`.
    ///
    /// # Errors
    ///
    /// See [`TypeBinder::encode`].
    pub fn encode<T: Serialize + 'static>(&self, name: &str, value: &T) -> Result<Vec<u8>, CodecError> {
        self.inner.binder.encode(name, value)
    }

    /// Decode bytes into the type bound to `name`.
    ///
    /// # Errors
    ///
    /// See [`TypeBinder::decode_as`].
    pub fn decode<T: DeserializeOwned + 'static>(&self, name: &str, bytes: &[u8]) -> Result<T, CodecError> {
        self.inner.binder.decode_as(name, bytes)
    }

    // --- Connection state ---

    /// Register a callback invoked on every connection-state change.
    ///
    /// The callback receives the agent itself, so it can register command
    /// handlers once connected. It holds only a weak reference to the
    /// agent and does nothing after the last [`Agent`] clone is dropped.
    pub fn register_state_callback<F>(&self, callback: F)
    where
        F: Fn(&Agent, ConnectionState) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let weak: Weak<AgentInner> = Arc::downgrade(&self.inner);
        self.inner
            .state
            .register_state_callback(Arc::new(move |state| match weak.upgrade() {
                Some(inner) => callback(&Agent { inner }, state),
                None => Ok(()),
            }));
    }

    /// Apply a connection-state change reported by the transport.
    ///
    /// Leaving [`ConnectionState::Connected`] drops every command handler
    /// after the new state is stored and before the state callbacks run, so
    /// a reconnect registers them again.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if any state callback failed. The new
    /// state is in place regardless.
    pub fn transition(&self, state: ConnectionState) -> Result<(), TransitionError> {
        self.inner.state.transition_with(state, |_, next| {
            if next != ConnectionState::Connected {
                self.inner.dispatcher.clear();
            }
        })
    }

    // --- Commands ---

    /// Register the handler for the command schema `name`.
    ///
    /// Handlers can only be registered while connected, typically from a
    /// state callback reacting to [`ConnectionState::Connected`].
    ///
    /// # Errors
    ///
    /// * [`RegisterError::NotConnected`] -- the agent is not connected.
    /// * Otherwise see [`CommandDispatcher::register`].
    pub fn register_command_callback<C, F>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<Registration, RegisterError>
    where
        C: DeserializeOwned + 'static,
        F: Fn(CommandCtx<C>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_while_connected(name, handler)
    }

    /// Remove a command handler. Returns `false` if it was no longer active.
    pub fn deregister_command_callback(&self, registration: &Registration) -> bool {
        self.inner.dispatcher.deregister(registration)
    }

    /// Dispatch an inbound command to its handler.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::dispatch`].
    pub fn dispatch(&self, inbound: InboundMessage) -> Result<(), DispatchError> {
        self.inner.dispatcher.dispatch(inbound)
    }

    // --- Logging ---

    /// Log an informational message tagged with the agent name.
    pub fn info(&self, message: &str) {
        tracing::info!(agent = %self.name(), "{message}");
    }

    /// Log a warning tagged with the agent name.
    pub fn warn(&self, message: &str) {
        tracing::warn!(agent = %self.name(), "{message}");
    }

    /// Log an error tagged with the agent name.
    pub fn error(&self, message: &str) {
        tracing::error!(agent = %self.name(), "{message}");
    }
}

fn load_schema(
    resources: &dyn ResourceLoader,
    schemas: &SchemaStore,
    name: &str,
    path: &str,
) -> Result<SchemaHandle, StartupError> {
    let raw = resources.load(path).map_err(|source| StartupError::Resource {
        path: path.to_owned(),
        source,
    })?;
    Ok(schemas.register(name, &raw)?)
}

enum ManifestSource {
    Value(Manifest),
    Resource(String),
}

/// Builder for [`Agent`].
///
/// The manifest comes either as a value or as a resource path; whichever
/// is set last wins. Resources default to an empty in-memory set.
pub struct AgentBuilder {
    transport: Arc<dyn Transport>,
    manifest: Option<ManifestSource>,
    resources: Option<Arc<dyn ResourceLoader>>,
}

impl AgentBuilder {
    /// Start building an agent that sends events through `transport`.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_shared_transport(Arc::new(transport))
    }

    /// Same as [`new`](AgentBuilder::new) for an already shared transport.
    pub fn with_shared_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            manifest: None,
            resources: None,
        }
    }

    /// Use `manifest` as the agent manifest.
    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(ManifestSource::Value(manifest));
        self
    }

    /// Read the manifest from a JSON resource at build time.
    pub fn manifest_resource(mut self, path: impl Into<String>) -> Self {
        self.manifest = Some(ManifestSource::Resource(path.into()));
        self
    }

    /// Load schema and manifest resources through `loader`.
    pub fn resources(mut self, loader: impl ResourceLoader + 'static) -> Self {
        self.resources = Some(Arc::new(loader));
        self
    }

    /// Build the agent and register the manifest's schemas in order.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if no manifest was given, the manifest is
    /// invalid, or any listed schema fails to load or register. No agent
    /// is returned in that case.
    pub fn build(self) -> Result<Agent, StartupError> {
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(MemoryResources::new()));

        let manifest = match self.manifest {
            Some(ManifestSource::Value(manifest)) => {
                manifest.validate()?;
                manifest
            }
            Some(ManifestSource::Resource(path)) => {
                let raw = resources
                    .load(&path)
                    .map_err(|source| StartupError::Resource { path, source })?;
                Manifest::from_json(&raw)?
            }
            None => return Err(StartupError::Manifest("no manifest configured".into())),
        };

        let schemas = Arc::new(SchemaStore::new());
        for entry in &manifest.schemas {
            load_schema(resources.as_ref(), &schemas, &entry.name, &entry.path)?;
        }

        let binder = Arc::new(TypeBinder::new(Arc::clone(&schemas)));
        let state = Arc::new(ConnectionStateMachine::new());
        let dispatcher =
            CommandDispatcher::new(Arc::clone(&binder), Arc::clone(&state), self.transport);

        tracing::info!(
            agent = %manifest.name,
            version = %manifest.version,
            schemas = schemas.len(),
            "agent initialized"
        );

        Ok(Agent {
            inner: Arc::new(AgentInner {
                manifest,
                resources,
                schemas,
                binder,
                state,
                dispatcher,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::binder::test_fixtures::{TestCommand, TestedEvent, ping};
    use crate::schema::test_fixtures::{
        HEADER, HEADER_AVSC, TEST_COMMAND, TEST_COMMAND_AVSC, TESTED_EVENT, TESTED_EVENT_AVSC,
    };
    use crate::transport::ChannelTransport;

    fn pong_resources() -> MemoryResources {
        MemoryResources::new()
            .with("/schema/header.avsc", HEADER_AVSC)
            .with("/schema/test-command.avsc", TEST_COMMAND_AVSC)
            .with("/schema/tested-event.avsc", TESTED_EVENT_AVSC)
    }

    fn pong_manifest() -> Manifest {
        Manifest::new("crucibuild/agent-pong", "1.0.0")
            .with_schema(HEADER, "/schema/header.avsc")
            .with_schema(TEST_COMMAND, "/schema/test-command.avsc")
            .with_schema(TESTED_EVENT, "/schema/tested-event.avsc")
    }

    fn pong_agent() -> Agent {
        let (transport, _outbound) = ChannelTransport::new();
        AgentBuilder::new(transport)
            .manifest(pong_manifest())
            .resources(pong_resources())
            .build()
            .expect("agent builds")
    }

    #[test]
    fn build_registers_manifest_schemas() {
        let agent = pong_agent();
        for name in [HEADER, TEST_COMMAND, TESTED_EVENT] {
            assert!(agent.schema(name).is_some(), "{name} registered");
        }
        assert_eq!(agent.name(), "crucibuild/agent-pong");
    }

    #[test]
    fn build_without_manifest_fails() {
        let (transport, _outbound) = ChannelTransport::new();
        let result = AgentBuilder::new(transport).build();
        assert!(matches!(result, Err(StartupError::Manifest(_))));
    }

    #[test]
    fn build_fails_on_missing_schema_resource() {
        let (transport, _outbound) = ChannelTransport::new();
        let result = AgentBuilder::new(transport)
            .manifest(pong_manifest().with_schema("a#missing", "/schema/missing.avsc"))
            .resources(pong_resources())
            .build();
        match result {
            Err(StartupError::Resource { path, .. }) => assert_eq!(path, "/schema/missing.avsc"),
            other => panic!("expected Resource error, got: {other:?}"),
        }
    }

    #[test]
    fn build_fails_when_reference_precedes_definition() {
        let (transport, _outbound) = ChannelTransport::new();
        let manifest = Manifest::new("a", "1")
            .with_schema(TEST_COMMAND, "/schema/test-command.avsc")
            .with_schema(HEADER, "/schema/header.avsc");
        let result = AgentBuilder::new(transport)
            .manifest(manifest)
            .resources(pong_resources())
            .build();
        assert!(
            matches!(result, Err(StartupError::Schema(SchemaError::Invalid { .. }))),
            "expected Invalid schema, got: {result:?}"
        );
    }

    #[test]
    fn build_reads_manifest_resource() {
        let manifest = serde_json::to_vec(&pong_manifest()).expect("serialize");
        let (transport, _outbound) = ChannelTransport::new();
        let agent = AgentBuilder::new(transport)
            .manifest_resource("/resources/manifest.json")
            .resources(pong_resources().with("/resources/manifest.json", manifest))
            .build()
            .expect("agent builds");
        assert_eq!(agent.manifest(), &pong_manifest());
    }

    #[test]
    fn schema_register_rejects_duplicates() {
        let agent = pong_agent();
        let result = agent.schema_register(HEADER, HEADER_AVSC.as_bytes());
        assert!(matches!(result, Err(SchemaError::Duplicate(ref n)) if n == HEADER));
    }

    #[test]
    fn load_schema_after_build() {
        let (transport, _outbound) = ChannelTransport::new();
        let agent = AgentBuilder::new(transport)
            .manifest(Manifest::new("a", "1"))
            .resources(pong_resources())
            .build()
            .expect("agent builds");
        let handle = agent
            .load_schema(HEADER, "/schema/header.avsc")
            .expect("header loads");
        assert_eq!(handle.name(), HEADER);
    }

    #[test]
    fn type_register_requires_schema() {
        let (transport, _outbound) = ChannelTransport::new();
        let agent = AgentBuilder::new(transport)
            .manifest(Manifest::new("a", "1"))
            .build()
            .expect("agent builds");
        let result = agent.type_register::<TestedEvent>(TESTED_EVENT);
        assert!(matches!(result, Err(BindError::UnknownSchema(_))));
    }

    #[test]
    fn command_registration_requires_connection() {
        let agent = pong_agent();
        agent
            .type_register::<TestCommand>(TEST_COMMAND)
            .expect("bind");
        let result =
            agent.register_command_callback(TEST_COMMAND, |_ctx: CommandCtx<TestCommand>| Ok(()));
        assert!(
            matches!(
                result,
                Err(RegisterError::NotConnected {
                    state: ConnectionState::Disconnected,
                    ..
                })
            ),
            "expected NotConnected, got: {result:?}"
        );
    }

    #[test]
    fn state_callback_registers_handler_on_connect() {
        let agent = pong_agent();
        agent
            .type_register::<TestCommand>(TEST_COMMAND)
            .expect("bind");
        let registered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&registered);
        agent.register_state_callback(move |agent, state| {
            if state == ConnectionState::Connected {
                agent.register_command_callback(TEST_COMMAND, |_ctx: CommandCtx<TestCommand>| {
                    Ok(())
                })?;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        agent.transition(ConnectionState::Connecting).expect("connecting");
        agent.transition(ConnectionState::Connected).expect("connected");
        agent.transition(ConnectionState::Disconnected).expect("disconnected");
        agent.transition(ConnectionState::Connecting).expect("connecting");
        agent
            .transition(ConnectionState::Connected)
            .expect("reconnect registers again without AlreadyRegistered");
        assert_eq!(registered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn leaving_connected_drops_handlers() {
        let agent = pong_agent();
        agent
            .type_register::<TestCommand>(TEST_COMMAND)
            .expect("bind");
        agent.transition(ConnectionState::Connecting).expect("connecting");
        agent.transition(ConnectionState::Connected).expect("connected");
        let registration = agent
            .register_command_callback(TEST_COMMAND, |_ctx: CommandCtx<TestCommand>| Ok(()))
            .expect("register");
        agent.transition(ConnectionState::Error).expect("error");
        assert!(!agent.deregister_command_callback(&registration));
    }

    #[test]
    fn registration_racing_disconnect_never_survives_it() {
        let agent = pong_agent();
        agent
            .type_register::<TestCommand>(TEST_COMMAND)
            .expect("bind");
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let registrar = {
            let agent = agent.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let _ = agent.register_command_callback(
                        TEST_COMMAND,
                        |_ctx: CommandCtx<TestCommand>| Ok(()),
                    );
                }
            })
        };

        for _ in 0..200 {
            agent.transition(ConnectionState::Connecting).expect("connecting");
            agent.transition(ConnectionState::Connected).expect("connected");
            agent
                .transition(ConnectionState::Disconnected)
                .expect("disconnected");
            assert!(
                !agent.inner.dispatcher.is_registered(TEST_COMMAND),
                "handler survived a transition away from Connected"
            );
        }
        stop.store(true, Ordering::Release);
        registrar.join().expect("registrar thread");
    }

    #[test]
    fn state_callback_sees_agent_state() {
        let agent = pong_agent();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        agent.register_state_callback(move |agent, state| {
            sink.lock().push((agent.state(), state));
            Ok(())
        });
        agent.transition(ConnectionState::Connecting).expect("connecting");
        assert_eq!(
            *seen.lock(),
            vec![(ConnectionState::Connecting, ConnectionState::Connecting)]
        );
    }

    #[test]
    fn dropped_agent_does_not_leak_through_callback() {
        let agent = pong_agent();
        let weak = Arc::downgrade(&agent.inner);
        agent.register_state_callback(|_, _| Ok(()));
        drop(agent);
        assert!(weak.upgrade().is_none(), "callback must not keep the agent alive");
    }

    #[test]
    fn encode_and_decode_delegate_to_binder() {
        let agent = pong_agent();
        agent
            .type_register::<TestCommand>(TEST_COMMAND)
            .expect("bind");
        let bytes = agent.encode(TEST_COMMAND, &ping()).expect("encode");
        let back: TestCommand = agent.decode(TEST_COMMAND, &bytes).expect("decode");
        assert_eq!(back, ping());
    }
}
