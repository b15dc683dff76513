//! The pong agent: answers every `test-command` with a `tested-event`
//! whose value is `"pong"`.
//!
//! Run with: `cargo run --example pong`
//!
//! The broker side is simulated in-process: a channel plays the transport,
//! reporting a connection and delivering one command.

use schema_agent::{
    AgentBuilder, ChannelTransport, CommandCtx, ConnectionState, DirResources, FieldKind,
    HandlerError, InboundMessage, LiveHandle, Message, Shape, TransportEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const TEST_COMMAND: &str = "crucibuild/agent-pong#test-command";
const TESTED_EVENT: &str = "crucibuild/agent-pong#tested-event";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    z: String,
}

impl Message for Header {
    fn shape() -> Shape {
        Shape::new().field("z", FieldKind::String)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestCommand {
    foo: Header,
    value: String,
    x: i32,
}

impl Message for TestCommand {
    fn shape() -> Shape {
        Shape::new()
            .field("foo", FieldKind::record::<Header>())
            .field("value", FieldKind::String)
            .field("x", FieldKind::Int)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestedEvent {
    value: String,
}

impl Message for TestedEvent {
    fn shape() -> Shape {
        Shape::new().field("value", FieldKind::String)
    }
}

// ---------------------------------------------------------------------------
// Business logic
// ---------------------------------------------------------------------------

fn on_test_command(ctx: CommandCtx<TestCommand>) -> Result<(), HandlerError> {
    let command = ctx.message();
    tracing::info!(
        foo.z = %command.foo.z,
        value = %command.value,
        x = command.x,
        "received test-command"
    );
    ctx.send_event(
        TESTED_EVENT,
        &TestedEvent {
            value: "pong".to_string(),
        },
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (transport, mut outbound) = ChannelTransport::new();
    let agent = AgentBuilder::new(transport)
        .resources(DirResources::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/demos/pong"
        )))
        .manifest_resource("/resources/manifest.json")
        .build()?;

    agent.type_register::<Header>("crucibuild/agent-pong#header")?;
    agent.type_register::<TestCommand>(TEST_COMMAND)?;
    agent.type_register::<TestedEvent>(TESTED_EVENT)?;

    agent.register_state_callback(|agent, state| {
        agent.info(&format!("connection state is now {state}"));
        if state == ConnectionState::Connected {
            agent.register_command_callback(TEST_COMMAND, on_test_command)?;
        }
        Ok(())
    });

    // --- Simulated broker ---
    let (events_tx, events_rx) = mpsc::channel(16);
    let live = LiveHandle::spawn(agent.clone(), events_rx);

    let ping = TestCommand {
        foo: Header { z: "h".to_string() },
        value: "ping".to_string(),
        x: 1,
    };
    let payload = agent.encode(TEST_COMMAND, &ping)?;

    events_tx
        .send(TransportEvent::State(ConnectionState::Connecting))
        .await?;
    events_tx
        .send(TransportEvent::State(ConnectionState::Connected))
        .await?;
    events_tx
        .send(TransportEvent::Message(
            InboundMessage::new(TEST_COMMAND, payload).with_correlation_id("demo-1"),
        ))
        .await?;
    events_tx
        .send(TransportEvent::State(ConnectionState::Disconnected))
        .await?;
    drop(events_tx);

    let report = live.join().await?;
    println!(
        "loop report: {} transition(s), {} dispatched, {} failed",
        report.transitions, report.dispatched, report.failed
    );

    while let Ok(message) = outbound.try_recv() {
        let event: TestedEvent = agent.decode(&message.event, &message.payload)?;
        println!(
            "sent {} (reply to {}, correlation {}): value = {}",
            message.event, message.in_reply_to, message.correlation_id, event.value
        );
    }

    Ok(())
}
