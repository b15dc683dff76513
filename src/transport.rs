//! Transport boundary: message envelopes and the outbound send primitive.
//!
//! The network side of a broker connection lives outside this crate. An
//! embedding supplies a [`Transport`] for outbound events and feeds inbound
//! commands and state changes to [`run_transport_loop`](crate::run_transport_loop).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// An encoded command delivered by the transport.
///
/// # Examples
///
/// ```
/// use schema_agent::InboundMessage;
///
/// let msg = InboundMessage::new("crucibuild/agent-pong#test-command", vec![0x02, b'h'])
///     .with_correlation_id("req-1");
/// assert_eq!(msg.correlation_id.as_deref(), Some("req-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Schema name of the command.
    pub command: String,
    /// Correlation id assigned by the sender, if any.
    pub correlation_id: Option<String>,
    /// Binary-encoded command body.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Create an inbound message with no correlation id.
    pub fn new(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            correlation_id: None,
            payload,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// An encoded event handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Schema name of the event.
    pub event: String,
    /// Name of the command this event answers.
    pub in_reply_to: String,
    /// Correlation id of the originating command.
    pub correlation_id: String,
    /// Binary-encoded event body.
    pub payload: Vec<u8>,
}

/// Send primitive towards the broker.
///
/// Called synchronously from inside command handlers, so implementations
/// must not block; queue the message and return.
pub trait Transport: Send + Sync {
    /// Hand an encoded event to the transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the message cannot be queued.
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;
}

/// In-process transport that forwards outbound events into a channel.
///
/// The receiving half is handed to whatever ships the bytes, or to a test
/// that inspects them.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver for its outbound events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> OutboundMessage {
        OutboundMessage {
            event: "evt".into(),
            in_reply_to: "cmd".into(),
            correlation_id: "c-1".into(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn channel_transport_forwards() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(event()).expect("send should succeed");
        let received = rx.try_recv().expect("message queued");
        assert_eq!(received, event());
    }

    #[test]
    fn channel_transport_closed_after_receiver_drop() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let result = transport.send(event());
        assert!(
            matches!(result, Err(TransportError::Closed)),
            "expected Closed, got: {result:?}"
        );
    }

    #[test]
    fn inbound_builder_sets_correlation_id() {
        let msg = InboundMessage::new("cmd", vec![]).with_correlation_id(String::from("id-7"));
        assert_eq!(msg.command, "cmd");
        assert_eq!(msg.correlation_id.as_deref(), Some("id-7"));
    }

    #[test]
    fn outbound_serde_roundtrip() {
        let json = serde_json::to_string(&event()).expect("serialization should succeed");
        let back: OutboundMessage =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, event());
    }
}
