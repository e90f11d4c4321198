//! Push-channel collaborator.
//!
//! Frames are JSON text messages shaped `{"event": <name>, "data": <object>}`
//! in both directions.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{InvoiceError, Result};
use crate::events::EventKind;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound lifecycle message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        self.event.parse().ok()
    }
}

/// Outbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Subscribe { invoice_id: String },
}

impl ControlMessage {
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Subscribe { invoice_id } => json!({
                "event": "subscribe",
                "data": {"invoiceId": invoice_id}
            }),
        }
    }
}

/// Parse one text frame. Frames without an event name are skipped.
pub fn parse_push_message(text: &str) -> Result<Option<PushMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| InvoiceError::Channel("expected JSON object frame".to_string()))?;
    let Some(event) = object.get("event").and_then(Value::as_str) else {
        return Ok(None);
    };
    let data = object.get("data").cloned().unwrap_or(Value::Null);
    Ok(Some(PushMessage::new(event, data)))
}

/// One open subscription transport, owned by a single driver.
#[async_trait]
pub trait PushChannel: Send {
    async fn send(&mut self, message: &ControlMessage) -> Result<()>;

    /// Next message, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<PushMessage>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushChannel>>;
}

/// Websocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::config::DEFAULT_PUSH_CONNECT_TIMEOUT_MS))
    }
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(Duration::from_millis(config.push_connect_timeout_ms))
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushChannel>> {
        let parsed_url =
            Url::parse(url).map_err(|error| InvoiceError::Channel(format!("invalid url: {error}")))?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(InvoiceError::Channel(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (stream, _response) = timeout(self.connect_timeout, connect_async(parsed_url.as_str()))
            .await
            .map_err(|_| {
                InvoiceError::Channel(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| InvoiceError::Channel(error.to_string()))?;

        debug!("push channel connected to {}", parsed_url);
        Ok(Box::new(WebSocketChannel {
            url: parsed_url.to_string(),
            stream,
            closed: false,
        }))
    }
}

struct WebSocketChannel {
    url: String,
    stream: WsStream,
    closed: bool,
}

#[async_trait]
impl PushChannel for WebSocketChannel {
    async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        if self.closed {
            return Err(InvoiceError::Channel("channel is closed".to_string()));
        }
        let text = serde_json::to_string(&message.to_json())?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| InvoiceError::Channel(error.to_string()))
    }

    async fn recv(&mut self) -> Option<PushMessage> {
        if self.closed {
            return None;
        }
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match parse_push_message(text.as_str()) {
                    Ok(Some(message)) => return Some(message),
                    Ok(None) => {}
                    Err(error) => warn!("push frame parse error on {}: {}", self.url, error),
                },
                Ok(Message::Ping(payload)) => {
                    debug!("received ping from {} ({} bytes)", self.url, payload.len());
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                Err(error) => {
                    warn!("websocket read error on {}: {}", self.url, error);
                    break;
                }
            }
        }
        self.closed = true;
        None
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|error| InvoiceError::Channel(error.to_string()))
    }
}

#[derive(Default)]
struct MemoryState {
    sender: Option<mpsc::UnboundedSender<PushMessage>>,
    receiver: Option<mpsc::UnboundedReceiver<PushMessage>>,
    connected_urls: Vec<String>,
    sent: Vec<ControlMessage>,
    closed: bool,
    connect_error: Option<String>,
}

/// In-process push channel for tests and for embedders that feed
/// messages from their own transport.
///
/// Messages injected before the connection opens are queued.
#[derive(Clone)]
pub struct MemoryPushConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryPushConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPushConnector {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                sender: Some(sender),
                receiver: Some(receiver),
                ..MemoryState::default()
            })),
        }
    }

    /// A connector whose `connect` always fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        let connector = Self::new();
        connector.lock().connect_error = Some(message.into());
        connector
    }

    /// Queue a message for the channel. Returns `false` once hung up.
    pub fn inject(&self, event: impl Into<String>, data: Value) -> bool {
        let state = self.lock();
        state
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(PushMessage::new(event, data)).is_ok())
    }

    /// Simulate the server dropping the connection.
    pub fn hang_up(&self) {
        self.lock().sender = None;
    }

    #[must_use]
    pub fn connected_urls(&self) -> Vec<String> {
        self.lock().connected_urls.clone()
    }

    #[must_use]
    pub fn sent_messages(&self) -> Vec<ControlMessage> {
        self.lock().sent.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PushConnector for MemoryPushConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushChannel>> {
        let mut state = self.lock();
        if let Some(message) = &state.connect_error {
            return Err(InvoiceError::Channel(message.clone()));
        }
        let receiver = state
            .receiver
            .take()
            .ok_or_else(|| InvoiceError::Channel("memory channel already connected".to_string()))?;
        state.connected_urls.push(url.to_string());
        Ok(Box::new(MemoryChannel {
            receiver,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryChannel {
    receiver: mpsc::UnboundedReceiver<PushMessage>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

#[async_trait]
impl PushChannel for MemoryChannel {
    async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(InvoiceError::Channel("channel is closed".to_string()));
        }
        state.sent.push(message.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<PushMessage> {
        if self.is_closed() {
            return None;
        }
        self.receiver.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.receiver.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    #[test]
    fn parses_push_frames() {
        let message = parse_push_message(r#"{"event":"broadcasted","data":{"id":"inv_1"}}"#)
            .expect("parse")
            .expect("message");
        assert_eq!(message.kind(), Some(EventKind::Broadcasted));
        assert_eq!(message.data["id"], "inv_1");

        assert_eq!(parse_push_message(r#"{"data":{}}"#).expect("parse"), None);
        assert!(parse_push_message("[]").is_err());
        assert!(parse_push_message("not json").is_err());
    }

    #[test]
    fn subscribe_control_message_shape() {
        let message = ControlMessage::Subscribe {
            invoice_id: "inv_1".to_string(),
        };
        assert_eq!(
            message.to_json(),
            json!({"event": "subscribe", "data": {"invoiceId": "inv_1"}})
        );
    }

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let result = WebSocketConnector::default()
            .connect("https://pay.example.com/ws")
            .await;
        assert!(matches!(result, Err(InvoiceError::Channel(_))));
    }

    #[tokio::test]
    async fn memory_channel_records_traffic() -> Result<()> {
        let connector = MemoryPushConnector::new();
        assert!(connector.inject("requested", json!({"id": "inv_1"})));

        let mut channel = connector.connect("memory://inv_1").await?;
        channel
            .send(&ControlMessage::Subscribe {
                invoice_id: "inv_1".to_string(),
            })
            .await?;
        let message = channel.recv().await.expect("queued message");
        assert_eq!(message.event, "requested");

        channel.close().await?;
        assert!(channel.recv().await.is_none());
        assert!(connector.is_closed());
        assert_eq!(connector.connected_urls(), vec!["memory://inv_1".to_string()]);
        assert_eq!(connector.sent_messages().len(), 1);
        assert!(connector.connect("memory://again").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn websocket_channel_subscribes_and_receives() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut socket = accept_async(stream).await.expect("handshake");
            let subscribe = loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => break text.to_string(),
                    Some(Ok(_)) => {}
                    other => panic!("unexpected frame: {other:?}"),
                }
            };
            socket
                .send(Message::Text("garbage".to_string().into()))
                .await
                .expect("send garbage");
            socket
                .send(Message::Text(
                    r#"{"event":"subscribed","data":{"id":"inv_ws"}}"#.to_string().into(),
                ))
                .await
                .expect("send subscribed");
            socket.close(None).await.expect("close");
            subscribe
        });

        let connector = WebSocketConnector::new(Duration::from_secs(2));
        let mut channel = connector.connect(&format!("ws://{addr}/ws")).await?;
        channel
            .send(&ControlMessage::Subscribe {
                invoice_id: "inv_ws".to_string(),
            })
            .await?;

        let message = channel.recv().await.expect("subscribed message");
        assert_eq!(message.kind(), Some(EventKind::Subscribed));
        assert!(channel.recv().await.is_none());

        let subscribe: Value = serde_json::from_str(&server.await?)?;
        assert_eq!(subscribe["data"]["invoiceId"], "inv_ws");
        Ok(())
    }
}
