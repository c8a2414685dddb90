//! Persistent WebSocket transport.
//!
//! A single long-lived duplex stream. The event loop `select!`s over
//! inbound frames and the outbound queue, forwarding both sides without
//! reordering.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──► Open ──► Closed            (normal shutdown)
//!                 │
//!                 └─────► Errored ──► Closed (transport failure)
//! ```
//!
//! No automatic reconnect: once closed, every further `send` is a no-op
//! plus a `socket:error` event. Reconnection policy belongs to the
//! layer above, which currently has none.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{ConnectionState, EventSender, Transport, TransportEvent};

// ============================================================================
// Constants
// ============================================================================

/// Timeout for the WebSocket upgrade.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands for the event loop.
enum Command {
    /// Transmit one wire message.
    Send(String),
    /// Close the stream and stop the loop.
    Shutdown,
}

/// State shared between the handle and the event loop.
struct Shared {
    state: Mutex<ConnectionState>,
    events: EventSender,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: TransportEvent) {
        // The pump may already be gone during teardown; that is fine.
        let _ = self.events.send(event);
    }
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Persistent transport over a WebSocket connection.
///
/// Messages sent before [`connect`](Transport::connect) resolves sit in
/// the outbound queue and flush once the stream is up.
pub struct WebSocketTransport {
    url: String,
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Command>,
    /// Taken by the event loop on connect; `None` afterwards.
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl WebSocketTransport {
    /// Creates a transport targeting `url` (a `ws://` or `wss://`
    /// endpoint), reporting through `events`.
    #[must_use]
    pub fn new(url: impl Into<String>, events: EventSender) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Connecting),
                events,
            }),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    /// Event loop bridging the stream and the outbound queue.
    async fn run_event_loop(
        ws_stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        shared: Arc<Shared>,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let mut errored = false;

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            trace!(len = text.len(), "inbound frame");
                            shared.emit(TransportEvent::Message(text.to_string()));
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            shared.set_state(ConnectionState::Errored);
                            shared.emit(TransportEvent::Error(e.to_string()));
                            errored = true;
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong, Frame
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(Command::Send(wire)) => {
                            if let Err(e) = ws_write.send(Message::Text(wire.into())).await {
                                warn!(error = %e, "send failed");
                                shared.emit(TransportEvent::Error(e.to_string()));
                            }
                        }

                        Some(Command::Shutdown) => {
                            debug!("shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        if errored {
            debug!("event loop terminated after error");
        }
        shared.set_state(ConnectionState::Closed);
        shared.emit(TransportEvent::Closed);
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<()> {
        let Some(command_rx) = self.command_rx.lock().take() else {
            // connect() already ran; the loop owns the receiver.
            return Ok(());
        };

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let ws_stream = match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Errored);
                *self.command_rx.lock() = Some(command_rx);
                return Err(Error::WebSocket(e));
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Errored);
                *self.command_rx.lock() = Some(command_rx);
                return Err(Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64));
            }
        };

        debug!(url = %self.url, "WebSocket connected");
        self.shared.set_state(ConnectionState::Open);
        self.shared.emit(TransportEvent::Open);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(Self::run_event_loop(ws_stream, command_rx, shared));

        Ok(())
    }

    fn send(&self, wire: String) {
        if !self.state().is_usable() {
            warn!("send on closed WebSocket transport");
            self.shared
                .emit(TransportEvent::Error("send on closed transport".to_string()));
            return;
        }

        if self.command_tx.send(Command::Send(wire)).is_err() {
            self.shared
                .emit(TransportEvent::Error("event loop gone".to_string()));
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (WebSocketTransport, super::super::EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            WebSocketTransport::new("ws://127.0.0.1:1/never", events_tx),
            events_rx,
        )
    }

    #[test]
    fn test_initial_state_is_connecting() {
        let (transport, _events) = transport();
        assert_eq!(transport.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let (transport, _events) = transport();
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transport_error() || err.is_timeout());
        assert_eq!(transport.state(), ConnectionState::Errored);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_queued() {
        let (transport, mut events) = transport();

        // State is Connecting, so this queues rather than erroring.
        transport.send(r#"["look",{}]"#.to_string());
        assert!(events.try_recv().is_err());
    }
}
