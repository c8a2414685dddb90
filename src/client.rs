//! Client facade and builder.
//!
//! The [`Client`] is the single object applications talk to. It owns
//! the active transport, the correlation table, and the dispatcher,
//! and runs one pump task that fans every transport event into the
//! right place:
//!
//! ```text
//! app ──► send / call ──► correlation ──► envelope ──► transport ──► wire
//! wire ──► transport ──► pump ──► correlation (reply?) ──► callback
//!                              └─► dispatcher (otherwise) ──► listener
//! ```
//!
//! Correlation is checked before broadcast. A reply carrying a
//! registered id resolves its caller and never also reaches listeners
//! registered for the same command name.
//!
//! # Example
//!
//! ```ignore
//! use commandwire::{Client, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder("ws://game.example.net/wire")
//!         .connect()
//!         .await?;
//!
//!     client.on("chat", Box::new(|payload| {
//!         println!("chat: {}", payload["text"]);
//!     }));
//!
//!     client.send("look", json!({}))?;
//!     let reply = client.call("who", json!({})).await?;
//!     println!("players: {}", reply.payload["players"]);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::correlation::{CorrelationTable, RequestId};
use crate::dispatcher::{Dispatcher, Listener, lifecycle};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::transport::{
    ConnectionState, EventReceiver, EventSender, PollingTransport, Transport, TransportEvent,
    TransportKind, WebSocketTransport,
};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for correlated calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum calls awaiting replies before new ones are rejected.
pub const MAX_PENDING_CALLS: usize = 256;

// ============================================================================
// Types
// ============================================================================

/// Constructor substituting a custom transport at init time.
///
/// Receives the event sender the client pump drains.
pub type TransportFactory = Box<dyn FnOnce(EventSender) -> Box<dyn Transport> + Send>;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Fluent configuration for a [`Client`].
///
/// Every option has a default: [`TransportKind::Auto`] strategy, a
/// fresh [`Dispatcher`], 30 second call and poll timeouts.
pub struct ClientBuilder {
    url: String,
    kind: TransportKind,
    dispatcher: Option<Arc<Dispatcher>>,
    factory: Option<TransportFactory>,
    call_timeout: Duration,
    poll_timeout: Duration,
}

impl ClientBuilder {
    /// Creates a builder targeting `url`.
    ///
    /// Any of `ws://`, `wss://`, `http://`, `https://` is accepted; the
    /// sibling scheme for the other strategy is derived from it.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: TransportKind::Auto,
            dispatcher: None,
            factory: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            poll_timeout: crate::transport::polling::DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Sets the transport strategy. Default: [`TransportKind::Auto`].
    #[must_use]
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Substitutes a caller-provided dispatcher instance.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Substitutes a caller-provided transport constructor.
    ///
    /// Overrides the strategy selection entirely; useful for tests and
    /// bespoke channels.
    #[must_use]
    pub fn connection(mut self, factory: TransportFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets the timeout for correlated calls. Default: 30s.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the bound on a single receive poll. Default: 30s.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Establishes the transport and starts the client.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if the endpoint URL is unusable
    /// - [`Error::HandshakeFailed`] if the polling handshake fails
    /// - Transport-level errors if the selected strategy cannot connect
    pub async fn connect(self) -> Result<Client> {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let (transport, kind): (Box<dyn Transport>, TransportKind) = match self.factory {
            Some(factory) => {
                let transport = factory(events_tx);
                transport.connect().await?;
                (transport, self.kind)
            }
            None => {
                Self::select_transport(&self.url, self.kind, self.poll_timeout, events_tx).await?
            }
        };

        info!(url = %self.url, ?kind, "client connected");

        let dispatcher = self.dispatcher.unwrap_or_default();
        Ok(Client::start(
            transport,
            kind,
            dispatcher,
            events_rx,
            self.call_timeout,
        ))
    }

    /// Derives `(ws_url, http_url)` from the configured endpoint.
    fn derive_urls(raw: &str) -> Result<(String, String)> {
        let url = Url::parse(raw).map_err(|_| Error::invalid_url(raw))?;

        let (ws_scheme, http_scheme) = match url.scheme() {
            "ws" | "http" => ("ws", "http"),
            "wss" | "https" => ("wss", "https"),
            _ => return Err(Error::invalid_url(raw)),
        };

        let mut ws_url = url.clone();
        let mut http_url = url;
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|()| Error::invalid_url(raw))?;
        http_url
            .set_scheme(http_scheme)
            .map_err(|()| Error::invalid_url(raw))?;

        Ok((ws_url.into(), http_url.into()))
    }

    /// Picks and connects a transport per the configured strategy.
    ///
    /// The choice is made exactly once; it is never re-evaluated at
    /// runtime.
    async fn select_transport(
        raw_url: &str,
        kind: TransportKind,
        poll_timeout: Duration,
        events_tx: EventSender,
    ) -> Result<(Box<dyn Transport>, TransportKind)> {
        let (ws_url, http_url) = Self::derive_urls(raw_url)?;

        match kind {
            TransportKind::WebSocket => {
                let transport = WebSocketTransport::new(ws_url, events_tx);
                transport.connect().await?;
                Ok((Box::new(transport), TransportKind::WebSocket))
            }

            TransportKind::Polling => {
                let transport =
                    PollingTransport::with_poll_timeout(http_url, events_tx, poll_timeout);
                transport.connect().await?;
                Ok((Box::new(transport), TransportKind::Polling))
            }

            TransportKind::Auto => {
                let websocket = WebSocketTransport::new(ws_url, events_tx.clone());
                match websocket.connect().await {
                    Ok(()) => Ok((Box::new(websocket), TransportKind::WebSocket)),
                    Err(e) => {
                        debug!(error = %e, "WebSocket unavailable, falling back to polling");
                        let transport =
                            PollingTransport::with_poll_timeout(http_url, events_tx, poll_timeout);
                        transport.connect().await?;
                        Ok((Box::new(transport), TransportKind::Polling))
                    }
                }
            }
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// The facade applications exchange commands through.
///
/// Independent clients never share correlation or dispatch state: all
/// of it is instance-owned, so several clients can coexist in one
/// process.
pub struct Client {
    transport: Box<dyn Transport>,
    kind: TransportKind,
    correlation: Arc<CorrelationTable>,
    dispatcher: Arc<Dispatcher>,
    call_timeout: Duration,
    pump: JoinHandle<()>,
}

impl Client {
    /// Creates a builder targeting `url`.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Wires the pump task and returns the running client.
    fn start(
        transport: Box<dyn Transport>,
        kind: TransportKind,
        dispatcher: Arc<Dispatcher>,
        events_rx: EventReceiver,
        call_timeout: Duration,
    ) -> Self {
        let correlation = Arc::new(CorrelationTable::new());

        let pump = tokio::spawn(Self::run_pump(
            events_rx,
            Arc::clone(&correlation),
            Arc::clone(&dispatcher),
        ));

        Self {
            transport,
            kind,
            correlation,
            dispatcher,
            call_timeout,
            pump,
        }
    }

    /// Drains transport events in arrival order.
    async fn run_pump(
        mut events_rx: EventReceiver,
        correlation: Arc<CorrelationTable>,
        dispatcher: Arc<Dispatcher>,
    ) {
        while let Some(event) = events_rx.recv().await {
            match event {
                TransportEvent::Open => {
                    dispatcher.emit(lifecycle::OPEN, json!({}));
                }

                TransportEvent::Message(wire) => {
                    Self::receive(&correlation, &dispatcher, &wire);
                }

                TransportEvent::Error(message) => {
                    dispatcher.emit(lifecycle::ERROR, json!({ "error": message }));
                }

                TransportEvent::Closed => {
                    correlation.fail_all("connection closed");
                    dispatcher.emit(lifecycle::CLOSE, json!({}));
                }
            }
        }

        debug!("event pump terminated");
    }

    /// Routes one inbound wire message.
    ///
    /// Correlation strictly precedes broadcast: a reply that resolves a
    /// pending call never also reaches the dispatcher. A reply-shaped
    /// message whose id was never registered falls through to the
    /// dispatcher like any other envelope. Malformed wire data is
    /// logged and dropped.
    fn receive(correlation: &CorrelationTable, dispatcher: &Dispatcher, wire: &str) {
        let envelope = match Envelope::decode(wire) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed inbound message");
                return;
            }
        };

        if let Some(id) = envelope.request_id()
            && correlation.resolve(id, envelope.clone())
        {
            trace!(%id, "reply correlated");
            return;
        }

        dispatcher.emit(&envelope.command, envelope.payload);
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Sends a fire-and-forget command. No id is injected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEnvelope`] if `command` is empty or
    /// `payload` is not a JSON object. Transmission failures surface as
    /// `socket:error` events, never here.
    pub fn send(&self, command: impl Into<String>, payload: Value) -> Result<()> {
        let envelope = Envelope::new(command, payload)?;
        self.transport.send(envelope.encode()?);
        Ok(())
    }

    /// Sends a command expecting a reply, with an explicit callback.
    ///
    /// Registers `callback` in the correlation table, injects the
    /// allocated id into a copy of the payload, and transmits. The
    /// callback runs at most once, when the matching reply arrives or
    /// the session tears down. Returns the allocated id.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyPending`] if the pending-call cap is reached
    /// - [`Error::MalformedEnvelope`] for invalid command/payload
    pub fn send_with_callback(
        &self,
        command: impl Into<String>,
        payload: Value,
        callback: impl FnOnce(Envelope) + Send + 'static,
    ) -> Result<RequestId> {
        let pending = self.correlation.len();
        if pending >= MAX_PENDING_CALLS {
            warn!(pending, max = MAX_PENDING_CALLS, "too many pending calls");
            return Err(Error::too_many_pending(pending, MAX_PENDING_CALLS));
        }

        let envelope = Envelope::new(command, payload)?;
        let id = self.correlation.register(Box::new(callback));
        let tagged = envelope.with_request_id(id);

        let wire = match tagged.encode() {
            Ok(wire) => wire,
            Err(e) => {
                self.correlation.cancel(id);
                return Err(e);
            }
        };

        self.transport.send(wire);
        trace!(%id, command = %tagged.command, "request sent");
        Ok(id)
    }

    /// Sends a command and awaits its reply.
    ///
    /// Built on [`send_with_callback`](Self::send_with_callback) with
    /// the configured call timeout; on expiry the pending entry is
    /// cancelled so a late reply is silently ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if no reply arrives in time
    /// - [`Error::ConnectionClosed`] if the session tears down first
    /// - [`Error::TooManyPending`] if the pending-call cap is reached
    pub async fn call(&self, command: impl Into<String>, payload: Value) -> Result<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let id = self.send_with_callback(command, payload, move |envelope| {
            let _ = reply_tx.send(envelope);
        })?;

        match timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(envelope)) => {
                // fail_all delivers a synthetic socket:error envelope.
                if envelope.command == lifecycle::ERROR {
                    return Err(Error::ConnectionClosed);
                }
                Ok(envelope)
            }
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.correlation.cancel(id);
                Err(Error::request_timeout(
                    id,
                    self.call_timeout.as_millis() as u64,
                ))
            }
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Registers `listener` for `command` on the dispatcher.
    pub fn on(&self, command: impl Into<String>, listener: Listener) {
        self.dispatcher.on(command, listener);
    }

    /// Removes any listener for `command`.
    pub fn off(&self, command: &str) {
        self.dispatcher.off(command);
    }

    /// Returns the shared dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns the active transport's lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Returns which strategy ended up active.
    #[inline]
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Returns the number of calls awaiting replies.
    #[inline]
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.correlation.len()
    }

    /// Tears down the transport. Pending calls fail with
    /// `socket:error`; the pump drains remaining events and stops.
    pub fn shutdown(&self) {
        self.transport.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.transport.shutdown();
        // The pump ends on its own once the transport's event senders
        // drop; abort covers loops still blocked on I/O.
        self.pump.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
