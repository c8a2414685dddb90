//! HTTP long-polling fallback transport.
//!
//! Emulates a duplex stream over repeated request/response cycles
//! against a single endpoint. All requests are POSTs carrying a JSON
//! body `{mode, msg?, suid}`.
//!
//! # Session Handshake
//!
//! Construction is followed by a one-time handshake POST (empty JSON
//! object) whose response `{"suid": "..."}` yields the session token
//! the server uses to associate stateless requests with this logical
//! client. Until the token arrives the transport is `Connecting` and
//! outbound sends are queued, never dropped. A failed handshake is
//! reported through the event channel and is not retried.
//!
//! # Receive Loop
//!
//! Once open, an unbounded self-rescheduling loop issues
//! `{mode: "receive", suid}` requests with a bounded timeout. A timeout
//! is the normal "no data yet" signal, not a failure: the next request
//! goes out immediately either way. A single failed poll never closes
//! the transport; only [`shutdown`](super::Transport::shutdown) stops
//! the loop. Consecutive failures are counted and logged so a policy
//! layer above can observe sustained trouble.
//!
//! # Sends
//!
//! Outbound messages are fire-and-forget `{mode: "input", msg, suid}`
//! requests, serialized through one worker task so wire order matches
//! call order.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{ConnectionState, EventSender, Transport, TransportEvent};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on a single receive poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive poll failures before escalating the log level.
const POLL_FAILURE_WARN_THRESHOLD: u32 = 3;

// ============================================================================
// Wire Shapes
// ============================================================================

/// Request body for input and receive cycles.
#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<&'a str>,
    suid: &'a str,
}

/// Handshake response body.
#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    suid: String,
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    state: Mutex<ConnectionState>,
    events: EventSender,
    stop: AtomicBool,
    stopped: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

// ============================================================================
// PollingTransport
// ============================================================================

/// Fallback transport emulating a duplex stream over HTTP.
pub struct PollingTransport {
    endpoint: String,
    http: reqwest::Client,
    poll_timeout: Duration,
    shared: Arc<Shared>,
    /// Sends issued before the handshake token arrives.
    queue: Mutex<VecDeque<String>>,
    /// Input worker channel; `Some` once open.
    input_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl PollingTransport {
    /// Creates a transport targeting the HTTP `endpoint`, reporting
    /// through `events`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, events: EventSender) -> Self {
        Self::with_poll_timeout(endpoint, events, DEFAULT_POLL_TIMEOUT)
    }

    /// Creates a transport with a custom receive-poll bound.
    #[must_use]
    pub fn with_poll_timeout(
        endpoint: impl Into<String>,
        events: EventSender,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
            poll_timeout,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Connecting),
                events,
                stop: AtomicBool::new(false),
                stopped: Notify::new(),
            }),
            queue: Mutex::new(VecDeque::new()),
            input_tx: Mutex::new(None),
        }
    }

    /// Number of sends waiting for the handshake token.
    #[inline]
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// One-time handshake obtaining the session token.
    async fn handshake(&self) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({}))
            .timeout(self.poll_timeout)
            .send()
            .await
            .map_err(|e| Error::handshake(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::handshake(format!("handshake returned {status}")));
        }

        let body: HandshakeResponse = response
            .json()
            .await
            .map_err(|e| Error::handshake(format!("bad handshake body: {e}")))?;

        if body.suid.is_empty() {
            return Err(Error::handshake("empty session token"));
        }

        Ok(body.suid)
    }

    /// Worker draining the input queue in order.
    async fn run_input_worker(
        http: reqwest::Client,
        endpoint: String,
        suid: String,
        mut input_rx: mpsc::UnboundedReceiver<String>,
        shared: Arc<Shared>,
    ) {
        while let Some(wire) = input_rx.recv().await {
            if shared.stop.load(Ordering::Relaxed) {
                break;
            }

            let request = PollRequest {
                mode: "input",
                msg: Some(&wire),
                suid: &suid,
            };

            match http.post(&endpoint).json(&request).send().await {
                Ok(response) if response.status().is_success() => {
                    trace!(len = wire.len(), "input delivered");
                }
                Ok(response) => {
                    let status = response.status();
                    warn!(%status, "input rejected");
                    shared.emit(TransportEvent::Error(format!("input returned {status}")));
                }
                Err(e) => {
                    warn!(error = %e, "input failed");
                    shared.emit(TransportEvent::Error(e.to_string()));
                }
            }
        }

        debug!("input worker stopped");
    }

    /// Unbounded self-rescheduling receive loop.
    async fn run_receive_loop(
        http: reqwest::Client,
        endpoint: String,
        suid: String,
        poll_timeout: Duration,
        shared: Arc<Shared>,
    ) {
        let mut consecutive_failures: u32 = 0;

        loop {
            if shared.stop.load(Ordering::Relaxed) {
                break;
            }

            let request = PollRequest {
                mode: "receive",
                msg: None,
                suid: &suid,
            };

            let poll = http
                .post(&endpoint)
                .json(&request)
                .timeout(poll_timeout)
                .send();

            let result = tokio::select! {
                _ = shared.stopped.notified() => break,
                result = poll => result,
            };

            match result {
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(body) if !body.is_empty() => {
                            consecutive_failures = 0;
                            trace!(len = body.len(), "poll delivered data");
                            shared.emit(TransportEvent::Message(body));
                        }
                        // Empty body: no data yet, poll again.
                        Ok(_) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(error = %e, "poll body read failed");
                        }
                    }
                }

                Ok(response) => {
                    consecutive_failures += 1;
                    warn!(status = %response.status(), "poll rejected");
                }

                // Timeout is "no data yet", not a failure.
                Err(e) if e.is_timeout() => {
                    trace!("poll timed out, rescheduling");
                    consecutive_failures = 0;
                }

                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, "poll failed");
                }
            }

            if consecutive_failures == POLL_FAILURE_WARN_THRESHOLD {
                warn!(
                    consecutive_failures,
                    "sustained poll failures; transport stays up, policy above decides"
                );
            }
        }

        debug!("receive loop stopped");
    }
}

#[async_trait]
impl Transport for PollingTransport {
    async fn connect(&self) -> Result<()> {
        if self.input_tx.lock().is_some() {
            return Ok(());
        }

        let suid = match self.handshake().await {
            Ok(suid) => suid,
            Err(e) => {
                self.shared.set_state(ConnectionState::Errored);
                self.shared.emit(TransportEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        debug!(suid = %suid, "polling session established");

        let (input_tx, input_rx) = mpsc::unbounded_channel();

        // Flush everything queued during the handshake, in order. The
        // queue lock is held across the flush AND the Open transition:
        // `send` checks the state under the same lock, so a concurrent
        // send either lands in the queue before the drain or observes
        // Open and goes straight to the worker. Nothing can strand.
        {
            let mut queue = self.queue.lock();
            for wire in queue.drain(..) {
                let _ = input_tx.send(wire);
            }
            *self.input_tx.lock() = Some(input_tx);
            self.shared.set_state(ConnectionState::Open);
        }
        self.shared.emit(TransportEvent::Open);

        tokio::spawn(Self::run_input_worker(
            self.http.clone(),
            self.endpoint.clone(),
            suid.clone(),
            input_rx,
            Arc::clone(&self.shared),
        ));

        tokio::spawn(Self::run_receive_loop(
            self.http.clone(),
            self.endpoint.clone(),
            suid,
            self.poll_timeout,
            Arc::clone(&self.shared),
        ));

        Ok(())
    }

    fn send(&self, wire: String) {
        // The state check and the push share the queue lock with the
        // Open transition in `connect`, so a send can never observe
        // Connecting after the pre-open queue has been drained.
        {
            let mut queue = self.queue.lock();
            if *self.shared.state.lock() == ConnectionState::Connecting {
                trace!("queueing send until handshake completes");
                queue.push_back(wire);
                return;
            }
        }

        match self.state() {
            ConnectionState::Open => {
                let guard = self.input_tx.lock();
                match guard.as_ref() {
                    Some(input_tx) if input_tx.send(wire).is_ok() => {}
                    _ => {
                        self.shared
                            .emit(TransportEvent::Error("input worker gone".to_string()));
                    }
                }
            }

            ConnectionState::Connecting | ConnectionState::Closed | ConnectionState::Errored => {
                warn!("send on closed polling transport");
                self.shared
                    .emit(TransportEvent::Error("send on closed transport".to_string()));
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::Relaxed) {
            return;
        }

        // notify_one leaves a permit behind if the receive loop is not
        // parked in its select yet, so the wakeup cannot be lost and
        // the loop never lingers for a full poll timeout.
        self.shared.stopped.notify_one();
        *self.input_tx.lock() = None;

        let was_usable = self.state().is_usable();
        self.shared.set_state(ConnectionState::Closed);
        if was_usable {
            self.shared.emit(TransportEvent::Closed);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (PollingTransport, super::super::EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            PollingTransport::new("http://127.0.0.1:1/poll", events_tx),
            events_rx,
        )
    }

    #[test]
    fn test_initial_state_is_connecting() {
        let (transport, _events) = transport();
        assert_eq!(transport.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_pre_handshake_sends_are_queued() {
        let (transport, mut events) = transport();

        transport.send(r#"["look",{}]"#.to_string());
        transport.send(r#"["who",{}]"#.to_string());

        assert_eq!(transport.queued_len(), 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_failure_surfaces_error_event() {
        let (transport, mut events) = transport();

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed { .. }));
        assert_eq!(transport.state(), ConnectionState::Errored);

        match events.try_recv() {
            Ok(TransportEvent::Error(message)) => {
                assert!(message.contains("Handshake failed"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_noop_plus_error() {
        let (transport, mut events) = transport();

        transport.shutdown();
        assert_eq!(transport.state(), ConnectionState::Closed);

        // Shutdown from Connecting emits Closed.
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Closed)));

        transport.send(r#"["look",{}]"#.to_string());
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Error(_))));
        assert_eq!(transport.queued_len(), 0);
    }

    #[test]
    fn test_poll_request_serialization() {
        let request = PollRequest {
            mode: "input",
            msg: Some(r#"["look",{}]"#),
            suid: "abc123",
        };
        let json = serde_json::to_string(&request).expect("serialize");
        assert_eq!(
            json,
            r#"{"mode":"input","msg":"[\"look\",{}]","suid":"abc123"}"#
        );

        let receive = PollRequest {
            mode: "receive",
            msg: None,
            suid: "abc123",
        };
        let json = serde_json::to_string(&receive).expect("serialize");
        assert_eq!(json, r#"{"mode":"receive","suid":"abc123"}"#);
    }

    #[test]
    fn test_handshake_response_parsing() {
        let body: HandshakeResponse =
            serde_json::from_str(r#"{"suid": "session-7"}"#).expect("parse");
        assert_eq!(body.suid, "session-7");
    }
}
