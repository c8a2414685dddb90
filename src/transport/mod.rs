//! Transport layer: two strategies behind one seam.
//!
//! A transport moves encoded envelopes to and from the remote endpoint
//! and reports everything that happens on the channel through a single
//! event stream. The client never sees which strategy is active.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   TransportEvent    ┌─────────────────┐
//! │  Client pump   │◄────────────────────│  event loop     │
//! │                │                     │  (one task per  │
//! │  send(wire) ───┼────────────────────►│   transport)    │
//! └────────────────┘   outbound queue    └─────────────────┘
//! ```
//!
//! # Strategies
//!
//! | Module | Strategy |
//! |--------|----------|
//! | `websocket` | Persistent duplex stream over WebSocket |
//! | `polling` | HTTP long-poll cycles emulating a duplex stream |
//!
//! The strategy is chosen once, at client construction, and never
//! re-evaluated at runtime. [`TransportKind::Auto`] tries the WebSocket
//! upgrade first and falls back to polling when it fails.

// ============================================================================
// Submodules
// ============================================================================

/// HTTP long-polling fallback transport.
pub mod polling;

/// Persistent WebSocket transport.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use polling::PollingTransport;
pub use websocket::WebSocketTransport;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel establishment is in progress.
    Connecting,
    /// Channel is usable; sends transmit immediately.
    Open,
    /// Channel shut down normally. Terminal.
    Closed,
    /// Channel failed. Transitions to [`ConnectionState::Closed`].
    Errored,
}

impl ConnectionState {
    /// Returns `true` if the channel can still carry traffic.
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Everything a transport surfaces to its owning client.
///
/// Inbound messages are delivered in the order the underlying channel
/// produced them; the event channel imposes no reordering.
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel became usable.
    Open,
    /// One inbound wire message.
    Message(String),
    /// The channel shut down. Emitted exactly once.
    Closed,
    /// A channel-level failure. Does not necessarily end the channel.
    Error(String),
}

/// Sender half used by transports to reach the client pump.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half drained by the client pump.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

// ============================================================================
// Transport Trait
// ============================================================================

/// Polymorphic transport contract.
///
/// Both strategies present an identical surface so the rest of the
/// system stays transport-agnostic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begins establishing the underlying channel.
    ///
    /// Resolves once the channel reaches [`ConnectionState::Open`] (or
    /// establishment fails); lifecycle events still flow through the
    /// event channel so listeners observe the same transitions.
    async fn connect(&self) -> Result<()>;

    /// Queues or immediately transmits one encoded envelope.
    ///
    /// Never raises into the caller: transmission failures surface as
    /// [`TransportEvent::Error`]. Sends while the channel is still
    /// establishing are queued, never dropped; sends after the channel
    /// closed are no-ops plus an error event.
    fn send(&self, wire: String);

    /// Returns the current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Tears down the channel and its event loop. Idempotent.
    fn shutdown(&self);
}

// ============================================================================
// TransportKind
// ============================================================================

/// Strategy selection, made once at client construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Try the persistent transport; fall back to polling when the
    /// upgrade fails.
    #[default]
    Auto,
    /// Persistent WebSocket only.
    WebSocket,
    /// HTTP long-polling only.
    Polling,
}

// ============================================================================
// Tests
// ============================================================================
