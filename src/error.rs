//! Error types for commandwire.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use commandwire::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     let reply = client.call("who", serde_json::json!({})).await?;
//!     println!("players: {}", reply.payload);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Envelope | [`Error::MalformedEnvelope`] |
//! | Connection | [`Error::Transport`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Handshake | [`Error::HandshakeFailed`] |
//! | Correlation | [`Error::RequestTimeout`], [`Error::TooManyPending`] |
//! | Configuration | [`Error::InvalidUrl`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |
//!
//! Failures on the *inbound* path (malformed wire data, unsolicited
//! replies, channel-level errors) never cross the client boundary as
//! errors: they are logged and surfaced as `socket:error` events.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::correlation::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Envelope Errors
    // ========================================================================
    /// Inbound wire data could not be decoded as an envelope.
    ///
    /// Returned when the text is not valid JSON, not an array, or the
    /// array does not hold a `[command, payload]` pair.
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Why decoding failed.
        reason: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Channel-level transport failure.
    ///
    /// Surfaced to applications as a `socket:error` event, never thrown
    /// through `Transport::send`.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Connection could not be established within the timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Polling transport could not obtain a session token.
    ///
    /// The transport does not retry the handshake automatically.
    #[error("Handshake failed: {message}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Correlation Errors
    // ========================================================================
    /// A correlated call did not receive its reply in time.
    ///
    /// The pending entry is cancelled; a late reply for this id is
    /// silently ignored.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Too many calls awaiting replies.
    #[error("Too many pending calls: {pending}/{max}")]
    TooManyPending {
        /// Current number of pending calls.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Endpoint URL could not be parsed or has an unsupported scheme.
    #[error("Invalid endpoint URL: {url}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP error from the polling transport.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a malformed envelope error.
    #[inline]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a handshake failure error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a too-many-pending error.
    #[inline]
    pub fn too_many_pending(pending: usize, max: usize) -> Self {
        Self::TooManyPending { pending, max }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a transport-level error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::HandshakeFailed { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::TooManyPending { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
