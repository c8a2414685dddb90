//! commandwire - Dual-transport command client.
//!
//! This library lets an application exchange structured, asynchronously
//! correlated commands with one remote server endpoint, transparently
//! choosing between a persistent WebSocket and an HTTP long-polling
//! fallback when the former is unavailable.
//!
//! # Architecture
//!
//! Every message is a two-element envelope `[command, payload]`.
//! Outbound commands that expect a reply are tagged with a generated id
//! and resolved by the correlation table when the reply arrives; every
//! other inbound envelope fans into a publish/subscribe dispatcher.
//!
//! Key design principles:
//!
//! - Both transports present one event surface; the rest of the system
//!   is transport-agnostic
//! - The strategy is chosen once, at init, never re-evaluated
//! - Correlation is checked before broadcast: a reply never also
//!   reaches listeners of the same command name
//! - Inbound failures degrade to events and logs, never panics or
//!   exceptions across the client boundary
//!
//! # Quick Start
//!
//! ```no_run
//! use commandwire::{Client, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Auto: try WebSocket, fall back to long-polling.
//!     let client = Client::builder("ws://game.example.net/wire")
//!         .connect()
//!         .await?;
//!
//!     client.on("chat", Box::new(|payload| {
//!         println!("chat: {}", payload["text"]);
//!     }));
//!
//!     client.send("look", json!({}))?;
//!
//!     let reply = client.call("who", json!({})).await?;
//!     println!("players: {}", reply.payload["players"]);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] facade and [`ClientBuilder`] |
//! | [`correlation`] | [`RequestId`] allocation and reply matching |
//! | [`dispatcher`] | Publish/subscribe registry and lifecycle names |
//! | [`envelope`] | [`Envelope`] type and wire codec |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`transport`] | Transport seam and both strategies |

// ============================================================================
// Modules
// ============================================================================

/// Client facade and builder.
pub mod client;

/// Request/reply correlation.
pub mod correlation;

/// Publish/subscribe dispatch.
pub mod dispatcher;

/// Envelope type and wire codec.
pub mod envelope;

/// Error types and result aliases.
pub mod error;

/// Transport layer: WebSocket and long-polling strategies.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{Client, ClientBuilder, TransportFactory};
pub use correlation::{CorrelationTable, RequestId};
pub use dispatcher::{Dispatcher, Listener, lifecycle};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use transport::{
    ConnectionState, PollingTransport, Transport, TransportEvent, TransportKind,
    WebSocketTransport,
};
