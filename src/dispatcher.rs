//! Publish/subscribe dispatch for uncorrelated inbound envelopes.
//!
//! The [`Dispatcher`] maps command names to listeners. Every inbound
//! envelope that is not a correlated reply is emitted here; events with
//! no listener are silently dropped (no buffering, no replay).
//!
//! # Registry Policy
//!
//! The registry is single-slot: `on` replaces any existing listener for
//! the same command name. Applications that want fan-out register one
//! listener and multiplex behind it.
//!
//! # Lifecycle Events
//!
//! Transport state transitions arrive under reserved command names, see
//! [`lifecycle`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;

// ============================================================================
// Lifecycle Command Names
// ============================================================================

/// Reserved command names for transport lifecycle events.
pub mod lifecycle {
    /// The channel became usable.
    pub const OPEN: &str = "socket:open";

    /// The channel shut down.
    pub const CLOSE: &str = "socket:close";

    /// A transport-level failure occurred. Payload carries an `error`
    /// descriptor when one is available.
    pub const ERROR: &str = "socket:error";
}

// ============================================================================
// Types
// ============================================================================

/// Listener invoked with the payload of a matching envelope.
pub type Listener = Box<dyn Fn(Value) + Send + Sync + 'static>;

/// Stored form; cloned out of the registry before invocation so
/// listeners may re-enter the dispatcher.
type ListenerSlot = Arc<dyn Fn(Value) + Send + Sync + 'static>;

// ============================================================================
// Dispatcher
// ============================================================================

/// Single-slot publish/subscribe registry keyed by command name.
///
/// Thread-safe; shared between the client's pump task and the
/// application via `Arc`. Listener invocation is synchronous on the
/// emitting thread.
pub struct Dispatcher {
    listeners: Mutex<FxHashMap<String, ListenerSlot>>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers `listener` for `command`.
    ///
    /// A previous registration for the same command is silently
    /// discarded.
    pub fn on(&self, command: impl Into<String>, listener: Listener) {
        let command = command.into();
        trace!(command = %command, "listener registered");
        self.listeners.lock().insert(command, Arc::from(listener));
    }

    /// Removes any registration for `command`. No-op if none exists.
    pub fn off(&self, command: &str) {
        self.listeners.lock().remove(command);
    }

    /// Emits `payload` to the listener registered for `command`.
    ///
    /// The listener runs synchronously before `emit` returns. Events
    /// with no listener are dropped. Returns whether a listener ran.
    pub fn emit(&self, command: &str, payload: Value) -> bool {
        // Clone the slot and drop the lock before invoking, so a
        // listener may re-enter on/off/emit without deadlocking.
        let listener = self.listeners.lock().get(command).cloned();
        match listener {
            Some(listener) => {
                listener(payload);
                true
            }
            None => {
                trace!(command, "no listener, event dropped");
                false
            }
        }
    }

    /// Returns `true` if a listener is registered for `command`.
    #[inline]
    #[must_use]
    pub fn has_listener(&self, command: &str) -> bool {
        self.listeners.lock().contains_key(command)
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Returns `true` if no listeners are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
