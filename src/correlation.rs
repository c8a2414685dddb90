//! Request/reply correlation.
//!
//! Outbound commands that expect a reply are tagged with a generated
//! [`RequestId`]; the [`CorrelationTable`] holds the pending callback
//! until a matching reply arrives and resolves it exactly once.
//!
//! # Lifecycle
//!
//! ```text
//! register() ──► pending ──► resolve()   (callback runs, entry removed)
//!                   │
//!                   ├──────► cancel()    (entry removed, callback dropped)
//!                   └──────► fail_all()  (teardown, callback gets socket:error)
//! ```
//!
//! Ids are monotonically increasing per table and never reused while a
//! callback for them is outstanding. An id the table never handed out
//! can never resolve, so an unsolicited reply-shaped message from the
//! server cannot hit a stale callback slot.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use crate::dispatcher::lifecycle;
use crate::envelope::Envelope;

// ============================================================================
// RequestId
// ============================================================================

/// Identifier correlating an outbound command with its reply.
///
/// Allocated by [`CorrelationTable::register`]; serialized as a bare
/// integer in the reserved payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw integer id.
    #[inline]
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw integer value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Types
// ============================================================================

/// Callback invoked with the reply envelope. Runs at most once.
pub type ReplyCallback = Box<dyn FnOnce(Envelope) + Send + 'static>;

/// Map of request ids to pending callbacks.
type PendingMap = FxHashMap<RequestId, ReplyCallback>;

// ============================================================================
// CorrelationTable
// ============================================================================

/// Maps generated request ids to pending reply callbacks.
///
/// Thread-safe; the id counter and the pending map are owned by one
/// table instance, so independent clients never share correlation
/// state.
pub struct CorrelationTable {
    /// Next id to hand out. Starts at 1; 0 is never a valid id.
    next_id: AtomicU64,

    /// Callbacks awaiting replies.
    pending: Mutex<PendingMap>,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingMap::default()),
        }
    }

    /// Allocates the next request id and stores `callback` under it.
    ///
    /// The caller is responsible for embedding the returned id into the
    /// outbound payload before transmission.
    pub fn register(&self, callback: ReplyCallback) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pending.lock().insert(id, callback);
        trace!(%id, "registered pending call");
        id
    }

    /// Resolves a pending call with its reply.
    ///
    /// Invokes the callback with `envelope` and removes the entry.
    /// Returns `false` for ids that were never registered or were
    /// already resolved, without invoking anything.
    pub fn resolve(&self, id: RequestId, envelope: Envelope) -> bool {
        let callback = self.pending.lock().remove(&id);
        match callback {
            Some(callback) => {
                trace!(%id, command = %envelope.command, "resolving pending call");
                callback(envelope);
                true
            }
            None => false,
        }
    }

    /// Removes a pending call without invoking its callback.
    ///
    /// Used when a call times out; a late reply for the id is then
    /// silently ignored. Returns `false` if no entry existed.
    pub fn cancel(&self, id: RequestId) -> bool {
        let removed = self.pending.lock().remove(&id).is_some();
        if removed {
            debug!(%id, "cancelled pending call");
        }
        removed
    }

    /// Fails every pending call on teardown.
    ///
    /// Each callback is invoked with a synthetic `socket:error` envelope
    /// so callers waiting on replies observe the closure instead of
    /// hanging.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(RequestId, ReplyCallback)> =
            self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, callback) in drained {
            let envelope = Envelope {
                command: lifecycle::ERROR.to_string(),
                payload: json!({ "error": reason, "id": id.as_u64() }),
            };
            callback(envelope);
        }

        if count > 0 {
            debug!(count, reason, "failed pending calls");
        }
    }

    /// Returns the number of calls awaiting replies.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if no calls are pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
