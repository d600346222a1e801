//! Lifecycle events and the session-owned listener registry.
//!
//! The emitter is a capability the session holds, not a base class and not
//! a general-purpose bus: it only ever carries [`SessionEvent`] values for
//! the session that owns it.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{ErrorCode, RequestError};

/// Listeners registered from request options run before plain listeners.
pub const PRIORITY_HIGHEST: i32 = 1000;
pub const PRIORITY_DEFAULT: i32 = 500;

/// A lifecycle transition, with the arguments the event contract assigns
/// to it.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new logical attempt begins.
    Request,
    /// A retry attempt begins.
    Retry,
    /// A retry attempt has just settled, before the next one is scheduled.
    RetryComplete {
        retry_count: u32,
        /// Whether the retry budget is now exhausted.
        is_last: bool,
        error: RequestError,
    },
    /// Pipeline-transformed success payload.
    Done(Value),
    /// Terminal or non-retried error.
    Fail { message: String, code: ErrorCode },
    /// Cancellation observed; suppresses `Done`/`Fail` for the settlement.
    Aborted,
    /// Final settlement of the logical request.
    Always {
        error: Option<RequestError>,
        response: Option<Value>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Request => EventKind::Request,
            SessionEvent::Retry => EventKind::Retry,
            SessionEvent::RetryComplete { .. } => EventKind::RetryComplete,
            SessionEvent::Done(_) => EventKind::Done,
            SessionEvent::Fail { .. } => EventKind::Fail,
            SessionEvent::Aborted => EventKind::Aborted,
            SessionEvent::Always { .. } => EventKind::Always,
        }
    }
}

/// Discriminant used when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Request,
    Retry,
    RetryComplete,
    Done,
    Fail,
    Aborted,
    Always,
}

pub type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Opaque subscription handle, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    kind: EventKind,
    /// Replacement key: subscribing again under the same key swaps the
    /// handler instead of stacking a duplicate.
    key: Option<String>,
    priority: i32,
    handler: Handler,
}

/// Ordered listener registry: higher priority first, insertion order
/// within a priority.
#[derive(Default)]
pub struct Emitter {
    listeners: Vec<Listener>,
    next_id: u64,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, handler: Handler, priority: i32) -> ListenerId {
        self.insert(kind, None, handler, priority)
    }

    /// Subscribes under a replacement key, dropping any listener already
    /// registered with the same key.
    pub fn subscribe_keyed(
        &mut self,
        kind: EventKind,
        key: &str,
        handler: Handler,
        priority: i32,
    ) -> ListenerId {
        self.remove_key(key);
        self.insert(kind, Some(key.to_owned()), handler, priority)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.retain(|listener| listener.id != id);
    }

    pub fn remove_key(&mut self, key: &str) {
        self.listeners
            .retain(|listener| listener.key.as_deref() != Some(key));
    }

    fn insert(
        &mut self,
        kind: EventKind,
        key: Option<String>,
        handler: Handler,
        priority: i32,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push(Listener {
            id,
            kind,
            key,
            priority,
            handler,
        });
        id
    }

    /// Snapshots the matching handlers in firing order.
    ///
    /// The session invokes handlers from the snapshot after releasing its
    /// locks, so a handler may freely subscribe or query the session.
    pub fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        let mut matching: Vec<(i32, usize, Handler)> = self
            .listeners
            .iter()
            .enumerate()
            .filter(|(_, listener)| listener.kind == kind)
            .map(|(index, listener)| (listener.priority, index, Arc::clone(&listener.handler)))
            .collect();
        matching.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        matching.into_iter().map(|(_, _, handler)| handler).collect()
    }
}
