//! Upstream session management
//!
//! One live session at a time: created on `initialize`, replaced wholesale
//! on re-initialize, destroyed on DELETE or client disconnect (unless the
//! keep-open flag is set). The session owns the bounded notification channel
//! between the active set and the outbound event stream; slow consumers lag
//! and re-list, they are never waited on.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// One upstream client session
pub struct Session {
    /// Session ID echoed in the `mcp-session-id` header
    pub id: String,
    tx: broadcast::Sender<Value>,
}

impl Session {
    fn new(buffer: usize) -> Self {
        Self {
            id: format!("proxy-{}", Uuid::new_v4()),
            tx: broadcast::channel(buffer).0,
        }
    }

    /// Queue a notification payload for the outbound stream.
    ///
    /// Returns `false` when no stream is attached; the payload is dropped,
    /// which is fine - a client that attaches later re-lists anyway.
    pub fn notify(&self, payload: Value) -> bool {
        self.tx.send(payload).is_ok()
    }

    /// Subscribe the outbound stream to this session's notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

/// Holder of the singleton session
pub struct SessionManager {
    current: RwLock<Option<Arc<Session>>>,
    keep_open: bool,
    buffer: usize,
}

impl SessionManager {
    /// Create a manager; `keep_open` keeps the session after the last
    /// client disconnects
    #[must_use]
    pub fn new(keep_open: bool) -> Self {
        Self {
            current: RwLock::new(None),
            keep_open,
            buffer: 64,
        }
    }

    /// Create a fresh session, closing any existing one first (reset
    /// semantics on re-initialize)
    pub fn initialize(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(self.buffer));
        let previous = self.current.write().replace(Arc::clone(&session));
        if let Some(old) = previous {
            // Dropping the old sender ends its streams
            info!(session_id = %old.id, "Closed prior session on re-initialize");
        }
        info!(session_id = %session.id, "Session initialized");
        session
    }

    /// The live session, if any
    #[must_use]
    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.read().clone()
    }

    /// Tear down the live session. Returns `false` when none existed.
    pub fn clear(&self) -> bool {
        let previous = self.current.write().take();
        match previous {
            Some(session) => {
                info!(session_id = %session.id, "Session terminated");
                true
            }
            None => false,
        }
    }

    /// Called when an event stream closes; honors the keep-open flag
    pub fn on_stream_closed(&self, session_id: &str) {
        if self.keep_open {
            debug!(session_id = %session_id, "Stream closed; keeping session open");
            return;
        }
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|s| s.id == session_id) {
            info!(session_id = %session_id, "Stream closed; tearing down session");
            *current = None;
        }
    }

    /// Send a notification to the live session
    pub fn notify(&self, payload: Value) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|session| session.notify(payload))
    }
}

/// Clears the session when the outbound stream is dropped
pub struct DisconnectGuard {
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl DisconnectGuard {
    /// Arm a guard for one stream
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>, session_id: String) -> Self {
        Self {
            sessions,
            session_id,
        }
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.sessions.on_stream_closed(&self.session_id);
    }
}
