//! Server-side handle to one accepted client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use serde_json::Value;

use crate::error::Result;
use crate::session::WireSession;

/// One accepted stream. Clones share the same connection.
///
/// A connection is promoted to ready, and joins the server registry, only
/// after its CONNECTION handshake; it is never reused after it closes.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: String,
    session: WireSession,
    ready: AtomicBool,
    connected_at: OnceLock<SystemTime>,
}

impl Connection {
    pub(crate) fn new(id: String, session: WireSession) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                session,
                ready: AtomicBool::new(false),
                connected_at: OnceLock::new(),
            }),
        }
    }

    /// Identifier assigned by the server and sent in the handshake reply.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        let _ = self.inner.connected_at.set(SystemTime::now());
        self.inner.ready.store(true, Ordering::Release);
    }

    /// When the handshake completed.
    pub fn connected_at(&self) -> Option<SystemTime> {
        self.inner.connected_at.get().copied()
    }

    pub fn is_compressed(&self) -> bool {
        self.inner.session.is_compressed()
    }

    pub fn is_binary(&self) -> bool {
        self.inner.session.is_binary()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.session.is_closing()
    }

    pub fn session(&self) -> &WireSession {
        &self.inner.session
    }

    pub async fn send(&self, data: Value) -> Result<()> {
        self.inner.session.send(data).await
    }

    /// Queue a message without waiting for it to be flushed.
    pub fn post(&self, data: Value) -> Result<()> {
        self.inner.session.post(data)
    }

    pub async fn request(&self, data: Value, timeout: Duration) -> Result<Value> {
        self.inner.session.request(data, timeout).await
    }

    pub async fn ping(&self, data: Value, timeout: Duration) -> Result<Duration> {
        self.inner.session.ping(data, timeout).await
    }

    pub async fn close(&self, reason: Option<Value>, allow_reconnect: bool) -> Result<bool> {
        self.inner.session.close(reason, allow_reconnect).await
    }

    pub fn destroy(&self, reason: Option<Value>) -> bool {
        self.inner.session.destroy(reason)
    }

    pub fn pause(&self) {
        self.inner.session.pause();
    }

    pub fn resume(&self) {
        self.inner.session.resume();
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("ready", &self.is_ready())
            .field("session", &self.inner.session)
            .finish()
    }
}
