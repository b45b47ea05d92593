//! Outstanding REQUEST and PING correlation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{PeerError, Result};

/// Length of generated nonces and connection ids.
pub const NONCE_LEN: usize = 12;

/// A fresh random alphanumeric correlation id.
pub fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// What kind of reply an entry waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Request,
    Ping,
}

/// A settled reply: the peer's payload and the round-trip time.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) data: Value,
    pub(crate) elapsed: Duration,
}

struct PendingRequest {
    kind: PendingKind,
    issued_at: Instant,
    reply: oneshot::Sender<Result<Reply>>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, PendingRequest>,
    closed: bool,
}

/// Nonce-keyed table of outstanding requests and pings.
///
/// Each entry is settled at most once: by its reply, by the caller dropping
/// interest (timeout), or by [`PendingTable::reject_all`] on teardown.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<Table>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a fresh nonce. Fails once the table has been torn down.
    pub(crate) fn register(&self, kind: PendingKind) -> Result<(String, oneshot::Receiver<Result<Reply>>)> {
        let mut table = self.lock();
        if table.closed {
            return Err(PeerError::ConnectionClosed);
        }
        let mut id = nonce();
        while table.entries.contains_key(&id) {
            id = nonce();
        }
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            id.clone(),
            PendingRequest {
                kind,
                issued_at: Instant::now(),
                reply: tx,
            },
        );
        Ok((id, rx))
    }

    /// Settle the entry for `nonce` with a reply of `kind`.
    ///
    /// Returns `false` for unknown nonces and kind mismatches; those replies
    /// are dropped.
    pub(crate) fn resolve(&self, nonce: &str, kind: PendingKind, data: Value) -> bool {
        let entry = {
            let mut table = self.lock();
            match table.entries.get(nonce) {
                Some(entry) if entry.kind == kind => table.entries.remove(nonce),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            trace!(nonce, ?kind, "reply without pending entry");
            return false;
        };
        let _ = entry.reply.send(Ok(Reply {
            data,
            elapsed: entry.issued_at.elapsed(),
        }));
        true
    }

    /// Drop the entry for `nonce` without settling it.
    pub(crate) fn remove(&self, nonce: &str) {
        self.lock().entries.remove(nonce);
    }

    /// Reject every entry and refuse further registrations.
    pub(crate) fn reject_all(&self, make_err: impl Fn() -> PeerError) {
        let drained: Vec<PendingRequest> = {
            let mut table = self.lock();
            table.closed = true;
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.reply.send(Err(make_err()));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Removes a pending entry when the waiting caller goes away, whether it
/// was settled, timed out or cancelled.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    nonce: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, nonce: String) -> Self {
        Self { table, nonce }
    }

    pub(crate) fn nonce(&self) -> &str {
        &self.nonce
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.nonce);
    }
}
