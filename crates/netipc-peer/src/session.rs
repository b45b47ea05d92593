//! The wire session shared by clients and server-side connections.
//!
//! A [`WireSession`] owns one established stream after the preamble. It runs
//! two tasks:
//!
//! ```text
//! send/request/ping ─► mpsc ─► write task ─► FrameWriter ─► stream
//! stream ─► FrameReader ─► read task ─► Dispatcher (client or connection)
//! ```
//!
//! The read task is the only place envelopes are dispatched, so handlers for
//! one session run strictly in wire order. The write task is the only place
//! bytes are written; each queued write completes once its batch has been
//! flushed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use netipc_frame::{Envelope, FrameConfig, FrameReader, FrameWriter, MessageType, PacketFormat};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::control::EndPayload;
use crate::drain::{Completion, DrainQueue};
use crate::error::{PeerError, Result};
use crate::pending::{PendingGuard, PendingKind, PendingTable, Reply};

/// Maximum writes coalesced into one flush.
const MAX_BATCH: usize = 64;

/// Receives what the read task decodes.
pub(crate) trait Dispatcher: Send + Sync + 'static {
    /// Gate applied to every envelope before dispatch; an error is fatal.
    fn admit(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    /// A CONNECTION envelope. An error is fatal.
    fn on_connection(&self, session: &WireSession, envelope: Envelope) -> Result<()>;

    fn on_message(&self, data: Value);

    /// A REQUEST. Returns the responder back when nobody handles it, which
    /// makes the session answer with an empty RESPONSE.
    fn on_request(&self, data: Value, responder: Responder) -> Option<Responder>;

    fn on_error(&self, error: &PeerError);

    /// Called once, after both tasks have stopped.
    fn on_close(&self, disconnect: Disconnect);
}

/// How a session ended.
#[derive(Debug, Default)]
pub struct Disconnect {
    /// END payload received from the peer before the stream closed.
    pub end: Option<EndPayload>,
    /// Reason given to a local `close` or `destroy`.
    pub local_reason: Option<Value>,
    /// Error that tore the session down, if any.
    pub error: Option<PeerError>,
}

impl Disconnect {
    /// The peer's END reason, else the local one.
    pub fn reason(&self) -> Option<&Value> {
        self.end
            .as_ref()
            .and_then(|end| end.reason.as_ref())
            .or(self.local_reason.as_ref())
    }

    /// `false` only when the peer's END asked not to reconnect.
    pub fn allows_reconnect(&self) -> bool {
        self.end.as_ref().is_none_or(|end| end.allow_reconnect)
    }
}

struct WriteOp {
    payload: Bytes,
    /// Shut the write side down after this frame.
    end: bool,
    done: Completion,
}

struct Shared {
    label: String,
    format: RwLock<PacketFormat>,
    writes: mpsc::UnboundedSender<WriteOp>,
    pending: PendingTable,
    closing: AtomicBool,
    destroyed: AtomicBool,
    terminated: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    received_end: Mutex<Option<EndPayload>>,
    local_reason: Mutex<Option<Value>>,
    write_fault: Mutex<Option<PeerError>>,
}

impl Shared {
    fn teardown_error(&self) -> PeerError {
        if self.destroyed.load(Ordering::Acquire) {
            PeerError::ConnectionDestroyed
        } else {
            PeerError::ConnectionClosed
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn store<T>(slot: &Mutex<Option<T>>, value: T) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
}

/// Handle to one framed, negotiated stream. Cheap to clone.
#[derive(Clone)]
pub struct WireSession {
    shared: Arc<Shared>,
}

/// The unstarted I/O half of a session; see [`WireSession::open`].
pub(crate) struct SessionDriver<S> {
    session: WireSession,
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    writes: mpsc::UnboundedReceiver<WriteOp>,
}

impl WireSession {
    /// Wrap `stream` in a session. `prefix` holds bytes already read past
    /// the preamble.
    ///
    /// Nothing is read or written until the returned driver is spawned, so
    /// the dispatcher can be built around the session handle first.
    pub(crate) fn open<S>(stream: S, prefix: BytesMut, label: String) -> (Self, SessionDriver<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writes, rx) = mpsc::unbounded_channel();
        let session = Self {
            shared: Arc::new(Shared {
                label,
                format: RwLock::new(PacketFormat::plain()),
                writes,
                pending: PendingTable::new(),
                closing: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                terminated: watch::Sender::new(false),
                paused: watch::Sender::new(false),
                cancel: CancellationToken::new(),
                received_end: Mutex::new(None),
                local_reason: Mutex::new(None),
                write_fault: Mutex::new(None),
            }),
        };
        let driver = SessionDriver {
            session: session.clone(),
            reader: FrameReader::with_prefix(read_half, FrameConfig::default(), &prefix),
            writer: FrameWriter::new(write_half),
            writes: rx,
        };
        (session, driver)
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Switch the packet format for every envelope packed or unpacked after
    /// this call.
    pub(crate) fn set_format(&self, format: PacketFormat) {
        *self.shared.format.write().unwrap_or_else(|e| e.into_inner()) = format;
    }

    fn format(&self) -> PacketFormat {
        self.shared
            .format
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_compressed(&self) -> bool {
        self.format().is_compressed()
    }

    pub fn is_binary(&self) -> bool {
        self.format().is_binary()
    }

    /// `close` or `destroy` has been called, or the session ended.
    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire) || self.is_terminated()
    }

    /// Both I/O tasks have stopped.
    pub fn is_terminated(&self) -> bool {
        *self.shared.terminated.borrow()
    }

    /// Resolves once the session has terminated.
    pub async fn terminated(&self) {
        let mut rx = self.shared.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Queue `envelope` for writing. The receiver settles once its batch has
    /// been flushed.
    pub(crate) fn enqueue(&self, envelope: &Envelope) -> Result<oneshot::Receiver<Result<()>>> {
        if self.is_closing() {
            return Err(PeerError::ConnectionClosed);
        }
        self.push(envelope, false)
    }

    fn push(&self, envelope: &Envelope, end: bool) -> Result<oneshot::Receiver<Result<()>>> {
        // Pack under the read lock so a concurrent format switch orders
        // strictly before or after this frame.
        let format = self.shared.format.read().unwrap_or_else(|e| e.into_inner());
        let payload = format.pack(envelope)?;
        let (done, rx) = oneshot::channel();
        self.shared
            .writes
            .send(WriteOp { payload, end, done })
            .map_err(|_| PeerError::ConnectionClosed)?;
        Ok(rx)
    }

    pub(crate) async fn write(&self, envelope: &Envelope) -> Result<()> {
        let done = self.enqueue(envelope)?;
        done.await.map_err(|_| self.shared.teardown_error())?
    }

    /// Send a MESSAGE; resolves once it has been flushed.
    pub async fn send(&self, data: Value) -> Result<()> {
        self.write(&Envelope::message(data)).await
    }

    /// Queue a MESSAGE without waiting for the flush.
    pub fn post(&self, data: Value) -> Result<()> {
        self.enqueue(&Envelope::message(data)).map(drop)
    }

    /// Send a REQUEST and wait for its RESPONSE payload.
    ///
    /// `Duration::ZERO` waits without a deadline.
    pub async fn request(&self, data: Value, timeout: Duration) -> Result<Value> {
        Ok(self.call(PendingKind::Request, data, timeout).await?.data)
    }

    /// Send a PING and return the round-trip time of its PONG.
    pub async fn ping(&self, data: Value, timeout: Duration) -> Result<Duration> {
        Ok(self.call(PendingKind::Ping, data, timeout).await?.elapsed)
    }

    async fn call(&self, kind: PendingKind, data: Value, timeout: Duration) -> Result<Reply> {
        if self.is_closing() {
            return Err(PeerError::ConnectionClosed);
        }
        let (nonce, reply) = self.shared.pending.register(kind)?;
        let guard = PendingGuard::new(&self.shared.pending, nonce);
        let envelope = match kind {
            PendingKind::Request => Envelope::request(data, guard.nonce().to_string()),
            PendingKind::Ping => Envelope::ping(data, guard.nonce().to_string()),
        };
        with_deadline(timeout, async {
            self.write(&envelope).await?;
            reply.await.map_err(|_| self.shared.teardown_error())?
        })
        .await
    }

    /// Graceful close: queue END `{m: reason, a: allow_reconnect}` behind
    /// every pending write, flush, then shut the write side down.
    ///
    /// Returns `Ok(false)` when the session was already closing.
    pub async fn close(&self, reason: Option<Value>, allow_reconnect: bool) -> Result<bool> {
        if self.is_terminated() || self.shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if let Some(reason) = &reason {
            store(&self.shared.local_reason, reason.clone());
        }
        let end = Envelope::end(serde_json::to_value(EndPayload::new(reason, allow_reconnect))?);
        let done = self.push(&end, true)?;
        done.await.map_err(|_| self.shared.teardown_error())??;
        debug!(session = %self.label(), "sent end");
        Ok(true)
    }

    /// Immediate teardown. Every queued write and pending request fails with
    /// [`PeerError::ConnectionDestroyed`]. Returns `false` if the session was
    /// already destroyed or had ended.
    pub fn destroy(&self, reason: Option<Value>) -> bool {
        if self.is_terminated() || self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.closing.store(true, Ordering::Release);
        if let Some(reason) = reason {
            store(&self.shared.local_reason, reason);
        }
        self.shared
            .pending
            .reject_all(|| PeerError::ConnectionDestroyed);
        self.shared.cancel.cancel();
        debug!(session = %self.label(), "destroyed");
        true
    }

    /// Stop consuming frames until [`WireSession::resume`].
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    fn unpack(&self, payload: &[u8]) -> Result<Envelope> {
        Ok(self.format().unpack(payload)?)
    }

    fn dispatch<D: Dispatcher>(&self, envelope: Envelope, dispatcher: &D) -> Result<()> {
        trace!(session = %self.label(), kind = ?envelope.kind, "dispatch");
        if envelope.kind.carries_nonce() && envelope.nonce.is_none() {
            dispatcher.on_error(&PeerError::MalformedEnvelope(format!(
                "{:?} without nonce",
                envelope.kind
            )));
            return Ok(());
        }
        let nonce = envelope.nonce.clone().unwrap_or_default();

        match envelope.kind {
            MessageType::Connection => dispatcher.on_connection(self, envelope)?,
            MessageType::Message => dispatcher.on_message(envelope.into_data()),
            MessageType::Request => {
                let responder = Responder {
                    session: self.clone(),
                    nonce,
                };
                if let Some(unhandled) = dispatcher.on_request(envelope.into_data(), responder) {
                    if let Err(err) = unhandled.reply_empty() {
                        dispatcher.on_error(&err);
                    }
                }
            }
            MessageType::Response => {
                self.shared
                    .pending
                    .resolve(&nonce, PendingKind::Request, envelope.into_data());
            }
            MessageType::Ping => {
                if let Err(err) = self.enqueue(&Envelope::pong(envelope.data, nonce)) {
                    dispatcher.on_error(&err);
                }
            }
            MessageType::Pong => {
                self.shared
                    .pending
                    .resolve(&nonce, PendingKind::Ping, envelope.into_data());
            }
            MessageType::End => {
                store(&self.shared.received_end, EndPayload::from_data(envelope.data));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WireSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireSession")
            .field("label", &self.shared.label)
            .field("format", &self.format())
            .field("closing", &self.is_closing())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Answers one REQUEST. Dropping it without replying leaves the requester
/// to time out.
pub struct Responder {
    session: WireSession,
    nonce: String,
}

impl Responder {
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Queue the RESPONSE. Replies are written in the order they are queued.
    pub fn reply(self, data: Value) -> Result<()> {
        self.session
            .enqueue(&Envelope::response(Some(data), self.nonce))
            .map(drop)
    }

    /// Send the RESPONSE and wait until it has been flushed.
    pub async fn reply_flushed(self, data: Value) -> Result<()> {
        self.session
            .write(&Envelope::response(Some(data), self.nonce))
            .await
    }

    fn reply_empty(self) -> Result<()> {
        self.session
            .enqueue(&Envelope::response(None, self.nonce))
            .map(drop)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("session", &self.session.label())
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// Run `fut` under `timeout`; `Duration::ZERO` disables the deadline.
pub(crate) async fn with_deadline<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| PeerError::Timeout(timeout))?
}

impl<S> SessionDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Start the read and write tasks.
    pub(crate) fn spawn<D: Dispatcher>(self, dispatcher: Arc<D>) -> JoinHandle<()> {
        tokio::spawn(self.run(dispatcher))
    }

    async fn run<D: Dispatcher>(self, dispatcher: Arc<D>) {
        let Self {
            session,
            mut reader,
            writer,
            writes,
        } = self;
        let shared = Arc::clone(&session.shared);

        let write_task = tokio::spawn(write_loop(Arc::clone(&shared), writer, writes));
        let read_error = read_loop(&session, &mut reader, dispatcher.as_ref()).await;

        shared.closing.store(true, Ordering::Release);
        shared.cancel.cancel();
        shared.pending.reject_all(|| shared.teardown_error());
        let _ = write_task.await;
        drop(reader);

        let error = match read_error {
            Some(err) => Some(err),
            None => {
                let fault = take(&shared.write_fault);
                if let Some(err) = &fault {
                    dispatcher.on_error(err);
                }
                fault
            }
        };
        shared.terminated.send_replace(true);
        debug!(session = %session.label(), error = ?error, "session ended");

        dispatcher.on_close(Disconnect {
            end: take(&shared.received_end),
            local_reason: take(&shared.local_reason),
            error,
        });
    }
}

/// Returns the error that ended the stream, `None` for EOF or cancellation.
async fn read_loop<S, D>(
    session: &WireSession,
    reader: &mut FrameReader<ReadHalf<S>>,
    dispatcher: &D,
) -> Option<PeerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    D: Dispatcher,
{
    let shared = &session.shared;
    let mut paused = shared.paused.subscribe();

    loop {
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                break;
            }
            tokio::select! {
                _ = shared.cancel.cancelled() => return None,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }

        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            frame = reader.read_frame() => frame,
        };
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(err) => {
                let err = PeerError::from(err);
                dispatcher.on_error(&err);
                return Some(err);
            }
        };

        let envelope = match session.unpack(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Undecodable packets are reported and skipped.
                dispatcher.on_error(&err);
                continue;
            }
        };

        let dispatched = dispatcher
            .admit(&envelope)
            .and_then(|()| session.dispatch(envelope, dispatcher));
        if let Err(err) = dispatched {
            dispatcher.on_error(&err);
            return Some(err);
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) where
    W: AsyncWrite + Unpin,
{
    let mut drain = DrainQueue::new();
    let mut payloads = Vec::with_capacity(MAX_BATCH);

    loop {
        let first = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let mut end = first.end;
        payloads.push(first.payload);
        drain.push(first.done);
        while !end && payloads.len() < MAX_BATCH {
            let Ok(op) = rx.try_recv() else { break };
            end = op.end;
            payloads.push(op.payload);
            drain.push(op.done);
        }

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(shared.teardown_error()),
            result = write_batch(&mut writer, &mut payloads, end) => result,
        };
        payloads.clear();

        match result {
            Ok(()) => {
                drain.drained();
                if end {
                    break;
                }
            }
            Err(err) => {
                drain.fail(|| shared.teardown_error());
                if !shared.cancel.is_cancelled() {
                    debug!(session = %shared.label, error = %err, "write failed");
                    store(&shared.write_fault, err);
                    shared.cancel.cancel();
                }
                break;
            }
        }
    }

    rx.close();
    while let Ok(op) = rx.try_recv() {
        let _ = op.done.send(Err(shared.teardown_error()));
    }
}

async fn write_batch<W>(writer: &mut FrameWriter<W>, payloads: &mut Vec<Bytes>, end: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for payload in payloads.drain(..) {
        writer.feed(payload).await?;
    }
    if end {
        writer.shutdown().await?;
    } else {
        writer.flush().await?;
    }
    Ok(())
}
