//! Connecting side, with optional automatic reconnection.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use netipc_frame::{Envelope, PacketFormat};
use netipc_transport::{Endpoint, IpcStream};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::control::ConnectionReply;
use crate::error::{PeerError, Result};
use crate::handshake::{client_offer, client_preamble, review_reply};
use crate::options::ClientOptions;
use crate::pending::nonce;
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::session::{with_deadline, Disconnect, Dispatcher, Responder, WireSession};

#[cfg(feature = "tls")]
use netipc_transport::TlsConnector;

/// Client lifecycle.
///
/// `Idle → Connecting → Connected → Ready`; a failure passes through
/// `Disconnected` and, with reconnection enabled, `Reconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    Connecting,
    /// Transport open, handshake in progress.
    Connected,
    Ready,
    Disconnected,
    Reconnecting,
}

type ReadyHandler = Arc<dyn Fn(&ConnectionReply) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&PeerError) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&Disconnect) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(ClientStatus) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(Value, Responder) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    ready: Option<ReadyHandler>,
    error: Option<ErrorHandler>,
    close: Option<CloseHandler>,
    status: Option<StatusHandler>,
    message: Option<MessageHandler>,
    request: Option<RequestHandler>,
}

struct ClientState {
    status: ClientStatus,
    id: Option<String>,
    session: Option<WireSession>,
    /// Bumped for every handshake attempt; stale sessions are ignored.
    generation: u64,
    /// Deliberately closed; no reconnection until `connect` is called again.
    closed: bool,
    payload: Option<Value>,
    backoff: ReconnectPolicy,
}

struct ClientInner {
    options: ClientOptions,
    endpoint: Endpoint,
    #[cfg(feature = "tls")]
    tls: Option<TlsConnector>,
    handlers: RwLock<Handlers>,
    state: Mutex<ClientState>,
}

/// A netipc client. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Validate `options` and build an idle client.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let endpoint = options.validate()?;
        #[cfg(feature = "tls")]
        let tls = match &options.tls {
            Some(tls) => Some(TlsConnector::new(tls)?),
            None => None,
        };
        let backoff = ReconnectPolicy::new(options.retries, options.retry_delay, options.max_retry_time);
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                endpoint,
                #[cfg(feature = "tls")]
                tls,
                handlers: RwLock::new(Handlers::default()),
                state: Mutex::new(ClientState {
                    status: ClientStatus::Idle,
                    id: None,
                    session: None,
                    generation: 0,
                    closed: false,
                    payload: None,
                    backoff,
                }),
            }),
        })
    }

    fn set(&self, install: impl FnOnce(&mut Handlers)) -> &Self {
        install(&mut self.inner.handlers.write().unwrap_or_else(|e| e.into_inner()));
        self
    }

    /// Handshake finished; receives the server's reply.
    pub fn on_ready(&self, handler: impl Fn(&ConnectionReply) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.ready = Some(Arc::new(handler)))
    }

    /// Without a handler errors are logged at debug level and dropped.
    pub fn on_error(&self, handler: impl Fn(&PeerError) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.error = Some(Arc::new(handler)))
    }

    /// The connection ended for good: closed deliberately, reconnection
    /// disabled, or retries exhausted.
    pub fn on_close(&self, handler: impl Fn(&Disconnect) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.close = Some(Arc::new(handler)))
    }

    pub fn on_status(&self, handler: impl Fn(ClientStatus) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.status = Some(Arc::new(handler)))
    }

    pub fn on_message(&self, handler: impl Fn(Value) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.message = Some(Arc::new(handler)))
    }

    /// Without a request handler every REQUEST is answered with an empty
    /// RESPONSE.
    pub fn on_request(&self, handler: impl Fn(Value, Responder) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.request = Some(Arc::new(handler)))
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state().status
    }

    /// Id assigned by the server in the last handshake.
    pub fn id(&self) -> Option<String> {
        self.inner.state().id.clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Connect and handshake, sending `payload` as the offer's extras.
    ///
    /// With reconnection enabled, failed attempts are retried with backoff
    /// before the last error is returned.
    pub async fn connect(&self, payload: Option<Value>) -> Result<Client> {
        {
            let mut state = self.inner.state();
            if state.status != ClientStatus::Idle {
                return Err(PeerError::NotIdle);
            }
            state.status = ClientStatus::Connecting;
            state.closed = false;
            state.payload = payload;
        }
        connect_cycle(&self.inner).await?;
        Ok(self.clone())
    }

    pub async fn send(&self, data: Value) -> Result<()> {
        self.ready_session().await?.send(data).await
    }

    /// Queue a message without waiting for it to be flushed.
    pub async fn post(&self, data: Value) -> Result<()> {
        self.ready_session().await?.post(data)
    }

    /// `Duration::ZERO` waits without a deadline.
    pub async fn request(&self, data: Value, timeout: Duration) -> Result<Value> {
        self.ready_session().await?.request(data, timeout).await
    }

    pub async fn ping(&self, data: Value, timeout: Duration) -> Result<Duration> {
        self.ready_session().await?.ping(data, timeout).await
    }

    /// [`Client::request`] with the configured `request_timeout`.
    pub async fn request_default(&self, data: Value) -> Result<Value> {
        self.request(data, self.inner.options.request_timeout).await
    }

    pub async fn ping_default(&self, data: Value) -> Result<Duration> {
        self.ping(data, self.inner.options.request_timeout).await
    }

    /// Close gracefully and disable reconnection. Returns `Ok(false)` when
    /// there was no open connection.
    pub async fn close(&self, reason: Option<Value>) -> Result<bool> {
        let session = {
            let mut state = self.inner.state();
            state.closed = true;
            state.session.clone()
        };
        match session {
            Some(session) => session.close(reason, false).await,
            None => Ok(false),
        }
    }

    /// Tear the connection down at once and disable reconnection.
    pub fn destroy(&self, reason: Option<Value>) -> bool {
        let session = {
            let mut state = self.inner.state();
            state.closed = true;
            state.session.clone()
        };
        session.is_some_and(|session| session.destroy(reason))
    }

    /// The current session, waiting out a reconnect with the same capped
    /// backoff used between attempts.
    async fn ready_session(&self) -> Result<WireSession> {
        let options = &self.inner.options;
        let policy = ReconnectPolicy::new(options.retries, options.retry_delay, options.max_retry_time);
        let mut tries = 0;
        loop {
            {
                let state = self.inner.state();
                if state.closed {
                    return Err(PeerError::ConnectionClosed);
                }
                if state.status == ClientStatus::Ready {
                    if let Some(session) = &state.session {
                        return Ok(session.clone());
                    }
                }
            }
            if !options.reconnect || tries >= options.retries {
                return Err(PeerError::NotReady);
            }
            tries += 1;
            tokio::time::sleep(policy.delay_for(tries)).await;
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("status", &state.status)
            .field("id", &state.id)
            .finish()
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler<H: Clone>(&self, pick: impl FnOnce(&Handlers) -> &Option<H>) -> Option<H> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        pick(&handlers).clone()
    }

    fn set_status(&self, status: ClientStatus) {
        self.state().status = status;
        trace!(?status, "client status");
        if let Some(handler) = self.handler(|h| &h.status) {
            handler(status);
        }
    }

    /// Back to `Idle` with a fresh backoff counter.
    fn settle_idle(&self) {
        self.state().backoff.reset();
        self.set_status(ClientStatus::Idle);
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn report(&self, error: &PeerError) {
        match self.handler(|h| &h.error) {
            Some(handler) => handler(error),
            None => debug!(error = %error, "unhandled client error"),
        }
    }

    fn emit_close(&self, disconnect: &Disconnect) {
        if let Some(handler) = self.handler(|h| &h.close) {
            handler(disconnect);
        }
    }

    async fn dial(&self) -> Result<IpcStream> {
        #[cfg(feature = "tls")]
        {
            if let Some(connector) = &self.tls {
                return Ok(netipc_transport::connect_tls(&self.endpoint, connector).await?);
            }
        }
        Ok(netipc_transport::connect(&self.endpoint).await?)
    }
}

async fn connect_cycle(inner: &Arc<ClientInner>) -> Result<()> {
    match attempt(inner).await {
        Ok(()) => Ok(()),
        Err(err) => {
            inner.report(&err);
            if inner.options.reconnect && !inner.is_closed() {
                reconnect_loop(inner, err).await
            } else {
                inner.settle_idle();
                Err(err)
            }
        }
    }
}

/// Retry until an attempt succeeds or the policy gives up.
async fn reconnect_loop(inner: &Arc<ClientInner>, mut last: PeerError) -> Result<()> {
    loop {
        let step = inner.state().backoff.record_failure();
        let Backoff::Retry(delay) = step else {
            debug!(error = %last, "giving up reconnecting");
            inner.settle_idle();
            return Err(last);
        };

        inner.set_status(ClientStatus::Reconnecting);
        debug!(?delay, "reconnecting");
        tokio::time::sleep(delay).await;
        if inner.is_closed() {
            inner.settle_idle();
            return Err(PeerError::ConnectionClosed);
        }

        inner.set_status(ClientStatus::Idle);
        match attempt(inner).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                inner.report(&err);
                last = err;
            }
        }
    }
}

/// One dial plus handshake. On success the client is `Ready`.
async fn attempt(inner: &Arc<ClientInner>) -> Result<()> {
    let options = &inner.options;
    let timeout = options.handshake_timeout;
    let deadline = Instant::now() + timeout;

    inner.set_status(ClientStatus::Connecting);
    let mut stream = with_deadline(timeout, inner.dial()).await?;
    inner.set_status(ClientStatus::Connected);

    let prefix = tokio::time::timeout_at(
        deadline,
        client_preamble(&mut stream, inner.endpoint.host(), &options.handshake_config()),
    )
    .await
    .map_err(|_| PeerError::Timeout(timeout))??;

    let (generation, offer) = {
        let mut state = inner.state();
        state.generation += 1;
        let offer = client_offer(
            options.compress,
            options.messagepack,
            &options.capabilities,
            state.payload.clone(),
            state.id.clone(),
        );
        (state.generation, offer)
    };

    let (session, driver) = WireSession::open(stream, prefix, inner.endpoint.to_string());
    let (ready_tx, ready_rx) = oneshot::channel();
    driver.spawn(Arc::new(ClientDispatch {
        client: Arc::downgrade(inner),
        generation,
        ready: Mutex::new(Some(ready_tx)),
    }));

    let handshake = async {
        session.enqueue(&Envelope::connection(serde_json::to_value(&offer)?, nonce()))?;
        ready_rx.await.map_err(|_| {
            PeerError::Disconnected("connection closed during handshake".to_string())
        })?
    };
    let reply = match tokio::time::timeout_at(deadline, handshake).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            session.destroy(None);
            return Err(err);
        }
        Err(_) => {
            session.destroy(None);
            return Err(PeerError::Timeout(timeout));
        }
    };
    review_reply(&offer, &reply);

    {
        let mut state = inner.state();
        if state.generation != generation || state.closed {
            drop(state);
            session.destroy(None);
            return Err(PeerError::ConnectionClosed);
        }
        // Checked under the lock so exactly one of this attempt and the
        // session's close path sees the failure.
        if session.is_terminated() {
            return Err(PeerError::Disconnected(
                "connection closed during handshake".to_string(),
            ));
        }
        state.id = Some(reply.id.clone());
        state.session = Some(session);
        state.backoff.reset();
        state.status = ClientStatus::Ready;
    }
    debug!(id = %reply.id, endpoint = %inner.endpoint, "client ready");

    if let Some(handler) = inner.handler(|h| &h.status) {
        handler(ClientStatus::Ready);
    }
    if let Some(handler) = inner.handler(|h| &h.ready) {
        handler(&reply);
    }
    Ok(())
}

/// A ready session ended.
async fn handle_disconnect(inner: Arc<ClientInner>, generation: u64, disconnect: Disconnect) {
    {
        let mut state = inner.state();
        if state.generation != generation || state.status != ClientStatus::Ready {
            return;
        }
        state.session = None;
        if !disconnect.allows_reconnect() {
            state.closed = true;
        }
    }
    inner.set_status(ClientStatus::Disconnected);

    if inner.options.reconnect && !inner.is_closed() {
        let last = match disconnect.error {
            Some(err) => err,
            None => PeerError::Disconnected(
                disconnect
                    .reason()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "connection closed".to_string()),
            ),
        };
        if let Err(err) = reconnect_loop(&inner, last).await {
            inner.emit_close(&Disconnect {
                error: Some(err),
                ..Disconnect::default()
            });
        }
    } else {
        inner.settle_idle();
        inner.emit_close(&disconnect);
    }
}

/// Routes the client session's envelopes to the client handlers.
struct ClientDispatch {
    client: Weak<ClientInner>,
    generation: u64,
    ready: Mutex<Option<oneshot::Sender<Result<ConnectionReply>>>>,
}

impl ClientDispatch {
    fn fail_handshake(&self, ready: oneshot::Sender<Result<ConnectionReply>>, err: PeerError) -> PeerError {
        let _ = ready.send(Err(PeerError::HandshakeFailed(err.to_string())));
        err
    }
}

impl Dispatcher for ClientDispatch {
    fn on_connection(&self, session: &WireSession, envelope: Envelope) -> Result<()> {
        let ready = self.ready.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(ready) = ready else {
            trace!("repeated connection envelope ignored");
            return Ok(());
        };
        let Some(client) = self.client.upgrade() else {
            return Err(PeerError::ConnectionClosed);
        };

        let reply: ConnectionReply = match serde_json::from_value(envelope.into_data()) {
            Ok(reply) => reply,
            Err(err) => return Err(self.fail_handshake(ready, err.into())),
        };
        let format = match PacketFormat::negotiated(&client.options.capabilities, reply.compress, reply.codec) {
            Ok(format) => format,
            Err(err) => return Err(self.fail_handshake(ready, err.into())),
        };
        session.set_format(format);
        let _ = ready.send(Ok(reply));
        Ok(())
    }

    fn on_message(&self, data: Value) {
        let Some(client) = self.client.upgrade() else { return };
        if let Some(handler) = client.handler(|h| &h.message) {
            handler(data);
        }
    }

    fn on_request(&self, data: Value, responder: Responder) -> Option<Responder> {
        let handler = self.client.upgrade()?.handler(|h| &h.request);
        match handler {
            Some(handler) => {
                handler(data, responder);
                None
            }
            None => Some(responder),
        }
    }

    fn on_error(&self, error: &PeerError) {
        if let Some(client) = self.client.upgrade() {
            client.report(error);
        }
    }

    fn on_close(&self, disconnect: Disconnect) {
        if let Some(client) = self.client.upgrade() {
            tokio::spawn(handle_disconnect(client, self.generation, disconnect));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_idle() {
        let client = Client::new(ClientOptions::path("/tmp/netipc-never.sock")).expect("valid options");
        assert_eq!(client.status(), ClientStatus::Idle);
        assert!(client.id().is_none());
        assert!(!client.destroy(None));
    }

    #[test]
    fn invalid_options_are_rejected_up_front() {
        assert!(matches!(
            Client::new(ClientOptions::url("tcp://localhost:0")),
            Err(PeerError::BadPort(_))
        ));
    }

    #[tokio::test]
    async fn operations_before_connect_are_not_ready() {
        let client = Client::new(
            ClientOptions::path("/tmp/netipc-never.sock").with_retry_delay(
                Duration::from_millis(1),
                Duration::from_millis(2),
            ),
        )
        .expect("valid options");
        assert!(matches!(
            client.send(Value::Null).await,
            Err(PeerError::NotReady)
        ));
    }

    #[tokio::test]
    async fn operations_after_close_are_closed() {
        let client = Client::new(ClientOptions::path("/tmp/netipc-never.sock")).expect("valid options");
        assert!(!client.close(None).await.expect("close"));
        assert!(matches!(
            client.request(Value::Null, Duration::ZERO).await,
            Err(PeerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn failed_connect_without_reconnect_returns_to_idle() {
        let client = Client::new(
            ClientOptions::path("/tmp/netipc-definitely-missing.sock").with_reconnect(false),
        )
        .expect("valid options");
        let err = client.connect(None).await.unwrap_err();
        assert!(matches!(err, PeerError::Transport(_)));
        assert_eq!(client.status(), ClientStatus::Idle);
    }
}
