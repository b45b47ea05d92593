//! Accepting side: listener, connection registry and fan-out helpers.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use netipc_frame::{Envelope, MessageType, PacketFormat};
use netipc_transport::{Accepted, Listener};
use serde_json::{json, Value};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::connection::Connection;
use crate::control::{ConnectionOffer, REASON_ORPHAN, REASON_SERVER_CLOSED};
use crate::error::{PeerError, Result};
use crate::handshake::{negotiate, server_preamble};
use crate::options::ServerOptions;
use crate::pending::nonce;
use crate::session::{Disconnect, Dispatcher, Responder, WireSession};

#[cfg(feature = "tls")]
use netipc_transport::TlsAcceptor;

type ReadyHandler = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&PeerError, Option<&Connection>) + Send + Sync>;
type ConnectHandler = Arc<dyn Fn(&Connection, Option<Value>) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(&Connection, &Disconnect) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&Connection, Value) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(&Connection, Value, Responder) + Send + Sync>;
type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    ready: Option<ReadyHandler>,
    error: Option<ErrorHandler>,
    connect: Option<ConnectHandler>,
    disconnect: Option<DisconnectHandler>,
    message: Option<MessageHandler>,
    request: Option<RequestHandler>,
    close: Option<CloseHandler>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    address: String,
}

struct ServerInner {
    options: ServerOptions,
    handlers: RwLock<Handlers>,
    /// Handshaken connections, in handshake order.
    connections: Mutex<Vec<Connection>>,
    /// Accepted connections still in their handshake.
    pending: Mutex<Vec<Connection>>,
    running: Mutex<Option<Running>>,
    limiter: Option<Arc<Semaphore>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ServerInner {
    fn handler<H: Clone>(&self, pick: impl FnOnce(&Handlers) -> &Option<H>) -> Option<H> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        pick(&handlers).clone()
    }

    fn report(&self, error: &PeerError, connection: Option<&Connection>) {
        match self.handler(|h| &h.error) {
            Some(handler) => handler(error, connection),
            None => debug!(
                connection = connection.map(Connection::id),
                error = %error,
                "unhandled server error"
            ),
        }
    }

    fn is_registered(&self, connection: &Connection) -> bool {
        lock(&self.connections)
            .iter()
            .any(|c| c.same_as(connection))
    }

    /// Run `finish` and move `connection` from `pending` into the registry,
    /// unless its run was cancelled. Both happen under the `pending` lock,
    /// which `Server::close` takes after cancelling, so a connection is
    /// either registered before the close snapshot or refused.
    fn promote(
        &self,
        connection: &Connection,
        run: &CancellationToken,
        finish: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let mut pending = lock(&self.pending);
        pending.retain(|c| !c.same_as(connection));
        if run.is_cancelled() {
            return Err(PeerError::ServerClosed);
        }
        finish()?;
        let mut registry = lock(&self.connections);
        if !registry.iter().any(|c| c.id() == connection.id()) {
            registry.push(connection.clone());
        }
        Ok(())
    }

    /// Track a connection still in its handshake. `false` once its run was
    /// cancelled.
    fn track(&self, connection: &Connection, run: &CancellationToken) -> bool {
        let mut pending = lock(&self.pending);
        if run.is_cancelled() {
            return false;
        }
        pending.push(connection.clone());
        true
    }

    /// Drop `connection` from both sets; `true` if it was registered.
    fn forget(&self, connection: &Connection) -> bool {
        lock(&self.pending).retain(|c| !c.same_as(connection));
        let mut registry = lock(&self.connections);
        let before = registry.len();
        registry.retain(|c| !c.same_as(connection));
        registry.len() != before
    }
}

/// A netipc server. Clones share the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Validate `options` and build a stopped server.
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let limiter = options.max.map(|max| Arc::new(Semaphore::new(max)));
        Ok(Self {
            inner: Arc::new(ServerInner {
                options,
                handlers: RwLock::new(Handlers::default()),
                connections: Mutex::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                running: Mutex::new(None),
                limiter,
            }),
        })
    }

    fn set(&self, install: impl FnOnce(&mut Handlers)) -> &Self {
        install(&mut self.inner.handlers.write().unwrap_or_else(|e| e.into_inner()));
        self
    }

    /// Listening started; receives the bound address.
    pub fn on_ready(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.ready = Some(Arc::new(handler)))
    }

    /// Errors from the listener and from connections. Without a handler they
    /// are logged at debug level and dropped.
    pub fn on_error(
        &self,
        handler: impl Fn(&PeerError, Option<&Connection>) + Send + Sync + 'static,
    ) -> &Self {
        self.set(|h| h.error = Some(Arc::new(handler)))
    }

    /// A connection finished its handshake; receives the client's extras.
    pub fn on_connect(&self, handler: impl Fn(&Connection, Option<Value>) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.connect = Some(Arc::new(handler)))
    }

    /// A registered connection closed.
    pub fn on_disconnect(
        &self,
        handler: impl Fn(&Connection, &Disconnect) + Send + Sync + 'static,
    ) -> &Self {
        self.set(|h| h.disconnect = Some(Arc::new(handler)))
    }

    pub fn on_message(&self, handler: impl Fn(&Connection, Value) + Send + Sync + 'static) -> &Self {
        self.set(|h| h.message = Some(Arc::new(handler)))
    }

    /// Without a request handler every REQUEST is answered with an empty
    /// RESPONSE.
    pub fn on_request(
        &self,
        handler: impl Fn(&Connection, Value, Responder) + Send + Sync + 'static,
    ) -> &Self {
        self.set(|h| h.request = Some(Arc::new(handler)))
    }

    pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) -> &Self {
        self.set(|h| h.close = Some(Arc::new(handler)))
    }

    /// Bind and start accepting.
    pub async fn start(&self) -> Result<Server> {
        if self.is_running() {
            return Err(PeerError::ServerExists);
        }

        let endpoint = self.inner.options.validate()?;
        let listener = self.bind(&endpoint).await?;
        let address = listener.local_address();

        {
            let mut running = lock(&self.inner.running);
            if running.is_some() {
                return Err(PeerError::ServerExists);
            }
            let cancel = CancellationToken::new();
            let task = tokio::spawn(accept_loop(
                Arc::downgrade(&self.inner),
                listener,
                cancel.clone(),
            ));
            *running = Some(Running {
                cancel,
                task,
                address: address.clone(),
            });
        }
        info!(%address, "listening");

        if let Some(handler) = self.inner.handler(|h| &h.ready) {
            handler(&address);
        }
        Ok(self.clone())
    }

    async fn bind(&self, endpoint: &netipc_transport::Endpoint) -> Result<Listener> {
        #[cfg(feature = "tls")]
        {
            if let Some(tls) = &self.inner.options.tls {
                let acceptor = TlsAcceptor::new(tls)?;
                return Ok(Listener::bind_tls(endpoint, acceptor).await?);
            }
        }
        Ok(Listener::bind(endpoint, self.inner.options.socket_mode).await?)
    }

    /// Bound address (`path` or `ip:port`) while running.
    pub fn address(&self) -> Option<String> {
        lock(&self.inner.running)
            .as_ref()
            .map(|running| running.address.clone())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Snapshot of the handshaken connections, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.inner.connections).clone()
    }

    /// Stop accepting, then close every connection with
    /// `allow_reconnect` passed on to the clients.
    pub async fn close(&self, allow_reconnect: bool) -> Result<()> {
        let Some(running) = lock(&self.inner.running).take() else {
            return Ok(());
        };
        running.cancel.cancel();
        let _ = running.task.await;

        let pending: Vec<Connection> = lock(&self.inner.pending).drain(..).collect();
        for connection in pending {
            connection.destroy(Some(json!(REASON_SERVER_CLOSED)));
        }
        for connection in self.connections() {
            if let Err(err) = connection
                .close(Some(json!(REASON_SERVER_CLOSED)), allow_reconnect)
                .await
            {
                self.inner.report(&err, Some(&connection));
            }
        }
        info!(address = %running.address, "server closed");

        if let Some(handler) = self.inner.handler(|h| &h.close) {
            handler();
        }
        Ok(())
    }

    /// Send `data` to every connection in turn. A failing connection is
    /// reported to the error handler and skipped.
    pub async fn broadcast(&self, data: Value) {
        for connection in self.connections() {
            if let Err(err) = connection.send(data.clone()).await {
                self.inner.report(&err, Some(&connection));
            }
        }
    }

    /// Request `data` from every connection concurrently. One result per
    /// connection, in registry order.
    pub async fn survey(&self, data: Value, timeout: Duration) -> Vec<(Connection, Result<Value>)> {
        let connections = self.connections();
        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.request(data.clone(), timeout)),
        )
        .await;
        connections.into_iter().zip(results).collect()
    }

    /// Ping every connection concurrently. One round-trip time per
    /// connection, in registry order.
    pub async fn ping(&self, data: Value, timeout: Duration) -> Vec<(Connection, Result<Duration>)> {
        let connections = self.connections();
        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.ping(data.clone(), timeout)),
        )
        .await;
        connections.into_iter().zip(results).collect()
    }

    /// Stop reading from every connection.
    pub fn pause(&self) {
        for connection in self.connections() {
            connection.pause();
        }
    }

    pub fn resume(&self) {
        for connection in self.connections() {
            connection.resume();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address())
            .field("connections", &lock(&self.inner.connections).len())
            .finish()
    }
}

async fn accept_loop(server: Weak<ServerInner>, listener: Listener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept_pending() => accepted,
        };
        let Some(inner) = server.upgrade() else { break };

        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                inner.report(&err.into(), None);
                continue;
            }
        };

        let permit = match &inner.limiter {
            Some(limiter) => match Arc::clone(limiter).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!("connection limit reached, refusing");
                    continue;
                }
            },
            None => None,
        };

        tokio::spawn(serve_connection(inner, accepted, permit, cancel.child_token()));
    }
    debug!("accept loop stopped");
}

async fn serve_connection(
    inner: Arc<ServerInner>,
    accepted: Accepted,
    permit: Option<OwnedSemaphorePermit>,
    run: CancellationToken,
) {
    let timeout = inner.options.handshake_timeout;
    let deadline = Instant::now() + timeout;

    let preamble = tokio::time::timeout_at(deadline, async {
        let mut stream = accepted.establish().await?;
        let prefix = server_preamble(&mut stream, &inner.options.handshake_config()).await?;
        Ok::<_, PeerError>((stream, prefix))
    });
    let opened = tokio::select! {
        _ = run.cancelled() => {
            debug!("server closed during preamble");
            return;
        }
        opened = preamble => opened.unwrap_or(Err(PeerError::Timeout(timeout))),
    };
    let (stream, prefix) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            debug!(error = %err, "preamble failed");
            inner.report(&err, None);
            return;
        }
    };

    let id = nonce();
    let label = format!(
        "{}:{}",
        stream
            .peer_label()
            .unwrap_or_else(|| stream.transport_name().to_string()),
        id
    );
    let (session, driver) = WireSession::open(stream, prefix, label);
    let connection = Connection::new(id, session);
    if !inner.track(&connection, &run) {
        debug!(connection = connection.id(), "server closed during handshake");
        return;
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    driver.spawn(Arc::new(ConnectionDispatch {
        connection: connection.clone(),
        server: Arc::downgrade(&inner),
        run: run.clone(),
        ready: Mutex::new(Some(ready_tx)),
        permit: Mutex::new(permit),
    }));
    drop(inner);

    tokio::select! {
        _ = run.cancelled() => {
            if !connection.is_ready() {
                connection.destroy(Some(json!(REASON_SERVER_CLOSED)));
            }
        }
        ready = tokio::time::timeout_at(deadline, ready_rx) => {
            if ready.is_err() {
                debug!(connection = connection.id(), "handshake timed out");
                connection.destroy(Some(json!("handshake timed out")));
            }
        }
    }
}

/// Routes one connection's envelopes to the server handlers.
struct ConnectionDispatch {
    connection: Connection,
    server: Weak<ServerInner>,
    /// Cancelled when the server run that accepted this connection stops.
    run: CancellationToken,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl ConnectionDispatch {
    fn server(&self) -> Result<Arc<ServerInner>> {
        self.server.upgrade().ok_or(PeerError::OrphanConnection)
    }
}

impl Dispatcher for ConnectionDispatch {
    fn admit(&self, envelope: &Envelope) -> Result<()> {
        if !self.connection.is_ready() && envelope.kind != MessageType::Connection {
            return Err(PeerError::PrematurePacket);
        }
        Ok(())
    }

    fn on_connection(&self, session: &WireSession, envelope: Envelope) -> Result<()> {
        if self.connection.is_ready() {
            trace!(connection = self.connection.id(), "repeated connection envelope ignored");
            return Ok(());
        }
        let server = self.server()?;
        let nonce = envelope.nonce.clone().unwrap_or_default();
        let offer: ConnectionOffer = serde_json::from_value(envelope.into_data())?;

        let capabilities = &server.options.capabilities;
        let reply = negotiate(&offer, capabilities, self.connection.id());
        let format = PacketFormat::negotiated(capabilities, reply.compress, reply.codec)?;
        let answer = Envelope::connection(serde_json::to_value(&reply)?, nonce);
        server.promote(&self.connection, &self.run, || {
            session.enqueue(&answer)?;
            session.set_format(format);
            self.connection.mark_ready();
            Ok(())
        })?;
        debug!(
            connection = self.connection.id(),
            compress = reply.compress,
            messagepack = reply.codec,
            "connection ready"
        );

        if let Some(handler) = server.handler(|h| &h.connect) {
            handler(&self.connection, offer.extras);
        }
        if let Some(ready) = lock(&self.ready).take() {
            let _ = ready.send(());
        }
        Ok(())
    }

    fn on_message(&self, data: Value) {
        if let Ok(server) = self.server() {
            if let Some(handler) = server.handler(|h| &h.message) {
                handler(&self.connection, data);
            }
        }
    }

    fn on_request(&self, data: Value, responder: Responder) -> Option<Responder> {
        let handler = self.server().ok()?.handler(|h| &h.request);
        match handler {
            Some(handler) => {
                handler(&self.connection, data, responder);
                None
            }
            None => Some(responder),
        }
    }

    fn on_error(&self, error: &PeerError) {
        let server = self.server().ok();
        if let Some(server) = &server {
            server.report(error, Some(&self.connection));
        }
        let orphaned = self.connection.is_ready()
            && server.is_none_or(|server| !server.is_registered(&self.connection));
        if orphaned && !self.connection.is_closed() {
            debug!(connection = self.connection.id(), "closing orphaned connection");
            let connection = self.connection.clone();
            tokio::spawn(async move {
                let _ = connection.close(Some(json!(REASON_ORPHAN)), true).await;
            });
        }
    }

    fn on_close(&self, disconnect: Disconnect) {
        lock(&self.permit).take();
        lock(&self.ready).take();
        let Ok(server) = self.server() else { return };
        if server.forget(&self.connection) {
            debug!(connection = self.connection.id(), "disconnected");
            if let Some(handler) = server.handler(|h| &h.disconnect) {
                handler(&self.connection, &disconnect);
            }
        }
    }
}
