//! The one shared socket connection of a client process.
//!
//! `ConnectionManager` is a cheap `Clone` handle; every component of the
//! client holds a clone of the same instance. Transport is injected through
//! [`Connector`] so the lifecycle can be driven in-process by tests.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use xoso_types::events::{ClientCommand, ServerEvent};
use xoso_types::models::ConnectionState;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Capacity of the inbound event fan-out.
const EVENT_BUFFER: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// -- Transport --

/// A live bidirectional text link. Dropping `outbound` closes it; `inbound`
/// yields `None` once the peer is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Link, ClientError>> + Send;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connectivity(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut send_task = tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                // outbound dropped: client-initiated close
                let _ = sink.send(WsMessage::Close(None)).await;
            });

            let mut recv_task = tokio::spawn(async move {
                while let Some(Ok(msg)) = stream.next().await {
                    match msg {
                        WsMessage::Text(text) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
            });

            tokio::select! {
                _ = &mut send_task => recv_task.abort(),
                _ = &mut recv_task => send_task.abort(),
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Server end of an in-process link handed out by [`MemoryConnector`].
pub struct MemoryServerEnd {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<String>,
}

impl MemoryServerEnd {
    pub fn push(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.to_client.send(text).is_ok(),
            Err(_) => false,
        }
    }

    /// Next command the client sent, `None` once the client closed the link.
    pub async fn next_command(&mut self) -> Option<ClientCommand> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

/// In-process transport: every successful `connect` yields a
/// [`MemoryServerEnd`] on the receiver returned by `new`.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryServerEnd>,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refuse: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Link, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ClientError::Connectivity("connection refused".into()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(MemoryServerEnd {
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| ClientError::Connectivity("server gone".into()))?;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// -- Listeners --

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `teardown` was called.
    ClientClosed,
    /// The peer went away.
    TransportClosed,
    /// Connecting failed or the server reported a non-auth error.
    TransportError(String),
    /// The server refused the credential. Not retried.
    AuthFailed(String),
}

impl DisconnectReason {
    /// The error a caller should surface, if any.
    pub fn error(&self) -> Option<ClientError> {
        match self {
            Self::ClientClosed => None,
            Self::TransportClosed => Some(ClientError::Connectivity("connection lost".into())),
            Self::TransportError(e) => Some(ClientError::Connectivity(e.clone())),
            Self::AuthFailed(reason) => Some(ClientError::Auth(reason.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(DisconnectReason),
}

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl ListenerRegistry {
    fn notify(&self, event: &ConnectionEvent) {
        // snapshot so callbacks may register or unregister
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn len(&self) -> usize {
        lock(&self.listeners).len()
    }
}

/// Keeps a connection listener registered. Dropping it (or calling
/// `unregister`) removes exactly that listener.
#[must_use = "dropping the guard unregisters the listener"]
pub struct ListenerGuard {
    registry: Weak<ListenerRegistry>,
    id: u64,
}

impl ListenerGuard {
    pub fn unregister(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

// -- Outbound --

struct LiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
}

type LinkSlot = Mutex<Option<LiveLink>>;

fn send_on(slot: &LinkSlot, cmd: &ClientCommand) -> Result<(), ClientError> {
    let text = serde_json::to_string(cmd).map_err(|e| ClientError::InvalidEvent(e.to_string()))?;
    match lock(slot).as_ref() {
        Some(link) => link
            .outbound
            .send(text)
            .map_err(|_| ClientError::NotConnected),
        None => Err(ClientError::NotConnected),
    }
}

/// Send-only handle that does not keep the connection alive.
#[derive(Clone)]
pub struct CommandSender {
    link: Weak<LinkSlot>,
}

impl CommandSender {
    pub fn send(&self, cmd: &ClientCommand) -> Result<(), ClientError> {
        let slot = self.link.upgrade().ok_or(ClientError::NotConnected)?;
        send_on(&slot, cmd)
    }
}

// -- Manager --

pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C> {
    connector: C,
    url: String,
    reconnect_delay: Duration,
    credential: RwLock<Option<String>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
    link: Arc<LinkSlot>,
    /// Serializes connection attempts.
    connecting: tokio::sync::Mutex<()>,
    listeners: Arc<ListenerRegistry>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: &ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                connector,
                url: config.socket_url.clone(),
                reconnect_delay: config.reconnect_delay,
                credential: RwLock::new(config.token.clone()),
                state,
                events,
                link: Arc::new(Mutex::new(None)),
                connecting: tokio::sync::Mutex::new(()),
                listeners: Arc::new(ListenerRegistry::default()),
                reconnect: Mutex::new(None),
                shutdown: CancellationToken::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_live()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to server-pushed events. Each subscriber gets every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender {
            link: Arc::downgrade(&self.inner.link),
        }
    }

    pub fn send(&self, cmd: &ClientCommand) -> Result<(), ClientError> {
        send_on(&self.inner.link, cmd)
    }

    /// Register a callback for every connected/disconnected transition.
    pub fn add_listener(
        &self,
        listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let registry = &self.inner.listeners;
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&registry.listeners).push((id, Arc::new(listener)));
        ListenerGuard {
            registry: Arc::downgrade(registry),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Replace the credential. Sent right away when already connected.
    pub fn set_credential(&self, token: Option<String>) {
        *self
            .inner
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token.clone();
        if let Some(token) = token {
            if self.is_connected() && self.send(&ClientCommand::Authenticate { token }).is_ok() {
                self.inner.state.send_replace(ConnectionState::Authenticated);
            }
        }
    }

    fn credential(&self) -> Option<String> {
        self.inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return once the shared connection is live, establishing it if needed.
    /// Concurrent callers share a single attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClientError::Connectivity("connection was torn down".into()));
        }

        let _attempt = self.inner.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.inner.state.send_replace(ConnectionState::Connecting);
        debug!("connecting to {}", self.inner.url);

        match self.inner.connector.connect(&self.inner.url).await {
            // torn down while the connector was working
            Ok(link) if self.inner.shutdown.is_cancelled() => {
                drop(link);
                self.inner.state.send_replace(ConnectionState::Disconnected);
                Err(ClientError::Connectivity("connection was torn down".into()))
            }
            Ok(link) => {
                self.attach(link);
                Ok(())
            }
            Err(e) if self.inner.shutdown.is_cancelled() => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                warn!("connect to {} failed: {}", self.inner.url, e);
                self.inner.state.send_replace(ConnectionState::Disconnected);
                self.inner
                    .listeners
                    .notify(&ConnectionEvent::Disconnected(DisconnectReason::TransportError(
                        e.to_string(),
                    )));
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    fn attach(&self, link: Link) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Link { outbound, inbound } = link;

        // the reader waits until the link is installed and announced, so a
        // link that is already dead is reported after `Connected`
        let (ready_tx, ready_rx) = oneshot::channel();
        let this = self.clone();
        let reader =
            tokio::spawn(async move { this.read_loop(generation, ready_rx, inbound).await });
        *lock(&self.inner.link) = Some(LiveLink {
            generation,
            outbound,
            reader,
        });

        let mut state = ConnectionState::Connected;
        if let Some(token) = self.credential() {
            match self.send(&ClientCommand::Authenticate { token }) {
                Ok(()) => state = ConnectionState::Authenticated,
                Err(e) => warn!("could not transmit credential: {}", e),
            }
        }
        self.inner.state.send_replace(state);
        info!("connected to {} ({:?})", self.inner.url, state);

        self.inner.listeners.notify(&ConnectionEvent::Connected);
        let _ = ready_tx.send(());
    }

    async fn read_loop(
        &self,
        generation: u64,
        ready: oneshot::Receiver<()>,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            started = ready => if started.is_err() { return },
        }
        loop {
            let text = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(text) => text,
                    None => break,
                },
            };

            let event = match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!("bad server frame: {} -- raw: {}", e, preview(&text));
                    continue;
                }
            };
            trace!("event {}", event.name());

            if let ServerEvent::ConnectError { message } = &event {
                let reason = if is_auth_failure(message) {
                    DisconnectReason::AuthFailed(message.clone())
                } else {
                    DisconnectReason::TransportError(message.clone())
                };
                let _ = self.inner.events.send(event);
                self.on_link_lost(generation, reason);
                return;
            }

            // no subscribers is fine
            let _ = self.inner.events.send(event);
        }

        self.on_link_lost(generation, DisconnectReason::TransportClosed);
    }

    fn on_link_lost(&self, generation: u64, reason: DisconnectReason) {
        {
            let mut slot = lock(&self.inner.link);
            match slot.as_ref() {
                Some(link) if link.generation == generation => *slot = None,
                _ => return,
            }
        }
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        warn!("disconnected from {}: {:?}", self.inner.url, reason);
        self.inner.state.send_replace(ConnectionState::Disconnected);
        let retry = !matches!(reason, DisconnectReason::AuthFailed(_));
        self.inner
            .listeners
            .notify(&ConnectionEvent::Disconnected(reason));
        if retry {
            self.schedule_reconnect();
        }
    }

    /// At most one pending attempt at a time.
    fn schedule_reconnect(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut slot = lock(&self.inner.reconnect);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.clone();
        let delay = self.inner.reconnect_delay;
        let shutdown = self.inner.shutdown.clone();
        debug!("reconnecting in {:?}", delay);
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // free the slot so a failed attempt can schedule the next one
            lock(&this.inner.reconnect).take();
            if let Err(e) = this.connect().await {
                debug!("reconnect attempt failed: {}", e);
            }
        }));
    }

    pub fn reconnect_pending(&self) -> bool {
        lock(&self.inner.reconnect)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Close the connection for good: cancels the reconnect timer and stops
    /// every task owned by the manager.
    pub fn teardown(&self) {
        self.inner.shutdown.cancel();
        if let Some(timer) = lock(&self.inner.reconnect).take() {
            timer.abort();
        }
        let link = lock(&self.inner.link).take();
        let was_live = self.is_connected();
        self.inner.state.send_replace(ConnectionState::Disconnected);

        if let Some(link) = link {
            link.reader.abort();
            drop(link.outbound);
        }
        if was_live {
            info!("connection to {} closed", self.inner.url);
            self.inner
                .listeners
                .notify(&ConnectionEvent::Disconnected(DisconnectReason::ClientClosed));
        }
    }
}

/// First 200 chars of a frame, for logs.
fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

fn is_auth_failure(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    ["authentication", "unauthorized", "jwt", "token", "xác thực"]
        .iter()
        .any(|needle| reason.contains(needle))
}
