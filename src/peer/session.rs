use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::message::{
    PeerEvent, PeerMessage, PeerRoute, PEER_CONNECTION_DESTROY, PEER_CONNECTION_ESTABLISHED,
    PEER_CONNECTION_SETUP, PEER_EVENT, PEER_MESSAGE,
};
use crate::address::Address;
use crate::error::{PeerError, Result};
use crate::listeners::ListenerRegistry;
use crate::status::{
    lock, same_handle, status_callback, ConnectionInfo, ConnectionStatus, ConnectionType,
    StatusBroadcaster, StatusCallback,
};
use crate::transport::{event_callback, Connection, EventCallback};
use crate::{log_debug, log_info, log_warn};

const COMPONENT: &str = "PeerSession";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Per-session options. Unknown keys are accepted and ignored so transport
/// options can travel in the same object.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PeerSessionConfig {
    #[serde(deserialize_with = "duration_from_millis")]
    timeout: Duration,
}

impl Default for PeerSessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl PeerSessionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parses `{"timeout": <millis>, ...}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| PeerError::InvalidConfig(e.to_string()))
    }

    /// Handshake timeout; a zero duration falls back to the default.
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_HANDSHAKE_TIMEOUT
        } else {
            self.timeout
        }
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

struct PendingHandshake {
    attempt: u64,
    done: oneshot::Sender<()>,
    listener: EventCallback,
}

#[derive(Default)]
struct HandshakeSlot {
    next_attempt: u64,
    pending: Option<PendingHandshake>,
}

/// Addressed traffic that passed the filter, waiting for the session's own
/// dispatch task.
enum Inbound {
    Message(Value),
    Event { name: String, payload: Value },
}

/// The handles a session registers on its transport, kept so they can be
/// detached when the session goes away.
struct TransportHooks {
    message: EventCallback,
    event: EventCallback,
    destroy: EventCallback,
    status: StatusCallback,
}

struct SessionInner {
    local_address: Address,
    remote_address: Address,
    connection: Arc<dyn Connection>,
    config: PeerSessionConfig,
    status: StatusBroadcaster,
    listeners: ListenerRegistry,
    message_callbacks: Mutex<Vec<EventCallback>>,
    handshake: Mutex<HandshakeSlot>,
    hooks: TransportHooks,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
}

/// One addressed conversation multiplexed over a shared `Connection`.
///
/// Cloning is cheap and yields a handle to the same session. The transport
/// is shared, never owned: dropping every handle detaches the session's hooks
/// and leaves the connection and its other sessions untouched.
///
/// Inbound messages and events are dispatched on a task of their own, so a
/// listener that awaits more traffic stalls only this session. Needs a Tokio
/// runtime.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    pub fn new(
        local_address: Address,
        remote_address: Address,
        connection: Arc<dyn Connection>,
        config: PeerSessionConfig,
    ) -> Self {
        let owner = ConnectionInfo {
            connection_type: connection.connection_type(),
            local_address: local_address.clone(),
            remote_address: Some(remote_address.clone()),
        };

        let inner = Arc::new_cyclic(|weak| SessionInner {
            local_address,
            remote_address,
            connection,
            config,
            status: StatusBroadcaster::new(owner),
            listeners: ListenerRegistry::new(),
            message_callbacks: Mutex::new(Vec::new()),
            handshake: Mutex::new(HandshakeSlot::default()),
            hooks: TransportHooks::new(weak),
            inbound: Mutex::new(None),
        });
        inner.install();

        Self { inner }
    }

    pub fn local_address(&self) -> &Address {
        &self.inner.local_address
    }

    pub fn remote_address(&self) -> &Address {
        &self.inner.remote_address
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.status()
    }

    pub fn info(&self) -> ConnectionInfo {
        self.inner.status.owner().clone()
    }

    pub fn config(&self) -> &PeerSessionConfig {
        &self.inner.config
    }

    /// Runs the setup/established handshake against the remote peer.
    ///
    /// Returns immediately while another attempt is in flight; only that
    /// attempt's caller learns the outcome. On timeout the session is left
    /// `failed` and nothing is retried.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;

        if inner.status.status() == ConnectionStatus::Connecting {
            log_debug!(COMPONENT, "[{}] handshake already in flight", inner.describe());
            return Ok(());
        }

        // A closed transport is reused as is.
        match inner.connection.status() {
            ConnectionStatus::Connected | ConnectionStatus::Closed => {}
            _ => inner.connection.connect().await?,
        }

        let timeout = inner.config.timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let setup = serde_json::to_value(inner.route())?;
        let (attempt, established) = SessionInner::begin_handshake(inner);

        inner.status.set_status(ConnectionStatus::Connecting);
        log_info!(
            COMPONENT,
            "[{}] handshake attempt {} started",
            inner.describe(),
            attempt
        );

        if let Err(e) = inner.connection.emit(PEER_CONNECTION_SETUP, setup).await {
            inner.abandon_handshake(attempt);
            inner.status.set_status(ConnectionStatus::Failed);
            return Err(e);
        }

        tokio::select! {
            biased;
            outcome = established => match outcome {
                Ok(()) => {
                    inner.status.set_status(ConnectionStatus::Connected);
                    log_info!(COMPONENT, "[{}] connected", inner.describe());
                    Ok(())
                }
                Err(_) => {
                    log_warn!(
                        COMPONENT,
                        "[{}] handshake attempt {} superseded",
                        inner.describe(),
                        attempt
                    );
                    Err(PeerError::HandshakeAborted {
                        session: self.info(),
                    })
                }
            },
            _ = &mut deadline => {
                inner.abandon_handshake(attempt);
                inner.status.set_status(ConnectionStatus::Failed);
                log_warn!(
                    COMPONENT,
                    "[{}] handshake attempt {} timed out after {:?}",
                    inner.describe(),
                    attempt,
                    timeout
                );
                Err(PeerError::HandshakeTimeout {
                    session: self.info(),
                    timeout,
                })
            }
        }
    }

    /// Tells the remote side to tear down and marks the session `closed`.
    /// The shared transport stays up.
    pub async fn disconnect(&self) -> Result<()> {
        match self.status() {
            ConnectionStatus::Disconnected | ConnectionStatus::Closed => {
                log_debug!(COMPONENT, "[{}] already down", self.inner.describe());
                return Ok(());
            }
            _ => {}
        }

        let destroy = serde_json::to_value(self.inner.route())?;
        self.inner
            .connection
            .emit(PEER_CONNECTION_DESTROY, destroy)
            .await?;
        self.inner.status.set_status(ConnectionStatus::Closed);
        log_info!(COMPONENT, "[{}] closed", self.inner.describe());
        Ok(())
    }

    pub async fn send(&self, payload: Value) -> Result<()> {
        let envelope = PeerMessage {
            from_address: self.inner.local_address.clone(),
            to_address: self.inner.remote_address.clone(),
            payload,
        };
        self.inner
            .connection
            .emit(PEER_MESSAGE, serde_json::to_value(envelope)?)
            .await
    }

    pub async fn emit_event(&self, event: &str, payload: Value) -> Result<()> {
        let envelope = PeerEvent {
            from_address: self.inner.local_address.clone(),
            to_address: self.inner.remote_address.clone(),
            event: event.to_string(),
            payload,
        };
        self.inner
            .connection
            .emit(PEER_EVENT, serde_json::to_value(envelope)?)
            .await
    }

    pub fn on_message(&self, callback: EventCallback) {
        let mut callbacks = lock(&self.inner.message_callbacks);
        if !callbacks.iter().any(|c| same_handle(c, &callback)) {
            callbacks.push(callback);
        }
    }

    pub fn on_event(&self, event: &str, callback: EventCallback, once: bool) {
        self.inner.listeners.register(event, callback, once);
    }

    pub fn off_event(&self, event: &str, callback: &EventCallback) {
        self.inner.listeners.unregister(event, callback);
    }

    pub fn on_status_change(&self, callback: StatusCallback) {
        self.inner.status.subscribe(callback);
    }

    pub fn off_status_change(&self, callback: &StatusCallback) {
        self.inner.status.unsubscribe(callback);
    }

    /// Responder side: the remote already ran its half of the handshake.
    pub(crate) fn mark_established(&self) {
        self.inner.status.set_status(ConnectionStatus::Connected);
    }
}

impl SessionInner {
    fn describe(&self) -> String {
        format!("{} -> {}", self.local_address, self.remote_address)
    }

    fn route(&self) -> PeerRoute {
        PeerRoute::new(self.local_address.clone(), self.remote_address.clone())
    }

    fn install(&self) {
        let connection = &self.connection;
        connection.on_event(PEER_MESSAGE, self.hooks.message.clone(), false);
        connection.on_event(PEER_EVENT, self.hooks.event.clone(), false);
        connection.on_event(PEER_CONNECTION_DESTROY, self.hooks.destroy.clone(), false);
        connection.on_status_change(self.hooks.status.clone());
    }

    fn on_peer_message(inner: &Arc<Self>, payload: Value) {
        let message: PeerMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                log_debug!(COMPONENT, "[{}] malformed message: {}", inner.describe(), e);
                return;
            }
        };
        if message
            .route()
            .matches(&inner.remote_address, &inner.local_address)
        {
            Self::deliver(inner, Inbound::Message(message.payload));
        }
    }

    fn on_peer_event(inner: &Arc<Self>, payload: Value) {
        let event: PeerEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                log_debug!(COMPONENT, "[{}] malformed event: {}", inner.describe(), e);
                return;
            }
        };
        if event
            .route()
            .matches(&inner.remote_address, &inner.local_address)
        {
            Self::deliver(
                inner,
                Inbound::Event {
                    name: event.event,
                    payload: event.payload,
                },
            );
        }
    }

    /// Queues accepted traffic for the dispatch task, starting it on first use.
    fn deliver(inner: &Arc<Self>, item: Inbound) {
        let mut queue = lock(&inner.inbound);
        let tx = queue.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::run_dispatch(Arc::downgrade(inner), rx));
            tx
        });
        let _ = tx.send(item);
    }

    /// Handles queued traffic one item at a time. Ends once the session is
    /// dropped.
    async fn run_dispatch(inner: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(item) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match item {
                Inbound::Message(payload) => {
                    let callbacks = lock(&inner.message_callbacks).clone();
                    join_all(callbacks.iter().map(|cb| cb(payload.clone()))).await;
                }
                Inbound::Event { name, payload } => {
                    inner.listeners.dispatch(&name, payload).await;
                }
            }
        }
    }

    fn on_transport_status(&self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Closed => self.status.set_status(ConnectionStatus::Closed),
            ConnectionStatus::Disconnected => {
                self.status.set_status(ConnectionStatus::Disconnected)
            }
            _ => {}
        }
    }

    /// Opens a new attempt and arms its established listener. A pending
    /// attempt is replaced: its listener is detached and its caller sees the
    /// handshake aborted.
    fn begin_handshake(inner: &Arc<Self>) -> (u64, oneshot::Receiver<()>) {
        let (done, established) = oneshot::channel();
        let mut slot = lock(&inner.handshake);
        let attempt = slot.next_attempt;
        slot.next_attempt += 1;

        let listener = Self::established_listener(inner, attempt);
        let superseded = slot.pending.replace(PendingHandshake {
            attempt,
            done,
            listener: listener.clone(),
        });
        if let Some(old) = superseded {
            inner
                .connection
                .off_event(PEER_CONNECTION_ESTABLISHED, &old.listener);
        }
        inner
            .connection
            .on_event(PEER_CONNECTION_ESTABLISHED, listener, true);
        (attempt, established)
    }

    fn established_listener(inner: &Arc<Self>, attempt: u64) -> EventCallback {
        let weak = Arc::downgrade(inner);
        event_callback(move |payload| {
            if let Some(inner) = weak.upgrade() {
                Self::on_established(&inner, attempt, payload);
            }
            async {}
        })
    }

    /// Arms a fresh one-shot listener for an attempt that is still pending.
    fn rearm_established(inner: &Arc<Self>, attempt: u64) {
        let mut slot = lock(&inner.handshake);
        let Some(pending) = slot.pending.as_mut().filter(|p| p.attempt == attempt) else {
            return;
        };
        let listener = Self::established_listener(inner, attempt);
        pending.listener = listener.clone();
        inner
            .connection
            .on_event(PEER_CONNECTION_ESTABLISHED, listener, true);
    }

    fn on_established(inner: &Arc<Self>, attempt: u64, payload: Value) {
        if !inner.is_pending(attempt) {
            log_debug!(
                COMPONENT,
                "[{}] ignoring established for stale attempt {}",
                inner.describe(),
                attempt
            );
            return;
        }

        // An empty payload is accepted; an addressed one must be ours.
        if let Ok(route) = serde_json::from_value::<PeerRoute>(payload) {
            if !route.matches(&inner.remote_address, &inner.local_address) {
                Self::rearm_established(inner, attempt);
                return;
            }
        }

        let pending = {
            let mut slot = lock(&inner.handshake);
            match &slot.pending {
                Some(p) if p.attempt == attempt => slot.pending.take(),
                _ => None,
            }
        };
        if let Some(pending) = pending {
            let _ = pending.done.send(());
        }
    }

    fn is_pending(&self, attempt: u64) -> bool {
        matches!(&lock(&self.handshake).pending, Some(p) if p.attempt == attempt)
    }

    fn abandon_handshake(&self, attempt: u64) {
        let pending = {
            let mut slot = lock(&self.handshake);
            match &slot.pending {
                Some(p) if p.attempt == attempt => slot.pending.take(),
                _ => None,
            }
        };
        if let Some(pending) = pending {
            self.connection
                .off_event(PEER_CONNECTION_ESTABLISHED, &pending.listener);
        }
    }
}

impl TransportHooks {
    /// Every hook holds a weak reference, so none of them keeps the session
    /// alive.
    fn new(weak: &Weak<SessionInner>) -> Self {
        let message = {
            let weak = weak.clone();
            event_callback(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    SessionInner::on_peer_message(&inner, payload);
                }
                async {}
            })
        };

        let event = {
            let weak = weak.clone();
            event_callback(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    SessionInner::on_peer_event(&inner, payload);
                }
                async {}
            })
        };

        let destroy = {
            let weak = weak.clone();
            event_callback(move |_| {
                if let Some(inner) = weak.upgrade() {
                    log_info!(COMPONENT, "[{}] destroyed by remote", inner.describe());
                    inner.status.set_status(ConnectionStatus::Closed);
                }
                async {}
            })
        };

        let status = {
            let weak = weak.clone();
            status_callback(move |status, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_transport_status(status);
                }
            })
        };

        Self {
            message,
            event,
            destroy,
            status,
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let connection = &self.connection;
        connection.off_event(PEER_MESSAGE, &self.hooks.message);
        connection.off_event(PEER_EVENT, &self.hooks.event);
        connection.off_event(PEER_CONNECTION_DESTROY, &self.hooks.destroy);
        connection.off_status_change(&self.hooks.status);

        let pending = lock(&self.handshake).pending.take();
        if let Some(pending) = pending {
            connection.off_event(PEER_CONNECTION_ESTABLISHED, &pending.listener);
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("local_address", &self.inner.local_address)
            .field("remote_address", &self.inner.remote_address)
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait]
impl Connection for PeerSession {
    fn connection_type(&self) -> ConnectionType {
        self.inner.status.owner().connection_type
    }

    fn local_address(&self) -> &Address {
        PeerSession::local_address(self)
    }

    async fn connect(&self) -> Result<()> {
        PeerSession::connect(self).await
    }

    async fn disconnect(&self) -> Result<()> {
        PeerSession::disconnect(self).await
    }

    fn status(&self) -> ConnectionStatus {
        PeerSession::status(self)
    }

    async fn send(&self, payload: Value) -> Result<()> {
        PeerSession::send(self, payload).await
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.emit_event(event, payload).await
    }

    fn on_message(&self, callback: EventCallback) {
        PeerSession::on_message(self, callback)
    }

    fn on_event(&self, event: &str, callback: EventCallback, once: bool) {
        PeerSession::on_event(self, event, callback, once)
    }

    fn off_event(&self, event: &str, callback: &EventCallback) {
        PeerSession::off_event(self, event, callback)
    }

    fn on_status_change(&self, callback: StatusCallback) {
        PeerSession::on_status_change(self, callback)
    }

    fn off_status_change(&self, callback: &StatusCallback) {
        PeerSession::off_status_change(self, callback)
    }
}
