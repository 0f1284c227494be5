//! In-process transport: a relay hub and the connections attached to it.
//!
//! The relay behaves like a small message server. Events whose payload
//! carries a `toAddress` go only to clients attached under that address,
//! everything else is broadcast to all other clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connection, EventCallback};
use crate::address::Address;
use crate::error::Result;
use crate::listeners::ListenerRegistry;
use crate::status::{
    lock, same_handle, ConnectionInfo, ConnectionStatus, ConnectionType, StatusBroadcaster,
    StatusCallback,
};
use crate::{log_debug, log_info, log_warn};

const COMPONENT: &str = "MemoryRelay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    /// The relay went away on purpose.
    ServerClosed,
    /// The link was cut without a goodbye.
    Lost,
}

enum Frame {
    Message(Value),
    Event { name: String, payload: Value },
    Shutdown(DisconnectReason),
}

struct Link {
    address: Address,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct RelayLinks {
    next_id: u64,
    links: HashMap<u64, Link>,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayLinks>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_count(&self) -> usize {
        lock(&self.state).links.len()
    }

    /// Cuts every link attached under `address`. Affected connections move to
    /// `disconnected`. Returns the number of links cut.
    pub fn drop_address(&self, address: &Address) -> usize {
        let dropped: Vec<Link> = {
            let mut state = lock(&self.state);
            let ids: Vec<u64> = state
                .links
                .iter()
                .filter(|(_, link)| &link.address == address)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| state.links.remove(id)).collect()
        };

        for link in &dropped {
            let _ = link.tx.send(Frame::Shutdown(DisconnectReason::Lost));
        }
        log_warn!(COMPONENT, "dropped {} link(s) for {}", dropped.len(), address);
        dropped.len()
    }

    /// Detaches everyone. Connections move to `closed`.
    pub fn shutdown(&self) {
        let links: Vec<Link> = lock(&self.state).links.drain().map(|(_, l)| l).collect();
        for link in &links {
            let _ = link.tx.send(Frame::Shutdown(DisconnectReason::ServerClosed));
        }
        log_info!(COMPONENT, "shut down, detached {} link(s)", links.len());
    }

    fn attach(&self, address: Address, tx: mpsc::UnboundedSender<Frame>) -> u64 {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        log_debug!(COMPONENT, "link {} attached for {}", id, address);
        state.links.insert(id, Link { address, tx });
        id
    }

    fn detach(&self, id: u64) -> bool {
        let removed = lock(&self.state).links.remove(&id).is_some();
        if removed {
            log_debug!(COMPONENT, "link {} detached", id);
        }
        removed
    }

    fn route_event(&self, from: u64, name: &str, payload: Value) {
        let target = payload
            .get("toAddress")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let state = lock(&self.state);
        for (id, link) in state.links.iter() {
            if *id == from {
                continue;
            }
            if let Some(target) = &target {
                if link.address.as_str() != target {
                    continue;
                }
            }
            let _ = link.tx.send(Frame::Event {
                name: name.to_string(),
                payload: payload.clone(),
            });
        }
    }

    fn broadcast_message(&self, from: u64, payload: Value) {
        let state = lock(&self.state);
        for (id, link) in state.links.iter() {
            if *id != from {
                let _ = link.tx.send(Frame::Message(payload.clone()));
            }
        }
    }
}

struct MemoryInner {
    relay: MemoryRelay,
    status: StatusBroadcaster,
    listeners: ListenerRegistry,
    message_callbacks: Mutex<Vec<EventCallback>>,
    link: Mutex<Option<u64>>,
}

impl MemoryInner {
    fn handle_shutdown(&self, link_id: u64, reason: DisconnectReason) {
        {
            let mut link = lock(&self.link);
            if *link != Some(link_id) {
                return;
            }
            *link = None;
        }

        match reason {
            DisconnectReason::ServerClosed => self.status.set_status(ConnectionStatus::Closed),
            DisconnectReason::Lost => self.status.set_status(ConnectionStatus::Disconnected),
        }
    }
}

/// A client attached to a `MemoryRelay`.
pub struct MemoryConnection {
    inner: Arc<MemoryInner>,
}

impl MemoryConnection {
    pub fn new(relay: MemoryRelay, local_address: Address) -> Self {
        let owner = ConnectionInfo {
            connection_type: ConnectionType::Memory,
            local_address,
            remote_address: None,
        };
        Self {
            inner: Arc::new(MemoryInner {
                relay,
                status: StatusBroadcaster::new(owner),
                listeners: ListenerRegistry::new(),
                message_callbacks: Mutex::new(Vec::new()),
                link: Mutex::new(None),
            }),
        }
    }

    fn current_link(&self) -> Option<u64> {
        *lock(&self.inner.link)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.listener_count(event)
    }

    pub fn status_subscriber_count(&self) -> usize {
        self.inner.status.subscriber_count()
    }
}

async fn pump(inner: Weak<MemoryInner>, link_id: u64, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match frame {
            Frame::Message(payload) => {
                let callbacks = lock(&inner.message_callbacks).clone();
                join_all(callbacks.iter().map(|cb| cb(payload.clone()))).await;
            }
            Frame::Event { name, payload } => {
                inner.listeners.dispatch(&name, payload).await;
            }
            Frame::Shutdown(reason) => {
                inner.handle_shutdown(link_id, reason);
                break;
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Memory
    }

    fn local_address(&self) -> &Address {
        &self.inner.status.owner().local_address
    }

    async fn connect(&self) -> Result<()> {
        if self.current_link().is_some() {
            return Ok(());
        }

        self.inner.status.set_status(ConnectionStatus::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.relay.attach(self.local_address().clone(), tx);
        *lock(&self.inner.link) = Some(id);
        tokio::spawn(pump(Arc::downgrade(&self.inner), id, rx));

        self.inner.status.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let link = lock(&self.inner.link).take();
        if let Some(id) = link {
            self.inner.relay.detach(id);
            self.inner.status.set_status(ConnectionStatus::Closed);
        }
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.status.status()
    }

    async fn send(&self, payload: Value) -> Result<()> {
        match self.current_link() {
            Some(id) => self.inner.relay.broadcast_message(id, payload),
            None => log_warn!(
                COMPONENT,
                "{} not attached, message dropped",
                self.local_address()
            ),
        }
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        match self.current_link() {
            Some(id) => self.inner.relay.route_event(id, event, payload),
            None => log_warn!(
                COMPONENT,
                "{} not attached, '{}' dropped",
                self.local_address(),
                event
            ),
        }
        Ok(())
    }

    fn on_message(&self, callback: EventCallback) {
        let mut callbacks = lock(&self.inner.message_callbacks);
        if !callbacks.iter().any(|c| same_handle(c, &callback)) {
            callbacks.push(callback);
        }
    }

    fn on_event(&self, event: &str, callback: EventCallback, once: bool) {
        self.inner.listeners.register(event, callback, once);
    }

    fn off_event(&self, event: &str, callback: &EventCallback) {
        self.inner.listeners.unregister(event, callback);
    }

    fn on_status_change(&self, callback: StatusCallback) {
        self.inner.status.subscribe(callback);
    }

    fn off_status_change(&self, callback: &StatusCallback) {
        self.inner.status.unsubscribe(callback);
    }
}
