use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::message::{PeerRoute, PEER_CONNECTION_ESTABLISHED, PEER_CONNECTION_SETUP};
use super::session::{PeerSession, PeerSessionConfig};
use crate::address::Address;
use crate::transport::{event_callback, Connection};
use crate::{log_debug, log_info, log_warn};

const COMPONENT: &str = "PeerAcceptor";

/// Responder half of the handshake.
///
/// Answers every "peer connection setup" addressed to `local_address` with
/// "peer connection established" and queues the resulting session, already
/// `connected`, for `accept`. Dropping the acceptor stops answering.
pub struct PeerAcceptor {
    local_address: Address,
    connection: Weak<dyn Connection>,
    // Weak, so `accept` still ends once the transport drops the listener.
    on_setup: Weak<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>,
    incoming: Mutex<mpsc::UnboundedReceiver<PeerSession>>,
}

impl PeerAcceptor {
    pub fn bind(
        local_address: Address,
        connection: Arc<dyn Connection>,
        config: PeerSessionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let local = local_address.clone();
        let transport = Arc::downgrade(&connection);
        let on_setup = event_callback(move |payload| {
            let local = local.clone();
            let transport = transport.clone();
            let config = config.clone();
            let tx = tx.clone();
            async move {
                if let Some(transport) = transport.upgrade() {
                    respond(local, transport, config, tx, payload).await;
                }
            }
        });
        connection.on_event(PEER_CONNECTION_SETUP, on_setup.clone(), false);

        Self {
            local_address,
            connection: Arc::downgrade(&connection),
            on_setup: Arc::downgrade(&on_setup),
            incoming: Mutex::new(rx),
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    /// Next session opened by a remote peer. `None` once the transport has
    /// been dropped.
    pub async fn accept(&self) -> Option<PeerSession> {
        self.incoming.lock().await.recv().await
    }
}

impl Drop for PeerAcceptor {
    fn drop(&mut self) {
        if let (Some(connection), Some(on_setup)) =
            (self.connection.upgrade(), self.on_setup.upgrade())
        {
            connection.off_event(PEER_CONNECTION_SETUP, &on_setup);
        }
    }
}

async fn respond(
    local: Address,
    transport: Arc<dyn Connection>,
    config: PeerSessionConfig,
    incoming: mpsc::UnboundedSender<PeerSession>,
    payload: Value,
) {
    let route: PeerRoute = match serde_json::from_value(payload) {
        Ok(route) => route,
        Err(e) => {
            log_debug!(COMPONENT, "[{}] malformed setup: {}", local, e);
            return;
        }
    };
    if route.to_address != local {
        return;
    }

    let remote = route.from_address;
    let session = PeerSession::new(local.clone(), remote.clone(), transport.clone(), config);
    session.mark_established();

    let reply = match serde_json::to_value(PeerRoute::new(local.clone(), remote.clone())) {
        Ok(reply) => reply,
        Err(e) => {
            log_warn!(COMPONENT, "[{}] cannot encode reply: {}", local, e);
            return;
        }
    };
    if let Err(e) = transport.emit(PEER_CONNECTION_ESTABLISHED, reply).await {
        log_warn!(COMPONENT, "[{} -> {}] established not sent: {}", local, remote, e);
        return;
    }

    log_info!(COMPONENT, "[{} -> {}] accepted", local, remote);
    if incoming.send(session).is_err() {
        log_debug!(COMPONENT, "[{}] acceptor dropped, session discarded", local);
    }
}
