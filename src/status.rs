use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Lifecycle state shared by transports and peer sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::New => "new",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Transport flavour. Only `Memory` ships with this crate; the other tags are
/// for `Connection` implementations living outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Memory,
    Socket,
    WebSocket,
    WebRtc,
}

/// Describes the owner of a status broadcaster. Passed to every status
/// subscriber and carried by handshake errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_type: ConnectionType,
    pub local_address: Address,
    /// Only set for peer sessions.
    pub remote_address: Option<Address>,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote_address {
            Some(remote) => write!(f, "{} -> {}", self.local_address, remote),
            None => write!(f, "{}", self.local_address),
        }
    }
}

pub type StatusCallback = Arc<dyn Fn(ConnectionStatus, &ConnectionInfo) + Send + Sync>;

/// Wraps a closure into a status callback handle. Keep the returned handle
/// around if the same subscription may be attempted twice.
pub fn status_callback<F>(f: F) -> StatusCallback
where
    F: Fn(ConnectionStatus, &ConnectionInfo) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Current status plus the ordered list of subscribers notified on every
/// `set_status`.
///
/// Transitions are serialized: concurrent `set_status` calls from different
/// threads reach subscribers in the order they were stored. A subscriber must
/// not set the status of the broadcaster that is notifying it.
pub struct StatusBroadcaster {
    owner: ConnectionInfo,
    transition: Mutex<()>,
    status: Mutex<ConnectionStatus>,
    subscribers: Mutex<Vec<StatusCallback>>,
}

impl StatusBroadcaster {
    pub fn new(owner: ConnectionInfo) -> Self {
        Self {
            owner,
            transition: Mutex::new(()),
            status: Mutex::new(ConnectionStatus::New),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> &ConnectionInfo {
        &self.owner
    }

    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    /// Stores `status`, then runs every subscriber in registration order
    /// before returning. Subscribers added while notifying see the next
    /// transition only.
    pub fn set_status(&self, status: ConnectionStatus) {
        let _transition = lock(&self.transition);
        *lock(&self.status) = status;

        let subscribers = lock(&self.subscribers).clone();
        for subscriber in subscribers {
            subscriber(status, &self.owner);
        }
    }

    /// Returns false when this exact handle is already subscribed.
    pub fn subscribe(&self, callback: StatusCallback) -> bool {
        let mut subscribers = lock(&self.subscribers);
        if subscribers.iter().any(|s| same_handle(s, &callback)) {
            return false;
        }
        subscribers.push(callback);
        true
    }

    /// Detaches this exact handle. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, callback: &StatusCallback) -> bool {
        let removed: Vec<StatusCallback> = {
            let mut subscribers = lock(&self.subscribers);
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *subscribers)
                .into_iter()
                .partition(|s| same_handle(s, callback));
            *subscribers = kept;
            removed
        };
        !removed.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Pointer identity on the shared allocation, ignoring vtables.
pub(crate) fn same_handle<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
