//! Addressed peer sessions multiplexed over one shared transport connection.
//!
//! Every [`PeerSession`] is identified by a `(local, remote)` address pair.
//! Sessions tag outgoing traffic with envelopes carrying both addresses and
//! drop inbound envelopes that are not `remote -> local`, so any number of
//! them can share a single [`Connection`].

pub mod address;
pub mod error;
pub mod listeners;
pub mod peer;
pub mod status;
pub mod transport;
pub mod utils;

pub use address::Address;
pub use error::{PeerError, Result};
pub use listeners::ListenerRegistry;
pub use peer::{PeerAcceptor, PeerSession, PeerSessionConfig};
pub use status::{
    status_callback, ConnectionInfo, ConnectionStatus, ConnectionType, StatusBroadcaster,
    StatusCallback,
};
pub use transport::{event_callback, Connection, EventCallback, MemoryConnection, MemoryRelay};
