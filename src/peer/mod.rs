pub mod acceptor;
pub mod message;
pub mod session;

pub use acceptor::PeerAcceptor;
pub use message::{
    PeerEvent, PeerMessage, PeerRoute, PEER_CONNECTION_DESTROY, PEER_CONNECTION_ESTABLISHED,
    PEER_CONNECTION_SETUP, PEER_EVENT, PEER_MESSAGE,
};
pub use session::{PeerSession, PeerSessionConfig, DEFAULT_HANDSHAKE_TIMEOUT};
