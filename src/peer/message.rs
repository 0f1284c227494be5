use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;

/// Transport-level event names reserved for peer multiplexing.
pub const PEER_MESSAGE: &str = "peer message";
pub const PEER_EVENT: &str = "peer event";
pub const PEER_CONNECTION_SETUP: &str = "peer connection setup";
pub const PEER_CONNECTION_ESTABLISHED: &str = "peer connection established";
pub const PEER_CONNECTION_DESTROY: &str = "peer connection destroy";

/// Addressing header carried by setup, established and destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRoute {
    pub from_address: Address,
    pub to_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    pub from_address: Address,
    pub to_address: Address,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEvent {
    pub from_address: Address,
    pub to_address: Address,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl PeerRoute {
    pub fn new(from_address: Address, to_address: Address) -> Self {
        Self {
            from_address,
            to_address,
        }
    }

    /// True when this envelope travels from `remote` to `local`.
    pub fn matches(&self, remote: &Address, local: &Address) -> bool {
        &self.from_address == remote && &self.to_address == local
    }
}

impl PeerMessage {
    pub fn route(&self) -> PeerRoute {
        PeerRoute::new(self.from_address.clone(), self.to_address.clone())
    }
}

impl PeerEvent {
    pub fn route(&self) -> PeerRoute {
        PeerRoute::new(self.from_address.clone(), self.to_address.clone())
    }
}
