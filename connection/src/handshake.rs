//! Version handshake helpers.

use crate::address::NodeAddress;
use crate::configuration::ConnectionConfiguration;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use log::debug;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

/// Gets the current Unix timestamp (seconds since January 1, 1970 00:00:00 UTC).
///
/// A clock set before the epoch yields `0`.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Generates a 64-bit nonce for use in version messages.
///
/// Not cryptographically secure, only used for connection loop detection.
pub fn generate_nonce() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    // Mix in the process ID for additional entropy.
    let pid = process::id() as u64;

    now ^ (pid.rotate_left(32))
}

/// State machine for tracking handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Sent version message, but haven't received anything yet.
    VersionSent,
    /// Received the peer's version message (and sent verack), but no verack response yet.
    VersionReceived,
    /// Received a verack, but no version message yet.
    VerackReceived,
    /// Both version and verack received - handshake complete.
    Complete,
}

impl HandshakeState {
    /// Transition on a received version message.
    pub fn on_version(self) -> HandshakeState {
        match self {
            HandshakeState::VersionSent => HandshakeState::VersionReceived,
            HandshakeState::VerackReceived => HandshakeState::Complete,
            _ => {
                debug!("Received duplicate version message in state {self:?}, ignoring");
                self
            }
        }
    }

    /// Transition on a received verack message.
    pub fn on_verack(self) -> HandshakeState {
        match self {
            HandshakeState::VersionSent => HandshakeState::VerackReceived,
            HandshakeState::VersionReceived => HandshakeState::Complete,
            _ => {
                debug!("Received duplicate verack message in state {self:?}, ignoring");
                self
            }
        }
    }
}

/// Converts a node address to a socket address for the version message.
///
/// Onion targets are advertised as the unspecified address.
fn address_to_socket(address: &NodeAddress, port: u16) -> SocketAddr {
    address
        .socket_addr(port)
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
}

/// Build our version message for the target.
pub fn version_message(
    configuration: &ConnectionConfiguration,
    target: &NodeAddress,
    port: u16,
    target_services: u64,
    nonce: u64,
) -> NetworkMessage {
    let receiver = address_to_socket(target, port);
    let sender = SocketAddr::new(configuration.sender_address, 0);

    NetworkMessage::Version(VersionMessage {
        version: configuration.protocol_version,
        services: configuration.services,
        timestamp: unix_timestamp(),
        receiver: Address::new(&receiver, ServiceFlags::from(target_services)),
        sender: Address::new(&sender, configuration.services),
        nonce,
        user_agent: configuration.user_agent.to_string(),
        start_height: configuration.start_height,
        relay: configuration.relay,
    })
}
