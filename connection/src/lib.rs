//! Plaintext bitcoin p2p connections for crawling.
//!
//! Provides just enough of the protocol for a crawler: open a stream, run the
//! version handshake, request addresses, and read them back.

mod address;
mod configuration;
mod connection;
mod error;
mod handshake;
mod tcp;
mod transport;
mod user_agent;

pub use address::{AddressEntry, AddressParseError, NodeAddress, ONION_PREFIX};
pub use configuration::{
    ConnectionConfiguration, DEFAULT_PROTOCOL_VERSION, DEFAULT_SOCKET_TIMEOUT,
    MIN_PROTOCOL_VERSION,
};
pub use connection::{Connection, Message, MessageKind, NodeConnection, PeerInfo};
pub use error::ConnectionError;
pub use handshake::unix_timestamp;
pub use user_agent::{UserAgent, UserAgentError};
