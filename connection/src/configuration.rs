//! Connection configuration types and constants.

use crate::user_agent::UserAgent;
use bitcoin::p2p::{Magic, ServiceFlags};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Minimum protocol version for basic compatibility with modern bitcoin nodes.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// Default protocol version advertised in version messages.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 70016;

/// Default timeout applied to every socket operation.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// Non-listening address used in version messages.
///
/// This address signals to peers that we are not accepting incoming connections
/// and should not be advertised to other nodes.
pub const NON_LISTENING_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Configuration used to open connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    /// Network magic prefixing every message.
    pub magic: Magic,
    /// Protocol version advertised in the version message.
    pub protocol_version: u32,
    /// User agent advertised in the version message.
    pub user_agent: UserAgent,
    /// Service flags advertised by this node.
    pub services: ServiceFlags,
    /// Address advertised as the sender in version messages.
    pub sender_address: IpAddr,
    /// Block height advertised in version messages.
    pub start_height: i32,
    /// Whether to relay transactions to this peer.
    pub relay: bool,
    /// Timeout for connect, handshake and each read.
    pub socket_timeout: Duration,
    /// SOCKS5 proxy used for onion targets.
    pub proxy: Option<SocketAddr>,
}

impl ConnectionConfiguration {
    /// Creates a configuration for a non-listening crawler on the given network.
    ///
    /// Advertises no services, a non-listening sender address, and does not
    /// relay transactions.
    pub fn non_listening(magic: Magic) -> Self {
        Self {
            magic,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            user_agent: UserAgent::default(),
            services: ServiceFlags::NONE,
            sender_address: NON_LISTENING_ADDRESS,
            start_height: 0,
            relay: false,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            proxy: None,
        }
    }

    /// Set the advertised protocol version.
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version.max(MIN_PROTOCOL_VERSION);
        self
    }

    pub fn with_user_agent(mut self, user_agent: UserAgent) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_services(mut self, services: ServiceFlags) -> Self {
        self.services = services;
        self
    }

    pub fn with_sender_address(mut self, address: IpAddr) -> Self {
        self.sender_address = address;
        self
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    /// Set the height advertised in the version message.
    pub fn with_start_height(mut self, height: i32) -> Self {
        self.start_height = height;
        self
    }

    /// Set the timeout applied to each socket operation.
    ///
    /// Connection establishment, each handshake read, and each poll for
    /// messages are bounded by this value.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Route onion targets through a SOCKS5 proxy.
    pub fn with_proxy(mut self, proxy: Option<SocketAddr>) -> Self {
        self.proxy = proxy;
        self
    }
}

impl fmt::Display for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionConfiguration {{ magic: {}, protocol: {}, user_agent: \"{}\", services: {}, relay: {}, timeout: {:?} }}",
            self.magic,
            self.protocol_version,
            self.user_agent,
            self.services,
            self.relay,
            self.socket_timeout
        )
    }
}
