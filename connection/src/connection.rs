//! A single crawl connection to a remote node.
//!
//! The lifecycle mirrors one crawl attempt:
//!
//! 1. [`Connection::open`] establishes the stream (through a proxy for onions).
//! 2. [`Connection::handshake`] exchanges version and verack.
//! 3. [`Connection::get_addr`] asks for known addresses without waiting.
//! 4. [`Connection::poll_messages`] collects responses within a time bound.
//! 5. [`Connection::close`] releases the socket, it is safe to call at any point.
//!
//! # Example
//!
//! ```no_run
//! use bitcoin::p2p::Magic;
//! use bitcoin_census_connection::{Connection, ConnectionConfiguration, MessageKind, NodeAddress};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfiguration::non_listening(Magic::BITCOIN);
//! let address: NodeAddress = "127.0.0.1".parse()?;
//! let mut conn = Connection::new(address, 8333, 0, config);
//!
//! conn.open().await?;
//! let info = conn.handshake().await?;
//! println!("{} at height {}", info.user_agent, info.height);
//!
//! conn.get_addr().await?;
//! let messages = conn
//!     .poll_messages(&[MessageKind::Addr], Duration::from_secs(5))
//!     .await?;
//! println!("{} address batches", messages.len());
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

use crate::address::{AddressEntry, NodeAddress};
use crate::configuration::ConnectionConfiguration;
use crate::error::ConnectionError;
use crate::handshake::{generate_nonce, version_message, HandshakeState};
use crate::tcp::open_stream;
use crate::transport::Transport;
use bitcoin::p2p::message::NetworkMessage;
use log::debug;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// What the remote node reported about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Service bits the node offers.
    pub services: u64,
    /// Chain height the node reported.
    pub height: i32,
    /// The node's user agent.
    pub user_agent: String,
    /// The node's protocol version.
    pub version: u32,
}

/// Kinds of post-handshake messages a caller can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Addr,
    Ping,
    Other,
}

/// A post-handshake message, reduced to what crawling needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An address list.
    Addr(Vec<AddressEntry>),
    /// A ping, already answered.
    Ping(u64),
    /// Anything else, by command name.
    Other(String),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Addr(_) => MessageKind::Addr,
            Message::Ping(_) => MessageKind::Ping,
            Message::Other(_) => MessageKind::Other,
        }
    }
}

impl From<NetworkMessage> for Message {
    fn from(message: NetworkMessage) -> Self {
        match message {
            NetworkMessage::Addr(addresses) => Message::Addr(
                addresses
                    .iter()
                    .map(|(timestamp, address)| AddressEntry::from_wire(*timestamp, address))
                    .collect(),
            ),
            NetworkMessage::Ping(nonce) => Message::Ping(nonce),
            other => Message::Other(other.cmd().to_string()),
        }
    }
}

/// A crawl connection to one node.
///
/// Generic over the byte stream so the protocol logic can run over in-memory
/// pipes, [`Connection`] is the TCP form.
#[derive(Debug)]
pub struct NodeConnection<S> {
    address: NodeAddress,
    port: u16,
    services: u64,
    configuration: ConnectionConfiguration,
    transport: Option<Transport<S>>,
}

/// TCP crawl connection.
pub type Connection = NodeConnection<TcpStream>;

impl Connection {
    /// Open the TCP stream, through the proxy for onion targets.
    pub async fn open(&mut self) -> Result<(), ConnectionError> {
        debug!("Connecting to {}:{}", self.address, self.port);
        let stream = open_stream(&self.address, self.port, &self.configuration).await?;
        self.attach(stream);
        Ok(())
    }
}

impl<S> NodeConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create an unopened connection.
    ///
    /// `services` is the service bits we assume the target offers.
    pub fn new(
        address: NodeAddress,
        port: u16,
        services: u64,
        configuration: ConnectionConfiguration,
    ) -> Self {
        NodeConnection {
            address,
            port,
            services,
            configuration,
            transport: None,
        }
    }

    /// Use an already established stream.
    pub fn attach(&mut self, stream: S) {
        self.transport = Some(Transport::new(self.configuration.magic, stream));
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn transport(&mut self) -> Result<&mut Transport<S>, ConnectionError> {
        self.transport.as_mut().ok_or(ConnectionError::Closed)
    }

    /// Exchange version and verack messages.
    ///
    /// The whole exchange is bounded by the socket timeout.
    pub async fn handshake(&mut self) -> Result<PeerInfo, ConnectionError> {
        let limit = self.configuration.socket_timeout;
        match timeout(limit, self.perform_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    async fn perform_handshake(&mut self) -> Result<PeerInfo, ConnectionError> {
        let nonce = generate_nonce();
        let version = version_message(
            &self.configuration,
            &self.address,
            self.port,
            self.services,
            nonce,
        );
        let transport = self.transport()?;
        transport.write(version).await?;
        debug!("Sent version message to peer");

        let mut state = HandshakeState::VersionSent;
        let mut info = None;

        while state != HandshakeState::Complete {
            match transport.read().await? {
                NetworkMessage::Version(version) => {
                    if version.nonce == nonce {
                        return Err(ConnectionError::ConnectionLoop);
                    }
                    if info.is_none() {
                        info = Some(PeerInfo {
                            services: version.services.to_u64(),
                            height: version.start_height,
                            user_agent: version.user_agent,
                            version: version.version,
                        });
                        transport.write(NetworkMessage::Verack).await?;
                        debug!("Sent verack message to peer");
                    }
                    state = state.on_version();
                }
                NetworkMessage::Verack => {
                    state = state.on_verack();
                }
                NetworkMessage::Ping(nonce) => {
                    transport.write(NetworkMessage::Pong(nonce)).await?;
                }
                message => {
                    debug!("Received unexpected message during handshake: {}, ignoring", message.cmd());
                }
            }
        }

        info.ok_or(ConnectionError::ProtocolFailed("handshake completed without version"))
    }

    /// Send a getaddr request without waiting for the answer.
    pub async fn get_addr(&mut self) -> Result<(), ConnectionError> {
        self.transport()?.write(NetworkMessage::GetAddr).await?;
        debug!("Sent getaddr message to peer");
        Ok(())
    }

    /// Wait up to `max_wait` for messages of the requested kinds.
    ///
    /// Pings are answered while waiting. Returns as soon as at least one
    /// wanted message arrived, or an empty list when the wait runs out.
    pub async fn poll_messages(
        &mut self,
        kinds: &[MessageKind],
        max_wait: Duration,
    ) -> Result<Vec<Message>, ConnectionError> {
        let deadline = Instant::now() + max_wait;
        let transport = self.transport()?;
        let mut received = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let message = match timeout(remaining, transport.read()).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            };

            if let NetworkMessage::Ping(nonce) = message {
                transport.write(NetworkMessage::Pong(nonce)).await?;
            }

            let message = Message::from(message);
            if kinds.contains(&message.kind()) {
                received.push(message);
                break;
            }
        }

        Ok(received)
    }

    /// Close the connection.
    ///
    /// Idempotent, errors while shutting down are only logged.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown().await {
                debug!("Error closing connection to {}: {e}", self.address);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }
}

impl<S> fmt::Display for NodeConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.transport.is_some() { "open" } else { "closed" };
        write!(f, "{}:{} ({state})", self.address, self.port)
    }
}
