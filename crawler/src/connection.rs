//! Peer connection abstractions for testing and mocking.
//!
//! This module provides the [`PeerConnection`] trait that abstracts crawl
//! connections, enabling dependency injection for testing without modifying
//! the worker logic.

use crate::node::NodeKey;
use bitcoin_census_connection::{
    AddressEntry, Connection, ConnectionConfiguration, ConnectionError, Message, MessageKind,
    NodeConnection, PeerInfo,
};
use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Longest single wait while collecting address lists.
const ADDRESS_POLL_SLICE: Duration = Duration::from_secs(1);

/// Operations a worker needs from a connection to one node.
pub trait PeerConnection: Send {
    fn handshake(
        &mut self,
    ) -> impl std::future::Future<Output = Result<PeerInfo, ConnectionError>> + Send;
    fn get_addr(&mut self) -> impl std::future::Future<Output = Result<(), ConnectionError>> + Send;
    fn poll_messages(
        &mut self,
        kinds: &[MessageKind],
        max_wait: Duration,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ConnectionError>> + Send;
    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;

    /// Waits for the answer to a getaddr request.
    ///
    /// Nodes often send a single self announcement before the real answer, so
    /// lists with one entry are not taken as the answer.
    ///
    /// # Arguments
    ///
    /// * `max_wait` - Maximum duration to wait for an answer.
    ///
    /// # Returns
    ///
    /// The address lists of the answer, empty when none arrived in time or
    /// the connection failed while waiting.
    fn collect_addresses(
        &mut self,
        max_wait: Duration,
    ) -> impl std::future::Future<Output = Vec<Vec<AddressEntry>>> + Send {
        async move {
            let start = Instant::now();

            loop {
                let remaining = max_wait.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    break;
                }

                let messages = match self
                    .poll_messages(&[MessageKind::Addr], remaining.min(ADDRESS_POLL_SLICE))
                    .await
                {
                    Ok(messages) => messages,
                    Err(e) => {
                        debug!("Error while waiting for addresses: {e}");
                        break;
                    }
                };

                let lists: Vec<Vec<AddressEntry>> = messages
                    .into_iter()
                    .filter_map(|message| match message {
                        Message::Addr(entries) => Some(entries),
                        _ => None,
                    })
                    .collect();
                if lists.iter().any(|entries| entries.len() > 1) {
                    return lists;
                }
            }

            Vec::new()
        }
    }
}

impl PeerConnection for Connection {
    fn handshake(
        &mut self,
    ) -> impl std::future::Future<Output = Result<PeerInfo, ConnectionError>> + Send {
        NodeConnection::handshake(self)
    }

    fn get_addr(&mut self) -> impl std::future::Future<Output = Result<(), ConnectionError>> + Send {
        NodeConnection::get_addr(self)
    }

    fn poll_messages(
        &mut self,
        kinds: &[MessageKind],
        max_wait: Duration,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ConnectionError>> + Send {
        NodeConnection::poll_messages(self, kinds, max_wait)
    }

    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send {
        NodeConnection::close(self)
    }
}

/// Factory trait for creating peer connections.
///
/// This trait enables dependency injection for connection creation,
/// allowing different implementations for production and testing.
pub trait Connector: Clone + Send + Sync + 'static {
    type Connection: PeerConnection + Send;

    /// Open a connection to `key`, advertising `start_height` as our height.
    fn connect(
        &self,
        key: &NodeKey,
        start_height: i32,
    ) -> impl std::future::Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// Connector opening plaintext TCP connections, through the proxy for onions.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    configuration: ConnectionConfiguration,
}

impl TcpConnector {
    pub fn new(configuration: ConnectionConfiguration) -> Self {
        Self { configuration }
    }
}

impl Connector for TcpConnector {
    type Connection = Connection;

    fn connect(
        &self,
        key: &NodeKey,
        start_height: i32,
    ) -> impl std::future::Future<Output = Result<Self::Connection, ConnectionError>> + Send {
        let configuration = self
            .configuration
            .clone()
            .with_start_height(start_height);
        let mut connection =
            Connection::new(key.address.clone(), key.port, key.services, configuration);
        async move {
            connection.open().await?;
            Ok(connection)
        }
    }
}
