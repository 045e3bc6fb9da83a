//! Integration tests for the crawl connection against an in-process fake node.

use bitcoin::consensus::encode;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use bitcoin_census_connection::{
    Connection, ConnectionConfiguration, ConnectionError, Message, MessageKind, NodeAddress,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const HEADER_SIZE: usize = 24;

/// Read one message, `None` once the crawler hung up.
async fn read_message(socket: &mut TcpStream) -> Option<NetworkMessage> {
    let mut header = [0u8; HEADER_SIZE];
    socket.read_exact(&mut header).await.ok()?;
    let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    let mut buffer = header.to_vec();
    buffer.resize(HEADER_SIZE + len, 0);
    socket.read_exact(&mut buffer[HEADER_SIZE..]).await.ok()?;
    let raw: RawNetworkMessage = encode::deserialize(&buffer).ok()?;
    Some(raw.payload().clone())
}

async fn write_message(socket: &mut TcpStream, message: NetworkMessage) {
    let data = encode::serialize(&RawNetworkMessage::new(Magic::REGTEST, message));
    socket.write_all(&data).await.unwrap();
}

fn remote_version(nonce: u64) -> NetworkMessage {
    let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    NetworkMessage::Version(VersionMessage {
        version: 70016,
        services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
        timestamp: 1_700_000_000,
        receiver: Address::new(&any, ServiceFlags::NONE),
        sender: Address::new(&any, ServiceFlags::NONE),
        nonce,
        user_agent: "/Satoshi:27.0.0/".to_string(),
        start_height: 840000,
        relay: false,
    })
}

/// Fake node which completes a handshake and answers getaddr with `addresses`.
async fn fake_node(addresses: Vec<(u32, Address)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        match read_message(&mut socket).await {
            Some(NetworkMessage::Version(_)) => {}
            other => panic!("expected version, got {other:?}"),
        }
        write_message(&mut socket, remote_version(1)).await;
        write_message(&mut socket, NetworkMessage::Verack).await;
        while let Some(message) = read_message(&mut socket).await {
            match message {
                NetworkMessage::GetAddr => {
                    write_message(&mut socket, NetworkMessage::Ping(5)).await;
                    write_message(&mut socket, NetworkMessage::Addr(addresses.clone())).await;
                }
                NetworkMessage::Verack | NetworkMessage::Pong(_) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    });

    local
}

fn config() -> ConnectionConfiguration {
    ConnectionConfiguration::non_listening(Magic::REGTEST).with_socket_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_handshake_and_getaddr() {
    let peer_a = Address::new(
        &SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 8333),
        ServiceFlags::NETWORK,
    );
    let peer_b = Address::new(
        &SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 18444),
        ServiceFlags::NETWORK,
    );
    let socket = fake_node(vec![(1_700_000_000, peer_a), (1_700_000_001, peer_b)]).await;

    let mut conn = Connection::new(NodeAddress::from(socket.ip()), socket.port(), 0, config());
    conn.open().await.unwrap();

    let info = conn.handshake().await.unwrap();
    assert_eq!(info.height, 840000);
    assert_eq!(info.user_agent, "/Satoshi:27.0.0/");
    assert_eq!(
        info.services,
        (ServiceFlags::NETWORK | ServiceFlags::WITNESS).to_u64()
    );

    conn.get_addr().await.unwrap();
    let messages = conn
        .poll_messages(&[MessageKind::Addr], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        Message::Addr(entries) => {
            assert_eq!(entries.len(), 2);
            assert_eq!(
                entries[1].address,
                Some(NodeAddress::Ipv4(Ipv4Addr::new(9, 9, 9, 9)))
            );
            assert_eq!(entries[1].port, 18444);
            assert_eq!(entries[1].timestamp, 1_700_000_001);
        }
        other => panic!("unexpected {other:?}"),
    }

    conn.close().await;
    conn.close().await;
    assert!(!conn.is_open());
    assert!(matches!(conn.get_addr().await, Err(ConnectionError::Closed)));
}

#[tokio::test]
async fn test_poll_times_out_empty() {
    let socket = fake_node(Vec::new()).await;
    let mut conn = Connection::new(NodeAddress::from(socket.ip()), socket.port(), 0, config());
    conn.open().await.unwrap();
    conn.handshake().await.unwrap();

    // No getaddr sent, nothing but silence comes back.
    let messages = conn
        .poll_messages(&[MessageKind::Addr], Duration::from_millis(200))
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket = listener.local_addr().unwrap();
    drop(listener);

    let mut conn = Connection::new(NodeAddress::from(socket.ip()), socket.port(), 0, config());
    let err = conn.open().await.unwrap_err();
    assert!(err.is_transport());
    assert!(!conn.is_open());
}
