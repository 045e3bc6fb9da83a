//! TCP stream establishment, directly or through a SOCKS5 proxy.

use crate::address::NodeAddress;
use crate::configuration::ConnectionConfiguration;
use crate::error::ConnectionError;
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;
const SOCKS_SUCCEEDED: u8 = 0x00;

/// Connect a TCP socket with a timeout and nodelay.
async fn establish(socket_addr: SocketAddr, limit: Duration) -> Result<TcpStream, ConnectionError> {
    match timeout(limit, TcpStream::connect(socket_addr)).await {
        Ok(Ok(stream)) => {
            // No delay is helpful for the small packets of the bitcoin p2p protocol.
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(ConnectionError::Io(e)),
        Err(_) => Err(ConnectionError::Timeout),
    }
}

/// Open a stream to the target.
///
/// IP targets are dialed directly, onion targets through the configured proxy.
pub(crate) async fn open_stream(
    address: &NodeAddress,
    port: u16,
    configuration: &ConnectionConfiguration,
) -> Result<TcpStream, ConnectionError> {
    let limit = configuration.socket_timeout;
    match address {
        NodeAddress::Onion(host) => {
            let proxy = configuration.proxy.ok_or(ConnectionError::ProxyRequired)?;
            debug!("Dialing {host}:{port} through proxy {proxy}");
            let mut stream = establish(proxy, limit).await?;
            match timeout(limit, socks5_connect(&mut stream, host, port)).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectionError::Timeout),
            }
            Ok(stream)
        }
        _ => match address.socket_addr(port) {
            Some(socket_addr) => establish(socket_addr, limit).await,
            None => Err(ConnectionError::ProtocolFailed("address has no socket form")),
        },
    }
}

/// Ask a SOCKS5 proxy (no authentication) to connect to a host name.
async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), ConnectionError> {
    let host_len = u8::try_from(host.len())
        .map_err(|_| ConnectionError::ProxyFailed("host name too long".to_string()))?;

    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        return Err(ConnectionError::ProxyFailed(format!(
            "unsupported authentication method {:#04x}",
            choice[1]
        )));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00, SOCKS_ATYP_DOMAIN]);
    request.push(host_len);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS_SUCCEEDED {
        return Err(ConnectionError::ProxyFailed(format!(
            "proxy reply code {:#04x}",
            reply[1]
        )));
    }

    // Discard the bound address.
    let remaining = match reply[3] {
        SOCKS_ATYP_IPV4 => 4 + 2,
        SOCKS_ATYP_IPV6 => 16 + 2,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(ConnectionError::ProxyFailed(format!(
                "unknown address type {other:#04x}"
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    Ok(())
}
