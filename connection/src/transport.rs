//! Plaintext (v1) message framing.
//!
//! Messages are a 24 byte header (magic, command, payload length, checksum)
//! followed by the payload. Serialization is delegated to the `bitcoin`
//! crate's [`RawNetworkMessage`].

use crate::error::ConnectionError;
use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a bitcoin message header in bytes.
const HEADER_SIZE: usize = 24;
/// Offset in the header where the payload length is stored.
const PAYLOAD_LENGTH_OFFSET: usize = 16;
/// Largest payload accepted from a peer.
const MAX_PAYLOAD_SIZE: usize = 4 * 1000 * 1000;

/// Progress of a partially read message.
///
/// Tracking progress across calls makes [`Transport::read`] cancellation
/// safe, a read interrupted by a timeout resumes where it left off.
#[derive(Debug)]
enum ReceiveState {
    ReadingHeader {
        header: [u8; HEADER_SIZE],
        bytes_read: usize,
    },
    ReadingPayload {
        /// Complete buffer including header and payload.
        buffer: Vec<u8>,
        bytes_read: usize,
    },
}

impl ReceiveState {
    fn reading_header() -> Self {
        ReceiveState::ReadingHeader {
            header: [0u8; HEADER_SIZE],
            bytes_read: 0,
        }
    }

    fn reading_payload(header: [u8; HEADER_SIZE], payload_len: usize) -> Self {
        let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_len);
        buffer.extend_from_slice(&header);
        buffer.resize(HEADER_SIZE + payload_len, 0);

        ReceiveState::ReadingPayload {
            buffer,
            bytes_read: HEADER_SIZE,
        }
    }
}

/// Plaintext transport over any byte stream.
#[derive(Debug)]
pub struct Transport<S> {
    magic: Magic,
    receive_state: ReceiveState,
    stream: S,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(magic: Magic, stream: S) -> Self {
        Self {
            magic,
            receive_state: ReceiveState::reading_header(),
            stream,
        }
    }

    /// Write a bitcoin network message.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), ConnectionError> {
        let raw_msg = RawNetworkMessage::new(self.magic, message);
        let data = encode::serialize(&raw_msg);

        self.stream.write_all(&data).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Read a bitcoin network message.
    ///
    /// Cancellation safe, see [`ReceiveState`].
    pub async fn read(&mut self) -> Result<NetworkMessage, ConnectionError> {
        loop {
            match &mut self.receive_state {
                ReceiveState::ReadingHeader { header, bytes_read } => {
                    while *bytes_read < HEADER_SIZE {
                        let n = self.stream.read(&mut header[*bytes_read..]).await?;
                        if n == 0 {
                            return Err(ConnectionError::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed while reading header",
                            )));
                        }
                        *bytes_read += n;
                    }

                    if header[..4] != self.magic.to_bytes() {
                        return Err(ConnectionError::MagicMismatch);
                    }

                    let payload_len = u32::from_le_bytes([
                        header[PAYLOAD_LENGTH_OFFSET],
                        header[PAYLOAD_LENGTH_OFFSET + 1],
                        header[PAYLOAD_LENGTH_OFFSET + 2],
                        header[PAYLOAD_LENGTH_OFFSET + 3],
                    ]) as usize;
                    if payload_len > MAX_PAYLOAD_SIZE {
                        return Err(ConnectionError::ProtocolFailed("oversized payload"));
                    }

                    self.receive_state = ReceiveState::reading_payload(*header, payload_len);
                }

                ReceiveState::ReadingPayload { buffer, bytes_read } => {
                    while *bytes_read < buffer.len() {
                        let n = self.stream.read(&mut buffer[*bytes_read..]).await?;
                        if n == 0 {
                            return Err(ConnectionError::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed while reading payload",
                            )));
                        }
                        *bytes_read += n;
                    }

                    let raw_msg: RawNetworkMessage = encode::deserialize(buffer)?;
                    self.receive_state = ReceiveState::reading_header();
                    return Ok(raw_msg.payload().clone());
                }
            }
        }
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
