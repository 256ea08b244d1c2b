//! TFTP File Transfer Logic
//!
//! This module serves one accepted read request: it streams the file in
//! fixed-size blocks, one block in flight at a time, waiting for the client's
//! acknowledgment before sending the next block.
//!
//! ```text
//! OpenFile -> SendBlock -> WaitAck -> (more data? SendBlock : Done)
//!                             \-> ErrorTerminated
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::protocol::{
    DEFAULT_BLOCK_SIZE, HEADER_LEN, TftpErrorCode, TftpOpcode, decode_ack, decode_error, encode_data, encode_error,
    get_tftp_opcode,
};

const TIMEOUT_SECS: u64 = 3;
const MAX_RETRIES: usize = 8;

/// Default receive buffer for inbound datagrams
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;

/// Largest payload a single IPv4 UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// How strictly the engine interprets datagrams received while waiting for
/// an acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Any datagram arriving on the transfer socket acknowledges the block
    /// just sent, whatever its source or content.
    #[default]
    Relaxed,
    /// Only an ACK from the transfer's peer carrying the block number just
    /// sent advances the transfer. Stale and duplicate ACKs are ignored,
    /// foreign senders get an "Unknown transfer ID" error, and an ERROR
    /// packet from the peer aborts the transfer.
    Strict,
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relaxed => write!(f, "relaxed"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes of file data per DATA packet
    pub chunk_size: usize,
    /// Receive buffer size for acknowledgments
    pub max_datagram_size: usize,
    /// How long to wait for an acknowledgment before re-sending a block
    pub ack_timeout: Duration,
    /// Sends per block, the first one included
    pub max_retries: usize,
    pub ack_policy: AckPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_BLOCK_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            ack_timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            ack_policy: AckPolicy::default(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk size must be at least 1 byte");
        ensure!(
            self.chunk_size + HEADER_LEN <= MAX_UDP_PAYLOAD,
            "chunk size {} does not fit in a UDP datagram",
            self.chunk_size
        );
        ensure!(
            self.max_datagram_size >= HEADER_LEN,
            "max datagram size {} is smaller than a TFTP header",
            self.max_datagram_size
        );
        ensure!(self.max_retries > 0, "max retries must be at least 1");
        ensure!(!self.ack_timeout.is_zero(), "ACK timeout must be non-zero");
        Ok(())
    }
}

/// Where a transfer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    OpenFile,
    SendBlock,
    WaitAck,
    Done,
    ErrorTerminated,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::ErrorTerminated)
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSummary {
    /// DATA packets acknowledged, including a trailing empty block
    pub blocks: u64,
    /// File bytes delivered
    pub bytes: u64,
    /// Block number of the final DATA packet
    pub last_block: u16,
}

/// One read request being served over a dedicated socket
///
/// The socket and the open file are released when the transfer finishes,
/// whether it succeeds or not.
pub struct Transfer {
    socket: UdpSocket,
    peer: SocketAddr,
    path: PathBuf,
    config: TransferConfig,
    state: TransferState,
    recv_buf: Vec<u8>,
}

impl Transfer {
    /// Prepare a transfer of `path` to `peer`
    ///
    /// `path` must already be known to exist; it is not re-validated.
    pub fn new(socket: UdpSocket, peer: SocketAddr, path: impl Into<PathBuf>, config: TransferConfig) -> Self {
        let recv_buf = vec![0u8; config.max_datagram_size];
        Self {
            socket,
            peer,
            path: path.into(),
            config,
            state: TransferState::OpenFile,
            recv_buf,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Run the transfer to completion
    pub async fn run(&mut self) -> Result<TransferSummary> {
        ensure!(!self.state.is_terminal(), "transfer already finished");

        let result = self.serve().await;
        self.state = match result {
            Ok(_) => TransferState::Done,
            Err(_) => TransferState::ErrorTerminated,
        };
        result
    }

    async fn serve(&mut self) -> Result<TransferSummary> {
        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let chunk_size = self.config.chunk_size;
        let mut chunk = vec![0u8; chunk_size];
        let mut block: u16 = 1;
        let mut summary = TransferSummary::default();

        loop {
            self.state = TransferState::SendBlock;

            let len = match read_chunk(&mut file, &mut chunk).await {
                Ok(len) => len,
                Err(e) => {
                    self.send_best_effort(&encode_error(TftpErrorCode::NotDefined)).await;
                    return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
                }
            };

            let packet = encode_data(block, &chunk[..len]);
            self.send_data_block_with_retries(&packet, block).await?;

            summary.blocks += 1;
            summary.bytes += len as u64;
            summary.last_block = block;

            // A short block, possibly empty, ends the transfer
            if len < chunk_size {
                return Ok(summary);
            }

            if block == u16::MAX {
                tracing::debug!(
                    "Block number of {} to {} wrapped after {} bytes",
                    self.path.display(),
                    self.peer,
                    summary.bytes
                );
            }
            block = block.wrapping_add(1);
        }
    }

    /// Send a data block with retries and wait for its ACK
    async fn send_data_block_with_retries(&mut self, packet: &[u8], block: u16) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            self.socket
                .send_to(packet, self.peer)
                .await
                .with_context(|| format!("failed to send block {} to {}", block, self.peer))?;
            self.state = TransferState::WaitAck;

            match timeout(self.config.ack_timeout, self.wait_ack(block)).await {
                Ok(result) => return result,
                Err(_) => {
                    tracing::debug!(
                        "No ACK for block {} from {} (attempt {}/{})",
                        block,
                        self.peer,
                        attempt,
                        self.config.max_retries
                    );
                }
            }
        }

        Err(anyhow!(
            "no ACK received for block {} after {} attempts",
            block,
            self.config.max_retries
        ))
    }

    /// Wait until a datagram acknowledging `block` arrives
    async fn wait_ack(&mut self, block: u16) -> Result<()> {
        loop {
            let (len, src) = self
                .socket
                .recv_from(&mut self.recv_buf)
                .await
                .context("failed to receive ACK")?;

            if self.config.ack_policy == AckPolicy::Relaxed {
                return Ok(());
            }

            if src != self.peer {
                tracing::debug!("Datagram from unknown source {} on transfer to {}", src, self.peer);
                let reply = encode_error(TftpErrorCode::UnknownTransferId);
                if let Err(e) = self.socket.send_to(&reply, src).await {
                    tracing::debug!("Failed to reject {}: {}", src, e);
                }
                continue;
            }

            let packet = &self.recv_buf[..len];
            match get_tftp_opcode(packet) {
                Some(TftpOpcode::Acknowledgment) => match decode_ack(packet) {
                    Ok(ack) if ack.block == block => return Ok(()),
                    Ok(ack) => tracing::debug!("Ignoring ACK {} while waiting for {}", ack.block, block),
                    Err(e) => tracing::debug!("Ignoring malformed ACK from {}: {}", src, e),
                },
                Some(TftpOpcode::Error) => match decode_error(packet) {
                    Ok(err) => bail!("client aborted transfer: {}", err),
                    Err(_) => bail!("client aborted transfer"),
                },
                opcode => tracing::debug!("Ignoring unexpected {:?} packet from {}", opcode, src),
            }
        }
    }

    async fn send_best_effort(&self, packet: &[u8]) {
        if let Err(e) = self.socket.send_to(packet, self.peer).await {
            tracing::debug!("Failed to notify {} of transfer failure: {}", self.peer, e);
        }
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream
///
/// Returns the number of bytes read; anything less than `buf.len()` means
/// the stream is exhausted.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use tempfile::NamedTempFile;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::protocol::{TftpData, decode_data, encode_ack};

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn temp_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&content).unwrap();
        file.flush().unwrap();
        file
    }

    async fn start(path: &Path, config: TransferConfig) -> (UdpSocket, JoinHandle<(Result<TransferSummary>, TransferState)>) {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut transfer = Transfer::new(socket, client.local_addr().unwrap(), path, config);
        assert_eq!(transfer.state(), TransferState::OpenFile);

        let handle = tokio::spawn(async move {
            let result = transfer.run().await;
            (result, transfer.state())
        });
        (client, handle)
    }

    async fn recv_data(client: &UdpSocket) -> (TftpData, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        let (len, src) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for DATA")
            .unwrap();
        (decode_data(&buf[..len]).unwrap(), src)
    }

    /// Acknowledge every block until a short one arrives
    async fn download(client: &UdpSocket, chunk_size: usize) -> Vec<TftpData> {
        let mut blocks = Vec::new();
        loop {
            let (data, src) = recv_data(client).await;
            client.send_to(&encode_ack(data.block), src).await.unwrap();
            let last = data.is_last_block(chunk_size);
            blocks.push(data);
            if last {
                return blocks;
            }
        }
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.max_datagram_size, 1024);
        assert_eq!(config.ack_timeout, Duration::from_secs(TIMEOUT_SECS));
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert_eq!(config.ack_policy, AckPolicy::Relaxed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transfer_config_validation() {
        let invalid = [
            TransferConfig {
                chunk_size: 0,
                ..Default::default()
            },
            TransferConfig {
                chunk_size: MAX_UDP_PAYLOAD,
                ..Default::default()
            },
            TransferConfig {
                max_datagram_size: 3,
                ..Default::default()
            },
            TransferConfig {
                max_retries: 0,
                ..Default::default()
            },
            TransferConfig {
                ack_timeout: Duration::ZERO,
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[tokio::test]
    async fn test_read_chunk() {
        let data: Vec<u8> = (0..1100u32).map(|i| i as u8).collect();
        let mut reader = &data[..];
        let mut buf = vec![0u8; 512];

        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 512);
        assert_eq!(&buf[..], &data[..512]);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 512);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 76);
        assert_eq!(&buf[..76], &data[1024..]);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_block_sequencing() {
        for (len, expected_blocks) in [(0usize, 1usize), (1, 1), (511, 1), (512, 2), (513, 2), (1024, 3), (1500, 3)] {
            let file = temp_file(len);
            let (client, handle) = start(file.path(), TransferConfig::default()).await;

            let blocks = download(&client, 512).await;
            assert_eq!(blocks.len(), expected_blocks, "file of {} bytes", len);
            for (i, data) in blocks.iter().enumerate() {
                assert_eq!(data.block as usize, i + 1);
            }
            assert!(blocks.last().unwrap().data.len() < 512);

            let received: Vec<u8> = blocks.into_iter().flat_map(|b| b.data).collect();
            assert_eq!(received, std::fs::read(file.path()).unwrap());

            let (result, state) = handle.await.unwrap();
            let summary = result.unwrap();
            assert_eq!(state, TransferState::Done);
            assert_eq!(summary.blocks as usize, expected_blocks);
            assert_eq!(summary.bytes as usize, len);
        }
    }

    #[tokio::test]
    async fn test_block_number_wraps_to_zero() {
        // One byte per block: 65537 bytes need blocks 1..=65535, 0, 1 and an
        // empty block 2.
        let file = temp_file(65537);
        let config = TransferConfig {
            chunk_size: 1,
            ..Default::default()
        };
        let (client, handle) = start(file.path(), config).await;

        let blocks = download(&client, 1).await;
        assert_eq!(blocks.len(), 65538);
        assert_eq!(blocks[65533].block, 65534);
        assert_eq!(blocks[65534].block, 65535);
        assert_eq!(blocks[65535].block, 0);
        assert_eq!(blocks[65536].block, 1);
        assert_eq!(blocks[65537].block, 2);
        assert!(blocks[65537].data.is_empty());

        let (result, _) = handle.await.unwrap();
        assert_eq!(result.unwrap().last_block, 2);
    }

    #[tokio::test]
    async fn test_relaxed_accepts_any_datagram() {
        let file = temp_file(600);
        let (client, handle) = start(file.path(), TransferConfig::default()).await;

        let (first, src) = recv_data(&client).await;
        assert_eq!(first.block, 1);
        client.send_to(b"not an ack", src).await.unwrap();

        let (second, src) = recv_data(&client).await;
        assert_eq!(second.block, 2);
        assert_eq!(second.data.len(), 88);
        client.send_to(&encode_ack(999), src).await.unwrap();

        let (result, state) = handle.await.unwrap();
        assert_eq!(result.unwrap().blocks, 2);
        assert_eq!(state, TransferState::Done);
    }

    #[tokio::test]
    async fn test_strict_ignores_stale_ack() {
        let file = temp_file(600);
        let config = TransferConfig {
            ack_policy: AckPolicy::Strict,
            ..Default::default()
        };
        let (client, handle) = start(file.path(), config).await;

        let (first, src) = recv_data(&client).await;
        assert_eq!(first.block, 1);

        // Wrong block number: the transfer must not advance
        client.send_to(&encode_ack(0), src).await.unwrap();
        let mut buf = [0u8; 1024];
        assert!(
            timeout(Duration::from_millis(200), client.recv_from(&mut buf))
                .await
                .is_err()
        );

        client.send_to(&encode_ack(1), src).await.unwrap();
        let (second, src) = recv_data(&client).await;
        assert_eq!(second.block, 2);
        client.send_to(&encode_ack(2), src).await.unwrap();

        let (result, state) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, TransferState::Done);
    }

    #[tokio::test]
    async fn test_strict_rejects_foreign_source() {
        let file = temp_file(10);
        let config = TransferConfig {
            ack_policy: AckPolicy::Strict,
            ..Default::default()
        };
        let (client, handle) = start(file.path(), config).await;
        let (_, src) = recv_data(&client).await;

        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        intruder.send_to(&encode_ack(1), src).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = timeout(RECV_TIMEOUT, intruder.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, src);
        let err = decode_error(&buf[..len]).unwrap();
        assert_eq!(err.code, TftpErrorCode::UnknownTransferId.as_u16());

        // The real client is still being served
        client.send_to(&encode_ack(1), src).await.unwrap();
        let (result, _) = handle.await.unwrap();
        assert_eq!(result.unwrap().bytes, 10);
    }

    #[tokio::test]
    async fn test_strict_aborts_on_client_error() {
        let file = temp_file(2000);
        let config = TransferConfig {
            ack_policy: AckPolicy::Strict,
            ..Default::default()
        };
        let (client, handle) = start(file.path(), config).await;
        let (_, src) = recv_data(&client).await;

        client.send_to(&encode_error(TftpErrorCode::DiskFull), src).await.unwrap();

        let (result, state) = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(state, TransferState::ErrorTerminated);
    }

    #[tokio::test]
    async fn test_retransmits_then_gives_up() {
        let file = temp_file(100);
        let config = TransferConfig {
            ack_timeout: Duration::from_millis(50),
            max_retries: 3,
            ..Default::default()
        };
        let (client, handle) = start(file.path(), config).await;

        for _ in 0..3 {
            let (data, _) = recv_data(&client).await;
            assert_eq!(data.block, 1);
            assert_eq!(data.data.len(), 100);
        }

        let (result, state) = handle.await.unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("no ACK received for block 1"));
        assert_eq!(state, TransferState::ErrorTerminated);
    }

    #[tokio::test]
    async fn test_missing_file_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (_client, handle) = start(&dir.path().join("gone.bin"), TransferConfig::default()).await;

        let (result, state) = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(state, TransferState::ErrorTerminated);
    }

    #[tokio::test]
    async fn test_finished_transfer_cannot_rerun() {
        let file = temp_file(0);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut transfer = Transfer::new(socket, client.local_addr().unwrap(), file.path(), TransferConfig::default());

        let client_task = tokio::spawn(async move { download(&client, 512).await.len() });
        transfer.run().await.unwrap();
        assert_eq!(client_task.await.unwrap(), 1);

        assert_eq!(transfer.state(), TransferState::Done);
        assert!(transfer.run().await.is_err());
    }
}
