//! TFTP Server Implementation
//!
//! This module contains the request dispatcher: it owns the well-known
//! listening socket, decodes incoming requests, and hands each one to a
//! worker that replies from its own ephemeral port.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::fs;
use tokio::net::UdpSocket;

use crate::ports::{PortAllocator, PortExhausted, PortRange};
use crate::protocol::{HEADER_LEN, TftpErrorCode, TftpRequest, decode_read_request, encode_error};
use crate::registry::{WorkerKind, WorkerRegistry};
use crate::transfer::{DEFAULT_MAX_DATAGRAM_SIZE, Transfer, TransferConfig};

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub listen_address: Ipv4Addr,
    pub listen_port: u16,
    /// Requested filenames are resolved against this directory
    pub root_directory: PathBuf,
    /// Receive buffer size of the listening socket
    pub max_datagram_size: usize,
    /// Ports that replies and transfers are sent from
    pub ephemeral_ports: PortRange,
    pub transfer: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            listen_address: Ipv4Addr::UNSPECIFIED,
            listen_port: DEFAULT_PORT,
            root_directory: PathBuf::from("."),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            ephemeral_ports: PortRange::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl TftpServerConfig {
    pub fn bind_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.listen_address, self.listen_port)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_datagram_size >= HEADER_LEN,
            "max datagram size {} is smaller than a TFTP header",
            self.max_datagram_size
        );
        ensure!(
            !self.ephemeral_ports.is_empty(),
            "ephemeral port range {} is empty",
            self.ephemeral_ports
        );
        self.transfer.validate().context("invalid transfer configuration")
    }
}

/// Result of resolving a requested filename against the served root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// An existing regular file inside the root
    File(PathBuf),
    /// Missing, or not a regular file
    NotFound,
    /// Resolves to a path outside the root
    OutsideRoot,
}

/// Resolve `filename` inside the canonical directory `root`
///
/// Canonicalisation follows `..` components and symlinks, so anything that
/// ends up outside `root` is reported as [`Resolution::OutsideRoot`].
pub async fn resolve_request_path(root: &Path, filename: &str) -> Resolution {
    let path = match fs::canonicalize(root.join(filename)).await {
        Ok(path) => path,
        Err(_) => return Resolution::NotFound,
    };

    if !path.starts_with(root) {
        return Resolution::OutsideRoot;
    }

    match fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Resolution::File(path),
        _ => Resolution::NotFound,
    }
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    socket: Option<UdpSocket>,
    root: PathBuf,
    ports: Arc<PortAllocator>,
    workers: WorkerRegistry,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        let ports = Arc::new(PortAllocator::new(config.ephemeral_ports));
        let root = config.root_directory.clone();
        Self {
            config,
            socket: None,
            root,
            ports,
            workers: WorkerRegistry::new(),
        }
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Registry of the transfers and error replies currently running
    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Validate the configuration and bind the listening socket
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        self.config.validate()?;

        self.root = fs::canonicalize(&self.config.root_directory)
            .await
            .with_context(|| format!("Root directory {} is not accessible", self.config.root_directory.display()))?;

        let socket = create_listen_socket(self.config.bind_address())?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            local_addr,
            self.root.display()
        );
        tracing::debug!(
            "{} reply port(s) available in {}",
            self.ports.remaining(),
            self.config.ephemeral_ports
        );

        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Bind if necessary, then serve requests until a fatal error
    ///
    /// Bad requests never end the loop. Only running out of ephemeral ports
    /// does.
    pub async fn run(&mut self) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        self.serve().await
    }

    /// Main server loop
    async fn serve(&self) -> Result<()> {
        let socket = self.socket.as_ref().context("Server must be bound before serving")?;
        let mut buffer = vec![0u8; self.config.max_datagram_size];

        loop {
            let (len, client) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("Error receiving TFTP packet: {}", e);
                    continue;
                }
            };
            tracing::debug!("Received {} bytes from {}", len, client);

            self.dispatch(&buffer[..len], client).await?;
        }
    }

    /// Handle one datagram from the listening socket
    async fn dispatch(&self, packet: &[u8], client: SocketAddr) -> Result<()> {
        let request = match decode_read_request(packet) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed packet from {}: {}", client, e);
                return self.reply_error(client, TftpErrorCode::IllegalOperation).await;
            }
        };

        if !request.is_read() {
            tracing::warn!("Rejecting {} for '{}' from {}", request.opcode, request.filename, client);
            return self.reply_error(client, TftpErrorCode::UnknownTransferId).await;
        }

        tracing::info!(
            "RRQ for '{}' in {} mode from {}",
            request.filename,
            request.mode,
            client
        );
        if request.transfer_mode().is_none() {
            tracing::debug!("Unknown transfer mode '{}', sending file bytes unchanged", request.mode);
        }

        let code = match resolve_request_path(&self.root, &request.filename).await {
            Resolution::File(path) => return self.start_transfer(request, path, client).await,
            Resolution::NotFound => TftpErrorCode::FileNotFound,
            Resolution::OutsideRoot => TftpErrorCode::AccessViolation,
        };

        tracing::warn!("Rejecting '{}' from {}: {}", request.filename, client, code);
        self.reply_error(client, code).await
    }

    /// Bind a fresh socket on the next ephemeral port
    ///
    /// Ports already taken by other programs are skipped; they stay consumed.
    async fn bind_reply_socket(&self) -> Result<UdpSocket> {
        loop {
            let port = self.ports.allocate()?;
            let addr = SocketAddrV4::new(self.config.listen_address, port);
            match UdpSocket::bind(addr).await {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    tracing::debug!("Ephemeral port {} in use, skipping", port);
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to bind reply socket to {}", addr)),
            }
        }
    }

    /// Bind a reply socket, separating fatal exhaustion from per-request failures
    async fn reply_socket(&self, client: SocketAddr) -> Result<Option<(UdpSocket, u16)>> {
        match self.bind_reply_socket().await {
            Ok(socket) => {
                let port = socket.local_addr().context("reply socket has no local address")?.port();
                Ok(Some((socket, port)))
            }
            Err(e) if e.is::<PortExhausted>() => {
                tracing::error!("Cannot answer {}: {}", client, e);
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Cannot answer {}: {:#}", client, e);
                Ok(None)
            }
        }
    }

    async fn reply_error(&self, client: SocketAddr, code: TftpErrorCode) -> Result<()> {
        let Some((socket, port)) = self.reply_socket(client).await? else {
            return Ok(());
        };

        self.workers
            .spawn(WorkerKind::ErrorReply { code }, client, port, async move {
                socket
                    .send_to(&encode_error(code), client)
                    .await
                    .with_context(|| format!("Failed to send error {} to {}", code.as_u16(), client))?;
                Ok(())
            });
        Ok(())
    }

    async fn start_transfer(&self, request: TftpRequest, path: PathBuf, client: SocketAddr) -> Result<()> {
        let Some((socket, port)) = self.reply_socket(client).await? else {
            return Ok(());
        };

        tracing::info!("Serve {}:'{}' -> {}", client, request.filename, port);

        let mut transfer = Transfer::new(socket, client, path, self.config.transfer.clone());
        let filename = request.filename;
        let kind = WorkerKind::Transfer {
            filename: filename.clone(),
        };
        self.workers.spawn(kind, client, port, async move {
            let summary = transfer.run().await?;
            tracing::info!(
                "Done! {}:'{}' -> {} ({} bytes in {} blocks)",
                client,
                filename,
                port,
                summary.bytes,
                summary.blocks
            );
            Ok(())
        });
        Ok(())
    }
}

/// Build the listening socket the way the protocol expects: address reuse and
/// broadcast enabled, non-blocking for tokio
fn create_listen_socket(addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("Failed to create socket")?;

    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR on TFTP socket")?;
    socket
        .set_broadcast(true)
        .context("Failed to enable broadcast on TFTP socket")?;
    socket
        .set_nonblocking(true)
        .context("Failed to set TFTP socket to non-blocking mode")?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .with_context(|| format!("Failed to bind TFTP server socket to {}", addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("Failed to convert to Tokio socket")
}
