//! tftpd - Main executable
//!
//! A minimal read-only TFTP server.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{
    AckPolicy, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_PORT, PortRange, TftpServer, TftpServerConfig,
    TransferConfig, WorkerRegistry,
};

const DEFAULT_ROOT: &str = ".";

#[derive(FromArgs, Debug)]
#[argh(
    description = "tftpd - minimal read-only TFTP (RFC 1350) server",
    example = "Serve the current directory on the standard port:\n  {command_name}",
    example = "Serve /srv/tftp on an unprivileged port:\n  {command_name} --port 6969 --root /srv/tftp",
    example = "Check ACK block numbers and give up faster on silent clients:\n  {command_name} --strict-ack --timeout 1 --retries 4"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'a',
        description = "address to listen on",
        default = "Ipv4Addr::UNSPECIFIED"
    )]
    address: Ipv4Addr,

    #[argh(option, short = 'p', description = "port to listen on", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(
        option,
        short = 'r',
        description = "directory to serve files from",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    //
    // Transfer tuning
    //
    #[argh(
        option,
        description = "bytes of file data per DATA packet",
        default = "DEFAULT_BLOCK_SIZE"
    )]
    chunk_size: usize,

    #[argh(
        option,
        description = "receive buffer size for incoming datagrams",
        default = "DEFAULT_MAX_DATAGRAM_SIZE"
    )]
    max_datagram: usize,

    #[argh(option, short = 't', description = "seconds to wait for an ACK", default = "3")]
    timeout: u64,

    #[argh(option, description = "sends per block before giving up", default = "8")]
    retries: usize,

    #[argh(switch, description = "only advance on an ACK for the block just sent")]
    strict_ack: bool,

    //
    // Ephemeral ports
    //
    #[argh(option, description = "first port used for replies", default = "PortRange::EPHEMERAL.start")]
    port_start: u16,

    #[argh(option, description = "end of the reply port range (exclusive)", default = "PortRange::EPHEMERAL.end")]
    port_end: u16,

    //
    // Worker reporting
    //
    #[argh(
        option,
        description = "seconds between active worker reports, 0 disables",
        default = "60"
    )]
    report_interval: u64,

    #[argh(
        option,
        description = "seconds after which a worker is reported as stalled",
        default = "300"
    )]
    stall_after: u64,
}

impl CliConfig {
    fn into_server_config(self) -> Result<TftpServerConfig> {
        let ack_policy = if self.strict_ack {
            AckPolicy::Strict
        } else {
            AckPolicy::Relaxed
        };

        let config = TftpServerConfig {
            listen_address: self.address,
            listen_port: self.port,
            root_directory: self.root,
            max_datagram_size: self.max_datagram,
            ephemeral_ports: PortRange::new(self.port_start, self.port_end),
            transfer: TransferConfig {
                chunk_size: self.chunk_size,
                max_datagram_size: self.max_datagram,
                ack_timeout: Duration::from_secs(self.timeout),
                max_retries: self.retries,
                ack_policy,
            },
        };

        config.validate().context("Invalid server configuration")?;
        Ok(config)
    }
}

/// Periodically log how many workers are alive and which ones look stuck
async fn report_workers(workers: WorkerRegistry, every: Duration, stall_after: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let active = workers.len();
        if active > 0 {
            tracing::info!("{} active worker(s)", active);
        }
        for worker in workers.stalled(stall_after) {
            tracing::warn!(
                "Worker {} ({}) for {} on port {} running for {:?}",
                worker.id,
                worker.kind,
                worker.peer,
                worker.local_port,
                worker.age()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_config: CliConfig = argh::from_env();
    let report_interval = cli_config.report_interval;
    let stall_after = Duration::from_secs(cli_config.stall_after);
    let mut server = TftpServer::new(cli_config.into_server_config()?);

    let config = server.config();
    tracing::info!(
        "Starting TFTP server on {} (chunk size {}, ACK timeout {:?} x {}, {} ACK checking, reply ports {})",
        config.bind_address(),
        config.transfer.chunk_size,
        config.transfer.ack_timeout,
        config.transfer.max_retries,
        config.transfer.ack_policy,
        config.ephemeral_ports
    );

    server.bind().await?;

    if report_interval > 0 {
        tokio::spawn(report_workers(
            server.workers().clone(),
            Duration::from_secs(report_interval),
            stall_after,
        ));
    }

    let workers = server.workers().clone();
    tokio::select! {
        res = server.run() => {
            if let Err(e) = &res {
                tracing::error!("TFTP server failed: {:#}", e);
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down with {} worker(s) still active", workers.len());
            Ok(())
        }
    }
}
