//! TFTP (Trivial File Transfer Protocol) Server Engine
//!
//! A read-only RFC 1350 server:
//! - Read requests (RRQ) served in lockstep, one 512-byte block in flight
//! - Block numbers starting at 1 and wrapping modulo 65536
//! - One ephemeral port per transfer and per error reply
//! - ACK timeout with bounded retransmission
//! - Relaxed or strict acknowledgment checking
//! - Path traversal protection
//! - Concurrent transfers tracked in a worker registry
//!
//! Write requests and option negotiation (RFC 2347-2349) are not supported.
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//!
//! use tftp::{TftpServer, TftpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = TftpServer::new(TftpServerConfig {
//!         listen_port: 6969,
//!         root_directory: PathBuf::from("/srv/tftp"),
//!         ..Default::default()
//!     });
//!     let addr = server.bind().await?;
//!     println!("listening on {addr}");
//!
//!     // Keep a handle on the running workers before serving
//!     let workers = server.workers().clone();
//!     let handle = tokio::spawn(async move { server.run().await });
//!     println!("{} active worker(s)", workers.len());
//!     handle.await??;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Working with Packets
//!
//! ```rust
//! use tftp::{TftpErrorCode, TftpOpcode, decode_ack, decode_data, encode_ack, encode_data, encode_error};
//!
//! let packet = encode_data(1, b"hello");
//! assert_eq!(&packet[..4], &[0x00, 0x03, 0x00, 0x01]);
//! assert_eq!(decode_data(&packet).unwrap().data, b"hello");
//!
//! assert_eq!(decode_ack(&encode_ack(1)).unwrap().block, 1);
//! assert!(decode_ack(&encode_error(TftpErrorCode::FileNotFound)).is_err());
//! assert_eq!(TftpOpcode::Data.as_u16(), 3);
//! ```

mod ports;
mod protocol;
mod registry;
mod server;
mod transfer;

pub use ports::*;
pub use protocol::*;
pub use registry::*;
pub use server::*;
pub use transfer::*;
