//! TFTP Protocol Implementation
//!
//! This module contains the wire codec for the TFTP packets this server
//! speaks: read requests, data blocks, acknowledgments and errors. It is
//! pure and stateless; nothing here touches a socket or a file.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350. Every packet
//! starts with a 2-byte opcode, and every numeric field is big-endian
//! (network byte order):
//!
//! ```text
//! RRQ    | 01 | filename | 0 | mode | 0 |
//! DATA   | 03 | block#   | payload (0..512 bytes) |
//! ACK    | 04 | block#   |
//! ERROR  | 05 | code     | message | 0 |
//! ```
//!
//! A DATA payload shorter than the block size marks the end of a transfer;
//! there is no separate end-of-file marker on the wire.

use std::fmt;

use thiserror::Error;

/// Default TFTP block size (512 bytes) as fixed by RFC 1350
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Length of the opcode + block number header of DATA and ACK packets
pub const HEADER_LEN: usize = 4;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
/// Each opcode corresponds to a specific packet format as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Recognised on the wire but never served.
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Defined by RFC 2347. Recognised on the wire but never sent, since this
    /// server does not negotiate options.
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(9), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::ReadRequest.name(), "RRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// The fixed error table of RFC 1350. Because the table is a closed enum, an
/// ERROR packet can only ever be built for a code that has a canonical
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see error message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Also sent for requests whose path resolves outside the served root.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    ///
    /// Sent in reply to packets that cannot be decoded.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    ///
    /// Sent in reply to well-formed packets that are not read requests, and
    /// to datagrams arriving at a transfer port from a foreign address.
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(1), Some(TftpErrorCode::FileNotFound));
    /// assert_eq!(TftpErrorCode::from_u16(8), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the canonical message for this error code
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::FileNotFound.default_message(), "File not found");
    /// assert_eq!(TftpErrorCode::IllegalOperation.default_message(), "Illegal TFTP operation");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined, see error message (if any)",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// The server always sends file bytes unchanged; the mode is parsed so it can
/// be reported, not to alter the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, mode string "octet"
    Octet,
    /// Text mode, mode string "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string, ignoring case
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("OCTET"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structural decode failures
///
/// Every variant is a malformed packet: the dispatcher answers all of them
/// with [`TftpErrorCode::IllegalOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("{0} is not NUL-terminated")]
    Unterminated(&'static str),
    #[error("{0} is not ASCII")]
    NotAscii(&'static str),
    #[error("expected {expected} packet, got {found}")]
    UnexpectedOpcode { expected: TftpOpcode, found: TftpOpcode },
    #[error("{kind} packet has invalid length {len}")]
    InvalidLength { kind: TftpOpcode, len: usize },
}

/// A decoded request packet
///
/// Produced by [`decode_read_request`]. The opcode is whatever known opcode
/// the sender used; only [`TftpOpcode::ReadRequest`] is ever served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    /// The request opcode
    pub opcode: TftpOpcode,
    /// Requested filename
    pub filename: String,
    /// Raw mode string, conventionally "octet" or "netascii"
    pub mode: String,
}

impl TftpRequest {
    /// Whether this request asks to read a file
    pub fn is_read(&self) -> bool {
        self.opcode == TftpOpcode::ReadRequest
    }

    /// The parsed transfer mode, if the mode string is a known one
    pub fn transfer_mode(&self) -> Option<TransferMode> {
        TransferMode::from_str_opt(&self.mode)
    }
}

/// TFTP Data packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpData {
    /// Block number, 1 for the first block, wrapping modulo 65536
    pub block: u16,
    /// Data payload
    pub data: Vec<u8>,
}

impl TftpData {
    /// Check if this is the last block of a transfer
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpData;
    ///
    /// let short = TftpData { block: 1, data: vec![0; 100] };
    /// let full = TftpData { block: 1, data: vec![0; 512] };
    ///
    /// assert!(short.is_last_block(512));
    /// assert!(!full.is_last_block(512));
    /// ```
    pub fn is_last_block(&self, block_size: usize) -> bool {
        self.data.len() < block_size
    }
}

/// TFTP ACK packet representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftpAck {
    /// Block number being acknowledged
    pub block: u16,
}

/// TFTP Error packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    /// Raw error code; peers may send codes outside the RFC table
    pub code: u16,
    /// Human-readable error message
    pub message: String,
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Get the opcode from a TFTP packet
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

/// Get the TFTP opcode enum from a packet buffer
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}

fn expect_opcode(buf: &[u8], expected: TftpOpcode) -> Result<(), PacketError> {
    let raw = get_opcode(buf).ok_or(PacketError::TooShort(buf.len()))?;
    let found = TftpOpcode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;
    if found != expected {
        return Err(PacketError::UnexpectedOpcode { expected, found });
    }
    Ok(())
}

fn ascii_field(bytes: &[u8], field: &'static str) -> Result<String, PacketError> {
    if !bytes.is_ascii() {
        return Err(PacketError::NotAscii(field));
    }
    // ASCII is always valid UTF-8
    Ok(bytes.iter().map(|&b| b as char).collect())
}

/// Decode a request packet (RRQ layout)
///
/// The filename and mode are variable length, so the decoder scans for NUL
/// delimiters: the first NUL at or after byte 2 ends the filename, the next
/// one ends the mode. Bytes after the mode terminator (RFC 2347 options) are
/// ignored.
///
/// Any known opcode is accepted; the caller decides what to do with requests
/// that are not reads.
///
/// # Examples
/// ```
/// use tftp::{TftpOpcode, decode_read_request};
///
/// let request = decode_read_request(b"\x00\x01boot.img\x00octet\x00").unwrap();
/// assert_eq!(request.opcode, TftpOpcode::ReadRequest);
/// assert_eq!(request.filename, "boot.img");
/// assert_eq!(request.mode, "octet");
///
/// assert!(decode_read_request(b"\x00\x09boot.img\x00octet\x00").is_err());
/// ```
pub fn decode_read_request(buf: &[u8]) -> Result<TftpRequest, PacketError> {
    let raw = get_opcode(buf).ok_or(PacketError::TooShort(buf.len()))?;
    let opcode = TftpOpcode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;

    let name_end = find_zero(buf, 2).ok_or(PacketError::Unterminated("filename"))?;
    let mode_end = find_zero(buf, name_end + 1).ok_or(PacketError::Unterminated("mode"))?;

    Ok(TftpRequest {
        opcode,
        filename: ascii_field(&buf[2..name_end], "filename")?,
        mode: ascii_field(&buf[name_end + 1..mode_end], "mode")?,
    })
}

/// Build a TFTP Read Request packet
pub fn encode_read_request(filename: &str, mode: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + filename.len() + mode.len() + 2);
    v.extend_from_slice(&TftpOpcode::ReadRequest.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_bytes());
    v.push(0);
    v
}

/// Build a TFTP Data packet
pub fn encode_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_LEN + data.len());
    v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// Parse a TFTP Data packet
pub fn decode_data(buf: &[u8]) -> Result<TftpData, PacketError> {
    expect_opcode(buf, TftpOpcode::Data)?;
    if buf.len() < HEADER_LEN {
        return Err(PacketError::InvalidLength {
            kind: TftpOpcode::Data,
            len: buf.len(),
        });
    }

    Ok(TftpData {
        block: u16::from_be_bytes([buf[2], buf[3]]),
        data: buf[HEADER_LEN..].to_vec(),
    })
}

/// Build a TFTP ACK packet
pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_LEN);
    v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Parse a TFTP ACK packet
///
/// An ACK is exactly four bytes; anything longer or shorter is malformed.
///
/// # Examples
/// ```
/// use tftp::{TftpErrorCode, decode_ack, encode_ack, encode_error};
///
/// assert_eq!(decode_ack(&encode_ack(7)).unwrap().block, 7);
/// assert!(decode_ack(&encode_error(TftpErrorCode::FileNotFound)).is_err());
/// ```
pub fn decode_ack(buf: &[u8]) -> Result<TftpAck, PacketError> {
    if buf.len() != HEADER_LEN {
        return Err(PacketError::InvalidLength {
            kind: TftpOpcode::Acknowledgment,
            len: buf.len(),
        });
    }
    expect_opcode(buf, TftpOpcode::Acknowledgment)?;

    Ok(TftpAck {
        block: u16::from_be_bytes([buf[2], buf[3]]),
    })
}

/// Build a TFTP Error packet carrying the canonical message for `code`
pub fn encode_error(code: TftpErrorCode) -> Vec<u8> {
    let msg = code.default_message();
    let mut v = Vec::with_capacity(HEADER_LEN + msg.len() + 1);
    v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.as_u16().to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}

/// Parse a TFTP Error packet
///
/// A missing terminator is tolerated; the message then runs to the end of
/// the datagram.
pub fn decode_error(buf: &[u8]) -> Result<TftpError, PacketError> {
    expect_opcode(buf, TftpOpcode::Error)?;
    if buf.len() < HEADER_LEN {
        return Err(PacketError::InvalidLength {
            kind: TftpOpcode::Error,
            len: buf.len(),
        });
    }

    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[HEADER_LEN..];
    let end = msg_bytes.iter().position(|&b| b == 0).unwrap_or(msg_bytes.len());
    let message = String::from_utf8_lossy(&msg_bytes[..end]).into_owned();

    Ok(TftpError { code, message })
}
