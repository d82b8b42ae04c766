//! TFTP packet codec and a thin packet-level wrapper around a UDP socket.
//!
//! All five RFC 1350 packet types encode to a fixed big-endian layout: a
//! 2-byte opcode followed by opcode-specific fields. Text fields are
//! NUL-terminated; block numbers and error codes are 2-byte unsigned.

use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Maximum number of data bytes carried by one Data packet. A payload
/// shorter than this marks the final block of a transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Cap on filename, mode, and error message text. The RFC sets no bound,
/// so this keeps receive buffers finite.
pub const MAX_TEXT_LEN: usize = 255;

// Large enough to hold the biggest valid packet (4 + 512 bytes) with room
// to detect oversized data payloads instead of silently truncating them.
const RECV_BUFFER_SIZE: usize = 1024;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// A malformed datagram, identifying the offending field. Decoding never
/// produces a partial packet.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    TooShort(usize),
    UnknownOpcode(u16),
    Unterminated(&'static str),
    TextTooLong(&'static str),
    UnknownMode(String),
    PayloadTooLarge(usize),
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::TooShort(len) => write!(f, "packet of {len} bytes is too short"),
            DecodeError::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            DecodeError::Unterminated(field) => {
                write!(f, "{field} is not NUL-terminated within the packet")
            }
            DecodeError::TextTooLong(field) => {
                write!(f, "{field} exceeds {MAX_TEXT_LEN} bytes")
            }
            DecodeError::UnknownMode(mode) => write!(f, "unknown transfer mode '{mode}'"),
            DecodeError::PayloadTooLarge(len) => {
                write!(f, "data payload of {len} bytes exceeds {DATA_BUFFER_SIZE}")
            }
        }
    }
}

/// Represents an error returned from the TFTP socket wrapper.
#[derive(Debug)]
pub enum SocketError {
    Io(io::Error),
    /// A datagram arrived but could not be decoded. The source address is
    /// kept so the caller can answer with an error packet.
    Decode {
        source: SocketAddr,
        error: DecodeError,
    },
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "socket IO error: {e}"),
            SocketError::Decode { source, error } => {
                write!(f, "malformed packet from {source}: {error}")
            }
            SocketError::Timeout(e) => write!(f, "socket receive timed out: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::Io(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Transfer mode requested by a client. Only octet (raw bytes) behavior is
/// implemented; netascii requests are accepted but served as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Octet,
    Netascii,
}

impl FileMode {
    fn as_str(self) -> &'static str {
        match self {
            FileMode::Octet => "octet",
            FileMode::Netascii => "netascii",
        }
    }
}

/// The RFC 1350 error codes carried by Error packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::WriteZero => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet.
    ReadReq {
        /// The file path the client wants to read.
        path: String,
        mode: FileMode,
    },

    /// A write request packet.
    WriteReq { path: String, mode: FileMode },

    /// A data packet.
    Data {
        /// The block number for this data packet, starting at 1 and
        /// wrapping mod 65536.
        block: u16,
        /// 0 to 512 bytes of file content.
        data: Vec<u8>,
    },

    /// An acknowledgment packet.
    Ack { block: u16 },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads a NUL-terminated text field starting at the beginning of the
/// buffer. Returns the text and the offset just past the terminator.
fn take_text(buf: &[u8], field: &'static str) -> Result<(String, usize), DecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == 0x00)
        .ok_or(DecodeError::Unterminated(field))?;
    if end > MAX_TEXT_LEN {
        return Err(DecodeError::TextTooLong(field));
    }
    let text = buf[..end].iter().map(|&b| char::from(b)).collect();
    Ok((text, end + 1))
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), DecodeError> {
    let (path, path_end) = take_text(buf, "filename")?;
    let (raw_mode, _) = take_text(&buf[path_end..], "transfer mode")?;

    let mode = match raw_mode.to_lowercase().as_str() {
        "octet" => FileMode::Octet,
        "netascii" => FileMode::Netascii,
        _ => return Err(DecodeError::UnknownMode(raw_mode)),
    };

    Ok((path, mode))
}

fn parse_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort(buf.len()));
    }
    let data = &buf[4..];
    if data.len() > DATA_BUFFER_SIZE {
        return Err(DecodeError::PayloadTooLarge(data.len()));
    }
    Ok(Packet::Data {
        block: u16_from_buffer(&buf[2..4]),
        data: Vec::from(data),
    })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort(buf.len()));
    }
    Ok(Packet::Ack {
        block: u16_from_buffer(&buf[2..4]),
    })
}

fn parse_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort(buf.len()));
    }
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, _) = take_text(&buf[4..], "error message")?;
    Ok(Packet::Error { code, message })
}

fn put_text(buf: &mut Vec<u8>, text: &str) {
    buf.extend(text.bytes());
    buf.push(0x00);
}

impl Packet {
    /// Decodes a datagram. Any violation of the wire format is reported as
    /// a [`DecodeError`] naming the malformed field.
    pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort(buf.len()));
        }

        match u16_from_buffer(&buf[..2]) {
            1 => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            2 => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            3 => parse_data(buf),
            4 => parse_ack(buf),
            5 => parse_error(buf),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }

    /// Serializes the packet to its wire layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => {
                let mut buf = vec![0x00, 0x01];
                put_text(&mut buf, path);
                put_text(&mut buf, mode.as_str());
                buf
            }
            Packet::WriteReq { path, mode } => {
                let mut buf = vec![0x00, 0x02];
                put_text(&mut buf, path);
                put_text(&mut buf, mode.as_str());
                buf
            }
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend([0x00, 0x03]);
                buf.extend(block.to_be_bytes());
                buf.extend(data);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = vec![0x00, 0x04];
                buf.extend(block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = vec![0x00, 0x05];
                buf.extend(code.as_u16().to_be_bytes());
                put_text(&mut buf, message);
                buf
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that encodes outgoing packets and decodes
/// incoming datagrams into [`Packet`] values.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }

    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        match Packet::decode(&buf[..total_written]) {
            Ok(packet) => Ok((packet, src)),
            Err(error) => Err(SocketError::Decode { source: src, error }),
        }
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}

/// Binds a socket to a randomly chosen ephemeral port. RFC 1350 asks each
/// end of a transfer to pick its TID at random, and the data phase must
/// never reuse the well-known request port.
pub fn bind_ephemeral() -> TftpResult<TftpSocket> {
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..16 {
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind ephemeral socket: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one bind attempt was made"))
}
