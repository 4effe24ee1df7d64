//! Wire codec for the six TFTP packet types (RFC 1350) plus the option
//! lists introduced by RFC 2347, and the netascii transfer-mode transform.
//!
//! `decode`/`encode` are pure functions over [`Packet`]; nothing here touches
//! sockets, files, or session state.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 255;
pub const MIN_WINDOW_SIZE: usize = 1;
pub const MAX_WINDOW_SIZE: usize = 65535;

/// TFTP opcodes, RFC 1350 plus the RFC 2347 OACK extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }
}

/// TFTP error codes, RFC 1350 section 5 plus RFC 2347's addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

/// Transfer mode named in an RRQ/WRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
    Mail,
}

impl TransferMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            other => Err(TftpError::MalformedPacket(format!(
                "unknown transfer mode: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

/// An ordered (name, value) option list, as carried by RRQ/WRQ/OACK.
pub type Options = Vec<(String, String)>;

/// One decoded TFTP packet. Opcode is implicit in the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Options,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Options,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: Options,
    },
}

/// Split a byte string into NUL-terminated ASCII strings; the entire
/// input must be consumed exactly (no bytes after the final NUL).
fn split_cstrs(mut body: &[u8]) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    while !body.is_empty() {
        let nul_at = body
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| TftpError::MalformedPacket("unterminated string".into()))?;
        let raw = &body[..nul_at];
        if !raw.is_ascii() {
            return Err(TftpError::MalformedPacket("non-ASCII string".into()));
        }
        strings.push(String::from_utf8_lossy(raw).into_owned());
        body = &body[nul_at + 1..];
    }
    Ok(strings)
}

fn pair_up(strings: Vec<String>) -> Options {
    let mut options = Vec::with_capacity(strings.len() / 2);
    let mut it = strings.into_iter();
    while let (Some(name), Some(value)) = (it.next(), it.next()) {
        options.push((name, value));
    }
    options
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut BytesMut, options: &Options) {
    for (name, value) in options {
        put_cstr(buf, name);
        put_cstr(buf, value);
    }
}

/// Decode a raw UDP datagram into a [`Packet`].
pub fn decode(datagram: &[u8]) -> Result<Packet> {
    if datagram.len() < 2 {
        return Err(TftpError::MalformedPacket(
            "datagram shorter than an opcode".into(),
        ));
    }
    let opcode_value = u16::from_be_bytes([datagram[0], datagram[1]]);
    let opcode = Opcode::from_u16(opcode_value)
        .ok_or_else(|| TftpError::MalformedPacket(format!("unknown opcode {opcode_value}")))?;
    let body = &datagram[2..];

    match opcode {
        Opcode::Rrq | Opcode::Wrq => {
            let strings = split_cstrs(body)?;
            if strings.len() < 2 || strings.len() % 2 != 0 {
                return Err(TftpError::MalformedPacket(format!(
                    "request needs an even number of strings >= 2, got {}",
                    strings.len()
                )));
            }
            let mut it = strings.into_iter();
            let filename = it.next().unwrap();
            let mode = it.next().unwrap();
            let options = pair_up(it.collect());
            if opcode == Opcode::Rrq {
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    options,
                })
            } else {
                Ok(Packet::Wrq {
                    filename,
                    mode,
                    options,
                })
            }
        }
        Opcode::Data => {
            if body.len() < 2 {
                return Err(TftpError::MalformedPacket("DATA missing block number".into()));
            }
            let block = u16::from_be_bytes([body[0], body[1]]);
            let payload = Bytes::copy_from_slice(&body[2..]);
            Ok(Packet::Data { block, payload })
        }
        Opcode::Ack => {
            if body.len() != 2 {
                return Err(TftpError::MalformedPacket(format!(
                    "ACK must be exactly 2 bytes, got {}",
                    body.len()
                )));
            }
            let block = u16::from_be_bytes([body[0], body[1]]);
            Ok(Packet::Ack { block })
        }
        Opcode::Error => {
            if body.len() < 2 {
                return Err(TftpError::MalformedPacket("ERROR missing code".into()));
            }
            let code = u16::from_be_bytes([body[0], body[1]]);
            let strings = split_cstrs(&body[2..])?;
            if strings.len() != 1 {
                return Err(TftpError::MalformedPacket(
                    "ERROR must carry exactly one message string".into(),
                ));
            }
            Ok(Packet::Error {
                code,
                message: strings.into_iter().next().unwrap(),
            })
        }
        Opcode::Oack => {
            let strings = split_cstrs(body)?;
            if strings.len() % 2 != 0 {
                return Err(TftpError::MalformedPacket(
                    "OACK needs an even number of strings".into(),
                ));
            }
            Ok(Packet::Oack {
                options: pair_up(strings),
            })
        }
    }
}

/// Encode a [`Packet`] back into wire bytes. Inverse of [`decode`] for
/// well-formed packets.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE.min(4096));
    match packet {
        Packet::Rrq {
            filename,
            mode,
            options,
        } => {
            buf.put_u16(Opcode::Rrq as u16);
            put_cstr(&mut buf, filename);
            put_cstr(&mut buf, mode);
            put_options(&mut buf, options);
        }
        Packet::Wrq {
            filename,
            mode,
            options,
        } => {
            buf.put_u16(Opcode::Wrq as u16);
            put_cstr(&mut buf, filename);
            put_cstr(&mut buf, mode);
            put_options(&mut buf, options);
        }
        Packet::Data { block, payload } => {
            buf.put_u16(Opcode::Data as u16);
            buf.put_u16(*block);
            buf.put_slice(payload);
        }
        Packet::Ack { block } => {
            buf.put_u16(Opcode::Ack as u16);
            buf.put_u16(*block);
        }
        Packet::Error { code, message } => {
            buf.put_u16(Opcode::Error as u16);
            buf.put_u16(*code);
            put_cstr(&mut buf, message);
        }
        Packet::Oack { options } => {
            buf.put_u16(Opcode::Oack as u16);
            put_options(&mut buf, options);
        }
    }
    buf.freeze()
}

/// Encode data into TFTP netascii: the host line separator (`\n`) becomes
/// `CR LF`, and a bare `CR` becomes `CR NUL`.
pub fn to_netascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            b'\n' => {
                out.push(b'\r');
                out.push(b'\n');
            }
            b'\r' => {
                out.push(b'\r');
                out.push(0);
            }
            _ => out.push(b),
        }
    }
    out
}

/// Decode netascii back to raw bytes: `CR LF` becomes the host line
/// separator, `CR NUL` becomes a bare `CR`. A trailing, unresolved `CR`
/// (no following byte yet) is left untouched — callers that stream across
/// chunk boundaries must buffer it and prepend it to the next chunk.
pub fn from_netascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && i + 1 < data.len() {
            match data[i + 1] {
                b'\n' => {
                    out.push(b'\n');
                    i += 2;
                    continue;
                }
                0 => {
                    out.push(b'\r');
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Streaming variant of [`from_netascii`] for callers that see the input in
/// chunks (e.g. successive WRQ DATA payloads). `pending_cr` carries a lone
/// trailing `CR` across calls; pass `false` on the first call and reuse the
/// same flag for every subsequent chunk of the same transfer. Call
/// [`flush_pending_cr`] once at end-of-transfer to emit a `CR` that was
/// still pending when the peer stopped sending.
pub fn from_netascii_streaming(data: &[u8], pending_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    let mut i = 0;
    if *pending_cr && !data.is_empty() {
        match data[0] {
            b'\n' => {
                out.push(b'\n');
                i = 1;
            }
            0 => {
                out.push(b'\r');
                i = 1;
            }
            _ => out.push(b'\r'),
        }
        *pending_cr = false;
    }
    while i < data.len() {
        if data[i] == b'\r' {
            if i + 1 < data.len() {
                match data[i + 1] {
                    b'\n' => {
                        out.push(b'\n');
                        i += 2;
                        continue;
                    }
                    0 => {
                        out.push(b'\r');
                        i += 2;
                        continue;
                    }
                    _ => {
                        out.push(b'\r');
                        i += 1;
                        continue;
                    }
                }
            } else {
                *pending_cr = true;
                i += 1;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// A `CR` left pending by [`from_netascii_streaming`] at real end-of-transfer
/// is a bare `CR` in the source, not a split sequence; emit it literally.
pub fn flush_pending_cr(pending_cr: bool) -> Option<u8> {
    if pending_cr { Some(b'\r') } else { None }
}
