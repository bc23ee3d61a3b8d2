//! Binary protocol framing.
//!
//! Every frame is a fixed 24-byte big-endian header followed by extras, key
//! and value, in that order:
//!
//! ```text
//!  0      magic (0x80 request, 0x81 response)
//!  1      opcode
//!  2..4   key length
//!  4      extras length
//!  5      data type (always 0)
//!  6..8   vbucket (request) / status (response)
//!  8..12  total body length = extras + key + value
//! 12..16  opaque (always 0)
//! 16..24  cas
//! ```
//!
//! Both directions are implemented so frames round-trip and test servers can
//! share this code; the client itself only writes requests and reads responses.

use std::fmt;
use std::io::{self, Read, Write};

use bytes::BufMut;

use crate::errors::{OperationError, ProtocolError};
use crate::legal_key;

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Flush = 0x08,
    Noop = 0x0a,
    GetKQ = 0x0d,
    AuthList = 0x20,
    AuthStart = 0x21,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        let opcode = match byte {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x08 => Opcode::Flush,
            0x0a => Opcode::Noop,
            0x0d => Opcode::GetKQ,
            0x20 => Opcode::AuthList,
            0x21 => Opcode::AuthStart,
            _ => return None,
        };
        Some(opcode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArgs,
    ItemNotStored,
    InvalidIncrDecr,
    WrongVBucket,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    /// Also sent by servers that are too busy to answer.
    InternalError,
    TemporaryError,
    Other(u16),
}

impl Status {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x00 => Status::Ok,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::ValueTooLarge,
            0x04 => Status::InvalidArgs,
            0x05 => Status::ItemNotStored,
            0x06 => Status::InvalidIncrDecr,
            0x07 => Status::WrongVBucket,
            0x08 => Status::AuthError,
            0x09 => Status::AuthContinue,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x85 => Status::InternalError,
            0x86 => Status::TemporaryError,
            other => Status::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Status::Ok => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::ValueTooLarge => 0x03,
            Status::InvalidArgs => 0x04,
            Status::ItemNotStored => 0x05,
            Status::InvalidIncrDecr => 0x06,
            Status::WrongVBucket => 0x07,
            Status::AuthError => 0x08,
            Status::AuthContinue => 0x09,
            Status::UnknownCommand => 0x81,
            Status::OutOfMemory => 0x82,
            Status::NotSupported => 0x83,
            Status::InternalError => 0x85,
            Status::TemporaryError => 0x86,
            Status::Other(code) => code,
        }
    }

    /// Maps a non-OK status to the error reported to callers.
    ///
    /// `KeyExists` is the answer to both a stale cas and an add over an
    /// existing key, so the request's cas decides between the two. A cas
    /// write on a key that is gone was not stored rather than missed.
    pub fn as_error(self, request_key: &str, request_cas: u64) -> OperationError {
        match self {
            Status::KeyNotFound if request_cas != 0 => OperationError::NotStoredError,
            Status::KeyNotFound => OperationError::CacheMissError,
            Status::KeyExists if request_cas != 0 => OperationError::CASConflictError,
            Status::KeyExists | Status::ItemNotStored => OperationError::NotStoredError,
            Status::InvalidIncrDecr => OperationError::BadIncrDecError,
            Status::InvalidArgs if !legal_key(request_key) => OperationError::MalformedKeyError,
            Status::AuthError => OperationError::AuthError(self),
            _ => OperationError::ServerError(self),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key already exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArgs => write!(f, "invalid arguments"),
            Status::ItemNotStored => write!(f, "item not stored"),
            Status::InvalidIncrDecr => write!(f, "incr/decr on non-numeric value"),
            Status::WrongVBucket => write!(f, "wrong vbucket"),
            Status::AuthError => write!(f, "auth error"),
            Status::AuthContinue => write!(f, "auth continue"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::NotSupported => write!(f, "not supported"),
            Status::InternalError => write!(f, "internal error or busy"),
            Status::TemporaryError => write!(f, "temporary failure"),
            Status::Other(code) => write!(f, "unknown status {:#06x}", code),
        }
    }
}

/// A request frame as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: u8,
    pub key: Vec<u8>,
    pub extras: Vec<u8>,
    pub value: Vec<u8>,
    pub cas: u64,
}

impl Request {
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        write_frame(
            writer,
            REQUEST_MAGIC,
            self.opcode,
            0,
            &self.key,
            &self.extras,
            &self.value,
            self.cas,
        )
    }
}

/// A successful response frame. Error statuses never reach the caller as a
/// `Response`; they become an `OperationError` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    header: [u8; HEADER_LEN],
    pub key: Vec<u8>,
    pub extras: Vec<u8>,
    pub value: Vec<u8>,
}

impl Response {
    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    pub fn opcode(&self) -> u8 {
        self.header[1]
    }

    pub fn cas(&self) -> u64 {
        be_u64(&self.header[16..24])
    }

    /// Item flags carried in the first four extras bytes of a get reply.
    pub fn flags(&self) -> u32 {
        if self.extras.len() < 4 {
            return 0;
        }
        u32::from_be_bytes([self.extras[0], self.extras[1], self.extras[2], self.extras[3]])
    }
}

/// Writes one request. The value goes out as a second write so large
/// payloads are never copied into the header buffer.
pub fn send_command<W: Write + ?Sized>(
    writer: &mut W,
    opcode: Opcode,
    key: &[u8],
    value: &[u8],
    cas: u64,
    extras: &[u8],
) -> io::Result<()> {
    write_frame(writer, REQUEST_MAGIC, opcode as u8, 0, key, extras, value, cas)
}

pub fn write_response<W: Write + ?Sized>(
    writer: &mut W,
    opcode: u8,
    status: Status,
    key: &[u8],
    extras: &[u8],
    value: &[u8],
    cas: u64,
) -> io::Result<()> {
    write_frame(
        writer,
        RESPONSE_MAGIC,
        opcode,
        status.as_u16(),
        key,
        extras,
        value,
        cas,
    )
}

#[allow(clippy::too_many_arguments)]
fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    magic: u8,
    opcode: u8,
    vbucket_or_status: u16,
    key: &[u8],
    extras: &[u8],
    value: &[u8],
    cas: u64,
) -> io::Result<()> {
    let key_len = u16::try_from(key.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "key longer than 65535 bytes"))?;
    let extras_len = u8::try_from(extras.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "extras longer than 255 bytes"))?;
    let body_len = u32::try_from(extras.len() + key.len() + value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame body exceeds 4 GiB"))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + extras.len() + key.len());
    buf.put_u8(magic);
    buf.put_u8(opcode);
    buf.put_u16(key_len);
    buf.put_u8(extras_len);
    buf.put_u8(0); // data type
    buf.put_u16(vbucket_or_status);
    buf.put_u32(body_len);
    buf.put_u32(0); // opaque
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    writer.write_all(&buf)?;

    if !value.is_empty() {
        writer.write_all(value)?;
    }
    writer.flush()
}

/// Reads one response frame.
///
/// On an error status the whole body is drained first so the stream stays
/// aligned on the next frame. `request_key` and `request_cas` only refine the
/// error reported for the status.
pub fn parse_response<R: Read + ?Sized>(
    reader: &mut R,
    request_key: &str,
    request_cas: u64,
) -> Result<Response, OperationError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    if header[0] != RESPONSE_MAGIC {
        return Err(ProtocolError::BadMagic(header[0]).into());
    }

    let status = Status::from_u16(be_u16(&header[6..8]));
    let total = be_u32(&header[8..12]);
    if status != Status::Ok {
        let drained = io::copy(&mut (&mut *reader).take(u64::from(total)), &mut io::sink())?;
        if drained < u64::from(total) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside an error frame",
            )
            .into());
        }
        return Err(status.as_error(request_key, request_cas));
    }

    let (key, extras, value) = read_body(reader, &header)?;
    Ok(Response {
        header,
        key,
        extras,
        value,
    })
}

/// Reads one request frame; the server side of `send_command`.
pub fn read_request<R: Read + ?Sized>(reader: &mut R) -> Result<Request, OperationError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    if header[0] != REQUEST_MAGIC {
        return Err(ProtocolError::BadMagic(header[0]).into());
    }
    let (key, extras, value) = read_body(reader, &header)?;
    Ok(Request {
        opcode: header[1],
        key,
        extras,
        value,
        cas: be_u64(&header[16..24]),
    })
}

type Body = (Vec<u8>, Vec<u8>, Vec<u8>);

fn read_body<R: Read + ?Sized>(
    reader: &mut R,
    header: &[u8; HEADER_LEN],
) -> Result<Body, OperationError> {
    let key_len = be_u16(&header[2..4]);
    let extras_len = header[4];
    let total = be_u32(&header[8..12]);

    let value_len = (total as usize)
        .checked_sub(usize::from(extras_len) + usize::from(key_len))
        .ok_or(ProtocolError::BodyLength {
            total,
            extras: extras_len,
            key: key_len,
        })?;

    let extras = read_exact_vec(reader, usize::from(extras_len))?;
    let key = read_exact_vec(reader, usize::from(key_len))?;
    let value = read_exact_vec(reader, value_len)?;
    Ok((key, extras, value))
}

// Grows with the bytes that actually arrive, not with the length the peer
// claims in its header.
fn read_exact_vec<R: Read + ?Sized>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if len > 0 {
        (&mut *reader).take(len as u64).read_to_end(&mut buf)?;
    }
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside a frame body",
        ));
    }
    Ok(buf)
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
