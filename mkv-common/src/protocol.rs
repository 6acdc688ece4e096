//! # Wire Protocol
//!
//! Purpose: Define the length-prefixed binary frames exchanged between the
//! client and cluster nodes, plus the encode/decode routines for both sides.
//!
//! ## Design Principles
//!
//! 1. **Simple Framing**: One `u32` length prefix per frame; no interleaving.
//! 2. **Bounded Decode**: Frames beyond `MAX_FRAME_LEN` are rejected before
//!    allocation so a corrupt peer cannot force unbounded buffers.
//! 3. **Symmetric Codec**: The same crate encodes requests and decodes them,
//!    which keeps the in-process test servers honest.
//!
//! ## Frame Layout
//!
//! ```text
//! frame:    | len: u32 BE | payload: len bytes |
//! request:  | opcode: u8  | fields ...         |
//! response: | tag: u8     | fields ...         |
//!
//! field encodings:
//!   bucket, key, name:  u16 BE length + bytes
//!   value:              u32 BE length + bytes
//!   key chunk (Keys):   u16 BE count, then count length-prefixed keys
//! ```
//!
//! A `ListKeys` request is answered by zero or more `Keys` frames followed by
//! one `Done` frame; every other request is answered by exactly one frame.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Protocol version reported alongside the server version string.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame payload, requests and responses alike.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Liveness probe.
    Ping = 1,
    /// Fetch one value.
    Get = 2,
    /// Store one value.
    Put = 3,
    /// Remove one key.
    Delete = 4,
    /// Stream every key in a bucket.
    ListKeys = 5,
    /// Report the server software version.
    ServerVersion = 6,
}

impl OpCode {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(OpCode::Ping),
            2 => Ok(OpCode::Get),
            3 => Ok(OpCode::Put),
            4 => Ok(OpCode::Delete),
            5 => Ok(OpCode::ListKeys),
            6 => Ok(OpCode::ServerVersion),
            other => Err(Error::Protocol(format!("unknown opcode {other}"))),
        }
    }
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Liveness probe.
    Ping,
    /// Fetch the value stored under `bucket`/`key`.
    Get { bucket: Vec<u8>, key: Vec<u8> },
    /// Store `value` under `bucket`/`key`.
    Put { bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
    /// Remove `bucket`/`key`.
    Delete { bucket: Vec<u8>, key: Vec<u8> },
    /// Begin streaming every key in `bucket`.
    ListKeys { bucket: Vec<u8> },
    /// Report the server software version.
    ServerVersion,
}

/// One server response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Operation succeeded with no payload.
    Ok,
    /// Key was absent.
    NotFound,
    /// Value payload for a successful get.
    Value(Vec<u8>),
    /// Application-level failure reported by the node.
    Error(String),
    /// One chunk of a key stream.
    Keys(Vec<Vec<u8>>),
    /// End of a key stream.
    Done,
    /// Server version string.
    Version(String),
}

const TAG_OK: u8 = 0;
const TAG_NOT_FOUND: u8 = 1;
const TAG_VALUE: u8 = 2;
const TAG_ERROR: u8 = 3;
const TAG_KEYS: u8 = 4;
const TAG_DONE: u8 = 5;
const TAG_VERSION: u8 = 6;

/// Encodes a complete request frame (length prefix included) into `buf`.
///
/// The buffer is cleared first so callers can reuse it across requests.
pub fn encode_request(request: &Request, buf: &mut BytesMut) {
    buf.clear();
    buf.put_u32(0); // patched below
    match request {
        Request::Ping => buf.put_u8(OpCode::Ping as u8),
        Request::Get { bucket, key } => {
            buf.put_u8(OpCode::Get as u8);
            put_short_field(buf, bucket);
            put_short_field(buf, key);
        }
        Request::Put { bucket, key, value } => {
            buf.put_u8(OpCode::Put as u8);
            put_short_field(buf, bucket);
            put_short_field(buf, key);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        Request::Delete { bucket, key } => {
            buf.put_u8(OpCode::Delete as u8);
            put_short_field(buf, bucket);
            put_short_field(buf, key);
        }
        Request::ListKeys { bucket } => {
            buf.put_u8(OpCode::ListKeys as u8);
            put_short_field(buf, bucket);
        }
        Request::ServerVersion => buf.put_u8(OpCode::ServerVersion as u8),
    }
    patch_len(buf);
}

/// Encodes a complete response frame (length prefix included) into `buf`.
pub fn encode_response(response: &Response, buf: &mut BytesMut) {
    buf.clear();
    buf.put_u32(0); // patched below
    match response {
        Response::Ok => buf.put_u8(TAG_OK),
        Response::NotFound => buf.put_u8(TAG_NOT_FOUND),
        Response::Value(value) => {
            buf.put_u8(TAG_VALUE);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        Response::Error(message) => {
            buf.put_u8(TAG_ERROR);
            put_short_field(buf, message.as_bytes());
        }
        Response::Keys(keys) => {
            buf.put_u8(TAG_KEYS);
            buf.put_u16(keys.len() as u16);
            for key in keys {
                put_short_field(buf, key);
            }
        }
        Response::Done => buf.put_u8(TAG_DONE),
        Response::Version(version) => {
            buf.put_u8(TAG_VERSION);
            put_short_field(buf, version.as_bytes());
        }
    }
    patch_len(buf);
}

/// Writes one request frame to `writer`.
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<()> {
    let mut buf = BytesMut::with_capacity(64);
    encode_request(request, &mut buf);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Writes one response frame to `writer`.
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let mut buf = BytesMut::with_capacity(64);
    encode_response(response, &mut buf);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads and decodes one request frame from `reader`.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request> {
    let payload = read_frame(reader)?;
    let mut buf = payload.as_slice();
    let opcode = OpCode::from_u8(get_u8(&mut buf)?)?;
    let request = match opcode {
        OpCode::Ping => Request::Ping,
        OpCode::Get => Request::Get {
            bucket: get_short_field(&mut buf)?,
            key: get_short_field(&mut buf)?,
        },
        OpCode::Put => {
            let bucket = get_short_field(&mut buf)?;
            let key = get_short_field(&mut buf)?;
            let len = get_u32(&mut buf)? as usize;
            Request::Put { bucket, key, value: get_bytes(&mut buf, len)? }
        }
        OpCode::Delete => Request::Delete {
            bucket: get_short_field(&mut buf)?,
            key: get_short_field(&mut buf)?,
        },
        OpCode::ListKeys => Request::ListKeys { bucket: get_short_field(&mut buf)? },
        OpCode::ServerVersion => Request::ServerVersion,
    };
    expect_drained(buf)?;
    Ok(request)
}

/// Reads and decodes one response frame from `reader`.
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let payload = read_frame(reader)?;
    let mut buf = payload.as_slice();
    let response = match get_u8(&mut buf)? {
        TAG_OK => Response::Ok,
        TAG_NOT_FOUND => Response::NotFound,
        TAG_VALUE => {
            let len = get_u32(&mut buf)? as usize;
            Response::Value(get_bytes(&mut buf, len)?)
        }
        TAG_ERROR => Response::Error(get_short_string(&mut buf)?),
        TAG_KEYS => {
            let count = get_u16(&mut buf)? as usize;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(get_short_field(&mut buf)?);
            }
            Response::Keys(keys)
        }
        TAG_DONE => Response::Done,
        TAG_VERSION => Response::Version(get_short_string(&mut buf)?),
        other => return Err(Error::Protocol(format!("unknown response tag {other}"))),
    };
    expect_drained(buf)?;
    Ok(response)
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(Error::Protocol("empty frame".to_string()));
    }
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn patch_len(buf: &mut BytesMut) {
    let len = (buf.len() - 4) as u32;
    buf[..4].copy_from_slice(&len.to_be_bytes());
}

fn put_short_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn get_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

fn get_short_field(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u16(buf)? as usize;
    get_bytes(buf, len)
}

fn get_short_string(buf: &mut &[u8]) -> Result<String> {
    let data = get_short_field(buf)?;
    String::from_utf8(data).map_err(|_| Error::Protocol("invalid utf-8 field".to_string()))
}

fn expect_drained(buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(Error::Protocol(format!("{} trailing bytes in frame", buf.len())))
    }
}

fn truncated() -> Error {
    Error::Protocol("truncated frame payload".to_string())
}
