//! # Node-Bound Transport
//!
//! Purpose: Provide the blocking framed connection the pool hands out, bound
//! to exactly one cluster node for its whole life.
//!
//! ## Design Principles
//! 1. **One Node Per Connection**: The retry executor reasons about node
//!    identity, so a transport never migrates between nodes.
//! 2. **Cache-Friendly Buffers**: Each connection reuses its encode buffer
//!    and buffered reader to avoid per-call allocations.
//! 3. **Fail Fast**: Unexpected frames surface as protocol errors instead of
//!    being papered over.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use mkv_common::{read_response, encode_request, Error, Request, Response, Result};

use crate::node::Node;

/// Identity hook for pooled objects: which cluster node a resource belongs
/// to. The retry executor uses this for skip-lists and health accounting.
pub trait NodeBound {
    /// The node this resource is bound to.
    fn node(&self) -> &Arc<Node>;
}

/// Socket-level knobs for new connections.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
}

/// Blocking framed connection to a single cluster node.
pub struct TcpTransport {
    node: Arc<Node>,
    reader: BufReader<TcpStream>,
    write_buf: BytesMut,
    pending_keys: VecDeque<Vec<u8>>,
    keys_done: bool,
}

impl TcpTransport {
    /// Connects to `node` and prepares the framed stream.
    pub fn connect(node: Arc<Node>, config: &TransportConfig) -> Result<Self> {
        let stream = connect_stream(&node, config)?;
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(TcpTransport {
            node,
            reader: BufReader::new(stream),
            write_buf: BytesMut::with_capacity(256),
            pending_keys: VecDeque::new(),
            keys_done: false,
        })
    }

    /// Liveness probe against the bound node.
    pub fn ping(&mut self) -> Result<()> {
        match self.call(&Request::Ping)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetches a value. `Ok(None)` when the key is absent.
    pub fn get(&mut self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let request = Request::Get { bucket: bucket.to_vec(), key: key.to_vec() };
        match self.call(&request)? {
            Response::Value(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    /// Stores a value.
    pub fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let request = Request::Put {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        };
        match self.call(&request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Removes a key. Returns true when a key was removed.
    pub fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<bool> {
        let request = Request::Delete { bucket: bucket.to_vec(), key: key.to_vec() };
        match self.call(&request)? {
            Response::Ok => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(unexpected(&other)),
        }
    }

    /// Reports the server software version.
    pub fn server_version(&mut self) -> Result<String> {
        match self.call(&Request::ServerVersion)? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected(&other)),
        }
    }

    /// Starts a key stream for `bucket` and buffers its first frame, so
    /// stale-connection failures surface before any key is delivered.
    pub fn begin_list_keys(&mut self, bucket: &[u8]) -> Result<()> {
        self.pending_keys.clear();
        self.keys_done = false;
        let request = Request::ListKeys { bucket: bucket.to_vec() };
        self.send(&request)?;
        self.fill_keys()
    }

    /// Yields the next streamed key, reading further frames as needed.
    /// `Ok(None)` once the stream's terminating frame has been seen.
    pub fn next_key(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(key) = self.pending_keys.pop_front() {
                return Ok(Some(key));
            }
            if self.keys_done {
                return Ok(None);
            }
            self.fill_keys()?;
        }
    }

    /// Shuts the socket down. Dropping the transport closes it as well; this
    /// exists for the pool's close callback so teardown is explicit.
    pub fn close(self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }

    fn fill_keys(&mut self) -> Result<()> {
        match read_response(&mut self.reader)? {
            Response::Keys(keys) => {
                self.pending_keys.extend(keys);
                Ok(())
            }
            Response::Done => {
                self.keys_done = true;
                Ok(())
            }
            Response::Error(message) => {
                self.keys_done = true;
                Err(Error::Server(message))
            }
            other => Err(unexpected(&other)),
        }
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        self.send(request)?;
        read_response(&mut self.reader)
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        encode_request(request, &mut self.write_buf);
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }
}

impl NodeBound for TcpTransport {
    fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

fn connect_stream(node: &Node, config: &TransportConfig) -> Result<TcpStream> {
    let addr = node.addr();
    let mut resolved = addr
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(addr.clone()))?;
    let sock_addr = resolved.next().ok_or_else(|| Error::InvalidAddress(addr))?;

    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&sock_addr, timeout)?,
        None => TcpStream::connect(sock_addr)?,
    };
    Ok(stream)
}

fn unexpected(response: &Response) -> Error {
    match response {
        Response::Error(message) => Error::Server(message.clone()),
        other => Error::Protocol(format!("unexpected response: {other:?}")),
    }
}
