//! # meshkv Client
//!
//! Blocking client library for a meshkv cluster: a health-aware connection
//! pool, transparent retry with node failover, streamed key listings, and
//! batched multi-key operations on a worker-thread pool.
//!
//! ```no_run
//! use mkv_client::MeshClient;
//!
//! # fn main() -> mkv_common::Result<()> {
//! let client = MeshClient::connect(["db1.local:7878", "db2.local:7878"])?;
//! client.put(b"users", b"alice", b"{\"age\":34}")?;
//! let value = client.get(b"users", b"alice")?;
//! assert!(value.is_some());
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod health;
pub mod node;
pub mod pool;
pub mod retry;
pub mod stream;
pub mod transport;

pub use batch::{Job, WorkerPool};
pub use client::{
    BatchGet, BatchPut, ClientConfig, DeleteOptions, GetOptions, KeyStream, MeshClient, PutItem,
    PutOptions,
};
pub use health::DecayingErrorRate;
pub use node::{choose, Node};
pub use pool::{Pool, PooledResource};
pub use retry::with_retries;
pub use stream::{start_stream, StreamHandle};
pub use transport::{NodeBound, TcpTransport, TransportConfig};

pub use mkv_common::{Error, Result};
