//! # Client Facade
//!
//! Purpose: The public entry point: configuration, single-key operations with
//! failover, streamed key listings, and batched multi-key operations.
//!
//! ## Design Principles
//! 1. **Cheap Construction**: Building a client opens no sockets; connections
//!    are made on first use through the pool factory.
//! 2. **Explicit Retry Override**: Per-call options carry the retry count;
//!    there is no ambient or thread-local override.
//! 3. **Clean Shutdown**: `close` stops the batch workers, waits for in-flight
//!    work, and tears down every pooled connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info};

use mkv_common::{Error, Result};

use crate::batch::{Job, WorkerPool};
use crate::node::{choose, Node};
use crate::pool::Pool;
use crate::retry::with_retries;
use crate::stream::{start_stream, StreamHandle};
use crate::transport::{TcpTransport, TransportConfig};

/// Client construction knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Cluster node addresses as `host:port`.
    pub nodes: Vec<String>,
    /// Default retry count for operations without a per-call override.
    pub retries: usize,
    /// Free connections kept per pool before releases start trimming.
    pub max_idle: usize,
    /// Batch worker threads; defaults to the machine's parallelism.
    pub worker_threads: Option<usize>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            nodes: Vec::new(),
            retries: 3,
            max_idle: 8,
            worker_threads: None,
            connect_timeout: Some(Duration::from_secs(5)),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Per-call options for reads.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Overrides the client's default retry count for this call.
    pub retries: Option<usize>,
}

/// Per-call options for writes.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Overrides the client's default retry count for this call.
    pub retries: Option<usize>,
}

/// Per-call options for deletes.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Overrides the client's default retry count for this call.
    pub retries: Option<usize>,
}

/// One write in a batched put.
#[derive(Debug, Clone)]
pub struct PutItem {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl PutItem {
    pub fn new(
        bucket: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        PutItem { bucket: bucket.into(), key: key.into(), value: value.into() }
    }
}

/// Outcome of one fetch in a batched get, tagged with its identity so callers
/// can match completion-ordered results back to their request.
#[derive(Debug)]
pub struct BatchGet {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub outcome: Result<Option<Vec<u8>>>,
}

/// Outcome of one write in a batched put.
#[derive(Debug)]
pub struct BatchPut {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub outcome: Result<()>,
}

struct ClientCore {
    nodes: Vec<Arc<Node>>,
    pool: Pool<TcpTransport>,
    workers: WorkerPool<Task>,
    retries: usize,
    closed: AtomicBool,
}

impl ClientCore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    fn get_inner(&self, bucket: &[u8], key: &[u8], retries: usize) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        with_retries(&self.pool, retries, |t| t.get(bucket, key))
    }

    fn put_inner(&self, bucket: &[u8], key: &[u8], value: &[u8], retries: usize) -> Result<()> {
        self.ensure_open()?;
        with_retries(&self.pool, retries, |t| t.put(bucket, key, value))
    }

    fn delete_inner(&self, bucket: &[u8], key: &[u8], retries: usize) -> Result<bool> {
        self.ensure_open()?;
        with_retries(&self.pool, retries, |t| t.delete(bucket, key))
    }
}

/// One queued batch operation. Each task runs a full retried call and reports
/// through its completion channel.
enum Task {
    Get {
        core: Arc<ClientCore>,
        bucket: Vec<u8>,
        key: Vec<u8>,
        retries: usize,
        done: Sender<BatchGet>,
    },
    Put {
        core: Arc<ClientCore>,
        item: PutItem,
        retries: usize,
        done: Sender<BatchPut>,
    },
}

impl Job for Task {
    fn run(self) {
        match self {
            Task::Get { core, bucket, key, retries, done } => {
                let outcome = core.get_inner(&bucket, &key, retries);
                let _ = done.send(BatchGet { bucket, key, outcome });
            }
            Task::Put { core, item, retries, done } => {
                let outcome = core.put_inner(&item.bucket, &item.key, &item.value, retries);
                let _ = done.send(BatchPut { bucket: item.bucket, key: item.key, outcome });
            }
        }
    }
}

/// Streamed bucket key listing.
pub type KeyStream =
    StreamHandle<TcpTransport, Vec<u8>, fn(&mut TcpTransport) -> Result<Option<Vec<u8>>>>;

fn pull_key(transport: &mut TcpTransport) -> Result<Option<Vec<u8>>> {
    transport.next_key()
}

/// Handle to a meshkv cluster.
///
/// Cloning is cheap and clones share the connection pool, batch workers, and
/// closed flag.
#[derive(Clone)]
pub struct MeshClient {
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("nodes", &self.core.nodes)
            .field("retries", &self.core.retries)
            .field("closed", &self.core.closed)
            .finish_non_exhaustive()
    }
}

impl MeshClient {
    /// Builds a client for `nodes` with default configuration. No connection
    /// is attempted until the first operation.
    pub fn connect<I, S>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(ClientConfig {
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        })
    }

    /// Builds a client from an explicit configuration.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        let nodes = config
            .nodes
            .iter()
            .map(|addr| Node::parse(addr).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let transport_config = TransportConfig {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        };
        let factory_nodes = nodes.clone();
        let pool = Pool::with_max_idle(
            config.max_idle,
            move || {
                let node = choose(&factory_nodes).ok_or(Error::NoNodes)?;
                debug!(node = %node.addr(), "opening connection");
                match TcpTransport::connect(Arc::clone(&node), &transport_config) {
                    Ok(transport) => Ok(transport),
                    Err(err) => {
                        // charge the connect failure so selection drifts away
                        node.error_rate().incr(1.0);
                        Err(err)
                    }
                }
            },
            TcpTransport::close,
        );

        let workers =
            WorkerPool::new(config.worker_threads.unwrap_or_else(WorkerPool::<Task>::default_size));

        info!(nodes = nodes.len(), retries = config.retries, "meshkv client ready");
        Ok(MeshClient {
            core: Arc::new(ClientCore {
                nodes,
                pool,
                workers,
                retries: config.retries,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Liveness probe against any healthy node.
    pub fn ping(&self) -> Result<()> {
        self.core.ensure_open()?;
        with_retries(&self.core.pool, self.core.retries, |t| t.ping())
    }

    /// Server software version of any healthy node.
    pub fn server_version(&self) -> Result<String> {
        self.core.ensure_open()?;
        with_retries(&self.core.pool, self.core.retries, |t| t.server_version())
    }

    /// Fetches a value; `Ok(None)` when the key is absent.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.get_inner(bucket, key, self.core.retries)
    }

    /// [`get`](MeshClient::get) with per-call options.
    pub fn get_with(&self, bucket: &[u8], key: &[u8], options: &GetOptions) -> Result<Option<Vec<u8>>> {
        self.core.get_inner(bucket, key, self.retries_for(options.retries))
    }

    /// Stores a value.
    pub fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.core.put_inner(bucket, key, value, self.core.retries)
    }

    /// [`put`](MeshClient::put) with per-call options.
    pub fn put_with(
        &self,
        bucket: &[u8],
        key: &[u8],
        value: &[u8],
        options: &PutOptions,
    ) -> Result<()> {
        self.core.put_inner(bucket, key, value, self.retries_for(options.retries))
    }

    /// Removes a key; returns whether it existed.
    pub fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<bool> {
        self.core.delete_inner(bucket, key, self.core.retries)
    }

    /// [`delete`](MeshClient::delete) with per-call options.
    pub fn delete_with(&self, bucket: &[u8], key: &[u8], options: &DeleteOptions) -> Result<bool> {
        self.core.delete_inner(bucket, key, self.retries_for(options.retries))
    }

    /// Streams every key in `bucket`. The returned iterator holds one pooled
    /// connection until it is drained or [`close`](StreamHandle::close)d.
    pub fn stream_keys(&self, bucket: &[u8]) -> Result<KeyStream> {
        self.core.ensure_open()?;
        let bucket = bucket.to_vec();
        start_stream(&self.core.pool, self.core.retries, move |t: &mut TcpTransport| {
            t.begin_list_keys(&bucket)?;
            Ok(pull_key as fn(&mut TcpTransport) -> Result<Option<Vec<u8>>>)
        })
    }

    /// Fetches many keys concurrently on the batch workers.
    ///
    /// Results arrive in completion order, one [`BatchGet`] per requested
    /// pair; failures are reported per item, not for the batch as a whole.
    pub fn multiget(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<BatchGet>> {
        self.multiget_with(pairs, &GetOptions::default())
    }

    /// [`multiget`](MeshClient::multiget) with per-call options.
    pub fn multiget_with(
        &self,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        options: &GetOptions,
    ) -> Result<Vec<BatchGet>> {
        self.core.ensure_open()?;
        self.core.workers.start();
        let retries = self.retries_for(options.retries);
        let count = pairs.len();
        let (done, results) = unbounded();
        for (bucket, key) in pairs {
            self.core.workers.enqueue(Task::Get {
                core: Arc::clone(&self.core),
                bucket,
                key,
                retries,
                done: done.clone(),
            })?;
        }
        drop(done);
        collect(results, count)
    }

    /// Writes many items concurrently on the batch workers. Results arrive in
    /// completion order.
    pub fn multiput(&self, items: Vec<PutItem>) -> Result<Vec<BatchPut>> {
        self.multiput_with(items, &PutOptions::default())
    }

    /// [`multiput`](MeshClient::multiput) with per-call options.
    pub fn multiput_with(&self, items: Vec<PutItem>, options: &PutOptions) -> Result<Vec<BatchPut>> {
        self.core.ensure_open()?;
        self.core.workers.start();
        let retries = self.retries_for(options.retries);
        let count = items.len();
        let (done, results) = unbounded();
        for item in items {
            self.core.workers.enqueue(Task::Put {
                core: Arc::clone(&self.core),
                item,
                retries,
                done: done.clone(),
            })?;
        }
        drop(done);
        collect(results, count)
    }

    /// The configured cluster nodes.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.core.nodes
    }

    /// Shuts the client down: refuses new operations, stops the batch workers
    /// after draining queued tasks, then destroys every pooled connection.
    /// Idempotent.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing meshkv client");
        self.core.workers.stop();
        self.core.pool.clear();
    }

    fn retries_for(&self, override_retries: Option<usize>) -> usize {
        override_retries.unwrap_or(self.core.retries)
    }
}

fn collect<R>(results: crossbeam_channel::Receiver<R>, count: usize) -> Result<Vec<R>> {
    let mut collected = Vec::with_capacity(count);
    for _ in 0..count {
        // every task sends exactly once; a dropped sender means a worker died
        let result = results.recv().map_err(|_| Error::WorkerPoolStopped)?;
        collected.push(result);
    }
    Ok(collected)
}
