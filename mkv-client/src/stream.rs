//! # Streaming Results
//!
//! Purpose: Hold a pooled connection open across a multi-frame server
//! response and hand results out as an iterator, with an explicit `close`
//! for abandoning the stream early.
//!
//! ## Design Principles
//! 1. **Exactly One Release**: The connection goes back to the pool (or is
//!    destroyed) exactly once, whether the stream is drained, closed early,
//!    or dropped mid-way.
//! 2. **Early Close Condemns**: Abandoning a stream leaves unread frames on
//!    the wire, so the connection is destroyed rather than reused.
//! 3. **Retried Start Only**: Failover happens while starting the stream;
//!    once items have flowed, an error ends the stream for the caller.

use std::sync::Arc;

use tracing::warn;

use mkv_common::Result;

use crate::pool::{Pool, PooledResource};
use crate::retry::RetryState;
use crate::transport::NodeBound;

/// Iterator over a streamed server response.
///
/// `pull` fetches the next item from the held connection; `Ok(None)` marks a
/// cleanly finished stream. Dropping the handle mid-stream destroys the
/// connection, same as [`StreamHandle::close`].
pub struct StreamHandle<T, I, F>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<Option<I>>,
{
    resource: Option<PooledResource<T>>,
    pull: F,
}

impl<T, I, F> std::fmt::Debug for StreamHandle<T, I, F>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<Option<I>>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("active", &self.resource.is_some())
            .finish_non_exhaustive()
    }
}

impl<T, I, F> StreamHandle<T, I, F>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<Option<I>>,
{
    /// Abandons the stream and destroys the held connection. Safe to call
    /// repeatedly and after the stream has finished.
    pub fn close(&mut self) {
        self.release(false);
    }

    fn release(&mut self, reuse: bool) {
        if let Some(mut resource) = self.resource.take() {
            if !reuse {
                resource.mark_bad();
            }
        }
    }
}

impl<T, I, F> Iterator for StreamHandle<T, I, F>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<Option<I>>,
{
    type Item = Result<I>;

    fn next(&mut self) -> Option<Self::Item> {
        let resource = self.resource.as_mut()?;
        match (self.pull)(resource) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.release(true);
                None
            }
            Err(err) => {
                self.release(!err.poisons_connection());
                Some(Err(err))
            }
        }
    }
}

impl<T, I, F> Drop for StreamHandle<T, I, F>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<Option<I>>,
{
    fn drop(&mut self) {
        self.release(false);
    }
}

/// Starts a streamed operation with the same failover rules as
/// [`with_retries`](crate::retry::with_retries).
///
/// `start` kicks the stream off on a freshly acquired connection and returns
/// the pull function the handle will iterate with. Transient start failures
/// fail over to other nodes within the retry budget; once started, the
/// stream is bound to its connection.
pub fn start_stream<T, I, F, S>(pool: &Pool<T>, retries: usize, mut start: S) -> Result<StreamHandle<T, I, F>>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<Option<I>>,
    S: FnMut(&mut T) -> Result<F>,
{
    let mut state = RetryState::new(retries);
    loop {
        let mut resource = match pool.acquire_where(|transport| state.allows(transport.node())) {
            Ok(resource) => resource,
            Err(err) if err.is_transient() => {
                if state.note_transient(None) {
                    continue;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match start(&mut resource) {
            Ok(pull) => return Ok(StreamHandle { resource: Some(resource), pull }),
            Err(err) if err.is_transient() => {
                resource.mark_bad();
                let node = Arc::clone(resource.node());
                drop(resource);
                if state.note_transient(Some(&node)) {
                    warn!(node = %node.addr(), error = %err, "stream start failed, failing over");
                    continue;
                }
                return Err(err);
            }
            Err(err) => {
                if err.poisons_connection() {
                    resource.mark_bad();
                }
                return Err(err);
            }
        }
    }
}
