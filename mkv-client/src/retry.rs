//! # Retry Executor
//!
//! Purpose: Run one logical operation against the cluster, failing over to
//! other nodes on transient network errors within a bounded budget.
//!
//! ## Design Principles
//! 1. **One Free Retry**: The first transient failure in a call is assumed to
//!    be a stale pooled connection and is not charged against the budget.
//! 2. **Skip What Failed**: A node that failed transiently is excluded from
//!    selection for the rest of the call.
//! 3. **Transparent Failures**: When the budget runs out, the caller sees the
//!    original underlying error, not a wrapper.

use std::sync::Arc;

use tracing::{debug, warn};

use mkv_common::Result;

use crate::node::Node;
use crate::pool::Pool;
use crate::transport::NodeBound;

/// Per-call retry bookkeeping shared between the executor and the streaming
/// start path: the skip-list, the budget, and the free first attempt.
pub(crate) struct RetryState {
    skip: Vec<Arc<Node>>,
    budget: usize,
    used: usize,
    first_attempt: bool,
}

impl RetryState {
    pub(crate) fn new(retries: usize) -> Self {
        RetryState {
            skip: Vec::new(),
            budget: retries.saturating_sub(1),
            used: 0,
            first_attempt: true,
        }
    }

    /// Whether `node` may still be selected for this call.
    pub(crate) fn allows(&self, node: &Arc<Node>) -> bool {
        !self.skip.iter().any(|skipped| Arc::ptr_eq(skipped, node))
    }

    /// Records a transient failure (with health penalty and skip-list entry
    /// when the failing node is known) and decides whether another attempt
    /// may run.
    pub(crate) fn note_transient(&mut self, node: Option<&Arc<Node>>) -> bool {
        if let Some(node) = node {
            node.error_rate().incr(1.0);
            self.skip.push(Arc::clone(node));
        }
        if self.first_attempt {
            // one free retry: a single stale connection is not a systemic failure
            self.first_attempt = false;
            return true;
        }
        if self.used < self.budget {
            self.used += 1;
            return true;
        }
        false
    }
}

/// Runs `op` against a pooled transport, retrying on transient failures.
///
/// `retries` is the configured retry count; the budget for charged retries is
/// `retries - 1`, on top of one uncharged retry for the first transient
/// failure. Fatal errors propagate immediately; the resource is destroyed
/// whenever the failure poisons the connection.
pub fn with_retries<T, R, F>(pool: &Pool<T>, retries: usize, mut op: F) -> Result<R>
where
    T: NodeBound,
    F: FnMut(&mut T) -> Result<R>,
{
    let mut state = RetryState::new(retries);
    loop {
        let mut resource = match pool.acquire_where(|transport| state.allows(transport.node())) {
            Ok(resource) => resource,
            Err(err) if err.is_transient() => {
                // connect failure: no node identity to skip, the factory's
                // health bump already biases selection away
                if state.note_transient(None) {
                    debug!(error = %err, "connect failed, retrying");
                    continue;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match op(&mut resource) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                resource.mark_bad();
                let node = Arc::clone(resource.node());
                drop(resource);
                if state.note_transient(Some(&node)) {
                    warn!(node = %node.addr(), error = %err, "transient failure, failing over");
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
