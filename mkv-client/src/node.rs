//! # Cluster Nodes and Selection
//!
//! Purpose: Describe one addressable cluster member and pick which member a
//! new connection should target, biased away from recently failing nodes.
//!
//! ## Design Principles
//! 1. **Health-Biased Spread**: Healthy nodes are chosen uniformly at random
//!    so load spreads across replicas.
//! 2. **Best of a Bad Lot**: When every node looks unhealthy the least-bad
//!    one is still returned; the client degrades instead of refusing.
//! 3. **Read-Only Selection**: `choose` never mutates the node list.

use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::health::DecayingErrorRate;

/// Error-rate threshold below which a node counts as healthy.
const HEALTHY_THRESHOLD: f64 = 0.1;

/// One addressable cluster member plus its decaying failure score.
pub struct Node {
    host: String,
    port: u16,
    error_rate: DecayingErrorRate,
}

impl Node {
    /// Creates a node for `host:port` with a fresh error rate.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Node {
            host: host.into(),
            port,
            error_rate: DecayingErrorRate::default(),
        }
    }

    /// Parses `host:port` into a node.
    pub fn parse(addr: &str) -> Result<Self, mkv_common::Error> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| mkv_common::Error::InvalidAddress(addr.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| mkv_common::Error::InvalidAddress(addr.to_string()))?;
        if host.is_empty() {
            return Err(mkv_common::Error::InvalidAddress(addr.to_string()));
        }
        Ok(Node::new(host, port))
    }

    /// Renders the connectable `host:port` address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The node's decaying failure score.
    pub fn error_rate(&self) -> &DecayingErrorRate {
        &self.error_rate
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Picks the node a new connection should target.
///
/// Nodes with an error rate below the health threshold are chosen uniformly
/// at random. If none qualify, the node with the minimum score wins.
pub fn choose(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    if nodes.is_empty() {
        return None;
    }

    let scored: Vec<(f64, &Arc<Node>)> =
        nodes.iter().map(|node| (node.error_rate().value(), node)).collect();

    let healthy: Vec<&Arc<Node>> = scored
        .iter()
        .filter(|(score, _)| *score < HEALTHY_THRESHOLD)
        .map(|(_, node)| *node)
        .collect();

    if let Some(node) = healthy.choose(&mut rand::thread_rng()) {
        return Some(Arc::clone(node));
    }

    scored
        .iter()
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, node)| Arc::clone(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cluster(count: usize) -> Vec<Arc<Node>> {
        (0..count)
            .map(|idx| Arc::new(Node::new("127.0.0.1", 7000 + idx as u16)))
            .collect()
    }

    #[test]
    fn test_parse_round_trips_addr() {
        let node = Node::parse("db1.local:8087").expect("parse");
        assert_eq!(node.addr(), "db1.local:8087");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Node::parse("no-port").is_err());
        assert!(Node::parse(":8087").is_err());
        assert!(Node::parse("host:notaport").is_err());
    }

    #[test]
    fn test_choose_empty_returns_none() {
        assert!(choose(&[]).is_none());
    }

    #[test]
    fn test_choose_spreads_over_healthy_nodes() {
        let nodes = cluster(3);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let picked = choose(&nodes).expect("choice");
            seen.insert(picked.addr());
        }
        assert_eq!(seen.len(), 3, "healthy nodes should all be selected");
    }

    #[test]
    fn test_choose_skips_unhealthy_nodes() {
        let nodes = cluster(3);
        nodes[0].error_rate().incr(5.0);
        nodes[2].error_rate().incr(5.0);
        for _ in 0..50 {
            let picked = choose(&nodes).expect("choice");
            assert!(Arc::ptr_eq(&picked, &nodes[1]));
        }
    }

    #[test]
    fn test_choose_falls_back_to_least_bad() {
        let nodes = cluster(3);
        nodes[0].error_rate().incr(9.0);
        nodes[1].error_rate().incr(3.0);
        nodes[2].error_rate().incr(6.0);
        let picked = choose(&nodes).expect("choice");
        assert!(Arc::ptr_eq(&picked, &nodes[1]));
    }

    #[test]
    fn test_choose_does_not_mutate_list() {
        let nodes = cluster(2);
        let before: Vec<String> = nodes.iter().map(|n| n.addr()).collect();
        let _ = choose(&nodes);
        let after: Vec<String> = nodes.iter().map(|n| n.addr()).collect();
        assert_eq!(before, after);
    }
}
