// Endpoint discovery seam. DNS/gossip mechanics live behind the trait;
// the built-in discoverers cover static and fixed-list cluster configs.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::NodeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub address: SocketAddr,
}

#[derive(thiserror::Error, Debug)]
pub enum DiscoverError {
    #[error("no candidate endpoints available")]
    Exhausted,
}

/// Yields a healthy node address; `failed` names the endpoint that just
/// faulted so the discoverer can avoid handing it straight back.
pub trait EndpointDiscoverer: Send + Sync {
    fn discover(&self, failed: Option<SocketAddr>) -> Result<NodeEndpoint, DiscoverError>;
}

pub struct StaticEndpointDiscoverer {
    endpoint: SocketAddr,
}

impl StaticEndpointDiscoverer {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self { endpoint }
    }
}

impl EndpointDiscoverer for StaticEndpointDiscoverer {
    fn discover(&self, _failed: Option<SocketAddr>) -> Result<NodeEndpoint, DiscoverError> {
        Ok(NodeEndpoint {
            address: self.endpoint,
        })
    }
}

pub struct RoundRobinDiscoverer {
    candidates: Vec<SocketAddr>,
    cursor: AtomicUsize,
}

impl RoundRobinDiscoverer {
    pub fn new(candidates: Vec<SocketAddr>) -> Self {
        Self {
            candidates,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl EndpointDiscoverer for RoundRobinDiscoverer {
    fn discover(&self, failed: Option<SocketAddr>) -> Result<NodeEndpoint, DiscoverError> {
        if self.candidates.is_empty() {
            return Err(DiscoverError::Exhausted);
        }
        for _ in 0..self.candidates.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.candidates.len();
            let candidate = self.candidates[index];
            // Skip the endpoint that just failed when an alternative exists.
            if self.candidates.len() > 1 && Some(candidate) == failed {
                continue;
            }
            return Ok(NodeEndpoint { address: candidate });
        }
        Ok(NodeEndpoint {
            address: self.candidates[0],
        })
    }
}

pub(crate) fn discoverer_for(nodes: &NodeSettings) -> Box<dyn EndpointDiscoverer> {
    match nodes {
        NodeSettings::Single(address) => Box::new(StaticEndpointDiscoverer::new(*address)),
        NodeSettings::Cluster(addresses) => Box::new(RoundRobinDiscoverer::new(addresses.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn static_discoverer_always_yields_its_endpoint() {
        let discoverer = StaticEndpointDiscoverer::new(addr(1113));
        assert_eq!(
            discoverer.discover(Some(addr(1113))).unwrap().address,
            addr(1113)
        );
    }

    #[test]
    fn round_robin_skips_the_failed_endpoint() {
        let discoverer = RoundRobinDiscoverer::new(vec![addr(1), addr(2)]);
        let first = discoverer.discover(None).unwrap().address;
        let second = discoverer.discover(Some(first)).unwrap().address;
        assert_ne!(first, second);
    }

    #[test]
    fn single_candidate_is_reused_even_after_failure() {
        let discoverer = RoundRobinDiscoverer::new(vec![addr(7)]);
        assert_eq!(discoverer.discover(Some(addr(7))).unwrap().address, addr(7));
    }
}
