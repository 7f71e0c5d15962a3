//! Cluster membership seams
//!
//! [`Membership`] is the capability set the coordinator needs from a gossip
//! implementation. [`ClusterDelegate`] is the callback surface a gossip
//! implementation drives; hooks for node metadata, broadcasts and state
//! exchange default to no-ops because membership is derived entirely from the
//! live member list.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name
    pub name: String,
    /// Gossip address
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Live view of the cluster plus point-to-point messaging
#[async_trait]
pub trait Membership: Send + Sync {
    /// Live members, including the local node
    fn members(&self) -> Vec<Node>;

    /// Number of live members, including the local node
    fn member_count(&self) -> usize;

    /// Contact `seeds` and merge their view; returns how many answered
    async fn join(&self, seeds: &[String]) -> Result<usize>;

    /// Deliver `message` to `node`, reporting failure to the caller
    async fn send_reliable(&self, node: &Node, message: Vec<u8>) -> Result<()>;
}

/// Callbacks driven by the gossip transport
///
/// Implementations are invoked from transport tasks and must not block.
pub trait ClusterDelegate: Send + Sync {
    /// A member joined or came back
    fn notify_join(&self, node: &Node);

    /// A member left or failed
    fn notify_leave(&self, node: &Node);

    /// A member changed its address
    fn notify_update(&self, node: &Node);

    /// A point-to-point message arrived. `data` is only valid for the call.
    fn notify_msg(&self, data: &[u8]);

    /// Metadata advertised with the local node
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// Application broadcasts piggybacked on gossip
    fn broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Application state sent during push-pull
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Application state received during push-pull
    fn merge_remote_state(&self, _state: &[u8], _join: bool) {}
}
