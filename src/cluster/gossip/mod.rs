//! Heartbeat push-pull gossip over TCP
//!
//! Each node bumps its own heartbeat every gossip interval and exchanges its
//! member table with one random live peer. Every connection carries exactly
//! one request frame and one reply frame, sealed under the cluster's shared
//! secret. Point-to-point application messages use the same connections and
//! are acknowledged once handed to the delegate.

mod members;
mod wire;

pub use members::{MemberEvent, MemberTable};
pub use wire::{Digest, FrameCodec, Message, MAX_FRAME_BYTES, SECRET_LEN};

use super::membership::{ClusterDelegate, Membership, Node};
use super::protocol::PROTOCOL_VERSION;
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeats and push-pull rounds
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
/// Time without a heartbeat advance before a member is considered failed
pub const DEFAULT_DEAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on connect plus request plus reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_META_BYTES: usize = 512;
const MAX_BROADCAST_BYTES: usize = 64 * 1024;

/// Gossip transport configuration
#[derive(Clone)]
pub struct GossipConfig {
    /// Unique node name
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Address advertised to peers, defaults to the bound address.
    /// Required when `bind_addr` is a wildcard.
    pub advertise_addr: Option<SocketAddr>,
    secret: Vec<u8>,
    pub protocol_version: u8,
    pub gossip_interval: Duration,
    pub dead_timeout: Duration,
    pub timeout: Duration,
}

impl GossipConfig {
    /// Validate the node name, addresses and shared secret
    pub fn new(
        name: impl Into<String>,
        bind_addr: &str,
        advertise_addr: Option<&str>,
        secret: Vec<u8>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Config("node name must not be empty".to_string()));
        }
        if secret.len() != SECRET_LEN {
            return Err(Error::Config(format!(
                "gossip secret must be {} bytes, got {}",
                SECRET_LEN,
                secret.len()
            )));
        }
        let bind_addr = parse_addr("bind", bind_addr)?;
        let advertise_addr = advertise_addr
            .map(|addr| parse_addr("advertise", addr))
            .transpose()?;
        if let Some(addr) = advertise_addr {
            if addr.ip().is_unspecified() {
                return Err(Error::Config(format!(
                    "advertise address {} must be routable",
                    addr
                )));
            }
        }
        require_advertise(bind_addr, advertise_addr)?;

        Ok(Self {
            name,
            bind_addr,
            advertise_addr,
            secret,
            protocol_version: PROTOCOL_VERSION,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            dead_timeout: DEFAULT_DEAD_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }
}

impl fmt::Debug for GossipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipConfig")
            .field("name", &self.name)
            .field("bind_addr", &self.bind_addr)
            .field("advertise_addr", &self.advertise_addr)
            .field("secret", &"<redacted>")
            .field("protocol_version", &self.protocol_version)
            .field("gossip_interval", &self.gossip_interval)
            .field("dead_timeout", &self.dead_timeout)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Peers cannot dial a wildcard address, so binding one needs an explicit
/// advertise address
fn require_advertise(bind_addr: SocketAddr, advertise_addr: Option<SocketAddr>) -> Result<()> {
    if advertise_addr.is_none() && bind_addr.ip().is_unspecified() {
        return Err(Error::Config(format!(
            "advertise address required when binding {}",
            bind_addr
        )));
    }
    Ok(())
}

fn parse_addr(kind: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Config(format!("invalid {} address '{}': {}", kind, addr, e)))
}

/// Gossip membership transport
pub struct Gossip {
    local: Node,
    codec: FrameCodec,
    table: Mutex<MemberTable>,
    delegate: Arc<dyn ClusterDelegate>,
    timeout: Duration,
    gossip_interval: Duration,
}

impl Gossip {
    /// Bind the listener and start the accept and gossip loops
    ///
    /// Both loops stop when `shutdown` is cancelled.
    pub async fn bind(
        config: GossipConfig,
        delegate: Arc<dyn ClusterDelegate>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        require_advertise(config.bind_addr, config.advertise_addr)?;
        let codec = FrameCodec::new(&config.secret, config.protocol_version)?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let bound = listener.local_addr()?;
        let advertise = config.advertise_addr.unwrap_or(bound);

        let local = Node::new(config.name.clone(), advertise);
        // Wall-clock start keeps heartbeats increasing across restarts
        let heartbeat = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let meta = delegate.node_meta(MAX_META_BYTES);
        let table = MemberTable::new(
            local.clone(),
            heartbeat,
            meta,
            config.dead_timeout,
            Instant::now(),
        );

        let gossip = Arc::new(Self {
            local,
            codec,
            table: Mutex::new(table),
            delegate,
            timeout: config.timeout,
            gossip_interval: config.gossip_interval,
        });

        info!(node = %gossip.local, bind = %bound, "Gossip transport listening");

        let acceptor = gossip.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            acceptor.run_accept(listener, accept_shutdown).await;
        });

        let gossiper = gossip.clone();
        tokio::spawn(async move {
            gossiper.run_gossip(shutdown).await;
        });

        Ok(gossip)
    }

    /// The local node as advertised to peers
    pub fn local_node(&self) -> &Node {
        &self.local
    }

    async fn run_accept(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Gossip listener stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gossip = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = gossip.handle_connection(stream).await {
                                debug!(%peer, error = %e, "Gossip connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept gossip connection"),
                },
            }
        }
    }

    async fn run_gossip(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.gossip_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Gossip loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let (events, peer) = {
                let mut table = self.table.lock();
                table.tick(now);
                (table.reap(now), table.random_peer())
            };
            self.dispatch(events);

            if let Some(peer) = peer {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = self.push_pull(peer.addr, false) => {
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "Push-pull failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            match self.codec.read(&mut stream).await? {
                Message::PushPull {
                    join,
                    members,
                    state,
                    broadcasts,
                } => {
                    self.apply_remote(members, &state, broadcasts, join);
                    let reply = self.local_message(join);
                    self.codec.write(&mut stream, &reply).await
                }
                Message::User(data) => {
                    self.delegate.notify_msg(&data);
                    self.codec.write(&mut stream, &Message::Ack).await
                }
                Message::Ack => Err(Error::Transport("unexpected ack".to_string())),
            }
        })
        .await?
    }

    fn local_message(&self, join: bool) -> Message {
        let members = self.table.lock().digests();
        Message::PushPull {
            join,
            members,
            state: self.delegate.local_state(join),
            broadcasts: self.delegate.broadcasts(0, MAX_BROADCAST_BYTES),
        }
    }

    fn apply_remote(&self, members: Vec<Digest>, state: &[u8], broadcasts: Vec<Vec<u8>>, join: bool) {
        let events = self.table.lock().merge(members, Instant::now());
        self.dispatch(events);

        if !state.is_empty() {
            self.delegate.merge_remote_state(state, join);
        }
        for broadcast in broadcasts {
            self.delegate.notify_msg(&broadcast);
        }
    }

    /// Deliver membership events; must be called without the table lock
    fn dispatch(&self, events: Vec<MemberEvent>) {
        for event in events {
            match event {
                MemberEvent::Join(node) => self.delegate.notify_join(&node),
                MemberEvent::Leave(node) => self.delegate.notify_leave(&node),
                MemberEvent::Update(node) => self.delegate.notify_update(&node),
            }
        }
    }

    async fn request(&self, addr: SocketAddr, message: &Message) -> Result<Message> {
        tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::Transport(format!("connect to {} failed: {}", addr, e)))?;
            self.codec.write(&mut stream, message).await?;
            self.codec.read(&mut stream).await
        })
        .await?
    }

    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let outgoing = self.local_message(join);
        match self.request(addr, &outgoing).await? {
            Message::PushPull {
                members,
                state,
                broadcasts,
                ..
            } => {
                self.apply_remote(members, &state, broadcasts, join);
                Ok(())
            }
            other => Err(Error::Transport(format!(
                "unexpected push-pull reply from {}: {:?}",
                addr, other
            ))),
        }
    }

    /// Announce departure to every live peer
    pub async fn leave(&self) -> Result<()> {
        let peers = {
            let mut table = self.table.lock();
            table.leave_local(Instant::now());
            table.peers()
        };

        for peer in &peers {
            if let Err(e) = self.push_pull(peer.addr, false).await {
                debug!(peer = %peer, error = %e, "Failed to announce leave");
            }
        }
        info!(node = %self.local, peers = peers.len(), "Left cluster");
        Ok(())
    }
}

#[async_trait]
impl Membership for Gossip {
    fn members(&self) -> Vec<Node> {
        self.table.lock().live()
    }

    fn member_count(&self) -> usize {
        self.table.lock().live_count()
    }

    async fn join(&self, seeds: &[String]) -> Result<usize> {
        if seeds.is_empty() {
            return Ok(0);
        }

        let mut joined = 0;
        for seed in seeds {
            let addrs = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => addrs.collect::<Vec<_>>(),
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Unable to resolve seed");
                    continue;
                }
            };
            let Some(addr) = addrs.into_iter().find(|addr| *addr != self.local.addr) else {
                continue;
            };

            match self.push_pull(addr, true).await {
                Ok(()) => joined += 1,
                Err(e) => warn!(seed = %seed, error = %e, "Failed to join seed"),
            }
        }

        if joined == 0 {
            return Err(Error::Cluster(format!(
                "unable to join any of {} seeds",
                seeds.len()
            )));
        }
        info!(node = %self.local, joined, members = self.member_count(), "Joined cluster");
        Ok(joined)
    }

    async fn send_reliable(&self, node: &Node, message: Vec<u8>) -> Result<()> {
        match self.request(node.addr, &Message::User(message)).await? {
            Message::Ack => Ok(()),
            other => Err(Error::Transport(format!(
                "unexpected reply from {}: {:?}",
                node, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_short_secret() {
        let err = GossipConfig::new("node-a", "127.0.0.1:0", None, vec![0u8; 31]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(format!("{}", err).contains("32 bytes"));
    }

    #[test]
    fn test_config_rejects_bad_addresses() {
        let secret = vec![0u8; SECRET_LEN];
        assert!(GossipConfig::new("node-a", "not-an-address", None, secret.clone()).is_err());
        assert!(GossipConfig::new("node-a", "127.0.0.1:0", Some("nope"), secret.clone()).is_err());
        assert!(GossipConfig::new("node-a", "0.0.0.0:7946", Some("0.0.0.0:7946"), secret).is_err());
    }

    #[test]
    fn test_config_requires_advertise_for_wildcard_bind() {
        let secret = vec![0u8; SECRET_LEN];
        for bind in ["0.0.0.0:7946", "[::]:7946"] {
            let err = GossipConfig::new("node-a", bind, None, secret.clone()).unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(format!("{}", err).contains("advertise address required"));
        }

        let config =
            GossipConfig::new("node-a", "0.0.0.0:7946", Some("10.0.0.5:7946"), secret).unwrap();
        assert_eq!(config.advertise_addr, Some("10.0.0.5:7946".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_bind_rejects_wildcard_without_advertise() {
        struct Silent;
        impl ClusterDelegate for Silent {
            fn notify_join(&self, _node: &Node) {}
            fn notify_leave(&self, _node: &Node) {}
            fn notify_update(&self, _node: &Node) {}
            fn notify_msg(&self, _data: &[u8]) {}
        }

        let mut config =
            GossipConfig::new("node-a", "127.0.0.1:0", None, vec![0u8; SECRET_LEN]).unwrap();
        config.bind_addr = "0.0.0.0:0".parse().unwrap();

        let shutdown = CancellationToken::new();
        let result = Gossip::bind(config, Arc::new(Silent), shutdown.clone()).await;
        assert!(matches!(result, Err(Error::Config(_))));
        shutdown.cancel();
    }

    #[test]
    fn test_config_rejects_empty_name() {
        assert!(GossipConfig::new("", "127.0.0.1:0", None, vec![0u8; SECRET_LEN]).is_err());
    }

    #[test]
    fn test_config_debug_hides_secret() {
        let config =
            GossipConfig::new("node-a", "127.0.0.1:0", None, vec![0xAB; SECRET_LEN]).unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("171"));
    }
}
