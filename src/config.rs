//! Server configuration and component assembly
//!
//! The binary maps its CLI flags and environment onto [`ServerConfig`];
//! [`ComponentFactory`] turns a validated config into the local store stack.

use crate::cluster::gossip::SECRET_LEN;
use crate::cluster::{ClusterConfig, GossipConfig};
use crate::store::{MemoryStore, RateLimitedStore, Store};
use crate::telemetry::parse_log_level;
use crate::{Error, Result};

use opentelemetry::metrics::Meter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default retention of partitions without new samples
pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(10 * 60);

/// Full server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique node name within the cluster
    pub node_name: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Gossip bind address
    pub cluster_bind: String,
    /// Gossip address advertised to peers
    pub cluster_advertise: Option<String>,
    /// Gossip seeds to join at startup
    pub seeds: Vec<String>,
    /// File holding the 32-byte cluster secret; clustering is off without one
    pub secret_file: Option<PathBuf>,
    /// Partitions whose newest sample is older than this are evicted
    pub store_ttl: Duration,
    /// Minimum interval between writes to one partition
    pub write_interval: Option<Duration>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: "telefed".to_string(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 9003)),
            cluster_bind: "0.0.0.0:7946".to_string(),
            cluster_advertise: None,
            seeds: Vec::new(),
            secret_file: None,
            store_ttl: DEFAULT_STORE_TTL,
            write_interval: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::Config("node name cannot be empty".to_string()));
        }
        if self.store_ttl.is_zero() {
            return Err(Error::Config("store TTL must be positive".to_string()));
        }
        if self.write_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::Config(
                "write interval must be positive when set".to_string(),
            ));
        }
        if self.secret_file.is_none() && !self.seeds.is_empty() {
            return Err(Error::Config(
                "joining seeds requires a cluster secret file".to_string(),
            ));
        }
        if self.cluster_enabled() && self.cluster_advertise.is_none() {
            let wildcard = self
                .cluster_bind
                .parse::<SocketAddr>()
                .is_ok_and(|addr| addr.ip().is_unspecified());
            if wildcard {
                return Err(Error::Config(format!(
                    "cluster advertise address required when binding {}",
                    self.cluster_bind
                )));
            }
        }
        parse_log_level(&self.log_level)?;
        Ok(())
    }

    pub fn cluster_enabled(&self) -> bool {
        self.secret_file.is_some()
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_name: self.node_name.clone(),
            ..Default::default()
        }
    }

    /// Gossip settings, loading the secret; `None` when clustering is off
    pub fn gossip_config(&self) -> Result<Option<GossipConfig>> {
        let Some(path) = &self.secret_file else {
            return Ok(None);
        };
        let secret = load_secret(path)?;
        GossipConfig::new(
            self.node_name.clone(),
            &self.cluster_bind,
            self.cluster_advertise.as_deref(),
            secret,
        )
        .map(Some)
    }
}

/// Read the cluster secret. A single trailing newline is ignored.
pub fn load_secret(path: &Path) -> Result<Vec<u8>> {
    let mut secret = std::fs::read(path).map_err(|e| {
        Error::Config(format!(
            "unable to read cluster secret {}: {}",
            path.display(),
            e
        ))
    })?;
    if secret.len() == SECRET_LEN + 1 && secret.last() == Some(&b'\n') {
        secret.pop();
    }
    if secret.len() != SECRET_LEN {
        return Err(Error::Config(format!(
            "invalid secret size, must be {} bytes: {}",
            SECRET_LEN,
            secret.len()
        )));
    }
    Ok(secret)
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the local store stack
    ///
    /// The memory store is always present; a rate limiter is layered on top
    /// when a write interval is configured.
    pub fn create_store(config: &ServerConfig, meter: &Meter) -> (Arc<MemoryStore>, Arc<dyn Store>) {
        let memory = Arc::new(MemoryStore::new(config.store_ttl, meter));
        info!(ttl_secs = config.store_ttl.as_secs(), "Using in-memory metric store");

        let store: Arc<dyn Store> = match config.write_interval {
            Some(interval) => {
                info!(interval_ms = interval.as_millis() as u64, "Rate limiting partition writes");
                Arc::new(RateLimitedStore::new(interval, memory.clone()))
            }
            None => memory.clone(),
        };

        (memory, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn secret_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ServerConfig {
            node_name: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            write_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            seeds: vec!["10.0.0.1:7946".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_advertise_for_wildcard_bind() {
        let file = secret_file(&[1u8; 32]);
        let config = ServerConfig {
            secret_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("advertise address required"));
        assert!(config.gossip_config().is_err());

        let config = ServerConfig {
            cluster_advertise: Some("10.0.0.5:7946".to_string()),
            ..config
        };
        config.validate().unwrap();
        let gossip = config.gossip_config().unwrap().unwrap();
        assert_eq!(gossip.advertise_addr, Some("10.0.0.5:7946".parse().unwrap()));
    }

    #[test]
    fn test_load_secret() {
        let file = secret_file(&[0x5a; 32]);
        assert_eq!(load_secret(file.path()).unwrap(), vec![0x5a; 32]);

        let mut with_newline = vec![b'k'; 32];
        with_newline.push(b'\n');
        let file = secret_file(&with_newline);
        assert_eq!(load_secret(file.path()).unwrap().len(), 32);
    }

    #[test]
    fn test_load_secret_rejects_wrong_size() {
        let file = secret_file(b"too-short");
        let err = load_secret(file.path()).unwrap_err();
        assert!(format!("{}", err).contains("must be 32 bytes: 9"));

        assert!(load_secret(Path::new("/nonexistent/telefed.secret")).is_err());
    }

    #[test]
    fn test_gossip_config_from_secret_file() {
        let file = secret_file(&[1u8; 32]);
        let config = ServerConfig {
            node_name: "node-a".to_string(),
            cluster_bind: "127.0.0.1:0".to_string(),
            secret_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let gossip = config.gossip_config().unwrap().unwrap();
        assert_eq!(gossip.name, "node-a");
        assert!(ServerConfig::default().gossip_config().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_store_applies_rate_limit() {
        let meter = opentelemetry::global::meter("test");
        let config = ServerConfig {
            write_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let (_memory, store) = ComponentFactory::create_store(&config, &meter);

        let batch = || {
            crate::store::PartitionedMetrics::new(
                "cluster-1",
                vec![crate::schema::MetricFamily {
                    name: Some("up".to_string()),
                    ..Default::default()
                }],
            )
        };
        store.write_metrics(batch()).await.unwrap();
        let err = store.write_metrics(batch()).await.unwrap_err();
        assert!(matches!(err, Error::WriteLimitReached { .. }));
    }
}
