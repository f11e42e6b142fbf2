//! Configuration for nodes, the relay server and the blob store.

use std::path::PathBuf;
use std::time::Duration;

/// Swarm node configuration, shared by every replica the node opens.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Upper bound on waiting for a publish acknowledgment during a local edit
    pub publish_timeout: Duration,
    /// Upper bound on a content store `put` or fetch
    pub store_timeout: Duration,
    /// Buffered failure reports per replica before slow readers lag
    pub report_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            report_capacity: 256,
        }
    }
}

impl NodeConfig {
    /// Create config for testing (short timeouts).
    pub fn for_testing() -> Self {
        Self {
            publish_timeout: Duration::from_millis(200),
            store_timeout: Duration::from_millis(200),
            report_capacity: 64,
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Maximum subscribers per topic
    pub max_peers_per_topic: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            broadcast_capacity: 256,
            max_peers_per_topic: 1024,
        }
    }
}

/// RocksDB blob store configuration.
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("swarmdoc_blobs"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl BlobStoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_default() {
        let config = NodeConfig::default();
        assert_eq!(config.publish_timeout, Duration::from_secs(5));
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.report_capacity, 256);
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9191");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_peers_per_topic, 1024);
    }

    #[test]
    fn test_blob_store_config_for_testing() {
        let config = BlobStoreConfig::for_testing("/tmp/blobs");
        assert_eq!(config.path, PathBuf::from("/tmp/blobs"));
        assert!(config.block_cache_size < BlobStoreConfig::default().block_cache_size);
        assert!(!config.sync_writes);
    }
}
