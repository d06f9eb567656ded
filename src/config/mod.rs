//! Configuration management for zaguan.
//!
//! Two files drive the process: the process config (connection cap,
//! reload interval, logging) loaded once at startup, and the cluster
//! config file (a `[[clusters]]` array) that is re-read on a fixed
//! interval to hot-swap live clusters.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy-wide settings
    pub proxy: ProxyConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Proxy-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Maximum number of concurrent client connections, 0 disables the cap
    #[serde(default)]
    pub max_connections: i32,
    /// Interval between cluster config file polls, in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig {
                max_connections: 0,
                monitor_interval_ms: default_monitor_interval_ms(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.max_connections < 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must not be negative".to_string(),
            ));
        }

        if self.proxy.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_interval_ms must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        Ok(())
    }

    /// Poll interval for the cluster config monitor
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.proxy.monitor_interval_ms)
    }
}

/// Cache backend flavor a cluster speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Memcache,
    MemcacheBinary,
    Redis,
    RedisCluster,
}

impl CacheType {
    /// Whether backends of this type speak RESP
    pub fn is_redis(self) -> bool {
        matches!(self, CacheType::Redis | CacheType::RedisCluster)
    }
}

/// Listener transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenProto {
    #[default]
    Tcp,
    Unix,
}

/// Key hashing function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashMethod {
    #[default]
    Fnv1a64,
    Crc16,
}

/// Key-to-node placement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashDistribution {
    #[default]
    Ketama,
    Modula,
}

fn default_dial_timeout_ms() -> u64 {
    1000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_node_connections() -> usize {
    2
}

/// One listener plus its backing pool.
///
/// `name` is the stable identity across reloads; `id` and `sn` are
/// runtime-assigned (dense registry index, monotone generation stamp) and
/// never read from the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(skip)]
    pub id: i32,
    #[serde(skip)]
    pub sn: i32,
    #[serde(default)]
    pub listen_proto: ListenProto,
    pub listen_addr: String,
    pub cache_type: CacheType,
    #[serde(default)]
    pub hash_method: HashMethod,
    #[serde(default)]
    pub hash_distribution: HashDistribution,
    /// Two-character routing tag, e.g. "{}"; empty disables tagging
    #[serde(default)]
    pub hash_tag: String,
    /// Password sent to redis backends after dialing; empty disables AUTH
    #[serde(default)]
    pub redis_auth: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Pooled connections kept per backend node
    #[serde(default = "default_node_connections")]
    pub node_connections: usize,
    /// Consecutive ping failures before a node is considered down, 0
    /// disables pinging
    #[serde(default)]
    pub ping_fail_limit: u32,
    /// Eject failing nodes from the ring until a ping succeeds again
    #[serde(default)]
    pub ping_auto_eject: bool,
    /// Forcibly close existing client connections when the backing pool
    /// changes
    #[serde(default)]
    pub close_when_change: bool,
    /// Backend endpoints, `host:port` with an optional `:weight` suffix
    pub servers: Vec<String>,
}

impl ClusterConfig {
    /// Ensure this cluster entry is usable
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "cluster name cannot be empty".to_string(),
            ));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} has an empty listen address",
                self.name
            )));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} declares no servers",
                self.name
            )));
        }
        for server in &self.servers {
            parse_server(server).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "cluster {} has an invalid server {server}: {e}",
                    self.name
                ))
            })?;
        }
        if !self.hash_tag.is_empty() && self.hash_tag.len() != 2 {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} hash_tag must be exactly two characters",
                self.name
            )));
        }
        if self.dial_timeout_ms == 0 || self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} timeouts must be greater than 0",
                self.name
            )));
        }
        if self.node_connections == 0 {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} node_connections must be greater than 0",
                self.name
            )));
        }
        if !self.redis_auth.is_empty() && !self.cache_type.is_redis() {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} sets redis_auth on a non-redis cache type",
                self.name
            )));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Split a `host:port[:weight]` server entry into endpoint and weight
pub fn parse_server(server: &str) -> Result<(&str, usize), String> {
    let mut parts = server.rsplitn(2, ':');
    let tail = parts.next().unwrap_or_default();
    let head = parts.next();

    // a trailing small integer is a weight, anything else is the port
    if let (Some(head), Ok(weight)) = (head, tail.parse::<usize>()) {
        if head.contains(':') && weight > 0 && weight <= 1024 {
            return Ok((head, weight));
        }
    }
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    port.parse::<u16>().map_err(|e| e.to_string())?;
    Ok((server, 1))
}

/// The shape of the polled cluster config file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterConfFile {
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
}

/// Load the cluster config file: a TOML document with a `[[clusters]]`
/// array. Names must be unique; every entry is validated.
pub fn load_cluster_conf<P: AsRef<Path>>(path: P) -> Result<Vec<ClusterConfig>, ConfigError> {
    let content = fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let file: ClusterConfFile =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let mut names = HashSet::new();
    for cluster in &file.clusters {
        cluster.ensure_valid()?;
        if !names.insert(cluster.name.clone()) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate cluster name: {}",
                cluster.name
            )));
        }
    }
    Ok(file.clusters)
}

/// Write an example cluster config file for the given cache type
pub fn create_example_cluster_conf<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
    let cluster = match mode {
        "memcache" => ClusterConfig {
            name: "mc-main".to_string(),
            id: 0,
            sn: 0,
            listen_proto: ListenProto::Tcp,
            listen_addr: "0.0.0.0:11211".to_string(),
            cache_type: CacheType::Memcache,
            hash_method: HashMethod::default(),
            hash_distribution: HashDistribution::default(),
            hash_tag: String::new(),
            redis_auth: String::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            node_connections: default_node_connections(),
            ping_fail_limit: 3,
            ping_auto_eject: true,
            close_when_change: false,
            servers: vec![
                "10.0.1.10:11211:1".to_string(),
                "10.0.1.11:11211:1".to_string(),
            ],
        },
        "redis" => ClusterConfig {
            name: "rd-main".to_string(),
            id: 0,
            sn: 0,
            listen_proto: ListenProto::Tcp,
            listen_addr: "0.0.0.0:6379".to_string(),
            cache_type: CacheType::Redis,
            hash_method: HashMethod::default(),
            hash_distribution: HashDistribution::default(),
            hash_tag: "{}".to_string(),
            redis_auth: String::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            node_connections: default_node_connections(),
            ping_fail_limit: 3,
            ping_auto_eject: false,
            close_when_change: false,
            servers: vec!["10.0.1.20:6379".to_string(), "10.0.1.21:6379".to_string()],
        },
        _ => {
            return Err(ConfigError::ValidationError(
                "mode must be 'memcache' or 'redis'".to_string(),
            ))
        }
    };

    let file = ClusterConfFile {
        clusters: vec![cluster],
    };
    let content =
        toml::to_string_pretty(&file).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
    fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
    Ok(())
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("serialize error: {0}")]
    SerializeError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Baseline cluster config for tests across the crate
#[cfg(test)]
pub(crate) fn test_cluster(name: &str, listen_addr: &str) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        id: 0,
        sn: 0,
        listen_proto: ListenProto::Tcp,
        listen_addr: listen_addr.to_string(),
        cache_type: CacheType::Redis,
        hash_method: HashMethod::default(),
        hash_distribution: HashDistribution::default(),
        hash_tag: String::new(),
        redis_auth: String::new(),
        dial_timeout_ms: 1000,
        read_timeout_ms: 1000,
        write_timeout_ms: 1000,
        node_connections: 2,
        ping_fail_limit: 0,
        ping_auto_eject: false,
        close_when_change: false,
        servers: vec!["127.0.0.1:6379".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.monitor_interval_ms, 1000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.proxy.monitor_interval_ms = 0;
        assert!(config.validate().is_err());

        config.proxy.monitor_interval_ms = 500;
        assert!(config.validate().is_ok());

        config.logging.level = "noisy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.proxy.max_connections, 0);
    }

    #[test]
    fn test_cluster_config_validation() {
        let mut cluster = test_cluster("rd", "0.0.0.0:6379");
        assert!(cluster.ensure_valid().is_ok());

        cluster.servers.clear();
        assert!(cluster.ensure_valid().is_err());

        cluster.servers = vec!["not-an-endpoint".to_string()];
        assert!(cluster.ensure_valid().is_err());

        cluster.servers = vec!["127.0.0.1:6379".to_string()];
        cluster.hash_tag = "{".to_string();
        assert!(cluster.ensure_valid().is_err());

        cluster.hash_tag = "{}".to_string();
        assert!(cluster.ensure_valid().is_ok());
    }

    #[test]
    fn test_redis_auth_requires_redis() {
        let mut cluster = test_cluster("mc", "0.0.0.0:11211");
        cluster.cache_type = CacheType::Memcache;
        cluster.redis_auth = "secret".to_string();
        assert!(cluster.ensure_valid().is_err());
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("127.0.0.1:6379").unwrap(), ("127.0.0.1:6379", 1));
        assert_eq!(parse_server("127.0.0.1:6379:4").unwrap(), ("127.0.0.1:6379", 4));
        assert!(parse_server("localhost").is_err());
        assert!(parse_server(":6379").is_err());
    }

    #[test]
    fn test_load_cluster_conf() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[clusters]]
name = "mc"
listen_addr = "0.0.0.0:11211"
cache_type = "memcache"
servers = ["10.0.0.1:11211", "10.0.0.2:11211"]

[[clusters]]
name = "rd"
listen_addr = "0.0.0.0:6379"
cache_type = "redis_cluster"
hash_tag = "{{}}"
servers = ["10.0.0.1:6379:2"]
"#
        )
        .unwrap();

        let clusters = load_cluster_conf(file.path()).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "mc");
        assert_eq!(clusters[0].cache_type, CacheType::Memcache);
        assert_eq!(clusters[0].node_connections, 2);
        assert_eq!(clusters[1].cache_type, CacheType::RedisCluster);
        assert_eq!(clusters[1].hash_tag, "{}");
    }

    #[test]
    fn test_load_cluster_conf_duplicate_name() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[clusters]]
name = "mc"
listen_addr = "0.0.0.0:11211"
cache_type = "memcache"
servers = ["10.0.0.1:11211"]

[[clusters]]
name = "mc"
listen_addr = "0.0.0.0:11212"
cache_type = "memcache"
servers = ["10.0.0.1:11211"]
"#
        )
        .unwrap();

        assert!(matches!(
            load_cluster_conf(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_create_example_cluster_conf() {
        let temp_file = NamedTempFile::new().unwrap();
        create_example_cluster_conf(temp_file.path(), "redis").unwrap();

        let clusters = load_cluster_conf(temp_file.path()).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].cache_type, CacheType::Redis);

        assert!(create_example_cluster_conf(temp_file.path(), "mongodb").is_err());
    }
}
