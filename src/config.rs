// src/config.rs

//! Client configuration: [`ClientOptions`] and the `redis://` / `rediss://` /
//! `unix://` URL parser that builds one. Grounded on the teacher's
//! `#[serde(default = "fn")]`-per-field style (see `SafetyConfig` in the
//! upstream `Config`) and on the `ConnectionAddr`/`ConnectionInfo` split used
//! by the redis-rs-family forks in `examples/other_examples/` for URL-derived
//! connection parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Where a [`crate::wire::Wire`] dials to. Mirrors the teacher's `AnyStream`
/// transport split, but as connection *parameters* rather than a live socket.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Unix { path } => write!(f, "unix:{path}"),
        }
    }
}

/// The topology a [`crate::client::Client`] was built for (spec §1/§4.7-§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    SingleNode,
    WithReplicas,
    Sentinel,
    Cluster,
}

/// Full connection and behavior configuration for a client, covering every
/// option in spec §6's table. Every field has a `#[serde(default = ...)]` so a
/// caller building this from a partial config file only needs to override
/// what they care about, matching the teacher's `SafetyConfig`/`MetricsConfig`
/// convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    pub addresses: Vec<Address>,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: i64,

    #[serde(default = "default_protocol")]
    pub protocol: u8,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_ring_scale")]
    pub ring_scale_per_conn: u32,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: Duration,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: Duration,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_retry_backoff")]
    pub min_retry_backoff: Duration,
    #[serde(default = "default_max_retry_backoff")]
    pub max_retry_backoff: Duration,

    #[serde(default)]
    pub enable_client_side_caching: bool,
    #[serde(default = "default_cache_size_each_conn")]
    pub cache_size_each_conn: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: Duration,

    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(default)]
    pub sentinel_master_name: Option<String>,

    #[serde(default = "default_cluster_refresh_interval")]
    pub cluster_refresh_interval: Duration,
    #[serde(default)]
    pub replica_only: bool,

    /// How long a wire may sit with no outbound write before the keepalive
    /// loop sends a `PING` (spec §6 `PingInterval`). Zero disables keepalive
    /// pings entirely.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: Duration,
    /// Hard cap on a wire's age before it is closed and redialed on next use
    /// (spec §6 `ConnLifetime`). Zero means unlimited.
    #[serde(default)]
    pub conn_lifetime: Duration,
    /// How long the writer loop may hold a flush open hoping more commands
    /// arrive to coalesce into the same write (spec §6 `MaxFlushDelay`).
    /// Zero still coalesces whatever is already queued, it just never waits
    /// for more.
    #[serde(default = "default_max_flush_delay")]
    pub max_flush_delay: Duration,
    /// Probes `INFO server` during the handshake for an `availability_zone`
    /// field (spec §4.3/§4.8 `EnableReplicaAZInfo`). Replica selection stays
    /// round-robin regardless; this only makes the zone available to future
    /// AZ-aware selectors.
    #[serde(default)]
    pub enable_replica_az_info: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            addresses: vec![Address::Tcp { host: "127.0.0.1".into(), port: 6379 }],
            username: None,
            password: None,
            database: 0,
            protocol: default_protocol(),
            pool_size: default_pool_size(),
            ring_scale_per_conn: default_ring_scale(),
            dial_timeout: default_dial_timeout(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            pool_timeout: default_pool_timeout(),
            idle_timeout: default_idle_timeout(),
            max_retries: default_max_retries(),
            min_retry_backoff: default_min_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
            enable_client_side_caching: false,
            cache_size_each_conn: default_cache_size_each_conn(),
            cache_ttl: default_cache_ttl(),
            tls: false,
            insecure_skip_verify: false,
            sentinel_master_name: None,
            cluster_refresh_interval: default_cluster_refresh_interval(),
            replica_only: false,
            ping_interval: default_ping_interval(),
            conn_lifetime: Duration::ZERO,
            max_flush_delay: default_max_flush_delay(),
            enable_replica_az_info: false,
        }
    }
}

fn default_protocol() -> u8 {
    3
}
fn default_pool_size() -> usize {
    4
}
fn default_ring_scale() -> u32 {
    8
}
fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_pool_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_max_retries() -> u32 {
    3
}
fn default_min_retry_backoff() -> Duration {
    Duration::from_millis(8)
}
fn default_max_retry_backoff() -> Duration {
    Duration::from_millis(512)
}
fn default_cache_size_each_conn() -> usize {
    10 * 1024 * 1024
}
fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_cluster_refresh_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_flush_delay() -> Duration {
    Duration::from_micros(100)
}

impl ClientOptions {
    /// Parses a connection string per spec §6: `redis://[user:pass@]host:port/db`,
    /// `rediss://...` (same, with TLS), or `unix:///path/to/socket?db=N`.
    /// Query parameters map onto the same fields a config struct would set,
    /// so `?protocol=2&pool_size=8` works the same as setting those fields directly.
    pub fn from_url(raw: &str) -> Result<Self, Error> {
        let url = Url::parse(raw)?;
        let mut opts = ClientOptions::default();

        match url.scheme() {
            "redis" => opts.tls = false,
            "rediss" => opts.tls = true,
            "unix" => {
                opts.addresses = vec![Address::Unix { path: url.path().to_string() }];
                apply_query(&mut opts, &url)?;
                return Ok(opts);
            }
            other => return Err(Error::Url(format!("unsupported scheme: {other}"))),
        }

        let host = url.host_str().unwrap_or("127.0.0.1").to_string();
        let port = url.port().unwrap_or(6379);
        opts.addresses = vec![Address::Tcp { host, port }];

        if !url.username().is_empty() {
            opts.username = Some(url.username().to_string());
        }
        if let Some(password) = url.password() {
            opts.password = Some(password.to_string());
        }
        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            opts.database =
                path.parse::<i64>().map_err(|_| Error::Url(format!("invalid database index: {path}")))?;
        }

        apply_query(&mut opts, &url)?;
        Ok(opts)
    }

    pub fn mode(&self) -> Mode {
        if self.sentinel_master_name.is_some() {
            Mode::Sentinel
        } else if self.addresses.len() > 1 {
            Mode::Cluster
        } else if self.replica_only {
            Mode::WithReplicas
        } else {
            Mode::SingleNode
        }
    }
}

fn apply_query(opts: &mut ClientOptions, url: &Url) -> Result<(), Error> {
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "protocol" => {
                opts.protocol =
                    value.parse().map_err(|_| Error::Url(format!("invalid protocol: {value}")))?
            }
            "pool_size" => {
                opts.pool_size =
                    value.parse().map_err(|_| Error::Url(format!("invalid pool_size: {value}")))?
            }
            "client_cache" => {
                opts.enable_client_side_caching = value == "true" || value == "1"
            }
            "master_name" => opts.sentinel_master_name = Some(value.to_string()),
            "replica_only" => opts.replica_only = value == "true" || value == "1",
            "insecure_skip_verify" => opts.insecure_skip_verify = value == "true" || value == "1",
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_redis_url() {
        let opts = ClientOptions::from_url("redis://user:pw@127.0.0.1:6380/2").unwrap();
        assert_eq!(opts.addresses, vec![Address::Tcp { host: "127.0.0.1".into(), port: 6380 }]);
        assert_eq!(opts.username.as_deref(), Some("user"));
        assert_eq!(opts.password.as_deref(), Some("pw"));
        assert_eq!(opts.database, 2);
        assert!(!opts.tls);
    }

    #[test]
    fn rediss_scheme_enables_tls() {
        let opts = ClientOptions::from_url("rediss://host:6379").unwrap();
        assert!(opts.tls);
    }

    #[test]
    fn unix_scheme_builds_a_unix_address() {
        let opts = ClientOptions::from_url("unix:///tmp/redis.sock?protocol=2").unwrap();
        assert_eq!(opts.addresses, vec![Address::Unix { path: "/tmp/redis.sock".into() }]);
        assert_eq!(opts.protocol, 2);
    }

    #[test]
    fn query_params_override_defaults() {
        let opts = ClientOptions::from_url("redis://host?client_cache=true&pool_size=16").unwrap();
        assert!(opts.enable_client_side_caching);
        assert_eq!(opts.pool_size, 16);
    }

    #[test]
    fn mode_is_derived_from_options() {
        let mut opts = ClientOptions::default();
        assert_eq!(opts.mode(), Mode::SingleNode);
        opts.sentinel_master_name = Some("mymaster".into());
        assert_eq!(opts.mode(), Mode::Sentinel);
    }
}
