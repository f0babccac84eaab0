//! Configuration surface for the Olla dataplane.
//!
//! Mirrors every tunable called out in the specification's "Configuration
//! surface" section. Durations are (de)serialized via [`duration_serde`] so
//! operators can write `"30s"` in `config.toml` instead of bare seconds.

pub mod defaults;
pub mod duration_serde;

use crate::domain::EndpointSpec;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub network: NetworkConfig,
    pub streaming: StreamingConfig,
    pub pool: PoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub size_limit: SizeLimitConfig,
    pub stats: StatsConfig,
    /// Static backend pool. Re-read only on process restart; there is no
    /// hot-reload in this implementation.
    pub endpoints: Vec<EndpointSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            network: NetworkConfig::default(),
            streaming: StreamingConfig::default(),
            pool: PoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            size_limit: SizeLimitConfig::default(),
            stats: StatsConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix stripped from the request before target-URL composition.
    pub proxy_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::DEFAULT_HOST.to_string(),
            port: defaults::DEFAULT_PORT,
            proxy_prefix: defaults::DEFAULT_PROXY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "duration_serde::duration")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_serde::duration")]
    pub keep_alive: Duration,
    #[serde(with = "duration_serde::duration")]
    pub read_timeout: Duration,
    #[serde(with = "duration_serde::duration")]
    pub response_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(defaults::DEFAULT_CONNECTION_TIMEOUT_SECS),
            keep_alive: Duration::from_secs(defaults::DEFAULT_KEEP_ALIVE_SECS),
            read_timeout: Duration::from_secs(defaults::DEFAULT_READ_TIMEOUT_SECS),
            response_timeout: Duration::from_secs(defaults::DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub stream_buffer_size: usize,
    pub client_disconnect_bytes_threshold: usize,
    #[serde(with = "duration_serde::duration")]
    pub client_disconnect_time_threshold: Duration,
    pub last_chunk_inline_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stream_buffer_size: defaults::DEFAULT_STREAM_BUFFER_SIZE,
            client_disconnect_bytes_threshold: defaults::DEFAULT_CLIENT_DISCONNECT_BYTES_THRESHOLD,
            client_disconnect_time_threshold: Duration::from_secs(
                defaults::DEFAULT_CLIENT_DISCONNECT_TIME_THRESHOLD_SECS,
            ),
            last_chunk_inline_capacity: defaults::DEFAULT_LAST_CHUNK_INLINE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle_conns: usize,
    pub max_conns_per_host: usize,
    pub max_idle_conns_per_host: usize,
    #[serde(with = "duration_serde::duration")]
    pub idle_conn_timeout: Duration,
    #[serde(with = "duration_serde::duration")]
    pub sweep_interval: Duration,
    #[serde(with = "duration_serde::duration")]
    pub idle_threshold: Duration,
    #[serde(with = "duration_serde::duration")]
    pub tls_handshake_timeout: Duration,
    pub max_response_header_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: defaults::DEFAULT_MAX_IDLE_CONNS,
            max_conns_per_host: defaults::DEFAULT_MAX_CONNS_PER_HOST,
            max_idle_conns_per_host: defaults::DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            idle_conn_timeout: Duration::from_secs(defaults::DEFAULT_IDLE_CONN_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(defaults::DEFAULT_POOL_SWEEP_INTERVAL_SECS),
            idle_threshold: Duration::from_secs(defaults::DEFAULT_POOL_IDLE_THRESHOLD_SECS),
            tls_handshake_timeout: Duration::from_secs(
                defaults::DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS,
            ),
            max_response_header_bytes: defaults::DEFAULT_MAX_RESPONSE_HEADER_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    #[serde(with = "duration_serde::duration")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            open_timeout: Duration::from_secs(defaults::DEFAULT_CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_rpm: u64,
    pub per_client_rpm: u64,
    pub health_rpm: u64,
    pub burst_size: u64,
    #[serde(with = "duration_serde::duration")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_serde::duration")]
    pub idle_ttl: Duration,
    pub trust_proxy_headers: bool,
    pub trusted_proxy_cidrs: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rpm: defaults::DEFAULT_GLOBAL_RPM,
            per_client_rpm: defaults::DEFAULT_PER_CLIENT_RPM,
            health_rpm: defaults::DEFAULT_HEALTH_RPM,
            burst_size: defaults::DEFAULT_BURST_SIZE,
            cleanup_interval: Duration::from_secs(
                defaults::DEFAULT_RATE_LIMITER_CLEANUP_INTERVAL_SECS,
            ),
            idle_ttl: Duration::from_secs(defaults::DEFAULT_RATE_LIMITER_IDLE_TTL_SECS),
            trust_proxy_headers: false,
            trusted_proxy_cidrs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeLimitConfig {
    /// 0 or negative disables the check.
    pub max_body_size: i64,
    /// 0 or negative disables the check.
    pub max_header_size: i64,
}

impl Default for SizeLimitConfig {
    fn default() -> Self {
        Self {
            max_body_size: defaults::DEFAULT_MAX_BODY_SIZE,
            max_header_size: defaults::DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    #[serde(with = "duration_serde::duration")]
    pub sweep_interval: Duration,
    #[serde(with = "duration_serde::duration")]
    pub endpoint_ttl: Duration,
    #[serde(with = "duration_serde::duration")]
    pub model_ttl: Duration,
    pub max_endpoints: usize,
    pub max_models: usize,
    pub reservoir_capacity: usize,
    pub max_clients_per_model: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(defaults::DEFAULT_STATS_SWEEP_INTERVAL_SECS),
            endpoint_ttl: Duration::from_secs(defaults::DEFAULT_ENDPOINT_STATS_TTL_SECS),
            model_ttl: Duration::from_secs(defaults::DEFAULT_MODEL_STATS_TTL_SECS),
            max_endpoints: defaults::DEFAULT_MAX_ENDPOINT_STATS,
            max_models: defaults::DEFAULT_MAX_MODEL_STATS,
            reservoir_capacity: defaults::DEFAULT_RESERVOIR_CAPACITY,
            max_clients_per_model: defaults::DEFAULT_MAX_CLIENTS_PER_MODEL,
        }
    }
}

impl Config {
    /// Load configuration from the file named by `$CONFIG_FILE` (default
    /// `config.toml`), writing out a generated default file on first run.
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }

    /// Parse the trusted-proxy CIDR list; invalid entries are logged and
    /// skipped rather than failing configuration load entirely.
    pub fn trusted_proxy_networks(&self) -> Vec<ipnet_like::IpCidr> {
        self.rate_limit
            .trusted_proxy_cidrs
            .iter()
            .filter_map(|raw| ipnet_like::IpCidr::parse(raw))
            .collect()
    }
}

/// Minimal CIDR matcher, avoiding a dependency for the one thing Olla needs
/// from it: "does this client IP fall in a trusted-proxy range".
pub mod ipnet_like {
    use super::IpAddr;

    #[derive(Debug, Clone, Copy)]
    pub struct IpCidr {
        network: IpAddr,
        prefix_len: u8,
    }

    impl IpCidr {
        pub fn parse(raw: &str) -> Option<Self> {
            let (addr_part, prefix_part) = raw.split_once('/')?;
            let network: IpAddr = addr_part.trim().parse().ok()?;
            let prefix_len: u8 = prefix_part.trim().parse().ok()?;
            Some(Self {
                network,
                prefix_len,
            })
        }

        pub fn contains(&self, addr: &IpAddr) -> bool {
            match (self.network, addr) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = if self.prefix_len >= 32 {
                        u32::MAX
                    } else {
                        !0u32 << (32 - self.prefix_len)
                    };
                    (u32::from(net) & mask) == (u32::from(*ip) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = if self.prefix_len >= 128 {
                        u128::MAX
                    } else {
                        !0u128 << (128 - self.prefix_len)
                    };
                    (u128::from(net) & mask) == (u128::from(*ip) & mask)
                }
                _ => false,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn matches_within_prefix() {
            let cidr = IpCidr::parse("10.0.0.0/8").unwrap();
            assert!(cidr.contains(&"10.1.2.3".parse().unwrap()));
            assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
        }

        #[test]
        fn rejects_malformed() {
            assert!(IpCidr::parse("not-a-cidr").is_none());
        }
    }
}
