//! Configuration default values.
//!
//! This module contains all the default values for configuration options,
//! making them easily changeable in one central location.

// Server / inbound
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 40114;
pub const DEFAULT_PROXY_PREFIX: &str = "/olla/";

// Network timeouts (seconds)
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 120;

// Streaming
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_CLIENT_DISCONNECT_BYTES_THRESHOLD: usize = 1024;
pub const DEFAULT_CLIENT_DISCONNECT_TIME_THRESHOLD_SECS: u64 = 5;
pub const DEFAULT_LAST_CHUNK_INLINE_CAPACITY: usize = 8 * 1024;

// Connection pooling
pub const DEFAULT_MAX_IDLE_CONNS: usize = 100;
pub const DEFAULT_MAX_CONNS_PER_HOST: usize = 50;
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 25;
pub const DEFAULT_IDLE_CONN_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_POOL_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_POOL_IDLE_THRESHOLD_SECS: u64 = 300;
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 32 * 1024;

// Circuit breaker
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS: u64 = 30;

// Rate limiting
pub const DEFAULT_GLOBAL_RPM: u64 = 6000;
pub const DEFAULT_PER_CLIENT_RPM: u64 = 600;
pub const DEFAULT_HEALTH_RPM: u64 = 600;
pub const DEFAULT_BURST_SIZE: u64 = 10;
pub const DEFAULT_RATE_LIMITER_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RATE_LIMITER_IDLE_TTL_SECS: u64 = 600;

// Size limits (0 or negative disables)
pub const DEFAULT_MAX_BODY_SIZE: i64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_HEADER_SIZE: i64 = 64 * 1024;

// Stats sweep
pub const DEFAULT_STATS_SWEEP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_ENDPOINT_STATS_TTL_SECS: u64 = 24 * 3600;
pub const DEFAULT_MODEL_STATS_TTL_SECS: u64 = 6 * 3600;
pub const DEFAULT_MAX_ENDPOINT_STATS: usize = 1000;
pub const DEFAULT_MAX_MODEL_STATS: usize = 50;
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 100;
pub const DEFAULT_MAX_CLIENTS_PER_MODEL: usize = 10_000;
