//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RTUN_ADMIN_KEY`, `RTUN_LISTEN`,
//!    `RTUN_RELAY_URL`
//! 2. **Config file** — path via `--config <path>`, or `rtun.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:1440"
//! data_dir = "/var/lib/rtun"
//!
//! [auth]
//! admin_key = "your-admin-key"
//! [auth.tenants]
//! "tenant-token-1" = "acme"
//! "tenant-token-2" = "globex"
//!
//! [tunnel]
//! url = "wss://relay.example.com/api/tunnel"
//! link_key = "shared-secret"
//! max_reconnect_attempts = 10
//! reconnect_base_delay_secs = 2
//! reconnect_max_delay_secs = 60
//! heartbeat_interval_secs = 30
//! # heartbeat_timeout_secs = 45     # defaults to 1.5x the interval
//! max_frame_bytes = 1048576         # 1 MiB
//!
//! [queue]
//! capacity = 100
//! backpressure_threshold = 0.8
//!
//! [limits]
//! default_tier = "standard"
//! per_source_address = false
//! combine = "all"                   # "all" = every dimension must admit
//! bucket_idle_secs = 900
//! [limits.tiers.standard]
//! capacity = 100
//! refill_per_min = 100.0
//! [limits.assignments]
//! acme = "standard"
//!
//! [pool]
//! max_sessions_per_identity = 3
//! max_channels_per_session = 10
//! idle_timeout_secs = 300
//! sweep_interval_secs = 60
//!
//! [breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! reset_timeout_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP management surface and data directory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:1440`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persistent data (queue mirrors). Default `/var/lib/rtun`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Authentication settings.
///
/// Token issuance itself is external; this table only maps already-issued
/// pre-shared tokens to tenant identities.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Admin key for the privileged diagnostics surface. Override with
    /// `RTUN_ADMIN_KEY`. Defaults to `"change-me"` which triggers a startup
    /// warning.
    #[serde(default = "default_admin_key")]
    pub admin_key: String,
    /// Tenant bearer token → identity.
    #[serde(default)]
    pub tenants: HashMap<String, String>,
}

/// Tunnel link settings — reconnect policy, heartbeat, frame ceiling.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Relay URL (e.g. `wss://relay.example.com/api/tunnel`). When unset the
    /// gateway runs with the link down and queues everything.
    pub url: Option<String>,
    /// Shared secret sent in the link handshake.
    #[serde(default)]
    pub link_key: String,
    /// Reconnect attempts before the link is declared failed (default 10).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Initial backoff delay in seconds (default 2).
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_secs: u64,
    /// Backoff ceiling in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between heartbeat probes (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait for a pong before declaring the link dead.
    /// Defaults to 1.5x the probe interval.
    pub heartbeat_timeout_secs: Option<u64>,
    /// Frame size ceiling in bytes (default 1 MiB). Oversized frames are
    /// rejected before send.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl TunnelConfig {
    /// Effective pong timeout: configured value, else 1.5x the interval.
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_timeout_secs
                .unwrap_or(self.heartbeat_interval_secs * 3 / 2),
        )
    }
}

/// Per-tenant request queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum buffered operations per identity (default 100).
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Fill fraction at which the advisory backpressure signal fires
    /// (default 0.8).
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: f64,
}

/// One rate-limit tier: bucket capacity and refill rate.
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub capacity: f64,
    pub refill_per_min: f64,
}

/// How multiple limiting dimensions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinePolicy {
    /// Every configured dimension must admit (AND).
    All,
    /// Any admitting dimension is enough (OR).
    Any,
}

/// Rate limiter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Tier used for identities without an explicit assignment.
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
    /// Tier table. Always contains at least `standard` (100 tokens,
    /// 100/min).
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, TierConfig>,
    /// Identity → tier name.
    #[serde(default)]
    pub assignments: HashMap<String, String>,
    /// Also limit per source address (default false).
    #[serde(default)]
    pub per_source_address: bool,
    /// Combine policy when several dimensions are configured (default all).
    #[serde(default = "default_combine")]
    pub combine: CombinePolicy,
    /// Seconds of inactivity before an identity's buckets are evicted
    /// (default 900).
    #[serde(default = "default_bucket_idle")]
    pub bucket_idle_secs: u64,
}

impl LimitsConfig {
    /// Resolve the tier for an identity, falling back to the default tier.
    pub fn tier_for(&self, identity: &str) -> TierConfig {
        let name = self
            .assignments
            .get(identity)
            .unwrap_or(&self.default_tier);
        self.tiers
            .get(name)
            .cloned()
            .unwrap_or_else(|| TierConfig {
                capacity: 100.0,
                refill_per_min: 100.0,
            })
    }
}

/// Backend session pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Sessions one identity may hold at once (default 3).
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_identity: usize,
    /// Channels multiplexed per session (default 10).
    #[serde(default = "default_max_channels")]
    pub max_channels_per_session: u32,
    /// Seconds a session may sit unused before eviction (default 300).
    #[serde(default = "default_pool_idle")]
    pub idle_timeout_secs: u64,
    /// Seconds between eviction sweeps (default 60).
    #[serde(default = "default_pool_sweep")]
    pub sweep_interval_secs: u64,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens (default 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes (default 2).
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds spent open before probing recovery (default 60).
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:1440".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/rtun".to_string()
}
fn default_admin_key() -> String {
    "change-me".to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_base_delay() -> u64 {
    2
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1 MiB
}
fn default_queue_capacity() -> usize {
    100
}
fn default_backpressure_threshold() -> f64 {
    0.8
}
fn default_tier_name() -> String {
    "standard".to_string()
}
fn default_tiers() -> HashMap<String, TierConfig> {
    let mut tiers = HashMap::new();
    tiers.insert(
        "standard".to_string(),
        TierConfig {
            capacity: 100.0,
            refill_per_min: 100.0,
        },
    );
    tiers
}
fn default_combine() -> CombinePolicy {
    CombinePolicy::All
}
fn default_bucket_idle() -> u64 {
    900
}
fn default_max_sessions() -> usize {
    3
}
fn default_max_channels() -> u32 {
    10
}
fn default_pool_idle() -> u64 {
    300
}
fn default_pool_sweep() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_key: default_admin_key(),
            tenants: HashMap::new(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            url: None,
            link_key: String::new(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_secs: default_reconnect_base_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: None,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            backpressure_threshold: default_backpressure_threshold(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier_name(),
            tiers: default_tiers(),
            assignments: HashMap::new(),
            per_source_address: false,
            combine: default_combine(),
            bucket_idle_secs: default_bucket_idle(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_identity: default_max_sessions(),
            max_channels_per_session: default_max_channels(),
            idle_timeout_secs: default_pool_idle(),
            sweep_interval_secs: default_pool_sweep(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            tunnel: TunnelConfig::default(),
            queue: QueueConfig::default(),
            limits: LimitsConfig::default(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `rtun.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("rtun.toml").exists() {
            let content = std::fs::read_to_string("rtun.toml").expect("Failed to read rtun.toml");
            toml::from_str(&content).expect("Failed to parse rtun.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("RTUN_ADMIN_KEY") {
            config.auth.admin_key = key;
        }
        if let Ok(listen) = std::env::var("RTUN_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("RTUN_RELAY_URL") {
            config.tunnel.url = Some(url);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").expect("parse empty config");
        assert_eq!(config.server.listen, "0.0.0.0:1440");
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.pool.max_sessions_per_identity, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.tunnel.max_reconnect_attempts, 10);
        assert_eq!(config.limits.combine, CombinePolicy::All);
    }

    #[test]
    fn pong_timeout_defaults_to_one_and_a_half_intervals() {
        let config = TunnelConfig::default();
        assert_eq!(config.pong_timeout(), Duration::from_secs(45));

        let explicit = TunnelConfig {
            heartbeat_timeout_secs: Some(10),
            ..TunnelConfig::default()
        };
        assert_eq!(explicit.pong_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn tier_lookup_falls_back_to_default() {
        let mut limits = LimitsConfig::default();
        limits.tiers.insert(
            "premium".to_string(),
            TierConfig {
                capacity: 1000.0,
                refill_per_min: 1000.0,
            },
        );
        limits
            .assignments
            .insert("acme".to_string(), "premium".to_string());

        assert!((limits.tier_for("acme").capacity - 1000.0).abs() < f64::EPSILON);
        assert!((limits.tier_for("unknown").capacity - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tier_table_parses_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            per_source_address = true
            combine = "any"
            [limits.tiers.burst]
            capacity = 20
            refill_per_min = 600.0
            [limits.assignments]
            acme = "burst"
            "#,
        )
        .expect("parse tier config");
        assert!(config.limits.per_source_address);
        assert_eq!(config.limits.combine, CombinePolicy::Any);
        assert!((config.limits.tier_for("acme").refill_per_min - 600.0).abs() < f64::EPSILON);
    }
}
