//! Configuration for the graph access layer.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`GRAPHGATE__ACCESS__` prefix)
//! 2. Config file (`graphgate.toml`, `[access]` section)
//! 3. Defaults
//!
//! Durations are written in milliseconds. The struct is validated once when
//! the access context starts and is never mutated afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};
use crate::types::TierKind;

/// Top-level access layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Backend endpoints in failover order.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Upper bound on idle + in-use connections.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// How long `acquire` waits for an idle connection or free slot.
    #[serde(default = "default_acquisition_timeout", with = "duration_ms")]
    pub acquisition_timeout: Duration,

    #[serde(default = "default_max_connection_lifetime", with = "duration_ms")]
    pub max_connection_lifetime: Duration,

    #[serde(default = "default_idle_timeout", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Use TLS schemes (`bolt+s`, `neo4j+s`) for every endpoint.
    #[serde(default)]
    pub encrypted: bool,

    #[serde(default)]
    pub tiers: TierConfigs,

    /// Aggregate byte budget shared by all four cache tiers.
    #[serde(default = "default_global_memory_budget_mb")]
    pub global_memory_budget_mb: u64,

    /// Alert thresholds keyed by operation type.
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, ThresholdConfig>,

    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    #[serde(default = "default_query_timeout", with = "duration_ms")]
    pub query_timeout: Duration,

    /// Period of the endpoint probe / idle reaper task.
    #[serde(default = "default_health_check_interval", with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Period of the cache TTL sweep task.
    #[serde(default = "default_sweep_interval", with = "duration_ms")]
    pub sweep_interval: Duration,

    /// Capacity of the monitor's recent-metrics ring buffer.
    #[serde(default = "default_metrics_buffer_size")]
    pub metrics_buffer_size: usize,

    /// Sample process memory around each monitored operation.
    #[serde(default = "default_true")]
    pub sample_memory: bool,

    /// Period of the background memory sampler.
    #[serde(default = "default_memory_sample_interval", with = "duration_ms")]
    pub memory_sample_interval: Duration,
}

/// Per-tier cache limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    pub max_entries: usize,
    pub ttl_seconds: u64,
    #[serde(default = "default_tier_size_mb")]
    pub max_size_mb: u64,
}

impl TierConfig {
    pub fn new(max_entries: usize, ttl_seconds: u64) -> Self {
        Self {
            max_entries,
            ttl_seconds,
            max_size_mb: default_tier_size_mb(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn max_size_bytes(&self) -> usize {
        mb_to_bytes(self.max_size_mb)
    }
}

/// Limits for each of the four tiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfigs {
    #[serde(default = "default_node_tier")]
    pub node: TierConfig,
    #[serde(default = "default_search_tier")]
    pub search: TierConfig,
    #[serde(default = "default_relationship_tier")]
    pub relationship: TierConfig,
    #[serde(default = "default_traversal_tier")]
    pub traversal: TierConfig,
}

impl TierConfigs {
    pub fn get(&self, tier: TierKind) -> &TierConfig {
        match tier {
            TierKind::Node => &self.node,
            TierKind::Search => &self.search,
            TierKind::Relationship => &self.relationship,
            TierKind::Traversal => &self.traversal,
        }
    }
}

impl Default for TierConfigs {
    fn default() -> Self {
        Self {
            node: default_node_tier(),
            search: default_search_tier(),
            relationship: default_relationship_tier(),
            traversal: default_traversal_tier(),
        }
    }
}

/// Alert threshold for one operation type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    #[serde(with = "duration_ms")]
    pub max_duration: Duration,
    /// Maximum process memory growth in megabytes.
    #[serde(default)]
    pub max_memory_delta: Option<f64>,
}

impl AccessConfig {
    /// Load from `{file_prefix}.toml` (optional) layered under `GRAPHGATE__` env vars.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("GRAPHGATE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("access.endpoints")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AccessError::Config(e.to_string()))?;

        match cfg.get::<AccessConfig>("access") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => {
                tracing::debug!(file_prefix, "No [access] section found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AccessError::Config(e.to_string())),
        }
    }

    /// Check every cross-field constraint. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(AccessError::Config("at least one endpoint is required".into()));
        }
        if self.max_pool_size == 0 {
            return Err(AccessError::Config("max_pool_size must be positive".into()));
        }
        for (name, d) in [
            ("acquisition_timeout", self.acquisition_timeout),
            ("max_connection_lifetime", self.max_connection_lifetime),
            ("idle_timeout", self.idle_timeout),
            ("query_timeout", self.query_timeout),
            ("health_check_interval", self.health_check_interval),
            ("sweep_interval", self.sweep_interval),
            ("memory_sample_interval", self.memory_sample_interval),
        ] {
            if d.is_zero() {
                return Err(AccessError::Config(format!("{name} must be positive")));
            }
        }
        if self.fetch_size == 0 {
            return Err(AccessError::Config("fetch_size must be positive".into()));
        }
        if self.metrics_buffer_size == 0 {
            return Err(AccessError::Config(
                "metrics_buffer_size must be positive".into(),
            ));
        }
        let budget = self.global_memory_budget_bytes();
        for tier in TierKind::LOCK_ORDER {
            let t = self.tiers.get(tier);
            if t.max_entries == 0 {
                return Err(AccessError::Config(format!(
                    "tiers.{tier}.max_entries must be positive"
                )));
            }
            if t.max_size_bytes() > budget {
                return Err(AccessError::Config(format!(
                    "tiers.{tier}.max_size_mb ({}) exceeds global_memory_budget_mb ({})",
                    t.max_size_mb, self.global_memory_budget_mb
                )));
            }
        }
        for (op, threshold) in &self.thresholds {
            if threshold.max_duration.is_zero() {
                return Err(AccessError::Config(format!(
                    "thresholds.{op}.max_duration must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn global_memory_budget_bytes(&self) -> usize {
        mb_to_bytes(self.global_memory_budget_mb)
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            user: default_user(),
            password: String::new(),
            max_pool_size: default_max_pool_size(),
            acquisition_timeout: default_acquisition_timeout(),
            max_connection_lifetime: default_max_connection_lifetime(),
            idle_timeout: default_idle_timeout(),
            encrypted: false,
            tiers: TierConfigs::default(),
            global_memory_budget_mb: default_global_memory_budget_mb(),
            thresholds: default_thresholds(),
            fetch_size: default_fetch_size(),
            query_timeout: default_query_timeout(),
            health_check_interval: default_health_check_interval(),
            sweep_interval: default_sweep_interval(),
            metrics_buffer_size: default_metrics_buffer_size(),
            sample_memory: true,
            memory_sample_interval: default_memory_sample_interval(),
        }
    }
}

fn mb_to_bytes(mb: u64) -> usize {
    (mb as usize).saturating_mul(1024 * 1024)
}

fn default_endpoints() -> Vec<String> {
    vec!["bolt://localhost:7687".to_string()]
}

fn default_user() -> String {
    "neo4j".to_string()
}

fn default_max_pool_size() -> usize {
    50
}

fn default_acquisition_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_connection_lifetime() -> Duration {
    Duration::from_secs(3600)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_global_memory_budget_mb() -> u64 {
    512
}

fn default_tier_size_mb() -> u64 {
    128
}

fn default_node_tier() -> TierConfig {
    TierConfig::new(10_000, 300)
}

fn default_search_tier() -> TierConfig {
    TierConfig::new(1_000, 60)
}

fn default_relationship_tier() -> TierConfig {
    TierConfig::new(5_000, 300)
}

fn default_traversal_tier() -> TierConfig {
    TierConfig::new(500, 120)
}

fn default_thresholds() -> BTreeMap<String, ThresholdConfig> {
    [
        ("get_entity", 100),
        ("search", 500),
        ("traverse", 1_000),
        ("relationships", 250),
        ("execute", 1_000),
        ("execute_batch", 2_000),
    ]
    .into_iter()
    .map(|(op, ms)| {
        (
            op.to_string(),
            ThresholdConfig {
                max_duration: Duration::from_millis(ms),
                max_memory_delta: Some(64.0),
            },
        )
    })
    .collect()
}

fn default_fetch_size() -> usize {
    1000
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_memory_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_metrics_buffer_size() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
