use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL (overridden by `DATABASE_URL`)
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Provision wallet-asset rows for every active asset when a user wallet is created
    pub default_assets_on_wallet_create: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_assets_on_wallet_create: true,
        }
    }
}

/// Outbox dispatcher tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Candidates selected per tick = batch_size * candidate_factor
    pub candidate_factor: usize,
    pub max_attempts: i32,
    /// A CLAIMED row whose lock is older than this is reclaimable
    pub lease_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub retention_days: u32,
    pub purge_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            candidate_factor: 3,
            max_attempts: 10,
            lease_timeout_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            retention_days: 7,
            purge_interval_secs: 24 * 60 * 60,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn candidate_limit(&self) -> usize {
        self.batch_size.saturating_mul(self.candidate_factor.max(1))
    }
}

/// Message bus / queue tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub default_attempts: u32,
    pub retry_backoff_ms: u64,
    pub dedupe_window_secs: u64,
    pub consumer_concurrency: usize,
    pub handshake_poll_ms: u64,
    pub handshake_timeout_ms: u64,
    pub failed_job_capacity: usize,
    /// How often expired cache keys are dropped
    pub cache_sweep_interval_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_attempts: 3,
            retry_backoff_ms: 1_000,
            dedupe_window_secs: 3_600,
            consumer_concurrency: 8,
            handshake_poll_ms: 100,
            handshake_timeout_ms: 10_000,
            failed_job_capacity: 1_000,
            cache_sweep_interval_secs: 60,
        }
    }
}

impl BusConfig {
    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerConfig {
    pub dedupe_ttl_secs: u64,
    pub handshake_ttl_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl_secs: 24 * 60 * 60,
            handshake_ttl_secs: 300,
        }
    }
}

impl ConsumerConfig {
    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }

    pub fn handshake_ttl(&self) -> Duration {
        Duration::from_secs(self.handshake_ttl_secs)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(content)?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.postgres_url = Some(url);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: "debug"
log_dir: "./logs"
log_file: "test.log"
use_json: true
rotation: "never"
"#;

    #[test]
    fn test_sections_default_when_missing() {
        let config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.dispatcher.poll_interval_ms, 500);
        assert_eq!(config.dispatcher.backoff_cap_ms, 60_000);
        assert_eq!(config.bus.cache_sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.bus.default_attempts, 3);
        assert_eq!(config.consumer.handshake_ttl(), Duration::from_secs(300));
        assert!(config.ledger.default_assets_on_wallet_create);
    }

    #[test]
    fn test_partial_dispatcher_section() {
        let yaml = format!("{}dispatcher:\n  batch_size: 10\n  candidate_factor: 4\n", MINIMAL);
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.dispatcher.batch_size, 10);
        assert_eq!(config.dispatcher.candidate_limit(), 40);
        // untouched fields keep defaults
        assert_eq!(config.dispatcher.max_attempts, 10);
    }

    #[test]
    fn test_candidate_limit_never_zero_factor() {
        let config = DispatcherConfig {
            candidate_factor: 0,
            ..Default::default()
        };
        assert_eq!(config.candidate_limit(), config.batch_size);
    }
}
