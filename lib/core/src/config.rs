//! Runtime configuration.
//!
//! Values are merged from three layers, later wins:
//!   1. Built-in defaults.
//!   2. Optional TOML file pointed to by `SPOOL_CONFIG_PATH`.
//!   3. `SPOOL_*` environment variables (double underscore for nesting,
//!      e.g. `SPOOL_REQUESTS__MAX_RETRIES=5`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// ENV holding the path to an optional TOML configuration file.
const CONFIG_PATH_ENV: &str = "SPOOL_CONFIG_PATH";

/// ENV prefix for overrides.
const ENV_PREFIX: &str = "SPOOL_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Treat every defined pool as active regardless of heartbeat age.
    pub all_pools_active: bool,
    /// Match STORE unit names as regular expressions.
    pub regex_store_units: bool,
    /// Heartbeat age in seconds beyond which a pool counts as inactive.
    pub pool_active_timeout_secs: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            all_pools_active: false,
            regex_store_units: false,
            pool_active_timeout_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Cost entry validity in seconds; expired entries answer "unknown".
    pub entry_timeout_secs: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            entry_timeout_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
    pub max_retries: u32,
    /// Seconds between automatic retries of suspended requests.
    pub retry_interval_secs: u64,
    /// Seconds between TTL sweeps over pending client messages.
    pub sweep_interval_secs: u64,
    /// Seconds between liveness probes of pools with in-flight work.
    pub ping_interval_secs: u64,
    /// Park failed requests instead of failing them outright.
    pub suspend_on_error: bool,
    /// Branch to pool-to-pool when the read candidate is over cost.
    pub p2p_on_cost: bool,
    /// Branch to staging when the read candidate is over cost.
    pub stage_on_cost: bool,
    /// Allow staging at all.
    pub stage_allowed: bool,
    /// Allow pool-to-pool at all.
    pub p2p_allowed: bool,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_secs: 60,
            sweep_interval_secs: 60,
            ping_interval_secs: 600,
            suspend_on_error: false,
            p2p_on_cost: false,
            stage_on_cost: false,
            stage_allowed: true,
            p2p_allowed: true,
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub selection: SelectionConfig,
    pub cost: CostConfig,
    pub requests: RequestsConfig,
}

impl SpoolConfig {
    /// Load the merged configuration. Never fails: a malformed layer is
    /// logged and skipped in favour of the layers below it.
    pub fn load() -> Self {
        let mut figment = Figment::from(Serialized::defaults(SpoolConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        match figment.extract() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("invalid configuration, using defaults: {e}");
                SpoolConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SpoolConfig::default();
        assert_eq!(config.selection.pool_active_timeout_secs, 300);
        assert_eq!(config.cost.entry_timeout_secs, 300);
        assert_eq!(config.requests.max_retries, 3);
        assert!(!config.requests.suspend_on_error);
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SPOOL_REQUESTS__MAX_RETRIES", "7");
            jail.set_env("SPOOL_SELECTION__ALL_POOLS_ACTIVE", "true");
            let config = SpoolConfig::load();
            assert_eq!(config.requests.max_retries, 7);
            assert!(config.selection.all_pools_active);
            Ok(())
        });
    }
}
