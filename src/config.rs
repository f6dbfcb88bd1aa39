//! Engine Configuration
//!
//! Runtime tunables come from the environment with conservative
//! defaults, so the binary runs with no flags in development.

use std::time::Duration;

use crate::scan::HarnessConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Checks in flight at once per scan.
    pub max_concurrency: usize,
    /// Per-check attempt timeout, seconds.
    pub check_timeout_secs: u64,
    /// Attempts per check; retries only on throttling.
    pub check_attempts: u32,
    /// Backoff base between throttled attempts, milliseconds.
    pub retry_base_delay_ms: u64,
    /// Runtime ceiling before a scan is presumed dead, minutes.
    pub scan_max_runtime_mins: i64,
    /// How often the staleness sweep runs, seconds.
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_concurrency: 5,
            check_timeout_secs: 60,
            check_attempts: 3,
            retry_base_delay_ms: 500,
            scan_max_runtime_mins: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("ENGINE_PORT", defaults.port),
            max_concurrency: env_parse("ENGINE_MAX_CONCURRENCY", defaults.max_concurrency),
            check_timeout_secs: env_parse("ENGINE_CHECK_TIMEOUT_SECS", defaults.check_timeout_secs),
            check_attempts: env_parse("ENGINE_CHECK_ATTEMPTS", defaults.check_attempts),
            retry_base_delay_ms: env_parse(
                "ENGINE_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            ),
            scan_max_runtime_mins: env_parse(
                "ENGINE_SCAN_MAX_RUNTIME_MINS",
                defaults.scan_max_runtime_mins,
            ),
            sweep_interval_secs: env_parse("ENGINE_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
        }
    }

    pub fn harness(&self) -> HarnessConfig {
        HarnessConfig {
            max_concurrency: self.max_concurrency,
            check_timeout: Duration::from_secs(self.check_timeout_secs),
            max_attempts: self.check_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn scan_max_runtime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.scan_max_runtime_mins)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.port, 8080);
        let harness = cfg.harness();
        assert_eq!(harness.max_concurrency, 5);
        assert_eq!(harness.max_attempts, 3);
    }
}
