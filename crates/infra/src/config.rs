//! Engine configuration.
//!
//! Everything has a default; `from_env()` overrides individual values from
//! `PROCURA_*` environment variables. Unparseable values fall back to the
//! default with a warning.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::RetryPolicy;

const DISPATCH_MAX_ATTEMPTS: &str = "PROCURA_DISPATCH_MAX_ATTEMPTS";
const DISPATCH_BACKOFF_MS: &str = "PROCURA_DISPATCH_BACKOFF_MS";
const CATALOG_MAX_ATTEMPTS: &str = "PROCURA_CATALOG_MAX_ATTEMPTS";
const CATALOG_BACKOFF_MS: &str = "PROCURA_CATALOG_BACKOFF_MS";
const SYSTEM_VALIDATOR: &str = "PROCURA_SYSTEM_VALIDATOR";

const DEFAULT_DISPATCH_ATTEMPTS: u32 = 5;
const DEFAULT_DISPATCH_BACKOFF_MS: u64 = 2;
const DEFAULT_CATALOG_ATTEMPTS: u32 = 3;
const DEFAULT_CATALOG_BACKOFF_MS: u64 = 5;
const DEFAULT_SYSTEM_VALIDATOR: &str = "system:auto";

/// Exponential dispatch backoff never waits longer than this many base delays.
const DISPATCH_BACKOFF_CAP_FACTOR: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Optimistic-retry policy for appends that lose a version race.
    pub dispatch_retry: RetryPolicy,
    /// Retry policy for transient catalog failures.
    pub catalog_retry: RetryPolicy,
    /// Identity recorded on automatic validations.
    pub system_validator: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_retry: dispatch_policy(DEFAULT_DISPATCH_ATTEMPTS, DEFAULT_DISPATCH_BACKOFF_MS),
            catalog_retry: RetryPolicy::fixed(
                DEFAULT_CATALOG_ATTEMPTS,
                Duration::from_millis(DEFAULT_CATALOG_BACKOFF_MS),
            ),
            system_validator: DEFAULT_SYSTEM_VALIDATOR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whatever `PROCURA_*` variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let dispatch_attempts = parsed(&lookup, DISPATCH_MAX_ATTEMPTS, DEFAULT_DISPATCH_ATTEMPTS);
        let dispatch_backoff = parsed(&lookup, DISPATCH_BACKOFF_MS, DEFAULT_DISPATCH_BACKOFF_MS);
        let catalog_attempts = parsed(&lookup, CATALOG_MAX_ATTEMPTS, DEFAULT_CATALOG_ATTEMPTS);
        let catalog_backoff = parsed(&lookup, CATALOG_BACKOFF_MS, DEFAULT_CATALOG_BACKOFF_MS);
        let system_validator = lookup(SYSTEM_VALIDATOR)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_VALIDATOR.to_string());

        Self {
            dispatch_retry: dispatch_policy(dispatch_attempts, dispatch_backoff),
            catalog_retry: RetryPolicy::fixed(
                catalog_attempts,
                Duration::from_millis(catalog_backoff),
            ),
            system_validator,
        }
    }

    pub fn with_dispatch_retry(mut self, policy: RetryPolicy) -> Self {
        self.dispatch_retry = policy;
        self
    }

    pub fn with_catalog_retry(mut self, policy: RetryPolicy) -> Self {
        self.catalog_retry = policy;
        self
    }

    pub fn with_system_validator(mut self, validator: impl Into<String>) -> Self {
        self.system_validator = validator.into();
        self
    }
}

fn dispatch_policy(max_attempts: u32, backoff_ms: u64) -> RetryPolicy {
    let base = Duration::from_millis(backoff_ms);
    RetryPolicy::exponential(max_attempts, base, base.saturating_mul(DISPATCH_BACKOFF_CAP_FACTOR))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = key, value = %raw, %default, "ignoring unparseable setting");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.dispatch_retry.max_attempts, 5);
        assert_eq!(config.dispatch_retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.dispatch_retry.max_delay, Duration::from_millis(50));
        assert_eq!(config.catalog_retry.max_attempts, 3);
        assert_eq!(config.catalog_retry.strategy, BackoffStrategy::Fixed);
        assert_eq!(config.system_validator, "system:auto");
    }

    #[test]
    fn variables_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PROCURA_DISPATCH_MAX_ATTEMPTS", "9"),
            ("PROCURA_DISPATCH_BACKOFF_MS", "4"),
            ("PROCURA_CATALOG_MAX_ATTEMPTS", "1"),
            ("PROCURA_SYSTEM_VALIDATOR", "bot:threshold"),
        ]));
        assert_eq!(config.dispatch_retry.max_attempts, 9);
        assert_eq!(config.dispatch_retry.base_delay, Duration::from_millis(4));
        assert_eq!(config.dispatch_retry.max_delay, Duration::from_millis(100));
        assert_eq!(config.catalog_retry.max_attempts, 1);
        assert_eq!(config.system_validator, "bot:threshold");
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PROCURA_DISPATCH_MAX_ATTEMPTS", "many"),
            ("PROCURA_SYSTEM_VALIDATOR", "   "),
        ]));
        assert_eq!(config.dispatch_retry.max_attempts, 5);
        assert_eq!(config.system_validator, "system:auto");
    }

    #[test]
    fn serializes_for_diagnostics() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["system_validator"], "system:auto");
        assert_eq!(json["catalog_retry"]["strategy"], "fixed");
    }
}
