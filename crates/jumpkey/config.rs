use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const PATCH_CONFIG_PREFIX: &str = "JUMP_LABEL_";

/// How a patch pass writes a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PokeMode {
    /// Always go through the `int3` protocol and one safe-point barrier.
    #[default]
    Breakpoint,
    /// Replace sites that fit in one aligned word with a single atomic
    /// store, and use the `int3` protocol only for the rest.
    Auto,
}

impl std::str::FromStr for PokeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breakpoint" => Ok(PokeMode::Breakpoint),
            "auto" => Ok(PokeMode::Auto),
            other => Err(format!(
                "unknown poke mode `{other}`, expected `breakpoint` or `auto`"
            )),
        }
    }
}

/// Tuning for patch passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub poke_mode: PokeMode,
    /// Longest single wait for execution contexts to reach a safe point.
    pub barrier_timeout_ms: u64,
    /// Extra barrier attempts after the first one overruns.
    pub barrier_retries: u32,
    /// Pause before the first retry; doubles on every further retry.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            poke_mode: PokeMode::Breakpoint,
            barrier_timeout_ms: 1_000,
            barrier_retries: 5,
            backoff_base_ms: 1,
            backoff_max_ms: 100,
        }
    }
}

impl PatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        envy::prefixed(PATCH_CONFIG_PREFIX)
            .from_env::<Self>()
            .map_err(|e| ConfigError::ConfigDeserializationError {
                err: e,
                from: "PatchConfig".to_string(),
            })
    }

    /// Same as [`PatchConfig::from_env`], reading from `vars` instead of the process environment.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(PATCH_CONFIG_PREFIX)
            .from_iter::<_, Self>(vars)
            .map_err(|e| ConfigError::ConfigDeserializationError {
                err: e,
                from: "PatchConfig".to_string(),
            })
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    /// Pause before retry number `retry` (starting at 0).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = PatchConfig::from_vars(vars(&[("UNRELATED", "1")])).expect("config");
        assert_eq!(config, PatchConfig::default());
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = PatchConfig::from_vars(vars(&[
            ("JUMP_LABEL_POKE_MODE", "auto"),
            ("JUMP_LABEL_BARRIER_TIMEOUT_MS", "25"),
            ("JUMP_LABEL_BARRIER_RETRIES", "2"),
        ]))
        .expect("config");
        assert_eq!(config.poke_mode, PokeMode::Auto);
        assert_eq!(config.barrier_timeout(), Duration::from_millis(25));
        assert_eq!(config.barrier_retries, 2);
        assert_eq!(config.backoff_max_ms, PatchConfig::default().backoff_max_ms);
    }

    #[test]
    fn test_bad_value_is_reported() {
        let err = PatchConfig::from_vars(vars(&[("JUMP_LABEL_BARRIER_RETRIES", "lots")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("PatchConfig"));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = PatchConfig {
            backoff_base_ms: 2,
            backoff_max_ms: 10,
            ..PatchConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(2));
        assert_eq!(config.backoff(1), Duration::from_millis(4));
        assert_eq!(config.backoff(2), Duration::from_millis(8));
        assert_eq!(config.backoff(3), Duration::from_millis(10));
        assert_eq!(config.backoff(80), Duration::from_millis(10));
    }
}
