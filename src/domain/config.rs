//! Engine configuration loaded through `ConfigPort`.
//!
//! Every field has a default, so an empty config file is valid. Values that
//! are present but malformed or out of range are rejected rather than
//! silently replaced.

use crate::domain::error::StratboxError;
use crate::domain::limits::ResourceLimits;
use crate::domain::metrics::MetricsConfig;
use crate::domain::sandbox::SandboxConfig;
use crate::domain::validator::ValidatorConfig;
use crate::ports::config_port::ConfigPort;

const MAX_TIMEOUT_SECONDS: i64 = 24 * 60 * 60;
const MAX_CALL_DEPTH: i64 = 1_000;
const MAX_MEMORY_LIMIT_MB: i64 = u32::MAX as i64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub limits: ResourceLimits,
    pub validator: ValidatorConfig,
    pub sandbox: SandboxConfig,
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, StratboxError> {
        let defaults = EngineConfig::default();

        let timeout_seconds = read_int(
            config,
            "sandbox",
            "timeout_seconds",
            defaults.limits.timeout_seconds as i64,
            1..=MAX_TIMEOUT_SECONDS,
        )?;
        let memory_limit_mb = read_int(
            config,
            "sandbox",
            "memory_limit_mb",
            defaults.limits.memory_limit_mb as i64,
            1..=MAX_MEMORY_LIMIT_MB,
        )?;
        let max_code_bytes = read_int(
            config,
            "sandbox",
            "max_code_bytes",
            defaults.validator.max_code_bytes as i64,
            1..=i64::from(u32::MAX),
        )?;
        let max_call_depth = read_int(
            config,
            "sandbox",
            "max_call_depth",
            defaults.sandbox.max_call_depth as i64,
            1..=MAX_CALL_DEPTH,
        )?;

        let risk_free_rate = read_double(config, "metrics", "risk_free_rate", defaults.metrics.risk_free_rate)?;
        if !(0.0..1.0).contains(&risk_free_rate) {
            return Err(invalid("metrics", "risk_free_rate", "risk_free_rate must be between 0 and 1"));
        }
        let periods_per_year = read_int(
            config,
            "metrics",
            "periods_per_year",
            i64::from(defaults.metrics.periods_per_year),
            1..=100_000,
        )?;
        let initial_capital =
            read_double(config, "metrics", "initial_capital", defaults.metrics.initial_capital)?;
        if initial_capital <= 0.0 {
            return Err(invalid("metrics", "initial_capital", "initial_capital must be positive"));
        }

        // Ranges above are all within the target types.
        Ok(EngineConfig {
            limits: ResourceLimits {
                timeout_seconds: timeout_seconds as u64,
                memory_limit_mb: memory_limit_mb as u64,
            },
            validator: ValidatorConfig {
                max_code_bytes: max_code_bytes as usize,
            },
            sandbox: SandboxConfig {
                max_call_depth: max_call_depth as usize,
            },
            metrics: MetricsConfig {
                risk_free_rate,
                periods_per_year: periods_per_year as u32,
                initial_capital,
            },
        })
    }

    /// Applies command-line limit overrides, held to the same ranges as the
    /// `[sandbox]` section.
    pub fn with_limit_overrides(
        mut self,
        timeout_seconds: Option<u64>,
        memory_limit_mb: Option<u64>,
    ) -> Result<Self, StratboxError> {
        if let Some(timeout) = timeout_seconds {
            self.limits.timeout_seconds =
                override_in_range("timeout_seconds", timeout, 1..=MAX_TIMEOUT_SECONDS)?;
        }
        if let Some(memory) = memory_limit_mb {
            self.limits.memory_limit_mb =
                override_in_range("memory_limit_mb", memory, 1..=MAX_MEMORY_LIMIT_MB)?;
        }
        Ok(self)
    }
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> StratboxError {
    StratboxError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn read_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, StratboxError> {
    let value = match config.get_string(section, key) {
        None => default,
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(section, key, format!("expected an integer, got '{raw}'")))?,
    };
    check_range(section, key, value, &range)
}

fn check_range(
    section: &str,
    key: &str,
    value: i64,
    range: &std::ops::RangeInclusive<i64>,
) -> Result<i64, StratboxError> {
    if !range.contains(&value) {
        return Err(invalid(
            section,
            key,
            format!("{key} must be between {} and {}", range.start(), range.end()),
        ));
    }
    Ok(value)
}

fn override_in_range(
    key: &str,
    value: u64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<u64, StratboxError> {
    let as_int = i64::try_from(value).unwrap_or(i64::MAX);
    check_range("sandbox", key, as_int, &range)?;
    Ok(value)
}

fn read_double(config: &dyn ConfigPort, section: &str, key: &str, default: f64) -> Result<f64, StratboxError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(invalid(section, key, format!("expected a finite number, got '{raw}'"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockConfig {
        values: HashMap<(String, String), String>,
    }

    impl MockConfig {
        fn new(entries: &[(&str, &str, &str)]) -> Self {
            let values = entries
                .iter()
                .map(|(s, k, v)| ((s.to_string(), k.to_string()), v.to_string()))
                .collect();
            Self { values }
        }
    }

    impl ConfigPort for MockConfig {
        fn get_string(&self, section: &str, key: &str) -> Option<String> {
            self.values
                .get(&(section.to_string(), key.to_string()))
                .cloned()
        }
    }

    #[test]
    fn empty_config_yields_defaults() {
        let config = EngineConfig::from_config(&MockConfig::new(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.limits.timeout_seconds, 30);
        assert_eq!(config.limits.memory_limit_mb, 512);
        assert_eq!(config.validator.max_code_bytes, 256 * 1024);
        assert_eq!(config.sandbox.max_call_depth, 64);
        assert_eq!(config.metrics.periods_per_year, 252);
    }

    #[test]
    fn values_are_read_from_sections() {
        let config = EngineConfig::from_config(&MockConfig::new(&[
            ("sandbox", "timeout_seconds", "5"),
            ("sandbox", "memory_limit_mb", "64"),
            ("sandbox", "max_call_depth", "32"),
            ("metrics", "risk_free_rate", "0.04"),
            ("metrics", "periods_per_year", "52"),
            ("metrics", "initial_capital", "25000"),
        ]))
        .unwrap();
        assert_eq!(config.limits.timeout_seconds, 5);
        assert_eq!(config.limits.memory_limit_mb, 64);
        assert_eq!(config.sandbox.max_call_depth, 32);
        assert!((config.metrics.risk_free_rate - 0.04).abs() < f64::EPSILON);
        assert_eq!(config.metrics.periods_per_year, 52);
        assert!((config.metrics.initial_capital - 25_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = EngineConfig::from_config(&MockConfig::new(&[("sandbox", "timeout_seconds", "0")]))
            .unwrap_err();
        match err {
            StratboxError::ConfigInvalid { section, key, .. } => {
                assert_eq!(section, "sandbox");
                assert_eq!(key, "timeout_seconds");
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn malformed_integer_is_rejected_not_defaulted() {
        let err = EngineConfig::from_config(&MockConfig::new(&[("sandbox", "memory_limit_mb", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("memory_limit_mb"));
    }

    #[test]
    fn risk_free_rate_out_of_range_is_rejected() {
        let err = EngineConfig::from_config(&MockConfig::new(&[("metrics", "risk_free_rate", "1.5")]))
            .unwrap_err();
        assert!(matches!(err, StratboxError::ConfigInvalid { .. }));
    }

    #[test]
    fn non_positive_capital_is_rejected() {
        let err = EngineConfig::from_config(&MockConfig::new(&[("metrics", "initial_capital", "-1")]))
            .unwrap_err();
        assert!(matches!(err, StratboxError::ConfigInvalid { .. }));
    }

    #[test]
    fn limit_overrides_share_the_sandbox_ranges() {
        let config = EngineConfig::default()
            .with_limit_overrides(Some(5), Some(128))
            .unwrap();
        assert_eq!(config.limits.timeout_seconds, 5);
        assert_eq!(config.limits.memory_limit_mb, 128);

        let untouched = EngineConfig::default().with_limit_overrides(None, None).unwrap();
        assert_eq!(untouched, EngineConfig::default());

        let err = EngineConfig::default()
            .with_limit_overrides(Some(0), None)
            .unwrap_err();
        match err {
            StratboxError::ConfigInvalid { section, key, .. } => {
                assert_eq!(section, "sandbox");
                assert_eq!(key, "timeout_seconds");
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
        assert!(EngineConfig::default().with_limit_overrides(Some(86_401), None).is_err());
        assert!(EngineConfig::default().with_limit_overrides(None, Some(0)).is_err());
        assert!(EngineConfig::default().with_limit_overrides(None, Some(u64::MAX)).is_err());
    }
}
