// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_N_PLUS_ONE_MAGIC_NUMBER: usize = 5;
const DEFAULT_CHILDREN_UNIQUE_CUTOFF: usize = 1000;
const DEFAULT_BACKTRACE_THRESHOLD: Duration = Duration::from_millis(500);
const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(2);
const DEFAULT_MAX_SLOW_PER_MINUTE: usize = 500;
const DEFAULT_MAX_DETAIL_PER_MINUTE: usize = 10;
const DEFAULT_SCORED_SET_MAX_SIZE: usize = 10;
const DEFAULT_SLOW_SET_TOTAL: usize = 10;
const DEFAULT_SLOW_SET_FAIR: usize = 1;
const DEFAULT_HISTOGRAM_BUCKETS: usize = 50;
const DEFAULT_MAX_METRICS_PER_TRACE: usize = 500;

/// Tunables for request tracking, sampling and conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Repeated calls to one operation before a backtrace is worth capturing
    pub n_plus_one_magic_number: usize,
    /// Same-type children a layer keeps individually before merging
    pub children_unique_cutoff: usize,
    /// Exclusive time above which a layer captures a backtrace
    pub backtrace_threshold: Duration,
    /// Requests at or below this total time are never slow transactions
    pub slow_request_threshold: Duration,
    pub max_slow_per_minute: usize,
    pub max_detail_per_minute: usize,
    pub scored_set_max_size: usize,
    pub slow_set_total: usize,
    pub slow_set_fair: usize,
    pub histogram_buckets: usize,
    /// Metrics kept per slow trace before it is marked truncated
    pub max_metrics_per_trace: usize,
    pub track_allocations: bool,
    /// Application root used to trim backtrace frames
    pub app_root: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            n_plus_one_magic_number: DEFAULT_N_PLUS_ONE_MAGIC_NUMBER,
            children_unique_cutoff: DEFAULT_CHILDREN_UNIQUE_CUTOFF,
            backtrace_threshold: DEFAULT_BACKTRACE_THRESHOLD,
            slow_request_threshold: DEFAULT_SLOW_REQUEST_THRESHOLD,
            max_slow_per_minute: DEFAULT_MAX_SLOW_PER_MINUTE,
            max_detail_per_minute: DEFAULT_MAX_DETAIL_PER_MINUTE,
            scored_set_max_size: DEFAULT_SCORED_SET_MAX_SIZE,
            slow_set_total: DEFAULT_SLOW_SET_TOTAL,
            slow_set_fair: DEFAULT_SLOW_SET_FAIR,
            histogram_buckets: DEFAULT_HISTOGRAM_BUCKETS,
            max_metrics_per_trace: DEFAULT_MAX_METRICS_PER_TRACE,
            track_allocations: false,
            app_root: None,
        }
    }
}

impl AgentConfig {
    /// Create configuration from `APM_*` environment variables.
    ///
    /// Values that do not parse, or that parse to something unusable, fall back
    /// to the default with a warning. The result is always sanitized.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            n_plus_one_magic_number: env_count(
                "APM_N_PLUS_ONE_MAGIC_NUMBER",
                defaults.n_plus_one_magic_number,
            ),
            children_unique_cutoff: env_count(
                "APM_CHILDREN_UNIQUE_CUTOFF",
                defaults.children_unique_cutoff,
            ),
            backtrace_threshold: env_seconds(
                "APM_BACKTRACE_THRESHOLD",
                defaults.backtrace_threshold,
            ),
            slow_request_threshold: env_seconds(
                "APM_SLOW_REQUEST_THRESHOLD",
                defaults.slow_request_threshold,
            ),
            max_slow_per_minute: env_parse("APM_MAX_SLOW_PER_MINUTE", defaults.max_slow_per_minute),
            max_detail_per_minute: env_parse(
                "APM_MAX_DETAIL_PER_MINUTE",
                defaults.max_detail_per_minute,
            ),
            scored_set_max_size: env_count("APM_SCORED_SET_MAX_SIZE", defaults.scored_set_max_size),
            slow_set_total: env_count("APM_SLOW_SET_TOTAL", defaults.slow_set_total),
            slow_set_fair: env_count("APM_SLOW_SET_FAIR", defaults.slow_set_fair),
            histogram_buckets: env_count("APM_HISTOGRAM_BUCKETS", defaults.histogram_buckets),
            max_metrics_per_trace: env_count(
                "APM_MAX_METRICS_PER_TRACE",
                defaults.max_metrics_per_trace,
            ),
            track_allocations: env::var("APM_TRACK_ALLOCATIONS")
                .map(|val| matches!(val.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.track_allocations),
            app_root: env::var("APM_APP_ROOT")
                .ok()
                .filter(|val| !val.trim().is_empty())
                .map(PathBuf::from),
        };

        if let Err(e) = config.validate() {
            warn!("Adjusting agent configuration: {e}");
        }
        config.sanitized()
    }

    /// Report the first nonsensical combination of tunables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("n_plus_one_magic_number", self.n_plus_one_magic_number),
            ("children_unique_cutoff", self.children_unique_cutoff),
            ("scored_set_max_size", self.scored_set_max_size),
            ("slow_set_total", self.slow_set_total),
            ("slow_set_fair", self.slow_set_fair),
            ("histogram_buckets", self.histogram_buckets),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                });
            }
        }

        if self.max_detail_per_minute > self.max_slow_per_minute {
            return Err(ConfigError::InvalidValue {
                key: "max_detail_per_minute",
                value: self.max_detail_per_minute.to_string(),
            });
        }

        if self.slow_set_fair > self.slow_set_total {
            return Err(ConfigError::InvalidValue {
                key: "slow_set_fair",
                value: self.slow_set_fair.to_string(),
            });
        }

        Ok(())
    }

    /// Clamp tunables into a usable range.
    ///
    /// Zero-sized containers become one slot and per-minute caps are ordered so
    /// that the detail cap never exceeds the overall cap.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.n_plus_one_magic_number = self.n_plus_one_magic_number.max(1);
        self.children_unique_cutoff = self.children_unique_cutoff.max(1);
        self.scored_set_max_size = self.scored_set_max_size.max(1);
        self.slow_set_total = self.slow_set_total.max(1);
        self.slow_set_fair = self.slow_set_fair.clamp(1, self.slow_set_total);
        self.histogram_buckets = self.histogram_buckets.max(1);
        self.max_detail_per_minute = self.max_detail_per_minute.min(self.max_slow_per_minute);
        self
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("Ignoring invalid value for {key}: {raw:?}");
            default
        }),
        Err(_) => default,
    }
}

fn env_count(key: &str, default: usize) -> usize {
    match env_parse(key, default) {
        0 => {
            warn!("{key} must be greater than 0, using {default}");
            default
        }
        value => value,
    }
}

fn env_seconds(key: &str, default: Duration) -> Duration {
    let Ok(raw) = env::var(key) else {
        return default;
    };
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_else(|| {
            warn!("Ignoring invalid value for {key}: {raw:?}");
            default
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_KEYS: [&str; 13] = [
        "APM_N_PLUS_ONE_MAGIC_NUMBER",
        "APM_CHILDREN_UNIQUE_CUTOFF",
        "APM_BACKTRACE_THRESHOLD",
        "APM_SLOW_REQUEST_THRESHOLD",
        "APM_MAX_SLOW_PER_MINUTE",
        "APM_MAX_DETAIL_PER_MINUTE",
        "APM_SCORED_SET_MAX_SIZE",
        "APM_SLOW_SET_TOTAL",
        "APM_SLOW_SET_FAIR",
        "APM_HISTOGRAM_BUCKETS",
        "APM_MAX_METRICS_PER_TRACE",
        "APM_TRACK_ALLOCATIONS",
        "APM_APP_ROOT",
    ];

    fn clear_env() {
        for key in ALL_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slow_request_threshold, Duration::from_secs(2));
        assert_eq!(config.n_plus_one_magic_number, 5);
    }

    #[test]
    #[serial]
    fn test_from_env_without_variables_uses_defaults() {
        clear_env();
        assert_eq!(AgentConfig::from_env(), AgentConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("APM_SLOW_REQUEST_THRESHOLD", "1.5");
        env::set_var("APM_MAX_DETAIL_PER_MINUTE", "3");
        env::set_var("APM_TRACK_ALLOCATIONS", "TRUE");
        env::set_var("APM_APP_ROOT", "/srv/app");

        let config = AgentConfig::from_env();
        assert_eq!(config.slow_request_threshold, Duration::from_millis(1500));
        assert_eq!(config.max_detail_per_minute, 3);
        assert!(config.track_allocations);
        assert_eq!(config.app_root, Some(PathBuf::from("/srv/app")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_values_degrade_to_defaults() {
        clear_env();
        env::set_var("APM_SLOW_SET_TOTAL", "-3");
        env::set_var("APM_HISTOGRAM_BUCKETS", "0");
        env::set_var("APM_SLOW_REQUEST_THRESHOLD", "-1.0");
        env::set_var("APM_BACKTRACE_THRESHOLD", "NaN");

        let config = AgentConfig::from_env();
        assert_eq!(config.slow_set_total, DEFAULT_SLOW_SET_TOTAL);
        assert_eq!(config.histogram_buckets, DEFAULT_HISTOGRAM_BUCKETS);
        assert_eq!(config.slow_request_threshold, DEFAULT_SLOW_REQUEST_THRESHOLD);
        assert_eq!(config.backtrace_threshold, DEFAULT_BACKTRACE_THRESHOLD);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_clamps_detail_cap() {
        clear_env();
        env::set_var("APM_MAX_SLOW_PER_MINUTE", "4");
        env::set_var("APM_MAX_DETAIL_PER_MINUTE", "40");

        let config = AgentConfig::from_env();
        assert_eq!(config.max_slow_per_minute, 4);
        assert_eq!(config.max_detail_per_minute, 4);
        clear_env();
    }

    #[test]
    fn test_validate_rejects_fair_above_total() {
        let config = AgentConfig {
            slow_set_total: 2,
            slow_set_fair: 5,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "slow_set_fair",
                value: "5".to_string()
            })
        );
        assert_eq!(config.sanitized().slow_set_fair, 2);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = AgentConfig {
            scored_set_max_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.sanitized().scored_set_max_size, 1);
    }
}
