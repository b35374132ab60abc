//! Configuration validation.
//!
//! Every check runs and every failure is collected, so a bad deployment
//! reports all of its problems at once instead of one per restart.

use crate::AppConfig;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Pool size configuration is invalid (min must be <= max).
    InvalidPoolSize { min: u32, max: u32 },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: u32, maximum: u32 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Sampling ratio must be between 0.0 and 1.0.
    InvalidSamplingRatio { value: f64 },
    /// Interval, timeout or ceiling must be positive.
    NonPositive { name: String },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Log format is invalid.
    InvalidLogFormat { value: String },
    /// Cron expression does not parse.
    InvalidSchedule { value: String, message: String },
    /// Heartbeats must arrive well within the ack-wait window.
    HeartbeatTooSlow { heartbeat_secs: u64, ack_wait_secs: u64 },
    /// Both discovery kinds are disabled; nothing would ever be scheduled.
    DiscoveryDisabled,
    /// The leader lock would expire between two refreshes.
    LeaderTtlTooShort { ttl_secs: u64, check_interval_secs: u64 },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPoolSize { min, max } => write!(
                f,
                "Invalid pool size: min ({}) cannot be greater than max ({})",
                min, max
            ),
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {} exceeds maximum allowed ({})", value, maximum)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidSamplingRatio { value } => write!(
                f,
                "Invalid sampling ratio: {} (must be between 0.0 and 1.0)",
                value
            ),
            Self::NonPositive { name } => write!(f, "'{}' must be positive", name),
            Self::InvalidLogLevel { value } => write!(
                f,
                "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                value
            ),
            Self::InvalidLogFormat { value } => {
                write!(f, "Invalid log format: '{}' (valid: pretty, json)", value)
            }
            Self::InvalidSchedule { value, message } => {
                write!(f, "Invalid cron schedule '{}': {}", value, message)
            }
            Self::HeartbeatTooSlow {
                heartbeat_secs,
                ack_wait_secs,
            } => write!(
                f,
                "Heartbeat interval ({}s) must be shorter than the ack wait ({}s)",
                heartbeat_secs, ack_wait_secs
            ),
            Self::DiscoveryDisabled => {
                write!(f, "Asset and spend discovery cannot both be disabled")
            }
            Self::LeaderTtlTooShort {
                ttl_secs,
                check_interval_secs,
            } => write!(
                f,
                "Leader TTL ({}s) must exceed the leader check interval ({}s)",
                ttl_secs, check_interval_secs
            ),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

#[derive(Debug, Default)]
struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn require_positive(&mut self, name: &str, value: u64) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositive {
                name: name.to_string(),
            });
        }
    }

    fn require_nonzero_len(&mut self, name: &str, value: usize) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositive {
                name: name.to_string(),
            });
        }
    }

    fn require_url(&mut self, url_type: &str, value: &str) {
        if let Err(e) = Url::parse(value) {
            self.add_error(ConfigValidationError::InvalidUrl {
                url_type: url_type.to_string(),
                message: format!("{}: {}", value, e),
            });
        }
    }

    fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: u32 = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];

    /// Validates the entire application configuration.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::default();

        Self::validate_database(config, &mut result);
        Self::validate_redis(config, &mut result);
        Self::validate_queue(config, &mut result);
        Self::validate_scheduler(config, &mut result);
        Self::validate_compliance(config, &mut result);
        Self::validate_services(config, &mut result);
        Self::validate_observability(config, &mut result);

        result.into_result()
    }

    fn validate_database(config: &AppConfig, result: &mut ValidationResult) {
        let db = &config.database;
        if !db.url.starts_with("postgres://") && !db.url.starts_with("postgresql://") {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL must start with postgres:// or postgresql://".to_string(),
            });
        }
        if db.min_connections > db.max_connections {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                min: db.min_connections,
                max: db.max_connections,
            });
        }
        if db.max_connections > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: db.max_connections,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
        result.require_positive("database.connect_timeout_secs", db.connect_timeout_secs);
        result.require_positive("database.idle_timeout_secs", db.idle_timeout_secs);
    }

    fn validate_redis(config: &AppConfig, result: &mut ValidationResult) {
        let redis = &config.redis;
        if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: "URL must start with redis:// or rediss://".to_string(),
            });
        }
        if redis.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: redis.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
        result.require_positive("redis.pool_size", u64::from(redis.pool_size));
    }

    fn validate_queue(config: &AppConfig, result: &mut ValidationResult) {
        let queue = &config.queue;
        result.require_nonzero_len("queue.stream_max_len", queue.stream_max_len);
        result.require_positive("queue.dedup_window_secs", queue.dedup_window_secs);
        result.require_nonzero_len("queue.consumer_batch_size", queue.consumer_batch_size);
        result.require_positive("queue.max_deliver", u64::from(queue.max_deliver));
        result.require_positive("queue.result_ack_wait_secs", queue.result_ack_wait_secs);
    }

    fn validate_scheduler(config: &AppConfig, result: &mut ValidationResult) {
        let s = &config.scheduler;
        for (name, value) in [
            ("scheduler.create_interval_secs", s.create_interval_secs),
            ("scheduler.dispatch_interval_secs", s.dispatch_interval_secs),
            ("scheduler.timeout_check_interval_secs", s.timeout_check_interval_secs),
            ("scheduler.describe_timeout_hours", s.describe_timeout_hours),
            ("scheduler.max_queued", s.max_queued),
            ("scheduler.max_in_10_minutes", s.max_in_10_minutes),
            ("scheduler.max_concurrent_call", u64::from(s.max_concurrent_call)),
            ("scheduler.default_resource_type_limit", s.default_resource_type_limit),
            ("scheduler.retention_days", s.retention_days),
            ("scheduler.removing_resources_interval_secs", s.removing_resources_interval_secs),
            ("scheduler.cleanup_interval_secs", s.cleanup_interval_secs),
            ("scheduler.leader_ttl_secs", s.leader_ttl_secs),
            ("scheduler.leader_check_interval_secs", s.leader_check_interval_secs),
            ("scheduler.credential_requests_per_second", u64::from(s.credential_requests_per_second)),
        ] {
            result.require_positive(name, value);
        }
        if s.leader_check_interval_secs >= s.leader_ttl_secs && s.leader_ttl_secs > 0 {
            result.add_error(ConfigValidationError::LeaderTtlTooShort {
                ttl_secs: s.leader_ttl_secs,
                check_interval_secs: s.leader_check_interval_secs,
            });
        }
        if !s.asset_discovery_enabled && !s.spend_discovery_enabled {
            result.add_error(ConfigValidationError::DiscoveryDisabled);
        }
    }

    fn validate_compliance(config: &AppConfig, result: &mut ValidationResult) {
        let c = &config.compliance;
        if let Err(e) = cron::Schedule::from_str(&c.publish_schedule) {
            result.add_error(ConfigValidationError::InvalidSchedule {
                value: c.publish_schedule.clone(),
                message: e.to_string(),
            });
        }
        result.require_positive("compliance.inner_iterations", u64::from(c.inner_iterations));
        result.require_positive("compliance.batch_size", u64::from(c.batch_size));
        result.require_positive("compliance.queued_timeout_minutes", c.queued_timeout_minutes);
        result.require_positive(
            "compliance.in_progress_timeout_minutes",
            c.in_progress_timeout_minutes,
        );
        result.require_positive("compliance.heartbeat_interval_secs", c.heartbeat_interval_secs);
        if c.heartbeat_interval_secs >= c.ack_wait_secs {
            result.add_error(ConfigValidationError::HeartbeatTooSlow {
                heartbeat_secs: c.heartbeat_interval_secs,
                ack_wait_secs: c.ack_wait_secs,
            });
        }
    }

    fn validate_services(config: &AppConfig, result: &mut ValidationResult) {
        let services = &config.services;
        result.require_url("integration service", &services.integration_url);
        result.require_url("compliance service", &services.compliance_url);
        result.require_url("inventory service", &services.inventory_url);
        result.require_url("describe delivery", &services.describe_delivery_endpoint);
        result.require_url("findings sink", &services.sink_url);
        result.require_positive("services.request_timeout_secs", services.request_timeout_secs);
        result.require_positive("services.call_deadline_secs", services.call_deadline_secs);
    }

    fn validate_observability(config: &AppConfig, result: &mut ValidationResult) {
        let obs = &config.telemetry;
        let level = obs.log_level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: obs.log_level.clone(),
            });
        }
        if obs.log_format != "pretty" && obs.log_format != "json" {
            result.add_error(ConfigValidationError::InvalidLogFormat {
                value: obs.log_format.clone(),
            });
        }
        if !(0.0..=1.0).contains(&obs.sampling_ratio) {
            result.add_error(ConfigValidationError::InvalidSamplingRatio {
                value: obs.sampling_ratio,
            });
        }
        if let Some(ref endpoint) = obs.otlp_endpoint {
            result.require_url("otlp_endpoint", endpoint);
        }
        if obs.metrics_addr.parse::<std::net::SocketAddr>().is_err() {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "metrics_addr".to_string(),
                message: format!("not a socket address: {}", obs.metrics_addr),
            });
        }
    }
}

/// Formats validation errors for display.
#[must_use]
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_of(config: &AppConfig) -> Vec<ConfigValidationError> {
        ConfigValidator::validate(config).err().unwrap_or_default()
    }

    #[test]
    fn test_default_config_passes() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_mysql_url_rejected() {
        let mut config = AppConfig::default();
        config.database.url = "mysql://vigil@localhost/vigil".to_string();
        assert!(errors_of(&config).iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidUrl { url_type, .. } if url_type == "database"
        )));
    }

    #[test]
    fn test_invalid_pool_size() {
        let mut config = AppConfig::default();
        config.database.min_connections = 100;
        config.database.max_connections = 10;
        assert!(errors_of(&config)
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidPoolSize { .. })));
    }

    #[test]
    fn test_zero_dispatch_interval() {
        let mut config = AppConfig::default();
        config.scheduler.dispatch_interval_secs = 0;
        assert!(errors_of(&config).iter().any(|e| matches!(
            e,
            ConfigValidationError::NonPositive { name } if name == "scheduler.dispatch_interval_secs"
        )));
    }

    #[test]
    fn test_zero_stream_max_len() {
        let mut config = AppConfig::default();
        config.queue.stream_max_len = 0;
        assert!(errors_of(&config).iter().any(|e| matches!(
            e,
            ConfigValidationError::NonPositive { name } if name == "queue.stream_max_len"
        )));
    }

    #[test]
    fn test_bad_cron_schedule() {
        let mut config = AppConfig::default();
        config.compliance.publish_schedule = "whenever".to_string();
        assert!(errors_of(&config)
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidSchedule { .. })));
    }

    #[test]
    fn test_heartbeat_must_be_inside_ack_wait() {
        let mut config = AppConfig::default();
        config.compliance.heartbeat_interval_secs = 3600;
        assert!(errors_of(&config)
            .iter()
            .any(|e| matches!(e, ConfigValidationError::HeartbeatTooSlow { .. })));
    }

    #[test]
    fn test_both_discovery_kinds_disabled() {
        let mut config = AppConfig::default();
        config.scheduler.asset_discovery_enabled = false;
        config.scheduler.spend_discovery_enabled = false;
        assert!(errors_of(&config).contains(&ConfigValidationError::DiscoveryDisabled));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = AppConfig::default();
        config.redis.url = "http://localhost:6379".to_string();
        config.telemetry.log_level = "loud".to_string();
        config.services.compliance_url = "not a url".to_string();
        let errors = errors_of(&config);
        assert!(errors.len() >= 3);

        let output = format_validation_errors(&errors);
        assert!(output.contains("Invalid redis URL"));
        assert!(output.contains("Invalid log level"));
    }
}
