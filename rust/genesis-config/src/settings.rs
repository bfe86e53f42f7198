//! Process settings loaded from the environment

use std::env;
use std::str::FromStr;

use genesis_types::Secret;
use thiserror::Error;

use crate::topology::QueueTopology;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("environment variable {name} has invalid value: {detail}")]
    InvalidVar { name: &'static str, detail: String },
}

/// Governor limits. Counters live in the shared KV; these are the caps.
#[derive(Debug, Clone, Copy)]
pub struct GovernorSettings {
    pub global_max_concurrent: usize,
    pub per_account_max_concurrent: usize,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_ms: u64,
    /// Provider tolerates ~1.4 mutating calls/s per account; expressed as a
    /// sliding window of 7 grants per 5 seconds.
    pub per_account_rate_max: u32,
    pub per_account_rate_window_ms: u64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            global_max_concurrent: 100,
            per_account_max_concurrent: 10,
            circuit_breaker_threshold: 10,
            circuit_breaker_reset_ms: 30_000,
            per_account_rate_max: 7,
            per_account_rate_window_ms: 5_000,
        }
    }
}

/// Hibernation/wake policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct HibernationSettings {
    pub campaign_idle_days: i64,
    pub execution_idle_days: i64,
    pub login_idle_days: i64,
    /// Inter-wake gap for staggered batches.
    pub wake_gap_ms: u64,
    pub pre_warm_minutes: i64,
    pub predictive_lookahead_hours: i64,
    pub auto_hibernate_after_hours: i64,
    /// Wake flow: poll provider status every 5s, budget 120s.
    pub wake_status_poll_s: u64,
    pub wake_status_budget_s: u64,
    /// Wake flow: poll sidecar health every 3s, budget 60s.
    pub wake_health_poll_s: u64,
    pub wake_health_budget_s: u64,
}

impl Default for HibernationSettings {
    fn default() -> Self {
        Self {
            campaign_idle_days: 7,
            execution_idle_days: 7,
            login_idle_days: 14,
            wake_gap_ms: 1_000,
            pre_warm_minutes: 10,
            predictive_lookahead_hours: 24,
            auto_hibernate_after_hours: 2,
            wake_status_poll_s: 5,
            wake_status_budget_s: 120,
            wake_health_poll_s: 3,
            wake_health_budget_s: 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DlqSettings {
    pub retention_days: i64,
    pub alert_threshold: usize,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            alert_threshold: 50,
        }
    }
}

/// Everything the process reads from the environment, resolved once.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Pool-management token; per-account tokens come from the store.
    pub cloud_api_token: Secret,
    pub cloud_api_base_url: String,
    pub dry_run: bool,
    pub log_level: String,
    pub graceful_shutdown_timeout_ms: u64,
    pub watchdog_interval_seconds: u64,
    pub watchdog_heartbeat_timeout_minutes: i64,
    pub scale_alerts_interval_minutes: u64,
    pub heartbeat_flush_interval_seconds: u64,
    pub sidecar_timeout_seconds: u64,
    pub cloud_timeout_seconds: u64,
    pub governor: GovernorSettings,
    pub hibernation: HibernationSettings,
    pub dlq: DlqSettings,
    pub topology: QueueTopology,
}

impl Settings {
    /// Load settings, failing fast on missing required variables or
    /// unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dry_run = parse_or("DRY_RUN", false)?;

        let database_url = required("DATABASE_URL")?;
        let redis_url = required("REDIS_URL")?;
        let cloud_api_token = if dry_run {
            Secret::new(env::var("CLOUD_API_TOKEN").unwrap_or_default())
        } else {
            Secret::new(required("CLOUD_API_TOKEN")?)
        };

        let topology = QueueTopology::with_concurrency_overrides(
            parse_or("WORKFLOW_UPDATE_CONCURRENCY", 100usize)?,
            parse_or("WAKE_DROPLET_CONCURRENCY", 50usize)?,
            parse_or("SIDECAR_UPDATE_CONCURRENCY", 50usize)?,
            parse_or("CREDENTIAL_INJECT_CONCURRENCY", 50usize)?,
            parse_or("HARD_REBOOT", 10usize)?,
        );

        Ok(Self {
            port: parse_or("PORT", 3000u16)?,
            database_url,
            redis_url,
            cloud_api_token,
            cloud_api_base_url: env::var("CLOUD_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.digitalocean.com/v2".to_string()),
            dry_run,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            graceful_shutdown_timeout_ms: parse_or("GRACEFUL_SHUTDOWN_TIMEOUT_MS", 30_000u64)?,
            watchdog_interval_seconds: parse_or("WATCHDOG_INTERVAL_SECONDS", 60u64)?,
            watchdog_heartbeat_timeout_minutes: parse_or(
                "WATCHDOG_HEARTBEAT_TIMEOUT_MINUTES",
                5i64,
            )?,
            scale_alerts_interval_minutes: parse_or("SCALE_ALERTS_INTERVAL_MINUTES", 15u64)?,
            heartbeat_flush_interval_seconds: parse_or("HEARTBEAT_PROCESS_INTERVAL_SECONDS", 10u64)?,
            sidecar_timeout_seconds: parse_or("SIDECAR_TIMEOUT_SECONDS", 30u64)?,
            cloud_timeout_seconds: parse_or("CLOUD_API_TIMEOUT_SECONDS", 15u64)?,
            governor: GovernorSettings {
                global_max_concurrent: parse_or("GLOBAL_MAX_CONCURRENT", 100usize)?,
                per_account_max_concurrent: parse_or("PER_ACCOUNT_MAX_CONCURRENT", 10usize)?,
                circuit_breaker_threshold: parse_or("CIRCUIT_BREAKER_THRESHOLD", 10u32)?,
                circuit_breaker_reset_ms: parse_or("CIRCUIT_BREAKER_RESET_MS", 30_000u64)?,
                ..GovernorSettings::default()
            },
            hibernation: HibernationSettings {
                campaign_idle_days: parse_or("HIBERNATION_CAMPAIGN_IDLE_DAYS", 7i64)?,
                execution_idle_days: parse_or("HIBERNATION_EXECUTION_IDLE_DAYS", 7i64)?,
                login_idle_days: parse_or("HIBERNATION_LOGIN_IDLE_DAYS", 14i64)?,
                wake_gap_ms: parse_or("WAKE_GAP_MS", 1_000u64)?,
                pre_warm_minutes: parse_or("PRE_WARM_MINUTES", 10i64)?,
                predictive_lookahead_hours: parse_or("PREDICTIVE_LOOKAHEAD_HOURS", 24i64)?,
                auto_hibernate_after_hours: parse_or("AUTO_HIBERNATE_AFTER_HOURS", 2i64)?,
                ..HibernationSettings::default()
            },
            dlq: DlqSettings {
                retention_days: parse_or("DLQ_RETENTION_DAYS", 30i64)?,
                alert_threshold: parse_or("DLQ_ALERT_THRESHOLD", 50usize)?,
            },
            topology,
        })
    }

    /// Defaults with in-memory-friendly endpoints, for tests and dry runs.
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            database_url: "postgres://localhost/genesis_test".into(),
            redis_url: "redis://localhost/0".into(),
            cloud_api_token: Secret::new(""),
            cloud_api_base_url: "https://api.digitalocean.com/v2".into(),
            dry_run: true,
            log_level: "debug".into(),
            graceful_shutdown_timeout_ms: 1_000,
            watchdog_interval_seconds: 60,
            watchdog_heartbeat_timeout_minutes: 5,
            scale_alerts_interval_minutes: 15,
            heartbeat_flush_interval_seconds: 10,
            sidecar_timeout_seconds: 30,
            cloud_timeout_seconds: 15,
            governor: GovernorSettings::default(),
            hibernation: HibernationSettings::default(),
            dlq: DlqSettings::default(),
            topology: QueueTopology::default(),
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse::<T>().map_err(|e| ConfigError::InvalidVar {
            name,
            detail: e.to_string(),
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn governor_defaults_match_spec() {
        let g = GovernorSettings::default();
        assert_eq!(g.global_max_concurrent, 100);
        assert_eq!(g.per_account_max_concurrent, 10);
        assert_eq!(g.circuit_breaker_threshold, 10);
        assert_eq!(g.circuit_breaker_reset_ms, 30_000);
    }

    #[test]
    fn hibernation_defaults() {
        let h = HibernationSettings::default();
        assert_eq!(h.campaign_idle_days, 7);
        assert_eq!(h.login_idle_days, 14);
        assert_eq!(h.wake_gap_ms, 1_000);
        assert_eq!(h.wake_status_budget_s, 120);
        assert_eq!(h.wake_health_budget_s, 60);
    }

    #[test]
    fn testing_settings_are_dry_run() {
        let s = Settings::for_testing();
        assert!(s.dry_run);
        assert_eq!(s.dlq.retention_days, 30);
    }
}
