use std::str::FromStr;
use std::time::Duration;

use cms_dispatch::NightlySchedule;
use cms_ratelimit::{Scope, ScopePolicy};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Outbox
    pub poll_interval: Duration,
    pub reclaim_after: Option<chrono::Duration>,
    pub nightly_stats: NightlySchedule,

    // Rate limiting
    pub user_quota: ScopePolicy,
    pub org_quota: ScopePolicy,
    pub ip_quota: ScopePolicy,
    pub rate_limit_backend_timeout: Duration,
    pub rate_limit_sweep_interval: Duration,
    /// Key the IP quota on `X-Forwarded-For`. Only behind a proxy that sets it.
    pub rate_limit_trust_forwarded_for: bool,

    // Web server
    pub web_host: String,
    pub web_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = get("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let poll_ms: u64 = parse_or(&get, "OUTBOX_POLL_INTERVAL_MS", 1500)?;
        let reclaim_secs: Option<i64> = parse_opt(&get, "OUTBOX_RECLAIM_AFTER_SECS")?;
        let nightly_hour: u32 = parse_or(&get, "NIGHTLY_STATS_HOUR_UTC", 3)?;
        let timeout_ms: u64 = parse_or(&get, "RATE_LIMIT_BACKEND_TIMEOUT_MS", 250)?;
        let sweep_secs: u64 = parse_or(&get, "RATE_LIMIT_SWEEP_INTERVAL_SECS", 300)?;
        let trust_forwarded_for: bool = parse_or(&get, "RATE_LIMIT_TRUST_FORWARDED_FOR", false)?;

        let config = Self {
            database_url,
            poll_interval: Duration::from_millis(positive("OUTBOX_POLL_INTERVAL_MS", poll_ms)?),
            reclaim_after: reclaim_secs
                .map(|secs| {
                    if secs > 0 {
                        Ok(chrono::Duration::seconds(secs))
                    } else {
                        Err(invalid("OUTBOX_RECLAIM_AFTER_SECS", "must be greater than zero"))
                    }
                })
                .transpose()?,
            nightly_stats: NightlySchedule::at_hour(nightly_hour)
                .ok_or_else(|| invalid("NIGHTLY_STATS_HOUR_UTC", "must be 0-23"))?,
            user_quota: policy(&get, "RATE_LIMIT_USER", Scope::User, "600/60")?,
            org_quota: policy(&get, "RATE_LIMIT_ORG", Scope::Org, "3000/60")?,
            ip_quota: policy(&get, "RATE_LIMIT_IP", Scope::Ip, "120/60")?,
            rate_limit_backend_timeout: Duration::from_millis(positive(
                "RATE_LIMIT_BACKEND_TIMEOUT_MS",
                timeout_ms,
            )?),
            rate_limit_sweep_interval: Duration::from_secs(positive(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                sweep_secs,
            )?),
            rate_limit_trust_forwarded_for: trust_forwarded_for,
            web_host: get("WEB_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            web_port: parse_or(&get, "WEB_PORT", 3000)?,
        };

        Ok(config)
    }

    pub fn quota_policies(&self) -> [ScopePolicy; 3] {
        [self.user_quota, self.org_quota, self.ip_quota]
    }

    pub fn log_summary(&self) {
        fn quota(p: &ScopePolicy) -> String {
            if p.is_enabled() {
                format!("{}/{}s", p.limit, p.window_secs)
            } else {
                "disabled".to_string()
            }
        }

        info!("Config loaded:");
        info!("  DATABASE_URL: {}", redact_url(&self.database_url));
        info!("  OUTBOX_POLL_INTERVAL_MS: {}", self.poll_interval.as_millis());
        info!(
            "  OUTBOX_RECLAIM_AFTER_SECS: {}",
            self.reclaim_after
                .map(|d| d.num_seconds().to_string())
                .unwrap_or_else(|| "<not set>".to_string())
        );
        info!("  RATE_LIMIT_USER: {}", quota(&self.user_quota));
        info!("  RATE_LIMIT_ORG: {}", quota(&self.org_quota));
        info!("  RATE_LIMIT_IP: {}", quota(&self.ip_quota));
        info!(
            "  RATE_LIMIT_TRUST_FORWARDED_FOR: {}",
            self.rate_limit_trust_forwarded_for
        );
        info!("  WEB: {}:{}", self.web_host, self.web_port);
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn parse_opt<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, format!("cannot parse {raw:?}"))),
        _ => Ok(None),
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn policy(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    scope: Scope,
    default: &str,
) -> Result<ScopePolicy, ConfigError> {
    let raw = get(key).unwrap_or_else(|| default.to_string());
    ScopePolicy::parse(scope, &raw).map_err(|e| invalid(key, e.to_string()))
}

/// Hide the password in a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let Some(at) = url[scheme_end..].find('@').map(|i| i + scheme_end) else {
        return url.to_string();
    };
    match url[scheme_end..at].find(':') {
        Some(colon) => format!("{}:***{}", &url[..scheme_end + colon], &url[at..]),
        None => url.to_string(),
    }
}
