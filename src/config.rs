//! Environment configuration
//!
//! Everything is `TOKENHUB_*` environment variables with validated
//! defaults. Invalid numeric values fail startup with a descriptive error
//! rather than silently falling back.

use std::path::PathBuf;

use crate::models::RouteMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub db_dsn: String,
    pub admin_token: Option<String>,
    pub cors_origins: Vec<String>,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub default_mode: RouteMode,
    pub default_max_budget_usd: f64,
    pub default_max_latency_ms: u64,
    pub provider_timeout_secs: u64,
    pub vault_enabled: bool,
    pub vault_password: Option<String>,
    pub log_level: String,
    pub otel_enabled: bool,
    pub otel_endpoint: Option<String>,
    pub otel_service: String,
    pub temporal_enabled: bool,
    pub temporal_address: Option<String>,
    pub credentials_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            db_dsn: "sqlite://tokenhub.db".into(),
            admin_token: None,
            cors_origins: Vec::new(),
            rate_limit_rps: 10,
            rate_limit_burst: 20,
            default_mode: RouteMode::Normal,
            default_max_budget_usd: 0.0,
            default_max_latency_ms: 30_000,
            provider_timeout_secs: 30,
            vault_enabled: false,
            vault_password: None,
            log_level: "info".into(),
            otel_enabled: false,
            otel_endpoint: None,
            otel_service: "tokenhub".into(),
            temporal_enabled: false,
            temporal_address: None,
            credentials_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup; tests inject maps here.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(addr) = lookup("TOKENHUB_LISTEN_ADDR") {
            // A bare ":8080" means all interfaces.
            config.listen_addr = if let Some(port) = addr.strip_prefix(':') {
                format!("0.0.0.0:{port}")
            } else {
                addr
            };
        }
        if let Some(dsn) = lookup("TOKENHUB_DB_DSN") {
            config.db_dsn = dsn;
        }
        config.admin_token = lookup("TOKENHUB_ADMIN_TOKEN").filter(|t| !t.is_empty());
        if let Some(origins) = lookup("TOKENHUB_CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        config.rate_limit_rps = parse_positive(lookup, "TOKENHUB_RATE_LIMIT_RPS", config.rate_limit_rps)?;
        config.rate_limit_burst =
            parse_positive(lookup, "TOKENHUB_RATE_LIMIT_BURST", config.rate_limit_burst)?;

        if let Some(mode) = lookup("TOKENHUB_DEFAULT_MODE") {
            config.default_mode = RouteMode::parse(&mode).ok_or_else(|| ConfigError::Invalid {
                name: "TOKENHUB_DEFAULT_MODE",
                value: mode,
                reason: "expected one of normal, cheap, fast, large, budget".into(),
            })?;
        }

        if let Some(raw) = lookup("TOKENHUB_DEFAULT_MAX_BUDGET_USD") {
            let budget: f64 = raw.parse().map_err(|_| ConfigError::Invalid {
                name: "TOKENHUB_DEFAULT_MAX_BUDGET_USD",
                value: raw.clone(),
                reason: "expected a number >= 0".into(),
            })?;
            if budget < 0.0 || !budget.is_finite() {
                return Err(ConfigError::Invalid {
                    name: "TOKENHUB_DEFAULT_MAX_BUDGET_USD",
                    value: raw,
                    reason: "expected a number >= 0".into(),
                });
            }
            config.default_max_budget_usd = budget;
        }

        config.default_max_latency_ms = parse_positive(
            lookup,
            "TOKENHUB_DEFAULT_MAX_LATENCY_MS",
            config.default_max_latency_ms,
        )?;
        config.provider_timeout_secs = parse_positive(
            lookup,
            "TOKENHUB_PROVIDER_TIMEOUT_SECS",
            config.provider_timeout_secs,
        )?;

        config.vault_enabled = parse_bool(lookup, "TOKENHUB_VAULT_ENABLED");
        config.vault_password = lookup("TOKENHUB_VAULT_PASSWORD").filter(|p| !p.is_empty());
        if let Some(level) = lookup("TOKENHUB_LOG_LEVEL") {
            config.log_level = level;
        }

        config.otel_enabled = parse_bool(lookup, "TOKENHUB_OTEL_ENABLED");
        config.otel_endpoint = lookup("TOKENHUB_OTEL_ENDPOINT").filter(|e| !e.is_empty());
        if let Some(service) = lookup("TOKENHUB_OTEL_SERVICE") {
            config.otel_service = service;
        }

        config.temporal_enabled = parse_bool(lookup, "TOKENHUB_TEMPORAL_ENABLED");
        config.temporal_address = lookup("TOKENHUB_TEMPORAL_ADDRESS").filter(|a| !a.is_empty());
        config.credentials_file = lookup("TOKENHUB_CREDENTIALS_FILE")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }
}

fn parse_positive<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => {
            let value: T = raw.parse().map_err(|_| ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: "expected a positive integer".into(),
            })?;
            if value <= T::default() {
                return Err(ConfigError::Invalid {
                    name,
                    value: raw,
                    reason: "expected a positive integer".into(),
                });
            }
            Ok(value)
        }
    }
}

fn parse_bool(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_with_empty_environment() {
        let config = Config::from_lookup(&lookup(&[])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.rate_limit_rps, 10);
        assert_eq!(config.default_mode, RouteMode::Normal);
    }

    #[test]
    fn bare_port_listen_addr_expands() {
        let config = Config::from_lookup(&lookup(&[("TOKENHUB_LISTEN_ADDR", ":9090")])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9090");
    }

    #[test]
    fn invalid_numerics_fail_with_descriptive_error() {
        let err = Config::from_lookup(&lookup(&[("TOKENHUB_RATE_LIMIT_RPS", "zero")])).unwrap_err();
        assert!(err.to_string().contains("TOKENHUB_RATE_LIMIT_RPS"));

        let err = Config::from_lookup(&lookup(&[("TOKENHUB_RATE_LIMIT_RPS", "0")])).unwrap_err();
        assert!(err.to_string().contains("positive"));

        let err =
            Config::from_lookup(&lookup(&[("TOKENHUB_DEFAULT_MAX_BUDGET_USD", "-1")])).unwrap_err();
        assert!(err.to_string().contains("TOKENHUB_DEFAULT_MAX_BUDGET_USD"));
    }

    #[test]
    fn mode_and_cors_parse() {
        let config = Config::from_lookup(&lookup(&[
            ("TOKENHUB_DEFAULT_MODE", "cheap"),
            ("TOKENHUB_CORS_ORIGINS", "https://a.test, https://b.test"),
        ]))
        .unwrap();
        assert_eq!(config.default_mode, RouteMode::Cheap);
        assert_eq!(config.cors_origins.len(), 2);

        let err = Config::from_lookup(&lookup(&[("TOKENHUB_DEFAULT_MODE", "warp")])).unwrap_err();
        assert!(err.to_string().contains("TOKENHUB_DEFAULT_MODE"));
    }
}
