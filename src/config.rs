//! Environment configuration surface
//!
//! All runtime options come from environment variables, read once at
//! startup. Unset variables fall back to defaults suitable for local
//! development; values that fail to parse are startup errors rather than
//! silent fallbacks.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::bootstrap::BootstrapConfig;
use crate::error::{AuthzError, Result};
use crate::jwt::{Algorithm, VerifierConfig};

/// Runtime configuration assembled from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the ext-authz gRPC service (`GRPC_PORT`)
    pub grpc_port: u16,

    /// Port for the health/metrics HTTP server (`METRICS_PORT`)
    pub metrics_port: u16,

    /// URL of the key-value revocation store (`REVOCATION_STORE_URL`)
    pub revocation_store_url: String,

    /// Key prefix for revocation entries (`REVOCATION_KEY_PREFIX`)
    pub revocation_key_prefix: String,

    /// Bootstrap scan page size (`REVOCATION_SCAN_PAGE_SIZE`)
    pub scan_page_size: usize,

    /// Per-lookup bound in the store-backed mode (`REVOCATION_READ_TIMEOUT_SEC`)
    pub read_timeout: Duration,

    /// Overall bootstrap deadline (`BOOTSTRAP_TIMEOUT_SEC`)
    pub bootstrap_timeout: Duration,

    /// Event bus URL; `None` disables live updates (`EVENT_BUS_URL`)
    pub event_bus_url: Option<String>,

    /// Whether to serve revocation checks from the local cache
    /// (`LOCAL_CACHE_ENABLED`)
    pub local_cache_enabled: bool,

    /// Cache sweeper tick interval (`LOCAL_CACHE_CLEANUP_SEC`)
    pub cleanup_interval: Duration,

    /// Credential verifier settings (`JWT_*`)
    pub verifier: VerifierConfig,

    /// Shared HMAC secret (`JWT_SECRET`)
    pub jwt_secret: Option<String>,

    /// PEM public key for asymmetric algorithms (`JWT_PUBLIC_KEY`)
    pub jwt_public_key: Option<String>,

    /// Origins that receive CORS headers on deny responses
    /// (`CORS_ALLOWED_ORIGINS`, comma-separated)
    pub cors_allowed_origins: HashSet<String>,

    /// Log filter directive (`LOG_LEVEL`)
    pub log_level: String,

    /// Deployment environment label (`ENVIRONMENT`)
    pub environment: String,
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let algorithm = Algorithm::from_str(&var_or("JWT_ALGORITHM", "HS256"))?;

        let verifier = VerifierConfig {
            algorithm,
            issuer: non_empty(var_or("JWT_ISSUER", "")),
            audience: non_empty(var_or("JWT_AUDIENCE", "")),
            clock_skew: parse_var("JWT_CLOCK_SKEW_SEC", 60)?,
            required_capability: non_empty(var_or("JWT_REQUIRED_CAPABILITY", "")),
        };

        let cleanup_secs: u64 = parse_var("LOCAL_CACHE_CLEANUP_SEC", 30)?;
        if cleanup_secs == 0 {
            return Err(AuthzError::configuration(
                "LOCAL_CACHE_CLEANUP_SEC must be at least 1",
            ));
        }

        Ok(Self {
            grpc_port: parse_var("GRPC_PORT", 50051)?,
            metrics_port: parse_var("METRICS_PORT", 9090)?,
            revocation_store_url: var_or("REVOCATION_STORE_URL", "redis://127.0.0.1:6379"),
            revocation_key_prefix: var_or("REVOCATION_KEY_PREFIX", "revoked:"),
            scan_page_size: parse_var("REVOCATION_SCAN_PAGE_SIZE", 1000)?,
            read_timeout: Duration::from_secs(parse_var("REVOCATION_READ_TIMEOUT_SEC", 1)?),
            bootstrap_timeout: Duration::from_secs(parse_var("BOOTSTRAP_TIMEOUT_SEC", 30)?),
            event_bus_url: non_empty(var_or("EVENT_BUS_URL", "")),
            local_cache_enabled: parse_bool("LOCAL_CACHE_ENABLED", true),
            cleanup_interval: Duration::from_secs(cleanup_secs),
            verifier,
            jwt_secret: non_empty(var_or("JWT_SECRET", "")),
            jwt_public_key: non_empty(var_or("JWT_PUBLIC_KEY", "")),
            cors_allowed_origins: parse_origins(&var_or("CORS_ALLOWED_ORIGINS", "")),
            log_level: var_or("LOG_LEVEL", "info"),
            environment: var_or("ENVIRONMENT", "development"),
        })
    }
}

/// Environment variable or default value
fn var_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Parse an environment variable, falling back to a default when unset
fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().map_err(|_| {
            AuthzError::configuration(format!("invalid value for {key}: {value}"))
        }),
        _ => Ok(default),
    }
}

/// Parse a boolean environment variable ("true"/"1" are truthy)
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value == "true" || value == "1",
        _ => default,
    }
}

/// Turn an empty string into `None`
fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Split a comma-separated origin list into an exact-match set
fn parse_origins(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl From<&Config> for BootstrapConfig {
    fn from(config: &Config) -> Self {
        Self {
            key_prefix: config.revocation_key_prefix.clone(),
            page_size: config.scan_page_size,
            deadline: config.bootstrap_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins() {
        let origins = parse_origins("https://a.example, https://b.example ,,");
        assert_eq!(origins.len(), 2);
        assert!(origins.contains("https://a.example"));
        assert!(origins.contains("https://b.example"));

        assert!(parse_origins("").is_empty());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty("".to_string()), None);
        assert_eq!(non_empty("   ".to_string()), None);
        assert_eq!(non_empty("eco2".to_string()), Some("eco2".to_string()));
    }

    #[test]
    fn test_defaults_without_environment() {
        // Variables are unlikely to be set in the test environment with
        // these exact names; defaults should apply.
        let config = Config::from_env().expect("defaults should parse");
        assert_eq!(config.revocation_key_prefix, "revoked:");
        assert_eq!(config.scan_page_size, 1000);
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert!(config.local_cache_enabled);
        assert_eq!(config.verifier.algorithm, Algorithm::HS256);
        assert_eq!(config.verifier.clock_skew, 60);
        assert!(config.verifier.issuer.is_none());
        assert!(config.cors_allowed_origins.is_empty());
    }
}
