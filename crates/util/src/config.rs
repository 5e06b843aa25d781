use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://hookrelay.db?mode=rwc";
pub const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const DEFAULT_ID_HEADER: &str = "X-Webhook-Id";

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// Upper bounds keep every derived timestamp inside the representable range.
const MAX_DEDUPE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const MAX_BACKOFF_CAP: Duration = DAY;
const MAX_LEASE_TIMEOUT: Duration = DAY;
const MAX_POLL_INTERVAL: Duration = HOUR;
const MAX_SHUTDOWN_GRACE: Duration = HOUR;
const MAX_RETENTION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook: WebhookConfig,
    pub dispatch: DispatchConfig,
    /// Target for the forwarding handler. `None` selects the logging handler.
    pub downstream_url: Option<String>,
    pub status_recent_events: usize,
    pub succeeded_retention: Duration,
    pub shutdown_grace: Duration,
}

/// Settings for the inbound webhook endpoint.
#[derive(Clone)]
pub struct WebhookConfig {
    pub path: String,
    pub secret: Option<Vec<u8>>,
    pub signature_header: String,
    /// Either `sha256` or `sha512`.
    pub signature_algorithm: String,
    pub id_header: String,
    pub id_bucket: Duration,
    pub dedupe_ttl: Duration,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("path", &self.path)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("signature_header", &self.signature_header)
            .field("signature_algorithm", &self.signature_algorithm)
            .field("id_header", &self.id_header)
            .field("id_bucket", &self.id_bucket)
            .field("dedupe_ttl", &self.dedupe_ttl)
            .finish()
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_WEBHOOK_PATH.to_string(),
            secret: None,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            signature_algorithm: "sha256".to_string(),
            id_header: DEFAULT_ID_HEADER.to_string(),
            id_bucket: Duration::from_secs(300),
            dedupe_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Settings for the dispatch worker pool and its retry policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub worker_count: usize,
    pub batch_size: usize,
    pub lease_timeout: Duration,
    pub handler_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1_000),
            backoff_cap: Duration::from_millis(300_000),
            worker_count: 4,
            batch_size: 8,
            lease_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = bind_address(&string_or("APP_BIND_ADDR", DEFAULT_BIND_ADDR))?;
        let database_url = string_or("APP_DATABASE_URL", DEFAULT_DATABASE_URL);

        let webhook = WebhookConfig {
            path: string_or("WEBHOOK_PATH", DEFAULT_WEBHOOK_PATH),
            secret: optional_string("WEBHOOK_SECRET").map(String::into_bytes),
            signature_header: string_or("WEBHOOK_SIGNATURE_HEADER", DEFAULT_SIGNATURE_HEADER),
            signature_algorithm: string_or("WEBHOOK_SIGNATURE_ALGORITHM", "sha256")
                .to_ascii_lowercase(),
            id_header: string_or("WEBHOOK_ID_HEADER", DEFAULT_ID_HEADER),
            id_bucket: Duration::from_secs(number_or("WEBHOOK_ID_BUCKET_SECS", 300u64)?),
            dedupe_ttl: Duration::from_secs(number_or("DEDUPE_TTL_SECS", 86_400u64)?),
        };

        let dispatch = DispatchConfig {
            max_attempts: number_or("DISPATCH_MAX_ATTEMPTS", 5u32)?,
            backoff_base: Duration::from_millis(number_or("DISPATCH_BACKOFF_BASE_MS", 1_000u64)?),
            backoff_cap: Duration::from_millis(number_or("DISPATCH_BACKOFF_CAP_MS", 300_000u64)?),
            worker_count: number_or("DISPATCH_WORKERS", 4usize)?,
            batch_size: number_or("DISPATCH_BATCH_SIZE", 8usize)?,
            lease_timeout: Duration::from_secs(number_or("DISPATCH_LEASE_TIMEOUT_SECS", 60u64)?),
            handler_timeout: Duration::from_secs(number_or(
                "DISPATCH_HANDLER_TIMEOUT_SECS",
                30u64,
            )?),
            poll_interval: Duration::from_millis(number_or("DISPATCH_POLL_INTERVAL_MS", 1_000u64)?),
        };

        let config = Self {
            bind_addr,
            environment,
            database_url,
            webhook,
            dispatch,
            downstream_url: optional_string("DOWNSTREAM_URL"),
            status_recent_events: number_or("STATUS_RECENT_EVENTS", 50usize)?,
            succeeded_retention: hours("SUCCEEDED_RETENTION_HOURS", 72)?,
            shutdown_grace: Duration::from_secs(number_or("SHUTDOWN_GRACE_SECS", 10u64)?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.webhook.path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                var: "WEBHOOK_PATH",
                reason: "must start with '/'".to_string(),
            });
        }
        if !matches!(self.webhook.signature_algorithm.as_str(), "sha256" | "sha512") {
            return Err(ConfigError::InvalidValue {
                var: "WEBHOOK_SIGNATURE_ALGORITHM",
                reason: format!(
                    "expected 'sha256' or 'sha512' (got {})",
                    self.webhook.signature_algorithm
                ),
            });
        }
        if self.webhook.id_bucket.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "WEBHOOK_ID_BUCKET_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        let dispatch = &self.dispatch;
        if dispatch.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DISPATCH_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if dispatch.worker_count == 0 || dispatch.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DISPATCH_WORKERS",
                reason: "worker count and batch size must be at least 1".to_string(),
            });
        }
        if dispatch.backoff_cap < dispatch.backoff_base {
            return Err(ConfigError::InvalidValue {
                var: "DISPATCH_BACKOFF_CAP_MS",
                reason: "must not be smaller than DISPATCH_BACKOFF_BASE_MS".to_string(),
            });
        }
        if dispatch.handler_timeout >= dispatch.lease_timeout {
            return Err(ConfigError::InvalidValue {
                var: "DISPATCH_HANDLER_TIMEOUT_SECS",
                reason: "must be shorter than DISPATCH_LEASE_TIMEOUT_SECS".to_string(),
            });
        }
        non_zero("DISPATCH_HANDLER_TIMEOUT_SECS", dispatch.handler_timeout)?;
        non_zero("DISPATCH_POLL_INTERVAL_MS", dispatch.poll_interval)?;

        at_most("DEDUPE_TTL_SECS", self.webhook.dedupe_ttl, MAX_DEDUPE_TTL)?;
        at_most("DISPATCH_BACKOFF_CAP_MS", dispatch.backoff_cap, MAX_BACKOFF_CAP)?;
        at_most("DISPATCH_LEASE_TIMEOUT_SECS", dispatch.lease_timeout, MAX_LEASE_TIMEOUT)?;
        at_most("DISPATCH_POLL_INTERVAL_MS", dispatch.poll_interval, MAX_POLL_INTERVAL)?;
        at_most("SHUTDOWN_GRACE_SECS", self.shutdown_grace, MAX_SHUTDOWN_GRACE)?;
        at_most("SUCCEEDED_RETENTION_HOURS", self.succeeded_retention, MAX_RETENTION)?;
        Ok(())
    }
}

fn non_zero(var: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn at_most(var: &'static str, value: Duration, max: Duration) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::InvalidValue {
            var,
            reason: format!("must not exceed {}s (got {}s)", max.as_secs(), value.as_secs()),
        });
    }
    Ok(())
}

fn bind_address(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.trim().parse().map_err(|source| ConfigError::BindAddress {
        value: raw.to_string(),
        source,
    })
}

fn hours(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let hours = number_or(var, default)?;
    hours
        .checked_mul(HOUR.as_secs())
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            var,
            reason: format!("{hours} hours is out of range"),
        })
}

fn optional_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn string_or(var: &str, default: &str) -> String {
    optional_string(var).unwrap_or_else(|| default.to_string())
}

fn number_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_string(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress {
        value: String,
        source: std::net::AddrParseError,
    },
    InvalidNumber { var: &'static str, value: String },
    InvalidValue { var: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress { value, source } => {
                write!(f, "invalid APP_BIND_ADDR value '{value}': {source}")
            }
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a non-negative integer (got {value})")
            }
            Self::InvalidValue { var, reason } => write!(f, "invalid {var}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindAddress { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ENV_GUARD;

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "APP_DATABASE_URL",
        "WEBHOOK_SECRET",
        "WEBHOOK_PATH",
        "WEBHOOK_SIGNATURE_ALGORITHM",
        "DEDUPE_TTL_SECS",
        "DISPATCH_MAX_ATTEMPTS",
        "DISPATCH_BACKOFF_BASE_MS",
        "DISPATCH_BACKOFF_CAP_MS",
        "DISPATCH_HANDLER_TIMEOUT_SECS",
        "DISPATCH_LEASE_TIMEOUT_SECS",
        "DISPATCH_POLL_INTERVAL_MS",
        "SUCCEEDED_RETENTION_HOURS",
        "SHUTDOWN_GRACE_SECS",
        "DOWNSTREAM_URL",
    ];

    fn invalid_var(err: ConfigError) -> &'static str {
        match err {
            ConfigError::InvalidValue { var, .. } => var,
            other => panic!("expected an invalid value, got {other}"),
        }
    }

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.webhook.path, "/webhook");
        assert!(config.webhook.secret.is_none());
        assert_eq!(config.webhook.dedupe_ttl, Duration::from_secs(86_400));
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.worker_count, 4);
        assert!(config.downstream_url.is_none());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("WEBHOOK_SECRET", "s3cr3t");
        env::set_var("DISPATCH_MAX_ATTEMPTS", "3");
        env::set_var("DOWNSTREAM_URL", "http://localhost:9100/hook");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.webhook.secret.as_deref(), Some(&b"s3cr3t"[..]));
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(
            config.downstream_url.as_deref(),
            Some("http://localhost:9100/hook")
        );

        clear_env();
    }

    #[test]
    fn rejects_non_numeric_values() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("DISPATCH_MAX_ATTEMPTS", "many");

        let err = AppConfig::from_env().expect_err("non-numeric should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { var: "DISPATCH_MAX_ATTEMPTS", .. }
        ));

        clear_env();
    }

    #[test]
    fn rejects_handler_timeout_longer_than_lease() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("DISPATCH_HANDLER_TIMEOUT_SECS", "60");
        env::set_var("DISPATCH_LEASE_TIMEOUT_SECS", "30");

        let err = AppConfig::from_env().expect_err("timeouts should be validated");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "DISPATCH_HANDLER_TIMEOUT_SECS", .. }
        ));

        clear_env();
    }

    #[test]
    fn rejects_zero_handler_timeout_and_poll_interval() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        env::set_var("DISPATCH_HANDLER_TIMEOUT_SECS", "0");
        let err = AppConfig::from_env().expect_err("zero handler timeout");
        assert_eq!(invalid_var(err), "DISPATCH_HANDLER_TIMEOUT_SECS");
        env::remove_var("DISPATCH_HANDLER_TIMEOUT_SECS");

        env::set_var("DISPATCH_POLL_INTERVAL_MS", "0");
        let err = AppConfig::from_env().expect_err("zero poll interval");
        assert_eq!(invalid_var(err), "DISPATCH_POLL_INTERVAL_MS");

        clear_env();
    }

    #[test]
    fn rejects_durations_beyond_upper_bounds() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        let cases = [
            ("DEDUPE_TTL_SECS", "1000000000000000"),
            ("DISPATCH_BACKOFF_CAP_MS", "18446744073709551615"),
            ("DISPATCH_LEASE_TIMEOUT_SECS", "1000000000"),
            ("DISPATCH_POLL_INTERVAL_MS", "86400000"),
            ("SHUTDOWN_GRACE_SECS", "1000000000000"),
            ("SUCCEEDED_RETENTION_HOURS", "1000000"),
        ];
        for (var, value) in cases {
            clear_env();
            env::set_var(var, value);
            let err = AppConfig::from_env().expect_err("oversized value should error");
            assert_eq!(invalid_var(err), var);
        }
        clear_env();
    }

    #[test]
    fn retention_hours_overflow_is_an_error() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("SUCCEEDED_RETENTION_HOURS", u64::MAX.to_string());

        let err = AppConfig::from_env().expect_err("overflowing retention");
        assert!(err.to_string().contains("out of range"));

        clear_env();
    }

    #[test]
    fn rejects_unparseable_bind_address() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_BIND_ADDR", "localhost");

        let err = AppConfig::from_env().expect_err("bind address should be validated");
        assert!(matches!(&err, ConfigError::BindAddress { value, .. } if value == "localhost"));
        assert!(std::error::Error::source(&err).is_some());

        clear_env();
    }

    #[test]
    fn rejects_unknown_signature_algorithm() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("WEBHOOK_SIGNATURE_ALGORITHM", "md5");

        let err = AppConfig::from_env().expect_err("algorithm should be validated");
        assert!(err.to_string().contains("WEBHOOK_SIGNATURE_ALGORITHM"));

        clear_env();
    }

    #[test]
    fn debug_output_redacts_secret() {
        let webhook = WebhookConfig {
            secret: Some(b"hunter2".to_vec()),
            ..WebhookConfig::default()
        };
        let rendered = format!("{webhook:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
