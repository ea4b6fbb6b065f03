//! Configuration module for the bindery application.
//!
//! This module handles loading and parsing configuration from environment variables
//! using the figment crate. It supports flexible duration parsing that accepts both
//! numeric values (interpreted as seconds) and duration strings with units.

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Main application configuration containing all sub-configurations
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Log level for the application
    ///
    /// This value is used to set the log level for this application's target specifically.
    /// e.g. "debug" would be similar to "warn,bindery=debug,..."
    ///
    /// Valid values are: "trace", "debug", "info", "warn", "error"
    /// Defaults to "info" if not specified
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port for the web server (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deployment environment (development, production, test)
    #[serde(default)]
    pub environment: Environment,
    /// Database connection URL
    pub database_url: String,

    /// Object store (S3-compatible) connection settings
    #[serde(flatten)]
    pub object_store: ObjectStoreConfig,

    /// User agent sent on every outbound HTTP request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Root URL of the merchant storefront the handlers crawl
    pub base_site_url: String,
    /// Baseline politeness delay applied to every outbound page request
    #[serde(
        default = "default_request_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub request_delay: Duration,
    /// Minimum delay between requests to the storefront
    ///
    /// The effective spacing is the larger of this, `request_delay` and the
    /// URL policy's per-agent crawl delay.
    #[serde(
        default = "default_site_rate_limit",
        deserialize_with = "deserialize_duration"
    )]
    pub site_rate_limit: Duration,

    /// Number of concurrent pipeline workers
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Default retry budget for enqueued jobs
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: i32,
    /// How long a worker may hold a job lease before it is reclaimable
    #[serde(default = "default_lock_ttl", deserialize_with = "deserialize_duration")]
    pub lock_ttl: Duration,
    /// How long an idle worker sleeps before polling the queue again
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    /// How often finished jobs are swept out of the queue table
    #[serde(
        default = "default_cleanup_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub cleanup_interval: Duration,
    /// Age past which completed/failed jobs are deleted by the sweep
    #[serde(
        default = "default_cleanup_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub cleanup_ttl: Duration,
    /// Graceful shutdown timeout duration
    ///
    /// Accepts both numeric values (seconds) and duration strings
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Optional webhook receiving monitoring alerts as JSON POSTs
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

/// Deployment environment the process runs in.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }
}

/// Connection settings for the S3-compatible object store.
///
/// All values are required; the process aborts at startup when any is
/// missing. `public_url` is the CDN-facing prefix that canonical image
/// URLs are built from, which may differ from `endpoint`.
#[derive(Deserialize, Clone)]
pub struct ObjectStoreConfig {
    pub object_store_endpoint: String,
    pub object_store_key_id: String,
    pub object_store_secret: String,
    pub object_store_bucket: String,
    pub object_store_public_url: String,
}

/// Default log level of "info"
fn default_log_level() -> String {
    "info".to_string()
}

/// Default port of 8080
fn default_port() -> u16 {
    8080
}

/// Default identifying user agent
fn default_user_agent() -> String {
    concat!(
        "bindery/",
        env!("CARGO_PKG_VERSION"),
        " (+https://github.com/bindery/bindery)"
    )
    .to_string()
}

/// Default politeness delay of 500 milliseconds
fn default_request_delay() -> Duration {
    Duration::from_millis(500)
}

/// Default storefront delay of 2 seconds between requests
fn default_site_rate_limit() -> Duration {
    Duration::from_secs(2)
}

/// Default of 4 concurrent workers
fn default_worker_concurrency() -> usize {
    4
}

/// Default retry budget of 3 attempts
fn default_retry_attempts() -> i32 {
    3
}

/// Default lock TTL of 10 minutes
fn default_lock_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Default queue poll interval of 5 seconds
fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

/// Default cleanup sweep interval of 1 hour
fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Default retention of 7 days for finished jobs
fn default_cleanup_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

/// Default shutdown timeout of 30 seconds
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Duration parser configured to handle various time units with seconds as default
///
/// Supports:
/// - Seconds (s) - default unit
/// - Milliseconds (ms)
/// - Minutes (m)
/// - Hours (h)
///
/// Does not support fractions, exponents, or infinity values
/// Allows for whitespace between the number and the time unit
/// Allows for multiple time units to be specified (summed together, e.g "10s 2m" = 120 + 10 = 130 seconds)
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::Second,
        TimeUnit::MilliSecond,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Custom deserializer for duration fields that accepts both numeric and string values
///
/// This deserializer handles the flexible duration parsing by accepting:
/// - Unsigned integers (interpreted as seconds)
/// - Signed integers (interpreted as seconds, must be non-negative)
/// - Strings (parsed using the fundu duration parser)
///
/// # Examples
///
/// - `1` -> 1 second
/// - `"30s"` -> 30 seconds
/// - `"2 m"` -> 2 minutes
/// - `"1500ms"` -> 1.5 seconds
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER.parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration format '{}': {}. Examples: '5' (5 seconds), '3500ms', '30s', '2m'",
                        value, e
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {}", e)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{Figment, providers::Env};

    fn set_required(jail: &mut figment::Jail) {
        jail.set_env("DATABASE_URL", "postgres://localhost/bindery");
        jail.set_env("BASE_SITE_URL", "https://shop.example.com");
        jail.set_env("OBJECT_STORE_ENDPOINT", "http://localhost:9000");
        jail.set_env("OBJECT_STORE_KEY_ID", "minio");
        jail.set_env("OBJECT_STORE_SECRET", "minio123");
        jail.set_env("OBJECT_STORE_BUCKET", "catalog");
        jail.set_env("OBJECT_STORE_PUBLIC_URL", "http://localhost:9000/catalog");
    }

    #[test]
    fn defaults_applied() {
        figment::Jail::expect_with(|jail| {
            set_required(jail);
            let config: Config = Figment::new()
                .merge(Env::raw())
                .extract()
                .expect("config should load");

            assert_eq!(config.port, 8080);
            assert_eq!(config.environment, Environment::Development);
            assert_eq!(config.worker_concurrency, 4);
            assert_eq!(config.retry_attempts, 3);
            assert_eq!(config.lock_ttl, Duration::from_secs(600));
            assert_eq!(config.poll_interval, Duration::from_secs(5));
            assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
            assert!(config.alert_webhook_url.is_none());
            Ok(())
        });
    }

    #[test]
    fn duration_strings_parse() {
        figment::Jail::expect_with(|jail| {
            set_required(jail);
            jail.set_env("LOCK_TTL", "5m");
            jail.set_env("POLL_INTERVAL", "1500ms");
            jail.set_env("ENVIRONMENT", "production");
            let config: Config = Figment::new()
                .merge(Env::raw())
                .extract()
                .expect("config should load");

            assert_eq!(config.lock_ttl, Duration::from_secs(300));
            assert_eq!(config.poll_interval, Duration::from_millis(1500));
            assert_eq!(config.environment, Environment::Production);
            Ok(())
        });
    }

    #[test]
    fn missing_database_url_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MISSING_BASE_SITE_URL", "https://shop.example.com");
            let result: Result<Config, _> =
                Figment::new().merge(Env::prefixed("MISSING_")).extract();
            assert!(result.is_err(), "missing required values must abort startup");
            Ok(())
        });
    }
}
