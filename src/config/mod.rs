//! Process configuration from environment variables.
//!
//! Loaded once at startup with figment. Duration fields accept both bare
//! numbers (seconds) and strings with units ("30s", "5m"). Dynamic
//! tunables live in the config collection instead (see `settings`).

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Main application configuration.
#[derive(Deserialize)]
pub struct Config {
    /// Log level for this application's target, e.g. "debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port for the webhook server (worker role).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database connection URL.
    pub database_url: String,
    /// Graceful shutdown timeout.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Shared secret for webhook HMAC signatures. Required by the worker
    /// role, which serves the webhook.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Webhook requests per minute before 429s.
    #[serde(default = "default_webhook_rpm")]
    pub webhook_rpm: u32,
    /// Extra burst allowance on top of the steady rate.
    #[serde(default = "default_webhook_burst")]
    pub webhook_burst: u32,
    /// Window in which an identical signed request is treated as a replay.
    #[serde(
        default = "default_replay_window",
        deserialize_with = "deserialize_duration"
    )]
    pub replay_window: Duration,

    /// How often the dynamic config documents are re-polled.
    #[serde(
        default = "default_config_refresh",
        deserialize_with = "deserialize_duration"
    )]
    pub config_refresh_interval: Duration,

    /// Pause between rotation cycles (rotate role).
    #[serde(
        default = "default_rotation_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub rotation_interval: Duration,
    /// Sources scraped per rotation cycle.
    #[serde(default = "default_rotation_batch")]
    pub rotation_batch: usize,

    /// Dedup cache entry lifetime.
    #[serde(
        default = "default_dedup_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub dedup_ttl: Duration,
    /// Dedup cache LRU bound.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Path to the candidate profile JSON handed to the scorer.
    #[serde(default)]
    pub profile_path: Option<String>,
    /// Scoring service endpoint. Required by the worker role.
    #[serde(default)]
    pub scorer_url: Option<String>,
    /// Company enrichment service endpoint; enrichment is skipped if unset.
    #[serde(default)]
    pub enrichment_url: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Default shutdown timeout of 8 seconds.
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_webhook_rpm() -> u32 {
    60
}

fn default_webhook_burst() -> u32 {
    10
}

fn default_replay_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_config_refresh() -> Duration {
    Duration::from_secs(60)
}

fn default_rotation_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_rotation_batch() -> usize {
    5
}

fn default_dedup_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_dedup_capacity() -> usize {
    16 * 1024
}

/// Duration parser with seconds as the default unit.
///
/// Accepts "5" (seconds), "1500ms", "30s", "2m"; multiple units are summed
/// ("2m 30s"). Fractions, exponents, and infinity are rejected.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::Second, TimeUnit::MilliSecond, TimeUnit::Minute])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserializer accepting both numeric (seconds) and string durations.
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
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration '{value}': {e}. Examples: '5' (seconds), '1500ms', '30s', '2m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration conversion error: {e}")))
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
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
