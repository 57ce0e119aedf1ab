use crate::status::StatusThresholds;
use anyhow::{ensure, Context, Result};
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOPIC_NAMESPACE: &str = "kampoengtani";

/// Upper bound for every interval and threshold setting (one year).
const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Keys accepted in the `INGEST_CONFIG_PATH` file. A key only applies when the
/// matching environment variable is unset or blank.
#[derive(Debug, Clone, Default, Deserialize)]
struct FileOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    topic_namespace: Option<String>,
    #[serde(default)]
    sweep_interval_secs: Option<u64>,
    #[serde(default)]
    sweep_threshold_secs: Option<u64>,
    #[serde(default)]
    offline_threshold_secs: Option<u64>,
    #[serde(default)]
    restart_threshold_secs: Option<u64>,
}

fn load_file_overrides(path: &Path) -> Option<FileOverrides> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "soil-ingest failed to read config file; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents;
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "soil-ingest failed to parse config file; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub topic_namespace: String,
    pub sweep_interval_secs: u64,
    pub sweep_threshold_secs: u64,
    pub offline_threshold_secs: u64,
    pub restart_threshold_secs: u64,
    pub stats_log_interval_secs: u64,
    pub otlp_endpoint: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup` (normally the process environment),
    /// layering the optional JSON file underneath it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let parsed = |key: &str| -> Result<Option<u64>> {
            var(key)
                .map(|raw| {
                    raw.parse::<u64>().with_context(|| {
                        format!("{key} must be a non-negative integer, got {raw:?}")
                    })
                })
                .transpose()
        };

        let config_path = var("INGEST_CONFIG_PATH").map(PathBuf::from);
        let file = config_path
            .as_deref()
            .and_then(load_file_overrides)
            .unwrap_or_default();
        let file_text = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let database_url = var("INGEST_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .or_else(|| file_text(&file.database_url))
            .context("INGEST_DATABASE_URL, DATABASE_URL or config file database_url is required")?;
        let database_url = normalize_database_url(database_url);

        let db_pool_size = match var("INGEST_DB_POOL_SIZE") {
            Some(raw) => raw.parse::<u32>().with_context(|| {
                format!("INGEST_DB_POOL_SIZE must be a positive integer, got {raw:?}")
            })?,
            None => 5,
        };

        let mqtt_host = var("INGEST_MQTT_HOST")
            .or_else(|| var("MQTT_BROKER"))
            .or_else(|| file_text(&file.mqtt_host))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = match var("INGEST_MQTT_PORT").or_else(|| var("MQTT_PORT")) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| {
                    format!("MQTT port must be a valid port number, got {raw:?}")
                })?,
            None => file.mqtt_port.filter(|port| *port != 0).unwrap_or(1883),
        };
        let mqtt_username =
            var("INGEST_MQTT_USERNAME").or_else(|| file_text(&file.mqtt_username));
        let mqtt_password =
            var("INGEST_MQTT_PASSWORD").or_else(|| file_text(&file.mqtt_password));
        let mqtt_keepalive_secs = parsed("INGEST_MQTT_KEEPALIVE_SECS")?.unwrap_or(60);
        let mqtt_client_id = var("INGEST_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("soil-ingest-{}", std::process::id()));
        let topic_namespace = var("INGEST_TOPIC_NAMESPACE")
            .or_else(|| file_text(&file.topic_namespace))
            .unwrap_or_else(|| DEFAULT_TOPIC_NAMESPACE.to_string());

        let sweep_interval_secs = parsed("INGEST_SWEEP_INTERVAL_SECS")?
            .or(file.sweep_interval_secs)
            .unwrap_or(30);
        let sweep_threshold_secs = parsed("INGEST_SWEEP_THRESHOLD_SECS")?
            .or(file.sweep_threshold_secs)
            .unwrap_or(120);
        let offline_threshold_secs = parsed("INGEST_OFFLINE_THRESHOLD_SECS")?
            .or(file.offline_threshold_secs)
            .unwrap_or(300);
        let restart_threshold_secs = parsed("INGEST_RESTART_THRESHOLD_SECS")?
            .or(file.restart_threshold_secs)
            .unwrap_or(60);
        let stats_log_interval_secs =
            parsed("INGEST_STATS_LOG_INTERVAL_SECS")?.unwrap_or(300);

        let config = Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_keepalive_secs,
            mqtt_client_id,
            topic_namespace,
            sweep_interval_secs,
            sweep_threshold_secs,
            offline_threshold_secs,
            restart_threshold_secs,
            stats_log_interval_secs,
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
            log_level: var("INGEST_LOG_LEVEL"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.db_pool_size > 0,
            "INGEST_DB_POOL_SIZE must be at least 1"
        );
        ensure!(
            (1..=u64::from(u16::MAX)).contains(&self.mqtt_keepalive_secs),
            "INGEST_MQTT_KEEPALIVE_SECS must be between 1 and {}",
            u16::MAX
        );
        ensure!(
            !self.topic_namespace.contains(['/', '+', '#']),
            "topic namespace {:?} must be a single topic level",
            self.topic_namespace
        );
        ensure!(
            self.sweep_interval_secs > 0,
            "INGEST_SWEEP_INTERVAL_SECS must be positive"
        );
        ensure!(
            self.sweep_threshold_secs > 0,
            "INGEST_SWEEP_THRESHOLD_SECS must be positive"
        );
        for (key, secs) in [
            ("INGEST_SWEEP_INTERVAL_SECS", self.sweep_interval_secs),
            ("INGEST_SWEEP_THRESHOLD_SECS", self.sweep_threshold_secs),
            ("INGEST_OFFLINE_THRESHOLD_SECS", self.offline_threshold_secs),
            ("INGEST_RESTART_THRESHOLD_SECS", self.restart_threshold_secs),
            ("INGEST_STATS_LOG_INTERVAL_SECS", self.stats_log_interval_secs),
        ] {
            ensure!(
                secs <= MAX_PERIOD_SECS,
                "{key} must be at most {MAX_PERIOD_SECS} seconds, got {secs}"
            );
        }
        ensure!(
            self.restart_threshold_secs > 0
                && self.restart_threshold_secs < self.offline_threshold_secs,
            "restart threshold ({}s) must be positive and below the offline threshold ({}s)",
            self.restart_threshold_secs,
            self.offline_threshold_secs
        );
        Ok(())
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sweep_threshold(&self) -> Duration {
        Duration::from_secs(self.sweep_threshold_secs)
    }

    pub fn status_thresholds(&self) -> StatusThresholds {
        StatusThresholds {
            offline: bounded_seconds(self.offline_threshold_secs),
            restart: bounded_seconds(self.restart_threshold_secs),
        }
    }

    /// `None` disables the periodic stats log.
    pub fn stats_log_interval(&self) -> Option<Duration> {
        (self.stats_log_interval_secs > 0)
            .then(|| Duration::from_secs(self.stats_log_interval_secs))
    }
}

fn bounded_seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs.min(MAX_PERIOD_SECS) as i64)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
