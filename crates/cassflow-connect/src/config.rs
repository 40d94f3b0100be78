//! Replicator configuration.
//!
//! Loaded from a YAML file with `${VAR}` / `${VAR:-default}` environment
//! expansion. Every recognized option has a default; destinations default to
//! disabled so a bare config starts nothing by accident.

use crate::error::{ConnectorError, Result};
use cassflow_cdc::TableSelector;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default = "default_workers_per_destination")]
    pub workers_per_destination: usize,
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches_per_destination: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_schema_poll_interval_ms")]
    pub schema_poll_interval_ms: u64,
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,
    #[serde(default)]
    pub destinations: DestinationsConfig,
    #[serde(default)]
    pub masking: MaskingConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            batch: BatchConfig::default(),
            workers_per_destination: default_workers_per_destination(),
            max_inflight_batches_per_destination: default_max_inflight_batches(),
            retry: RetryConfig::default(),
            schema_poll_interval_ms: default_schema_poll_interval_ms(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            destinations: DestinationsConfig::default(),
            masking: MaskingConfig::default(),
            dlq: DlqConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// The source's cdc_raw directory.
    #[serde(default = "default_cdc_directory")]
    pub cdc_directory: PathBuf,
    /// Directory of catalog exports the schema monitor polls.
    #[serde(default = "default_catalog_directory")]
    pub catalog_directory: PathBuf,
    /// Reader poll interval when no new bytes are available.
    #[serde(default = "default_reader_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Monitored tables; empty replicates every table observed.
    #[serde(default)]
    pub tables: Vec<TableSelector>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cdc_directory: default_cdc_directory(),
            catalog_directory: default_catalog_directory(),
            poll_interval_ms: default_reader_poll_interval_ms(),
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_age_ms: default_max_batch_age_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_frac")]
    pub jitter_frac: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_frac: default_jitter_frac(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DestinationsConfig {
    #[serde(default)]
    pub postgres: DestinationConfig,
    #[serde(default)]
    pub clickhouse: DestinationConfig,
    #[serde(default)]
    pub timescaledb: DestinationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: 0,
            database: default_database(),
            user: default_user(),
            password: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaskingConfig {
    /// Substring patterns classified PII; empty uses the built-in list.
    #[serde(default)]
    pub pii_patterns: Vec<String>,
    /// Substring patterns classified PHI; empty uses the built-in list.
    #[serde(default)]
    pub phi_patterns: Vec<String>,
    /// Opaque salt mixed into PII digests.
    #[serde(default)]
    pub salt: String,
    /// Identifier of the PHI HMAC key in use.
    #[serde(default = "default_key_id")]
    pub key_id: String,
    /// PHI HMAC key material.
    #[serde(default)]
    pub key: String,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            pii_patterns: Vec::new(),
            phi_patterns: Vec::new(),
            salt: String::new(),
            key_id: default_key_id(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_directory")]
    pub directory: PathBuf,
    /// Deadline for a single DLQ append before the pipeline declares a
    /// fatal failure.
    #[serde(default = "default_dlq_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            directory: default_dlq_directory(),
            write_timeout_ms: default_dlq_write_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Bind address for the metrics/health listener.
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

fn default_cdc_directory() -> PathBuf {
    PathBuf::from("/var/lib/cassandra/cdc_raw")
}
fn default_catalog_directory() -> PathBuf {
    PathBuf::from("/var/lib/cassflow/catalog")
}
fn default_reader_poll_interval_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    100
}
fn default_max_batch_bytes() -> usize {
    1024 * 1024
}
fn default_max_batch_age_ms() -> u64 {
    1000
}
fn default_workers_per_destination() -> usize {
    4
}
fn default_max_inflight_batches() -> usize {
    8
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_frac() -> f64 {
    0.25
}
fn default_schema_poll_interval_ms() -> u64 {
    30_000
}
fn default_shutdown_deadline_ms() -> u64 {
    30_000
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_database() -> String {
    "analytics".to_string()
}
fn default_user() -> String {
    "cassflow".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_statement_timeout_ms() -> u64 {
    30_000
}
fn default_key_id() -> String {
    "phi-key-1".to_string()
}
fn default_dlq_directory() -> PathBuf {
    PathBuf::from("data/dlq")
}
fn default_dlq_write_timeout_ms() -> u64 {
    10_000
}
fn default_http_bind() -> String {
    "0.0.0.0:9090".to_string()
}

impl ReplicatorConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Parse a YAML document (environment variables already in scope).
    pub fn parse(contents: &str) -> Result<Self> {
        let expanded = expand_env_vars(contents);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ConnectorError::config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size == 0 {
            return Err(ConnectorError::config("batch.batch_size must be positive"));
        }
        if self.batch.max_batch_bytes == 0 {
            return Err(ConnectorError::config(
                "batch.max_batch_bytes must be positive",
            ));
        }
        if self.workers_per_destination == 0 {
            return Err(ConnectorError::config(
                "workers_per_destination must be positive",
            ));
        }
        if self.max_inflight_batches_per_destination == 0 {
            return Err(ConnectorError::config(
                "max_inflight_batches_per_destination must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConnectorError::config("retry.max_attempts must be positive"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConnectorError::config("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_frac) {
            return Err(ConnectorError::config(
                "retry.jitter_frac must be within [0, 1]",
            ));
        }
        for (name, dest) in [
            ("postgres", &self.destinations.postgres),
            ("clickhouse", &self.destinations.clickhouse),
            ("timescaledb", &self.destinations.timescaledb),
        ] {
            if dest.enabled && dest.port == 0 {
                return Err(ConnectorError::config(format!(
                    "destinations.{name}.port is required when enabled"
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_destination_count(&self) -> usize {
        [
            &self.destinations.postgres,
            &self.destinations.clickhouse,
            &self.destinations.timescaledb,
        ]
        .iter()
        .filter(|d| d.enabled)
        .count()
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references.
fn expand_env_vars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let expr = &after[..end];
                let (name, default) = match expr.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (expr, None),
                };
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(default.unwrap_or("")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
