//! Configuration: TOML file defaults + environment variable overrides.
//!
//! Tunables live in `config/etl.toml`. Secrets (store password, vendor
//! token) come from environment variables and are never written to TOML.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;

/// Top-level configuration, loaded once at startup. No hot reload.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Tokens per minute per logical rate bucket, overriding catalog defaults.
    #[serde(default)]
    pub rate_limit: HashMap<String, u32>,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Per-pipeline overrides, keyed by pipeline name.
    #[serde(default)]
    pub pipeline: HashMap<String, PipelineOverride>,
    #[serde(default)]
    pub etl: EtlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default = "default_store_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_store_database")]
    pub database: String,
}

fn default_store_host() -> String {
    "127.0.0.1".into()
}
fn default_store_port() -> u16 {
    3306
}
fn default_store_user() -> String {
    "root".into()
}
fn default_store_database() -> String {
    "ashare_stock".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            user: default_store_user(),
            password: String::new(),
            database: default_store_database(),
        }
    }
}

impl StoreConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_upstream_url")]
    pub base_url: String,
}

fn default_upstream_url() -> String {
    "http://api.tushare.pro".into()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: default_upstream_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Per-attempt fetch deadline in seconds.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Retry attempts after the first try.
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    /// Base backoff delay in seconds; doubles per attempt.
    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,
    /// Backoff ceiling in seconds.
    #[serde(default = "default_retry_delay_cap_sec")]
    pub retry_delay_cap_sec: u64,
    /// Bounded worker pool size for per-api ingest fan-out.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Soft per-stage timeout in minutes.
    #[serde(default = "default_stage_timeout_min")]
    pub stage_timeout_min: u64,
    /// RUNNING rows older than this are reclaimed as zombies.
    #[serde(default = "default_zombie_threshold_min")]
    pub zombie_threshold_min: u32,
}

fn default_timeout_sec() -> u64 {
    60
}
fn default_retry_times() -> u32 {
    3
}
fn default_retry_delay_sec() -> u64 {
    2
}
fn default_retry_delay_cap_sec() -> u64 {
    60
}
fn default_concurrency() -> usize {
    3
}
fn default_stage_timeout_min() -> u64 {
    90
}
fn default_zombie_threshold_min() -> u32 {
    120
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout_sec: default_timeout_sec(),
            retry_times: default_retry_times(),
            retry_delay_sec: default_retry_delay_sec(),
            retry_delay_cap_sec: default_retry_delay_cap_sec(),
            concurrency: default_concurrency(),
            stage_timeout_min: default_stage_timeout_min(),
            zombie_threshold_min: default_zombie_threshold_min(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineOverride {
    pub lenient: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    /// First date ever ingested; watermarks initialize one trading day before.
    #[serde(default = "default_start_date")]
    pub start_date: u32,
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_start_date() -> u32 {
    20100101
}
fn default_exchange() -> String {
    "SSE".into()
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            start_date: default_start_date(),
            exchange: default_exchange(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_output: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_output: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file merged with `ETL__`-prefixed env
    /// vars, then apply explicit secret overrides from plain env vars.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let file = config::File::with_name(path.unwrap_or("config/etl")).required(path.is_some());
        let builder = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ETL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = builder.try_deserialize()?;

        // Secrets and connection details keep their legacy env names.
        if let Ok(v) = env::var("TUSHARE_TOKEN") {
            cfg.upstream.token = v;
        }
        if let Ok(v) = env::var("MYSQL_HOST") {
            cfg.store.host = v;
        }
        if let Ok(v) = env::var("MYSQL_PORT") {
            cfg.store.port = v.parse().unwrap_or(cfg.store.port);
        }
        if let Ok(v) = env::var("MYSQL_USER") {
            cfg.store.user = v;
        }
        if let Ok(v) = env::var("MYSQL_PASSWORD") {
            cfg.store.password = v;
        }
        if let Ok(v) = env::var("MYSQL_DB") {
            cfg.store.database = v;
        }

        Ok(cfg)
    }

    /// Effective lenient flag for a pipeline: CLI flag beats config override
    /// beats the pipeline's built-in default.
    pub fn lenient_for(&self, pipeline: &str, cli_flag: bool, built_in: bool) -> bool {
        if cli_flag {
            return true;
        }
        self.pipeline
            .get(pipeline)
            .and_then(|p| p.lenient)
            .unwrap_or(built_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config {
            store: StoreConfig::default(),
            upstream: UpstreamConfig::default(),
            rate_limit: HashMap::new(),
            batch: BatchConfig::default(),
            pipeline: HashMap::new(),
            etl: EtlConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert_eq!(cfg.batch.timeout_sec, 60);
        assert_eq!(cfg.batch.zombie_threshold_min, 120);
        assert_eq!(cfg.etl.start_date, 20100101);
        assert!(cfg.store.url().starts_with("mysql://root:@127.0.0.1:3306/"));
    }

    #[test]
    fn lenient_precedence() {
        let mut cfg = Config {
            store: StoreConfig::default(),
            upstream: UpstreamConfig::default(),
            rate_limit: HashMap::new(),
            batch: BatchConfig::default(),
            pipeline: HashMap::new(),
            etl: EtlConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(!cfg.lenient_for("afternoon_core", false, false));
        assert!(cfg.lenient_for("afternoon_core", true, false));
        cfg.pipeline.insert(
            "afternoon_core".into(),
            PipelineOverride {
                lenient: Some(true),
            },
        );
        assert!(cfg.lenient_for("afternoon_core", false, false));
    }
}
