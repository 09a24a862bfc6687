//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file (default: `config/fh.toml`).
//! Every section except `[db]` is optional and falls back to documented
//! defaults. A small set of environment variables override file values so
//! deployments can point the same file at different stores and hosts.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/feeds.sqlite"
//!
//! [download]
//! concurrent_origins = 3
//! concurrent_items = 5
//!
//! [enrichment]
//! host = "https://api.openai.com/v1"
//! models = ["gpt-4o-mini", "gpt-4.1-mini"]
//!
//! [enrichment.requests_per_minute]
//! default = 20
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ENV_DB_PATH: &str = "FH_DB_PATH";
pub const ENV_ENRICH_HOST: &str = "FH_ENRICH_HOST";
pub const ENV_ENRICH_MODELS: &str = "FH_ENRICH_MODELS";

const CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=20;

/// Upper bound for every retention setting, in days.
pub const MAX_RETENTION_DAYS: i64 = 3650;

/// Accepted per-origin request rates.
pub const REQUESTS_PER_SECOND_RANGE: std::ops::RangeInclusive<f64> = 0.001..=1000.0;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    /// Linear retry delay: the n-th retry waits `retry_delay_ms * n`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_concurrent_origins")]
    pub concurrent_origins: usize,
    #[serde(default = "default_concurrent_items")]
    pub concurrent_items: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_validator_max_age_days")]
    pub validator_max_age_days: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub ssrf_protection: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_fetch_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            concurrent_origins: default_concurrent_origins(),
            concurrent_items: default_concurrent_items(),
            max_redirects: default_max_redirects(),
            validator_max_age_days: default_validator_max_age_days(),
            user_agent: default_user_agent(),
            ssrf_protection: true,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    15
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_concurrent_origins() -> usize {
    3
}
fn default_concurrent_items() -> usize {
    5
}
fn default_max_redirects() -> usize {
    5
}
fn default_validator_max_age_days() -> i64 {
    30
}
fn default_user_agent() -> String {
    format!("feed-harness/{}", env!("CARGO_PKG_VERSION"))
}
fn default_true() -> bool {
    true
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_idle_evict_secs")]
    pub idle_evict_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            idle_evict_secs: default_idle_evict_secs(),
        }
    }
}

fn default_requests_per_second() -> f64 {
    2.0
}
fn default_burst() -> u32 {
    4
}
fn default_idle_evict_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_base_delay_secs() -> u64 {
    60
}
fn default_max_delay_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "models_list")]
    pub models: Vec<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    #[serde(default = "default_max_content_tokens")]
    pub max_content_tokens: usize,
    #[serde(default = "default_enrich_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enrich_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_recovery_secs")]
    pub breaker_recovery_secs: u64,
    /// Model name to requests-per-minute; the `default` key applies to unlisted models.
    #[serde(default)]
    pub requests_per_minute: HashMap<String, u32>,
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: i64,
    #[serde(default = "default_enrich_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_user_prompt")]
    pub user_prompt: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            host: None,
            models: Vec::new(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_content_chars: default_max_content_chars(),
            max_content_tokens: default_max_content_tokens(),
            timeout_secs: default_enrich_timeout_secs(),
            max_retries: default_enrich_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: true,
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_recovery_secs: default_breaker_recovery_secs(),
            requests_per_minute: HashMap::new(),
            cache_max_age_days: default_cache_max_age_days(),
            batch_size: default_enrich_batch_size(),
            progress_every: default_progress_every(),
            system_prompt: default_system_prompt(),
            user_prompt: default_user_prompt(),
        }
    }
}

impl EnrichmentConfig {
    /// Whether a host and at least one model are configured.
    pub fn is_configured(&self) -> bool {
        self.host.is_some() && !self.models.is_empty()
    }

    /// Credential from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    /// Requests-per-minute limit for `model`, falling back to the `default` entry.
    pub fn rpm_for(&self, model: &str) -> Option<u32> {
        self.requests_per_minute
            .get(model)
            .or_else(|| self.requests_per_minute.get("default"))
            .copied()
            .filter(|rpm| *rpm > 0)
    }
}

fn default_api_key_env() -> String {
    "FH_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f64 {
    0.3
}
fn default_max_content_chars() -> usize {
    10_000
}
fn default_max_content_tokens() -> usize {
    4_000
}
fn default_enrich_timeout_secs() -> u64 {
    60
}
fn default_enrich_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_recovery_secs() -> u64 {
    60
}
fn default_cache_max_age_days() -> i64 {
    30
}
fn default_enrich_batch_size() -> usize {
    10
}
fn default_progress_every() -> usize {
    20
}

fn default_system_prompt() -> String {
    "You are a technical news analyst. You read articles and answer with a single JSON \
     object and nothing else."
        .to_string()
}

fn default_user_prompt() -> String {
    r#"Analyze the article below and respond with JSON of the form:
{"summary": "<2-4 sentence summary>", "relevance": <1-10>, "quality": <1-10>, "timeliness": <1-10>, "category": "<one of ai-ml, security, engineering, tools, opinion, other>", "keywords": ["<2-4 keywords>"]}

Title: {title}

{content}"#
        .to_string()
}

/// Accept either a TOML array of model names or a comma-separated string.
fn models_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Models {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Models::deserialize(deserializer)? {
        Models::List(list) => list,
        Models::Csv(csv) => split_models(&csv),
    })
}

fn split_models(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Fully-defaulted configuration pointing at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            download: DownloadConfig::default(),
            throttle: ThrottleConfig::default(),
            ledger: LedgerConfig::default(),
            enrichment: EnrichmentConfig::default(),
            server: ServerConfig::default(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.trim().is_empty() {
                self.db.path = PathBuf::from(path);
            }
        }
        if let Ok(host) = std::env::var(ENV_ENRICH_HOST) {
            if !host.trim().is_empty() {
                self.enrichment.host = Some(host);
            }
        }
        if let Ok(models) = std::env::var(ENV_ENRICH_MODELS) {
            let models = split_models(&models);
            if !models.is_empty() {
                self.enrichment.models = models;
            }
        }
    }

    /// Range-check every field with a bounded domain.
    pub fn validate(&self) -> Result<()> {
        let d = &self.download;
        if !CONCURRENCY_RANGE.contains(&d.concurrent_origins) {
            bail!("download.concurrent_origins must be in [1, 20]");
        }
        if !CONCURRENCY_RANGE.contains(&d.concurrent_items) {
            bail!("download.concurrent_items must be in [1, 20]");
        }
        if d.timeout_secs == 0 || d.connect_timeout_secs == 0 {
            bail!("download.timeout_secs and download.connect_timeout_secs must be > 0");
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&d.validator_max_age_days) {
            bail!("download.validator_max_age_days must be in [1, {}]", MAX_RETENTION_DAYS);
        }

        let t = &self.throttle;
        if !REQUESTS_PER_SECOND_RANGE.contains(&t.requests_per_second) {
            bail!("throttle.requests_per_second must be in [0.001, 1000]");
        }
        if t.burst == 0 {
            bail!("throttle.burst must be >= 1");
        }

        let l = &self.ledger;
        if l.base_delay_secs == 0 {
            bail!("ledger.base_delay_secs must be > 0");
        }
        if l.max_delay_secs > 86_400 {
            bail!("ledger.max_delay_secs must be <= 86400 (24 hours)");
        }
        if l.base_delay_secs > l.max_delay_secs {
            bail!("ledger.base_delay_secs must be <= ledger.max_delay_secs");
        }

        let e = &self.enrichment;
        if !(0.0..=2.0).contains(&e.temperature) {
            bail!("enrichment.temperature must be in [0.0, 2.0]");
        }
        if e.max_tokens == 0 {
            bail!("enrichment.max_tokens must be > 0");
        }
        if e.max_content_chars == 0 || e.max_content_tokens == 0 {
            bail!("enrichment.max_content_chars and enrichment.max_content_tokens must be > 0");
        }
        if e.max_retries == 0 {
            bail!("enrichment.max_retries must be >= 1");
        }
        if e.breaker_failure_threshold == 0 {
            bail!("enrichment.breaker_failure_threshold must be >= 1");
        }
        if e.batch_size == 0 {
            bail!("enrichment.batch_size must be >= 1");
        }
        if e.progress_every == 0 {
            bail!("enrichment.progress_every must be >= 1");
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&e.cache_max_age_days) {
            bail!("enrichment.cache_max_age_days must be in [1, {}]", MAX_RETENTION_DAYS);
        }
        if e.host.is_some() && e.models.is_empty() {
            bail!("enrichment.models must list at least one model when enrichment.host is set");
        }
        if !e.user_prompt.contains("{content}") {
            bail!("enrichment.user_prompt must contain a {{content}} placeholder");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env_overrides();
    config.validate()?;

    Ok(config)
}
