// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the delivery pipeline.
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. **Defaults** - [`Config::default`]
//! 2. **YAML file** - `hec.yaml` in the config directory (if present)
//! 3. **Environment variables** - `HEC_*` variables (highest priority)
//!
//! A [`Config`] is built once at startup and passed as `Arc<Config>` to every
//! component that needs it; nothing reads global state.

pub mod env;
pub mod log_level;
pub mod metadata;
pub mod yaml;

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::{
    env::EnvConfigSource, log_level::LogLevel, metadata::Metadata, yaml::YamlConfigSource,
};
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_MIN_BACKOFF, DEFAULT_PORT, DEFAULT_RETRY_INTERVAL, DEFAULT_WORKER_COUNT,
    FLUSH_BACKOFF_FACTOR, FLUSH_BUFFER_SIZE, FLUSH_MAX_PERIOD, FLUSH_MIN_PERIOD, HIGH_WATER_MARK,
    JSON_ENDPOINT, MAX_BATCH_SIZE, MAX_DECORATOR_ENTRIES, MIN_BUFFER_SIZE, OFFER_TIMEOUT,
    QUEUE_CAPACITY, RAW_ENDPOINT,
};
use crate::error::ConfigError;
use crate::event::EventKind;

/// Queue implementations known at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Default,
}

/// Delayed flush buffer tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushTuning {
    pub min_period: Duration,
    pub max_period: Duration,
    pub backoff: f64,
    pub buffer_size: usize,
}

impl Default for FlushTuning {
    fn default() -> Self {
        FlushTuning {
            min_period: FLUSH_MIN_PERIOD,
            max_period: FLUSH_MAX_PERIOD,
            backoff: FLUSH_BACKOFF_FACTOR,
            buffer_size: FLUSH_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    pub enabled: bool,
    /// Collector host, or several hosts separated by commas.
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub token: String,
    pub raw_event_enabled: bool,
    /// Console captures are only created while this is on.
    pub pipeline_filter: bool,
    pub max_events_batch_size: usize,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub min_backoff: Duration,
    pub high_water_mark: usize,
    pub queue_kind: QueueKind,
    pub queue_capacity: usize,
    pub offer_timeout: Duration,
    pub worker_count: usize,
    pub http_timeout: Duration,
    pub proxy_https: Option<String>,
    pub metadata: Metadata,
    /// `host` field reported with every event.
    pub metadata_host: Option<String>,
    pub ignored_jobs: Option<Regex>,
    pub allowed_jobs: Option<Regex>,
    pub max_file_size: u64,
    pub max_decorator_entries: usize,
    pub flush: FlushTuning,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: false,
            host: String::new(),
            port: DEFAULT_PORT,
            use_ssl: true,
            token: String::new(),
            raw_event_enabled: true,
            pipeline_filter: true,
            max_events_batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            min_backoff: DEFAULT_MIN_BACKOFF,
            high_water_mark: HIGH_WATER_MARK,
            queue_kind: QueueKind::Default,
            queue_capacity: QUEUE_CAPACITY,
            offer_timeout: OFFER_TIMEOUT,
            worker_count: DEFAULT_WORKER_COUNT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            proxy_https: None,
            metadata: Metadata::default(),
            metadata_host: None,
            ignored_jobs: None,
            allowed_jobs: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_decorator_entries: MAX_DECORATOR_ENTRIES,
            flush: FlushTuning::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Enabled and pointed at a collector with a token.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.enabled && !self.host.trim().is_empty() && !self.token.is_empty()
    }

    #[must_use]
    pub fn is_event_disabled(&self, kind: EventKind) -> bool {
        !self.is_valid() || self.metadata.is_disabled(kind)
    }

    /// Raw mode applies only to line-oriented text.
    #[must_use]
    pub fn can_post_raw(&self, kind: EventKind) -> bool {
        self.raw_event_enabled && kind.needs_line_split()
    }

    /// A build URL outside the allow pattern is ignored; inside it, the deny
    /// pattern decides.
    #[must_use]
    pub fn is_build_ignored(&self, build_url: &str) -> bool {
        if let Some(allowed) = &self.allowed_jobs {
            if !allowed.is_match(build_url) {
                debug!("CONFIG | {build_url} is not in the allowed job pattern");
                return true;
            }
        }
        self.ignored_jobs
            .as_ref()
            .is_some_and(|ignored| ignored.is_match(build_url))
    }

    /// `scheme://host:port` for every configured collector host.
    #[must_use]
    pub fn collector_urls(&self) -> Vec<String> {
        let scheme = if self.use_ssl { "https" } else { "http" };
        self.host
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| format!("{scheme}://{host}:{}", self.port))
            .collect()
    }

    #[must_use]
    pub fn json_url(&self, base: &str) -> String {
        format!("{base}{JSON_ENDPOINT}")
    }

    #[must_use]
    pub fn raw_url(&self, base: &str) -> String {
        format!("{base}{RAW_ENDPOINT}")
    }

    /// Copy used on remote build agents, which run a single delivery worker.
    #[must_use]
    pub fn for_agent(&self) -> Config {
        Config {
            worker_count: 1,
            ..self.clone()
        }
    }

    /// Rejects settings that would leave an enabled pipeline unable to deliver.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled {
            if self.host.trim().is_empty() {
                return Err(ConfigError::Invalid("host is empty".to_string()));
            }
            if self.token.is_empty() {
                return Err(ConfigError::Invalid("token is empty".to_string()));
            }
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.flush.min_period > self.flush.max_period {
            return Err(ConfigError::Invalid(format!(
                "flush min period {:?} exceeds max period {:?}",
                self.flush.min_period, self.flush.max_period
            )));
        }
        if self.flush.backoff < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "flush backoff {} must be >= 1.0",
                self.flush.backoff
            )));
        }
        Ok(())
    }
}

/// Settings read from a single source. Every field is optional; only the
/// fields present override the config being built.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub use_ssl: Option<bool>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub token: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub raw_event_enabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub pipeline_filter: Option<bool>,
    pub max_events_batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    /// Seconds.
    pub retry_interval: Option<u64>,
    pub high_water_mark: Option<usize>,
    pub queue_kind: Option<QueueKind>,
    pub queue_capacity: Option<usize>,
    pub worker_count: Option<usize>,
    /// Seconds.
    pub http_timeout: Option<u64>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub proxy_https: Option<String>,
    /// `key=value` lines, e.g. `console_log.index=ci`.
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub metadata: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub metadata_host: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub metadata_source: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub ignored_jobs: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub allowed_jobs: Option<String>,
    pub max_file_size: Option<u64>,
    pub log_level: Option<LogLevel>,
}

macro_rules! merge_option_to_value {
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Applies every field present in `source` to `config`.
pub fn merge_config(config: &mut Config, source: &SourceConfig) {
    merge_option_to_value!(config, source, enabled);
    merge_option_to_value!(config, source, host);
    merge_option_to_value!(config, source, port);
    merge_option_to_value!(config, source, use_ssl);
    merge_option_to_value!(config, source, token);
    merge_option_to_value!(config, source, raw_event_enabled);
    merge_option_to_value!(config, source, pipeline_filter);
    merge_option_to_value!(config, source, max_events_batch_size);
    merge_option_to_value!(config, source, max_retries);
    merge_option_to_value!(config, source, high_water_mark);
    merge_option_to_value!(config, source, queue_kind);
    merge_option_to_value!(config, source, queue_capacity);
    merge_option_to_value!(config, source, worker_count);
    merge_option_to_value!(config, source, max_file_size);
    merge_option_to_value!(config, source, log_level);

    if let Some(seconds) = source.retry_interval {
        config.retry_interval = Duration::from_secs(seconds);
    }
    if let Some(seconds) = source.http_timeout {
        config.http_timeout = Duration::from_secs(seconds);
    }
    if source.proxy_https.is_some() {
        config.proxy_https.clone_from(&source.proxy_https);
    }
    if source.metadata_host.is_some() {
        config.metadata_host.clone_from(&source.metadata_host);
    }
    if let Some(text) = &source.metadata {
        config.metadata.load(text);
    }
    if let Some(metadata_source) = &source.metadata_source {
        config.metadata.insert("source", metadata_source);
    }
    if let Some(pattern) = &source.ignored_jobs {
        config.ignored_jobs = compile_pattern("ignored_jobs", pattern);
    }
    if let Some(pattern) = &source.allowed_jobs {
        config.allowed_jobs = compile_pattern("allowed_jobs", pattern);
    }
}

/// An invalid pattern disables the filter instead of failing startup.
fn compile_pattern(name: &str, pattern: &str) -> Option<Regex> {
    if pattern.trim().is_empty() {
        return None;
    }
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            error!("CONFIG | Invalid {name} pattern {pattern:?}: {e}, ignoring");
            None
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("CONFIG | Failed to load config: {e}");
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("CONFIG | All sources failed to load config, using default config.");
        }

        self.config.max_events_batch_size = self
            .config
            .max_events_batch_size
            .clamp(MIN_BUFFER_SIZE, MAX_BATCH_SIZE);

        if self.config.proxy_https.is_none() {
            if let Ok(https_proxy) = std::env::var("HTTPS_PROXY") {
                self.config.proxy_https = Some(https_proxy);
            }
        }

        self.config.clone()
    }
}

/// Loads `hec.yaml` from `config_directory`, then `HEC_*` environment variables.
#[must_use]
pub fn get_config(config_directory: &Path) -> Config {
    let path = config_directory.join("hec.yaml");
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource { path }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        None | Some(Value::Null) => Ok(None),
        Some(_) => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64().is_some_and(|n| n != 0))),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            other => {
                error!("Failed to parse bool value: {other:?}, ignoring");
                Ok(None)
            }
        },
        Some(other) => {
            error!("Failed to parse bool value: {other}, ignoring");
            Ok(None)
        }
    }
}
