use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;

use crate::point::is_valid_name;

/// Top-level configuration for the scout agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tracing filter directive (e.g. "info", "scout=debug"). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Remote collector address (e.g. "tsdb.example.com:4242"). Empty means
    /// points go to the local sink.
    #[serde(default)]
    pub endpoint: String,

    /// Keep the full hostname in the `host` tag instead of the first label.
    #[serde(default)]
    pub full_hostname: bool,

    /// Extra default tags applied to every point.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Cadence for collectors that do not set their own. Default: 15s, or
    /// 3s when printing locally. Read through [`Config::cadence`].
    #[serde(default, with = "humantime_serde")]
    pub default_cadence: Option<Duration>,

    /// Collector selection and built-in collectors.
    #[serde(default)]
    pub collectors: CollectorsConfig,

    /// Remote delivery configuration.
    #[serde(default)]
    pub sender: SenderConfig,

    /// Metadata reporting configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Local sink configuration.
    #[serde(default)]
    pub local: LocalConfig,

    /// Memory ceiling configuration.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Collector selection and built-in collectors.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorsConfig {
    /// Only run collectors whose name contains this substring.
    #[serde(default)]
    pub filter: String,

    /// Directory of external programs laid out as `<secs>/<executable>`.
    #[serde(default)]
    pub program_dir: Option<PathBuf>,

    /// Maximum run time of one program invocation. Default: 30s.
    #[serde(default = "default_program_timeout", with = "humantime_serde")]
    pub program_timeout: Duration,

    /// Points per tick from the synthetic load collector. 0 disables it.
    #[serde(default)]
    pub fake: usize,

    /// Enable the built-in /proc system collector. Default: true.
    #[serde(default = "default_true")]
    pub system: bool,
}

/// Remote delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// Maximum points per request. Default: 500.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before sending a partial batch. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Capacity of the pipeline between collectors and the sender. Default: 8192.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Delivery attempts per batch, including the first. Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry. Default: 500ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on the retry delay. Default: 10s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Timeout of a single request. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Request body compression (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Metadata reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Report rate/unit/description per series. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often staged metadata is sent. Default: 30s.
    #[serde(default = "default_metadata_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Records that can wait for delivery before new ones are dropped. Default: 4096.
    #[serde(default = "default_metadata_queue_size")]
    pub queue_size: usize,
}

/// Local sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    /// Print points instead of sending them, even with an endpoint set.
    #[serde(default)]
    pub print: bool,

    /// Print the wire JSON object instead of the line protocol.
    #[serde(default)]
    pub json: bool,
}

/// Memory ceiling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Resident memory ceiling in bytes. 0 disables the watchdog. Default: 500MiB.
    #[serde(default = "default_max_rss_bytes")]
    pub max_rss_bytes: u64,

    /// Check period. Default: 60s.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g. ":9090"). Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub endpoint: Option<String>,
    pub filter: Option<String>,
    pub batch_size: Option<usize>,
    pub fake: Option<usize>,
    pub program_dir: Option<PathBuf>,
    pub print: bool,
    pub json: bool,
    pub disable_metadata: bool,
    pub full_hostname: bool,
}

/// Default cadence while printing locally.
pub const PRINT_CADENCE: Duration = Duration::from_secs(3);

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cadence() -> Duration {
    Duration::from_secs(15)
}

fn default_true() -> bool {
    true
}

fn default_program_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_size() -> usize {
    8192
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_metadata_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_metadata_queue_size() -> usize {
    4096
}

fn default_max_rss_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            endpoint: String::new(),
            full_hostname: false,
            tags: HashMap::new(),
            default_cadence: None,
            collectors: CollectorsConfig::default(),
            sender: SenderConfig::default(),
            metadata: MetadataConfig::default(),
            local: LocalConfig::default(),
            watchdog: WatchdogConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            filter: String::new(),
            program_dir: None,
            program_timeout: default_program_timeout(),
            fake: 0,
            system: true,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            queue_size: default_queue_size(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            request_timeout: default_request_timeout(),
            compression: default_compression(),
            headers: HashMap::new(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval: default_metadata_flush_interval(),
            queue_size: default_metadata_queue_size(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_rss_bytes: default_max_rss_bytes(),
            check_interval: default_check_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Applies command-line overrides and re-validates.
    pub fn apply_overrides(&mut self, o: &Overrides) -> Result<()> {
        if let Some(level) = &o.log_level {
            self.log_level = level.clone();
        }
        if let Some(endpoint) = &o.endpoint {
            self.endpoint = endpoint.clone();
        }
        if let Some(filter) = &o.filter {
            self.collectors.filter = filter.clone();
        }
        if let Some(n) = o.batch_size {
            self.sender.batch_size = n;
        }
        if let Some(n) = o.fake {
            self.collectors.fake = n;
        }
        if let Some(dir) = &o.program_dir {
            self.collectors.program_dir = Some(dir.clone());
        }
        if o.print {
            self.local.print = true;
            self.default_cadence = Some(PRINT_CADENCE);
        }
        if o.json {
            self.local.json = true;
        }
        if o.disable_metadata {
            self.metadata.enabled = false;
        }
        if o.full_hostname {
            self.full_hostname = true;
        }

        self.validate()
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cadence().is_zero() {
            bail!("default_cadence must be positive");
        }

        for (k, v) in &self.tags {
            if !is_valid_name(k) || !is_valid_name(v) {
                bail!("invalid tag {k:?}={v:?}");
            }
        }

        if self.collectors.program_timeout.is_zero() {
            bail!("collectors.program_timeout must be positive");
        }

        if self.sender.batch_size == 0 {
            bail!("sender.batch_size must be positive");
        }
        if self.sender.queue_size == 0 {
            bail!("sender.queue_size must be positive");
        }
        if self.sender.max_attempts == 0 {
            bail!("sender.max_attempts must be at least 1");
        }
        if self.sender.flush_interval.is_zero() {
            bail!("sender.flush_interval must be positive");
        }
        if self.sender.initial_backoff > self.sender.max_backoff {
            bail!("sender.initial_backoff must not exceed sender.max_backoff");
        }
        match self.sender.compression.as_str() {
            "none" | "" | "gzip" => {}
            other => bail!("invalid compression type: {other}"),
        }

        if self.metadata.enabled {
            if self.metadata.queue_size == 0 {
                bail!("metadata.queue_size must be positive when enabled");
            }
            if self.metadata.flush_interval.is_zero() {
                bail!("metadata.flush_interval must be positive when enabled");
            }
        }

        if self.watchdog.max_rss_bytes > 0 && self.watchdog.check_interval.is_zero() {
            bail!("watchdog.check_interval must be positive when enabled");
        }

        self.endpoint_url()?;

        Ok(())
    }

    /// Parsed endpoint, with `http://` assumed when no scheme is given.
    /// `None` when no endpoint is configured.
    pub fn endpoint_url(&self) -> Result<Option<Url>> {
        let raw = self.endpoint.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let with_scheme = if raw.contains("//") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let url = Url::parse(&with_scheme)
            .with_context(|| format!("invalid endpoint address {raw:?}"))?;
        if url.host_str().is_none() {
            bail!("endpoint address {raw:?} has no host");
        }

        Ok(Some(url))
    }

    /// Effective cadence for collectors that do not set their own.
    pub fn cadence(&self) -> Duration {
        match self.default_cadence {
            Some(cadence) => cadence,
            None if self.local.print => PRINT_CADENCE,
            None => default_cadence(),
        }
    }

    /// Points are printed rather than sent.
    pub fn local_mode(&self) -> bool {
        self.local.print || self.endpoint.trim().is_empty()
    }
}

/// Joins an API path onto the endpoint base, keeping any base path prefix.
pub fn api_url(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
