//! Configuration — CLI flags, environment variables, config file.

use clap::Parser;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::instruments::PATH_LABEL;
use crate::metrics::{valid_label_name, valid_metric_name};

/// stress-app — synthetic load for exercising a monitoring stack
#[derive(Parser, Debug)]
#[command(name = "stress-app", version, about)]
pub struct Cli {
    /// Config file path (TOML)
    #[arg(long, default_value = "stress-app.toml")]
    pub config: String,

    /// Listen port
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub listen_host: Option<String>,

    /// Separate port for /health, /metrics and /status
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Simulated work range in milliseconds, as MIN,MAX
    #[arg(long)]
    pub delay_range_ms: Option<String>,

    /// Cap on request header bytes
    #[arg(long)]
    pub max_header_bytes: Option<usize>,

    /// Request read timeout in seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Header read timeout in seconds
    #[arg(long)]
    pub read_header_timeout: Option<u64>,

    /// Response write timeout in seconds
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Idle keep-alive connection timeout in seconds
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Instrument set: full or counter
    #[arg(long)]
    pub instruments: Option<String>,

    /// Metric name prefix
    #[arg(long)]
    pub metric_prefix: Option<String>,

    /// Constant label attached to every metric, as KEY=VALUE (repeatable)
    #[arg(long = "metric-label")]
    pub metric_labels: Vec<String>,

    /// Split the request counter and latency histogram by request path
    #[arg(long)]
    pub path_label: bool,

    /// Initial capacity of pooled response buffers
    #[arg(long)]
    pub buffer_capacity: Option<usize>,

    /// Maximum idle buffers kept in the pool
    #[arg(long)]
    pub pool_max_idle: Option<usize>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Which instruments are registered and updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentSet {
    /// Request counter only.
    Counter,
    /// Counter, latency histogram, active gauge, response-size histogram.
    #[default]
    Full,
}

impl FromStr for InstrumentSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "counter" => Ok(InstrumentSet::Counter),
            "full" => Ok(InstrumentSet::Full),
            other => Err(format!("unknown instrument set '{other}' (expected full or counter)")),
        }
    }
}

impl fmt::Display for InstrumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentSet::Counter => write!(f, "counter"),
            InstrumentSet::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub admin_port: Option<u16>,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub max_header_bytes: usize,
    pub read_timeout_secs: u64,
    pub read_header_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub instruments: InstrumentSet,
    pub metric_prefix: String,
    pub metric_labels: Vec<(String, String)>,
    pub path_label: bool,
    pub buffer_capacity: usize,
    pub pool_max_idle: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: 4242,
            admin_port: None,
            delay_min_ms: 10,
            delay_max_ms: 100,
            max_header_bytes: 1 << 20,
            read_timeout_secs: 5,
            read_header_timeout_secs: 2,
            write_timeout_secs: 10,
            idle_timeout_secs: 30,
            instruments: InstrumentSet::Full,
            metric_prefix: "app".into(),
            metric_labels: Vec::new(),
            path_label: false,
            buffer_capacity: 128,
            pool_max_idle: 1024,
            log_level: "info".into(),
        }
    }
}

/// Shape of the TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_host: Option<String>,
    listen_port: Option<u16>,
    admin_port: Option<u16>,
    delay_range_ms: Option<[u64; 2]>,
    max_header_bytes: Option<usize>,
    read_timeout_secs: Option<u64>,
    read_header_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    instruments: Option<InstrumentSet>,
    metric_prefix: Option<String>,
    #[serde(default)]
    metric_labels: BTreeMap<String, String>,
    path_label: Option<bool>,
    buffer_capacity: Option<usize>,
    pool_max_idle: Option<usize>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration: defaults → config file → env vars → CLI flags.
    pub fn load() -> Result<Self, String> {
        let cli = Cli::parse();
        Self::from_sources(&cli, |key| std::env::var(key).ok())
    }

    fn from_sources(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Config::default();

        // 1. Config file
        let config_path = Path::new(&cli.config);
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .map_err(|e| format!("cannot read config file '{}': {}", cli.config, e))?;
            apply_config_file(&mut config, &content)
                .map_err(|e| format!("invalid config file '{}': {}", cli.config, e))?;
        }

        // 2. Environment variables
        apply_env(&mut config, env)?;

        // 3. CLI flags (highest priority)
        apply_cli(&mut config, cli)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Returns an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.delay_min_ms > self.delay_max_ms {
            return Err(format!(
                "delay range min ({}) must not exceed max ({})",
                self.delay_min_ms, self.delay_max_ms
            ));
        }
        if self.read_timeout_secs == 0
            || self.read_header_timeout_secs == 0
            || self.write_timeout_secs == 0
            || self.idle_timeout_secs == 0
        {
            return Err("timeouts must be > 0".into());
        }
        if self.max_header_bytes == 0 {
            return Err("max_header_bytes must be > 0".into());
        }
        if self.buffer_capacity == 0 {
            return Err("buffer_capacity must be > 0".into());
        }
        if !valid_metric_name(&self.metric_prefix) {
            return Err(format!("invalid metric prefix '{}'", self.metric_prefix));
        }

        let mut seen = HashSet::new();
        for (key, _) in &self.metric_labels {
            if !valid_label_name(key) {
                return Err(format!("invalid metric label name '{key}'"));
            }
            if key == "le" {
                return Err("metric label 'le' is reserved for histogram buckets".into());
            }
            if self.path_label && key == PATH_LABEL {
                return Err(format!("metric label '{key}' is set per request with path_label"));
            }
            if !seen.insert(key.as_str()) {
                return Err(format!("metric label '{key}' given more than once"));
            }
        }
        Ok(())
    }

    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.delay_min_ms),
            Duration::from_millis(self.delay_max_ms),
        )
    }

    /// Header reads are bounded by both the header and the overall read budget.
    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_header_timeout_secs.min(self.read_timeout_secs))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn apply_config_file(config: &mut Config, content: &str) -> Result<(), String> {
    let file: FileConfig = toml::from_str(content).map_err(|e| e.to_string())?;

    if let Some(v) = file.listen_host {
        config.listen_host = v;
    }
    if let Some(v) = file.listen_port {
        config.listen_port = v;
    }
    if let Some(v) = file.admin_port {
        config.admin_port = Some(v);
    }
    if let Some([min, max]) = file.delay_range_ms {
        config.delay_min_ms = min;
        config.delay_max_ms = max;
    }
    if let Some(v) = file.max_header_bytes {
        config.max_header_bytes = v;
    }
    if let Some(v) = file.read_timeout_secs {
        config.read_timeout_secs = v;
    }
    if let Some(v) = file.read_header_timeout_secs {
        config.read_header_timeout_secs = v;
    }
    if let Some(v) = file.write_timeout_secs {
        config.write_timeout_secs = v;
    }
    if let Some(v) = file.idle_timeout_secs {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = file.instruments {
        config.instruments = v;
    }
    if let Some(v) = file.metric_prefix {
        config.metric_prefix = v;
    }
    if !file.metric_labels.is_empty() {
        config.metric_labels = file.metric_labels.into_iter().collect();
    }
    if let Some(v) = file.path_label {
        config.path_label = v;
    }
    if let Some(v) = file.buffer_capacity {
        config.buffer_capacity = v;
    }
    if let Some(v) = file.pool_max_idle {
        config.pool_max_idle = v;
    }
    if let Some(v) = file.log_level {
        config.log_level = v;
    }
    Ok(())
}

fn apply_env(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Result<(), String> {
    if let Some(v) = env("STRESS_APP_HOST") {
        config.listen_host = v;
    }
    if let Some(v) = env("STRESS_APP_PORT") {
        config.listen_port = parse_value("STRESS_APP_PORT", &v)?;
    }
    if let Some(v) = env("STRESS_APP_ADMIN_PORT") {
        config.admin_port = Some(parse_value("STRESS_APP_ADMIN_PORT", &v)?);
    }
    if let Some(v) = env("STRESS_APP_DELAY_RANGE_MS") {
        (config.delay_min_ms, config.delay_max_ms) = parse_range(&v)?;
    }
    if let Some(v) = env("STRESS_APP_MAX_HEADER_BYTES") {
        config.max_header_bytes = parse_value("STRESS_APP_MAX_HEADER_BYTES", &v)?;
    }
    if let Some(v) = env("STRESS_APP_READ_TIMEOUT") {
        config.read_timeout_secs = parse_value("STRESS_APP_READ_TIMEOUT", &v)?;
    }
    if let Some(v) = env("STRESS_APP_READ_HEADER_TIMEOUT") {
        config.read_header_timeout_secs = parse_value("STRESS_APP_READ_HEADER_TIMEOUT", &v)?;
    }
    if let Some(v) = env("STRESS_APP_WRITE_TIMEOUT") {
        config.write_timeout_secs = parse_value("STRESS_APP_WRITE_TIMEOUT", &v)?;
    }
    if let Some(v) = env("STRESS_APP_IDLE_TIMEOUT") {
        config.idle_timeout_secs = parse_value("STRESS_APP_IDLE_TIMEOUT", &v)?;
    }
    if let Some(v) = env("STRESS_APP_INSTRUMENTS") {
        config.instruments = v.parse()?;
    }
    if let Some(v) = env("STRESS_APP_METRIC_PREFIX") {
        config.metric_prefix = v;
    }
    if let Some(v) = env("STRESS_APP_METRIC_LABELS") {
        config.metric_labels = v
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(parse_label)
            .collect::<Result<_, _>>()?;
    }
    if let Some(v) = env("STRESS_APP_PATH_LABEL") {
        config.path_label = parse_value("STRESS_APP_PATH_LABEL", &v)?;
    }
    if let Some(v) = env("STRESS_APP_BUFFER_CAPACITY") {
        config.buffer_capacity = parse_value("STRESS_APP_BUFFER_CAPACITY", &v)?;
    }
    if let Some(v) = env("STRESS_APP_POOL_MAX_IDLE") {
        config.pool_max_idle = parse_value("STRESS_APP_POOL_MAX_IDLE", &v)?;
    }
    if let Some(v) = env("STRESS_APP_LOG_LEVEL") {
        config.log_level = v;
    }
    Ok(())
}

fn apply_cli(config: &mut Config, cli: &Cli) -> Result<(), String> {
    if let Some(v) = &cli.listen_host {
        config.listen_host = v.clone();
    }
    if let Some(v) = cli.port {
        config.listen_port = v;
    }
    if let Some(v) = cli.admin_port {
        config.admin_port = Some(v);
    }
    if let Some(v) = &cli.delay_range_ms {
        (config.delay_min_ms, config.delay_max_ms) = parse_range(v)?;
    }
    if let Some(v) = cli.max_header_bytes {
        config.max_header_bytes = v;
    }
    if let Some(v) = cli.read_timeout {
        config.read_timeout_secs = v;
    }
    if let Some(v) = cli.read_header_timeout {
        config.read_header_timeout_secs = v;
    }
    if let Some(v) = cli.write_timeout {
        config.write_timeout_secs = v;
    }
    if let Some(v) = cli.idle_timeout {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = &cli.instruments {
        config.instruments = v.parse()?;
    }
    if let Some(v) = &cli.metric_prefix {
        config.metric_prefix = v.clone();
    }
    if !cli.metric_labels.is_empty() {
        config.metric_labels = cli
            .metric_labels
            .iter()
            .map(|s| parse_label(s))
            .collect::<Result<_, _>>()?;
    }
    if cli.path_label {
        config.path_label = true;
    }
    if let Some(v) = cli.buffer_capacity {
        config.buffer_capacity = v;
    }
    if let Some(v) = cli.pool_max_idle {
        config.pool_max_idle = v;
    }
    if let Some(v) = &cli.log_level {
        config.log_level = v.clone();
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid value for {key}: '{value}'"))
}

/// Parse `MIN,MAX` (or a single value for a fixed delay).
fn parse_range(value: &str) -> Result<(u64, u64), String> {
    let invalid = || format!("invalid delay range '{value}' (expected MIN,MAX)");
    match value.split_once(',') {
        Some((min, max)) => {
            let min = min.trim().parse().map_err(|_| invalid())?;
            let max = max.trim().parse().map_err(|_| invalid())?;
            Ok((min, max))
        }
        None => {
            let fixed = value.trim().parse().map_err(|_| invalid())?;
            Ok((fixed, fixed))
        }
    }
}

fn parse_label(pair: &str) -> Result<(String, String), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("invalid metric label '{pair}' (expected KEY=VALUE)"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid metric label '{pair}' (empty key)"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
