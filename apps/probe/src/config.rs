//! Probe configuration: defaults, a TOML config file, environment
//! overrides, then explicit command-line flags, in that order of
//! precedence (later overlays earlier).

use std::fs;
use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/worldping/probe.toml";
pub const DEFAULT_HEALTH_HOSTS: &str =
    "google.com,youtube.com,facebook.com,twitter.com,wikipedia.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("name must be set")]
    MissingName,
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Parser)]
#[command(name = "worldping-probe", version, about = "worldping network monitoring agent")]
pub struct Flags {
    /// log level. 0=TRACE|1=DEBUG|2=INFO|3=WARN|4=ERROR|5=FATAL|6=PANIC
    #[arg(long)]
    pub log_level: Option<u8>,
    /// configuration file path
    #[arg(long)]
    pub config: Option<String>,
    /// address of the control server (ws:// or wss://)
    #[arg(long)]
    pub server_url: Option<String>,
    /// address of the metrics gateway (http:// or https://)
    #[arg(long)]
    pub tsdb_url: Option<String>,
    /// agent name, assigned by the control server
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub api_key: Option<String>,
    /// number of concurrent writers to the metrics gateway
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// comma-separated hosts pinged to judge this probe's own health
    #[arg(long)]
    pub health_hosts: Option<String>,
    /// address families for the ICMP engine: v4, v6 or all
    #[arg(long)]
    pub icmp_protocol: Option<String>,
    /// listen address for the /alive and /ready endpoints
    #[arg(long)]
    pub healthz_listen_addr: Option<String>,
    /// enable graphite instrumentation
    #[arg(long)]
    pub stats_enabled: Option<bool>,
    /// stats prefix; $hostname expands to the local hostname
    #[arg(long)]
    pub stats_prefix: Option<String>,
    /// graphite address
    #[arg(long)]
    pub stats_addr: Option<String>,
    /// seconds between stats submissions
    #[arg(long)]
    pub stats_interval: Option<u64>,
    /// stats messages buffered while graphite is unavailable
    #[arg(long)]
    pub stats_buffer_size: Option<usize>,
    /// seconds after which a stats write counts as failed
    #[arg(long)]
    pub stats_timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: u8,
    pub server_url: String,
    pub tsdb_url: String,
    pub name: String,
    pub api_key: String,
    pub concurrency: usize,
    pub health_hosts: String,
    pub icmp_protocol: String,
    pub healthz_listen_addr: String,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub prefix: String,
    pub addr: String,
    pub interval_secs: u64,
    pub buffer_size: usize,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: 2,
            server_url: "ws://localhost:80/".to_string(),
            tsdb_url: "http://localhost:80/".to_string(),
            name: String::new(),
            api_key: "not_very_secret_key".to_string(),
            concurrency: 5,
            health_hosts: DEFAULT_HEALTH_HOSTS.to_string(),
            icmp_protocol: "all".to_string(),
            healthz_listen_addr: "localhost:7180".to_string(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "worldping-probe.stats.$hostname".to_string(),
            addr: "localhost:2003".to_string(),
            interval_secs: 10,
            buffer_size: 20_000,
            timeout_secs: 10,
        }
    }
}

impl Config {
    /// Assemble the effective configuration. A missing config file at
    /// the default location is fine; a file named explicitly with
    /// `--config` must exist.
    pub fn load(flags: &Flags) -> Result<Self, ConfigError> {
        let (path, explicit) = match &flags.config {
            Some(path) => (path.clone(), true),
            None => (DEFAULT_CONFIG_PATH.to_string(), false),
        };

        let mut config = if Path::new(&path).exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.clone(), source })?
        } else if explicit {
            return Err(ConfigError::Read {
                path,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_flags(flags);
        Ok(config)
    }

    /// Environment overlays the file, using `WP_PROBE_`-prefixed keys.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn set<T: std::str::FromStr>(
            target: &mut T,
            get: &impl Fn(&str) -> Option<String>,
            key: &'static str,
        ) -> Result<(), ConfigError> {
            if let Some(raw) = get(key) {
                *target =
                    raw.parse().map_err(|_| ConfigError::Invalid(key, raw.to_string()))?;
            }
            Ok(())
        }

        set(&mut self.log_level, &get, "WP_PROBE_LOG_LEVEL")?;
        set(&mut self.server_url, &get, "WP_PROBE_SERVER_URL")?;
        set(&mut self.tsdb_url, &get, "WP_PROBE_TSDB_URL")?;
        set(&mut self.name, &get, "WP_PROBE_NAME")?;
        set(&mut self.api_key, &get, "WP_PROBE_API_KEY")?;
        set(&mut self.concurrency, &get, "WP_PROBE_CONCURRENCY")?;
        set(&mut self.health_hosts, &get, "WP_PROBE_HEALTH_HOSTS")?;
        set(&mut self.icmp_protocol, &get, "WP_PROBE_ICMP_PROTOCOL")?;
        set(&mut self.healthz_listen_addr, &get, "WP_PROBE_HEALTHZ_LISTEN_ADDR")?;
        set(&mut self.stats.enabled, &get, "WP_PROBE_STATS_ENABLED")?;
        set(&mut self.stats.prefix, &get, "WP_PROBE_STATS_PREFIX")?;
        set(&mut self.stats.addr, &get, "WP_PROBE_STATS_ADDR")?;
        set(&mut self.stats.interval_secs, &get, "WP_PROBE_STATS_INTERVAL")?;
        set(&mut self.stats.buffer_size, &get, "WP_PROBE_STATS_BUFFER_SIZE")?;
        set(&mut self.stats.timeout_secs, &get, "WP_PROBE_STATS_TIMEOUT")?;
        Ok(())
    }

    /// Explicit flags overlay everything.
    fn apply_flags(&mut self, flags: &Flags) {
        macro_rules! overlay {
            ($($field:expr, $flag:expr;)*) => {
                $(if let Some(value) = &$flag { $field = value.clone(); })*
            };
        }
        overlay! {
            self.log_level, flags.log_level;
            self.server_url, flags.server_url;
            self.tsdb_url, flags.tsdb_url;
            self.name, flags.name;
            self.api_key, flags.api_key;
            self.concurrency, flags.concurrency;
            self.health_hosts, flags.health_hosts;
            self.icmp_protocol, flags.icmp_protocol;
            self.healthz_listen_addr, flags.healthz_listen_addr;
            self.stats.enabled, flags.stats_enabled;
            self.stats.prefix, flags.stats_prefix;
            self.stats.addr, flags.stats_addr;
            self.stats.interval_secs, flags.stats_interval;
            self.stats.buffer_size, flags.stats_buffer_size;
            self.stats.timeout_secs, flags.stats_timeout;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.log_level > 6 {
            return Err(ConfigError::Invalid("log-level", self.log_level.to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency", "0".to_string()));
        }

        let server = Url::parse(&self.server_url)
            .map_err(|err| ConfigError::Invalid("server-url", err.to_string()))?;
        if !matches!(server.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid("server-url", self.server_url.clone()));
        }

        let tsdb = Url::parse(&self.tsdb_url)
            .map_err(|err| ConfigError::Invalid("tsdb-url", err.to_string()))?;
        if !matches!(tsdb.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid("tsdb-url", self.tsdb_url.clone()));
        }

        if !matches!(self.icmp_protocol.as_str(), "v4" | "v6" | "all") {
            return Err(ConfigError::Invalid("icmp-protocol", self.icmp_protocol.clone()));
        }

        if self.stats.enabled && self.stats.addr.is_empty() {
            return Err(ConfigError::Invalid("stats-addr", "empty".to_string()));
        }
        Ok(())
    }

    /// Expand `$hostname` in the stats prefix, with dots flattened so
    /// the hostname stays a single graphite node.
    pub fn stats_prefix(&self, hostname: &str) -> String {
        self.stats.prefix.replace("$hostname", &hostname.replace('.', "_"))
    }
}
