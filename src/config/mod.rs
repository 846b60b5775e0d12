//! Configuration layer: typed settings with layered precedence
//! (file → `CACHER__` env → legacy env → CLI).

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{KeyVersion, RouteRule, RouteTable};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cacher";
const ENV_PREFIX: &str = "CACHER";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_REQUEST_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Environment variables understood by earlier deployments of the proxy.
pub const LEGACY_UPSTREAM_URL: &str = "PROXY_URL";
pub const LEGACY_REDIS_ADDR: &str = "REDIS_ADDR";
pub const LEGACY_KEY_VERSION: &str = "REDIS_KEY_VERSION";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_request_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Redis { url: String },
    Memory { capacity: NonZeroUsize },
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub key_version: KeyVersion,
    pub routes: RouteTable,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    load_with_env(cli, |name| std::env::var(name).ok())
}

/// Same as [`load`] with an explicit lookup for the legacy variables.
pub fn load_with_env<F>(cli: &CliArgs, legacy_env: F) -> Result<Settings, LoadError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_legacy_env(legacy_env);

    match cli.command.as_ref() {
        Some(command) => raw.apply_serve_overrides(command.overrides()),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
    metrics: RawMetricsSettings,
}

impl RawSettings {
    /// Fill keys still unset from the variables earlier deployments used.
    fn apply_legacy_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.upstream.url.is_none() {
            self.upstream.url = lookup(LEGACY_UPSTREAM_URL);
        }
        if self.store.redis_url.is_none() {
            self.store.redis_url = lookup(LEGACY_REDIS_ADDR).map(|addr| redis_url_from_addr(&addr));
        }
        if self.cache.key_version.is_none() {
            self.cache.key_version = lookup(LEGACY_KEY_VERSION);
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.store.redis_url = Some(url.clone());
        }
        if let Some(version) = overrides.key_version.as_ref() {
            self.cache.key_version = Some(version.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            store,
            cache,
            metrics,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let upstream = build_upstream_settings(upstream)?;
        let store = build_store_settings(store)?;
        let cache = build_cache_settings(cache)?;
        let metrics = build_metrics_settings(metrics)?;

        Ok(Self {
            server,
            logging,
            upstream,
            store,
            cache,
            metrics,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let max_request_bytes_value = server
        .max_request_bytes
        .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
    if max_request_bytes_value == 0 {
        return Err(LoadError::invalid(
            "server.max_request_bytes",
            "must be greater than zero",
        ));
    }
    let max_request_bytes = usize::try_from(max_request_bytes_value).map_err(|_| {
        LoadError::invalid(
            "server.max_request_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_request_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            LoadError::invalid(
                "upstream.url",
                format!("required; set it via config file, CACHER__UPSTREAM__URL or {LEGACY_UPSTREAM_URL}"),
            )
        })?;

    let url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("upstream.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.url",
            format!("unsupported scheme `{}`", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(LoadError::invalid("upstream.url", "missing host"));
    }

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = store
        .backend
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "redis".to_string());

    let backend = match backend.as_str() {
        "redis" => {
            let url = store
                .redis_url
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
            if url.is_empty() {
                return Err(LoadError::invalid("store.redis_url", "must not be empty"));
            }
            StoreBackend::Redis { url }
        }
        "memory" => {
            let capacity = store.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY);
            let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
                LoadError::invalid("store.memory_capacity", "must be greater than zero")
            })?;
            StoreBackend::Memory { capacity }
        }
        other => {
            return Err(LoadError::invalid(
                "store.backend",
                format!("unknown backend `{other}` (expected `redis` or `memory`)"),
            ));
        }
    };

    Ok(StoreSettings { backend })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let key_version = KeyVersion::parse(cache.key_version.as_deref().unwrap_or_default())
        .map_err(|err| LoadError::invalid("cache.key_version", err.to_string()))?;

    let routes = match cache.routes {
        Some(rules) => RouteTable::new(
            rules
                .into_iter()
                .map(|rule| RouteRule::new(rule.pattern, rule.resource))
                .collect(),
        )
        .map_err(|err| LoadError::invalid("cache.routes", err.to_string()))?,
        None => RouteTable::default(),
    };

    Ok(CacheSettings {
        key_version,
        routes,
    })
}

fn build_metrics_settings(metrics: RawMetricsSettings) -> Result<MetricsSettings, LoadError> {
    let path = metrics
        .path
        .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string());
    if !path.starts_with('/') {
        return Err(LoadError::invalid("metrics.path", "must start with `/`"));
    }

    Ok(MetricsSettings {
        enabled: metrics.enabled.unwrap_or(true),
        path,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    redis_url: Option<String>,
    memory_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    key_version: Option<String>,
    routes: Option<Vec<RawRouteRule>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouteRule {
    pattern: String,
    resource: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMetricsSettings {
    enabled: Option<bool>,
    path: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// `REDIS_ADDR` historically held a bare `host:port`.
fn redis_url_from_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.is_empty() || addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}
