use crate::site::SiteLimits;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the preview gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public proxy and admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend port pool
    #[serde(default)]
    pub ports: PortPoolConfig,

    /// Instance lifecycle settings
    #[serde(default)]
    pub instances: InstanceConfig,

    /// Message bus transport and topics
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Externally visible base URL, used to build preview URLs
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// First path segment of preview URLs: `/<route_prefix>/<app id>/...`
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Port for the loopback admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Max time to wait for a backend response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Public URL of an app's preview
    pub fn preview_url(&self, app_id: &str) -> String {
        format!(
            "{}/{}/{}/",
            self.public_url.trim_end_matches('/'),
            self.route_prefix,
            app_id
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            public_url: default_public_url(),
            route_prefix: default_route_prefix(),
            admin_port: default_admin_port(),
            admin_token: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortPoolConfig {
    /// First backend port (default: 4000)
    #[serde(default = "default_port_range_start")]
    pub start: u16,

    /// Number of ports in the pool (default: 1000)
    #[serde(default = "default_port_range_size")]
    pub size: u16,

    /// Ports to try before giving up when binding fails (default: 3)
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            start: default_port_range_start(),
            size: default_port_range_size(),
            bind_attempts: default_bind_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Default lease length in seconds (default: 1800)
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Maximum number of creating + live instances (default: 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Interval between expiry sweeps in seconds (default: 300)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Time open backend connections get to finish on stop (default: 10)
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,

    /// Maximum size of a submission in bytes (default: 10 MiB)
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,

    /// Maximum number of declared backend routes (default: 64)
    #[serde(default = "default_max_routes")]
    pub max_routes: usize,
}

impl InstanceConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn site_limits(&self) -> SiteLimits {
        SiteLimits {
            max_content_bytes: self.max_content_bytes,
            max_routes: self.max_routes,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease(),
            max_concurrent: default_max_concurrent(),
            sweep_interval_secs: default_sweep_interval(),
            drain_grace_secs: default_drain_grace(),
            max_content_bytes: default_max_content_bytes(),
            max_routes: default_max_routes(),
        }
    }
}

/// Bus transport
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// In-process topics (default)
    #[default]
    Local,
    /// Redis pub/sub
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Transport: "local" (default) or "redis"
    #[serde(default, rename = "type")]
    pub bus_type: BusType,

    /// Redis URL (redis transport only)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Topic carrying creation requests
    #[serde(default = "default_create_topic")]
    pub create_topic: String,

    /// Topic carrying lease extensions
    #[serde(default = "default_extend_topic")]
    pub extend_topic: String,

    /// Readiness notices go to `<ready_topic_prefix><app id>`
    #[serde(default = "default_ready_topic_prefix")]
    pub ready_topic_prefix: String,
}

impl BusConfig {
    pub fn ready_topic(&self, app_id: &str) -> String {
        format!("{}{}", self.ready_topic_prefix, app_id)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::default(),
            url: default_redis_url(),
            create_topic: default_create_topic(),
            extend_topic: default_extend_topic(),
            ready_topic_prefix: default_ready_topic_prefix(),
        }
    }
}

fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_route_prefix() -> String {
    "preview".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_port_range_start() -> u16 {
    4000
}

fn default_port_range_size() -> u16 {
    1000
}

fn default_bind_attempts() -> u32 {
    3
}

fn default_lease() -> u64 {
    30 * 60
}

fn default_max_concurrent() -> usize {
    5
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_drain_grace() -> u64 {
    10
}

fn default_max_content_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_routes() -> usize {
    64
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_create_topic() -> String {
    "app:create".to_string()
}

fn default_extend_topic() -> String {
    "app:extend".to_string()
}

fn default_ready_topic_prefix() -> String {
    "app:ready:".to_string()
}

impl Config {
    /// Load and validate a TOML configuration file, then apply environment
    /// overrides
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults plus environment overrides
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PORT`, `WORKER_PUBLIC_URL`, `MAX_CONCURRENT_APPS` and `REDIS_URL`
    /// overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT {:?}: {}", port, e))?;
        }
        if let Some(url) = lookup("WORKER_PUBLIC_URL") {
            self.server.public_url = url;
        }
        if let Some(max) = lookup("MAX_CONCURRENT_APPS") {
            self.instances.max_concurrent = max
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid MAX_CONCURRENT_APPS {:?}: {}", max, e))?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.bus.bus_type = BusType::Redis;
            self.bus.url = url;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.start == 0 {
            errors.push("ports.start must be greater than 0".to_string());
        }
        if self.ports.size == 0 {
            errors.push("ports.size must be greater than 0".to_string());
        } else if self.ports.start as u32 + self.ports.size as u32 > u16::MAX as u32 + 1 {
            errors.push(format!(
                "port range {}+{} runs past 65535",
                self.ports.start, self.ports.size
            ));
        }
        if self.ports.bind_attempts == 0 {
            errors.push("ports.bind_attempts must be greater than 0".to_string());
        }
        if self.instances.lease_secs == 0 {
            errors.push("instances.lease_secs must be greater than 0".to_string());
        }
        if self.instances.max_concurrent == 0 {
            errors.push("instances.max_concurrent must be greater than 0".to_string());
        }
        if self.instances.sweep_interval_secs == 0 {
            errors.push("instances.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        let prefix = &self.server.route_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            errors.push(format!(
                "server.route_prefix {:?} must be a single non-empty path segment",
                prefix
            ));
        }
        if self.bus.create_topic.is_empty() || self.bus.extend_topic.is_empty() {
            errors.push("bus topics must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
