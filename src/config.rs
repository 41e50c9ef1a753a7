//! Agent configuration
//!
//! Loaded from a `microservice.yaml` file:
//!
//! ```yaml
//! service:  { name: hello-client, version: 0.0.1, appId: demo }
//! instance: { hostname: "", protocol: rest, listenAddress: ":8090" }
//! registry: { address: "http://127.0.0.1:30100" }
//! provider: { name: hello-server, version: 0.0.1, appId: demo }
//! tenant:   { domain: default }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{InstanceConfig, ServiceIdentity};
use crate::watch::ReconnectPolicy;

/// Tenant domain used when none is configured
pub const DEFAULT_DOMAIN: &str = "default";

/// Host substituted when the listen address has none
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Validated agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Identity this process registers as
    pub service: ServiceIdentity,
    /// This process's instance; absent for pure discovery clients
    pub instance: Option<InstanceConfig>,
    pub registry: RegistryConfig,
    /// Target provider the consumer discovers
    pub provider: Option<ServiceIdentity>,
    pub tenant: TenantConfig,
    pub heartbeat: HeartbeatConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Base address, e.g. `http://127.0.0.1:30100`
    pub address: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(default)]
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Reconnect attempts after the watch stream drops (0 = never)
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl WatchConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

/// On-disk layout; every section optional until validated
#[derive(Debug, Deserialize)]
struct RawConfig {
    service: Option<ServiceIdentity>,
    instance: Option<InstanceConfig>,
    registry: Option<RegistryConfig>,
    provider: Option<ServiceIdentity>,
    tenant: Option<TenantConfig>,
    #[serde(default)]
    heartbeat: HeartbeatConfig,
    #[serde(default)]
    watch: WatchConfig,
}

impl Config {
    /// Load and validate a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut tenant = raw.tenant.unwrap_or_default();
        if tenant.domain.is_empty() {
            tenant.domain = DEFAULT_DOMAIN.to_string();
        }

        if raw.heartbeat.interval_secs == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }

        let instance = match raw.instance {
            Some(mut instance) => {
                if instance.hostname.is_empty() {
                    instance.hostname = local_hostname();
                }
                instance.listen_address = normalize_listen_address(&instance.listen_address)?;
                Some(instance)
            }
            None => None,
        };

        Ok(Self {
            service: raw.service.ok_or(ConfigError::Missing("service"))?,
            instance,
            registry: raw.registry.ok_or(ConfigError::Missing("registry"))?,
            provider: raw.provider,
            tenant,
            heartbeat: raw.heartbeat,
            watch: raw.watch,
        })
    }

    /// Instance section, required by anything that registers an instance
    pub fn instance(&self) -> Result<&InstanceConfig, ConfigError> {
        self.instance.as_ref().ok_or(ConfigError::Missing("instance"))
    }

    /// Provider section, required by consumers
    pub fn provider(&self) -> Result<&ServiceIdentity, ConfigError> {
        self.provider.as_ref().ok_or(ConfigError::Missing("provider"))
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

/// Validate a `host:port` listen address
///
/// An empty host becomes `127.0.0.1`; the port must be a positive number.
pub fn normalize_listen_address(address: &str) -> Result<String, ConfigError> {
    if address.is_empty() {
        return Err(ConfigError::EmptyListenAddress);
    }

    let invalid = |reason: &str| ConfigError::InvalidListenAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port in address"))?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("missing ']' in address"))?
    } else if host.contains(':') {
        return Err(invalid("too many colons in address"));
    } else {
        host
    };

    let host = if host.is_empty() { DEFAULT_LISTEN_HOST } else { host };

    let port_num: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidPort { port: port.to_string() })?;
    if port_num == 0 {
        return Err(ConfigError::InvalidPort { port: port.to_string() });
    }

    if host.contains(':') {
        Ok(format!("[{}]:{}", host, port_num))
    } else {
        Ok(format!("{}:{}", host, port_num))
    }
}
