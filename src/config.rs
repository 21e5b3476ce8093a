use serde::Deserialize;
use std::time::Duration;
use std::{collections::HashSet, fs};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9000";
pub const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0:8081";
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_HEALTH_RETRIES: u32 = 2;
pub const DEFAULT_CLIENT_IDLE_SECS: u64 = 30;
pub const DEFAULT_BACKEND_IDLE_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_BACKEND_WEIGHT: i64 = 1;

/// Raw on-disk schema. Everything is optional; `finalize` turns it into a
/// fully resolved [`Config`] with defaults applied and invalid entries
/// rejected.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawConfig {
    pub listen_address: Option<String>,
    pub admin_address: Option<String>,
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    pub health_check: Option<RawHealthCheck>,
    pub timeout: Option<RawTimeout>,
    pub discovery: Option<RawDiscovery>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawHealthCheck {
    pub interval_sec: Option<u64>,
    pub timeout_sec: Option<u64>,
    pub retries: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawTimeout {
    pub client_idle_sec: Option<u64>,
    pub backend_idle_sec: Option<u64>,
    pub connect_timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawDiscovery {
    #[serde(rename = "type")]
    pub kind: Option<DiscoveryKind>,
    pub kubernetes: Option<KubernetesDiscoveryConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    #[default]
    Static,
    Docker,
    Kubernetes,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub address: String,
    #[serde(default)]
    pub weight: Option<i64>,
}

/// Selector for external endpoint-slice discovery; unused by the static
/// source.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct KubernetesDiscoveryConfig {
    pub namespace: String,
    pub service: String,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub admin_address: String,
    pub algorithm: Algorithm,
    pub backends: Vec<ResolvedBackend>,
    pub health_check: HealthCheckConfig,
    pub timeout: TimeoutConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone)]
pub struct ResolvedBackend {
    pub address: String,
    pub weight: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub interval_sec: u64,
    pub timeout_sec: u64,
    pub retries: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub client_idle_sec: u64,
    pub backend_idle_sec: u64,
    pub connect_timeout: u64,
}

impl TimeoutConfig {
    pub fn client_idle(&self) -> Duration {
        Duration::from_secs(self.client_idle_sec)
    }

    pub fn backend_idle(&self) -> Duration {
        Duration::from_secs(self.backend_idle_sec)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            client_idle_sec: DEFAULT_CLIENT_IDLE_SECS,
            backend_idle_sec: DEFAULT_BACKEND_IDLE_SECS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub kind: DiscoveryKind,
    pub kubernetes: Option<KubernetesDiscoveryConfig>,
}

impl RawConfig {
    /// Applies defaults, validates, and sanitizes the configuration.
    pub fn finalize(self) -> Result<Config, ConfigError> {
        let listen_address =
            self.listen_address.unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        if listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ConfigError(format!(
                "listen_address is not a valid socket address: {listen_address}"
            )));
        }

        let admin_address = self.admin_address.unwrap_or_else(|| DEFAULT_ADMIN_ADDR.to_string());
        if admin_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ConfigError(format!(
                "admin_address is not a valid socket address: {admin_address}"
            )));
        }

        let backends = validate_and_dedupe_backends(self.backends)?;

        let health = self.health_check.unwrap_or_default();
        let health_check = HealthCheckConfig {
            interval_sec: health.interval_sec.unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS).max(1),
            timeout_sec: health.timeout_sec.unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS).max(1),
            retries: health.retries.unwrap_or(DEFAULT_HEALTH_RETRIES).max(1),
        };

        let timeout = self.timeout.unwrap_or_default();
        let timeout = TimeoutConfig {
            client_idle_sec: timeout.client_idle_sec.unwrap_or(DEFAULT_CLIENT_IDLE_SECS).max(1),
            backend_idle_sec: timeout.backend_idle_sec.unwrap_or(DEFAULT_BACKEND_IDLE_SECS).max(1),
            connect_timeout: timeout.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS).max(1),
        };

        let discovery = self.discovery.unwrap_or_default();
        let discovery = DiscoveryConfig {
            kind: discovery.kind.unwrap_or_default(),
            kubernetes: discovery.kubernetes,
        };

        if discovery.kind == DiscoveryKind::Static && backends.is_empty() {
            return Err(ConfigError::ConfigError(
                "no backends specified and discovery is static".to_string(),
            ));
        }

        Ok(Config {
            listen_address,
            admin_address,
            algorithm: self.algorithm.unwrap_or_default(),
            backends,
            health_check,
            timeout,
            discovery,
        })
    }
}

/// Loads and finalizes a TOML configuration file. A missing file yields the
/// defaults (which fail finalization when they leave the pool empty).
pub fn try_load_config(path: &str) -> Result<Config, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => {
            info!(path = %path, "Loaded config");
            toml::from_str::<RawConfig>(&raw)
                .map_err(|e| ConfigError::ConfigError(e.to_string()))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path, "No config file found, using defaults");
            RawConfig::default()
        }
        Err(e) => return Err(ConfigError::ConfigError(e.to_string())),
    };
    raw.finalize()
}

fn validate_and_dedupe_backends(
    backends: Vec<BackendConfig>,
) -> Result<Vec<ResolvedBackend>, ConfigError> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(backends.len());

    for b in backends {
        let address = b.address.trim().to_string();
        if address.is_empty() {
            warn!("Skipping empty backend address");
            continue;
        }
        if address.parse::<std::net::SocketAddr>().is_err() {
            // host:port with a hostname is fine; only a missing port is not.
            let Some((host, port)) = address.rsplit_once(':') else {
                warn!(address = %address, "Skipping backend without a port");
                continue;
            };
            if host.is_empty() || port.parse::<u16>().is_err() {
                warn!(address = %address, "Skipping backend with an invalid port");
                continue;
            }
        }
        if !seen.insert(address.clone()) {
            warn!(address = %address, "Skipping duplicate backend");
            continue;
        }
        resolved.push(ResolvedBackend {
            address,
            weight: b.weight.unwrap_or(DEFAULT_BACKEND_WEIGHT),
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RawConfig {
        toml::from_str(
            r#"
            listen_address = "127.0.0.1:9000"

            [[backends]]
            address = "127.0.0.1:8001"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn finalize_applies_defaults() {
        let cfg = minimal().finalize().unwrap();
        assert_eq!(cfg.algorithm, Algorithm::RoundRobin);
        assert_eq!(cfg.health_check.interval_sec, DEFAULT_HEALTH_INTERVAL_SECS);
        assert_eq!(cfg.health_check.timeout_sec, DEFAULT_HEALTH_TIMEOUT_SECS);
        assert_eq!(cfg.health_check.retries, DEFAULT_HEALTH_RETRIES);
        assert_eq!(cfg.timeout.client_idle_sec, DEFAULT_CLIENT_IDLE_SECS);
        assert_eq!(cfg.timeout.backend_idle_sec, DEFAULT_BACKEND_IDLE_SECS);
        assert_eq!(cfg.timeout.connect_timeout, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(cfg.discovery.kind, DiscoveryKind::Static);
        assert_eq!(cfg.backends.len(), 1);
        assert_eq!(cfg.backends[0].weight, DEFAULT_BACKEND_WEIGHT);
    }

    #[test]
    fn full_schema_parses() {
        let raw: RawConfig = toml::from_str(
            r#"
            listen_address = "0.0.0.0:9000"
            admin_address = "0.0.0.0:8082"
            algorithm = "ip_hash"

            [[backends]]
            address = "10.0.0.1:8080"
            weight = 5

            [[backends]]
            address = "10.0.0.2:8080"

            [health_check]
            interval_sec = 7
            timeout_sec = 3
            retries = 4

            [timeout]
            client_idle_sec = 60
            backend_idle_sec = 45
            connect_timeout = 2

            [discovery]
            type = "kubernetes"

            [discovery.kubernetes]
            namespace = "default"
            service = "web"
            "#,
        )
        .unwrap();

        let cfg = raw.finalize().unwrap();
        assert_eq!(cfg.algorithm, Algorithm::IpHash);
        assert_eq!(cfg.backends[0].weight, 5);
        assert_eq!(cfg.backends[1].weight, 1);
        assert_eq!(cfg.health_check.retries, 4);
        assert_eq!(cfg.timeout.connect(), Duration::from_secs(2));
        assert_eq!(cfg.discovery.kind, DiscoveryKind::Kubernetes);
        assert_eq!(cfg.discovery.kubernetes.unwrap().service, "web");
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        let mut raw = minimal();
        raw.listen_address = Some("not-an-address".to_string());
        assert!(raw.finalize().is_err());
    }

    #[test]
    fn unknown_algorithm_fails_to_parse() {
        let err = toml::from_str::<RawConfig>(
            r#"
            algorithm = "fastest_first"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn static_discovery_requires_backends() {
        let raw: RawConfig = toml::from_str(r#"listen_address = "127.0.0.1:9000""#).unwrap();
        assert!(raw.finalize().is_err());
    }

    #[test]
    fn backends_are_deduped_and_sanitized() {
        let raw: RawConfig = toml::from_str(
            r#"
            listen_address = "127.0.0.1:9000"

            [[backends]]
            address = "  10.0.0.1:8080  "

            [[backends]]
            address = "10.0.0.1:8080"

            [[backends]]
            address = "no-port"

            [[backends]]
            address = "db.internal:5432"
            "#,
        )
        .unwrap();

        let cfg = raw.finalize().unwrap();
        let addrs: Vec<&str> = cfg.backends.iter().map(|b| b.address.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:8080", "db.internal:5432"]);
    }
}
