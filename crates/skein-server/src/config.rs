//! Server configuration.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8099);

/// Default path of the MCP endpoint.
pub const DEFAULT_MCP_PATH: &str = "/mcp";

/// Default path of the liveness endpoint.
pub const DEFAULT_HEALTHZ_PATH: &str = "/healthz";

/// Default delay between health checks (60 seconds).
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on the first health check, which may wait on slow startups (2 minutes).
pub const DEFAULT_HEALTH_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default bound on every later health check (30 seconds).
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_address: SocketAddr,

    /// Path serving POST/GET/DELETE for MCP sessions.
    pub path: String,

    /// Path serving the liveness probe.
    pub healthz_path: String,

    pub health_interval: Duration,
    pub health_startup_timeout: Duration,
    pub health_check_timeout: Duration,

    /// Environment merged into every session before request headers.
    pub env: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS,
            path: DEFAULT_MCP_PATH.to_string(),
            healthz_path: DEFAULT_HEALTHZ_PATH.to_string(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            health_startup_timeout: DEFAULT_HEALTH_STARTUP_TIMEOUT,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            env: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the MCP endpoint path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the liveness endpoint path.
    pub fn with_healthz_path(mut self, path: impl Into<String>) -> Self {
        self.healthz_path = path.into();
        self
    }

    /// Set the delay between health checks.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Set the timeouts of the first and of every later health check.
    pub fn with_health_timeouts(mut self, startup: Duration, check: Duration) -> Self {
        self.health_startup_timeout = startup;
        self.health_check_timeout = check;
        self
    }

    /// Add one base environment entry.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the base environment.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 8099);
        assert!(config.bind_address.ip().is_loopback());
        assert_eq!(config.path, "/mcp");
        assert_eq!(config.healthz_path, "/healthz");
        assert_eq!(config.health_interval, Duration::from_secs(60));
        assert_eq!(config.health_startup_timeout, Duration::from_secs(120));
        assert_eq!(config.health_check_timeout, Duration::from_secs(30));
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::new()
            .with_bind_address("0.0.0.0:9000".parse().unwrap())
            .with_path("/rpc")
            .with_healthz_path("/live")
            .with_health_interval(Duration::from_secs(5))
            .with_health_timeouts(Duration::from_secs(10), Duration::from_secs(2))
            .with_env_var("REGION", "eu");

        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.path, "/rpc");
        assert_eq!(config.healthz_path, "/live");
        assert_eq!(config.health_interval, Duration::from_secs(5));
        assert_eq!(config.health_startup_timeout, Duration::from_secs(10));
        assert_eq!(config.health_check_timeout, Duration::from_secs(2));
        assert_eq!(config.env.get("REGION").map(String::as_str), Some("eu"));
    }
}
