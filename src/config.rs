//! Server configuration.
//!
//! All keys are read from the environment with the contractual names below;
//! the binary's CLI flags override host and port.

use std::env;
use std::str::FromStr;

/// Runtime configuration for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host (`HOST`).
    pub host: String,
    /// Initial bind port (`PORT`); probed upward on conflict.
    pub port: u16,
    /// How many consecutive ports to try when the initial one is taken.
    pub max_port_retries: u16,
    /// Connection cap (`MAX_CONNECTIONS`).
    pub max_connections: usize,
    /// CORS header value (`CORS_ORIGIN`).
    pub cors_origin: String,
    /// Hub mode (`IS_HUB`): dial bootstrap hubs and join the mesh.
    pub is_hub: bool,
    /// Reserved network name that auto-promotes peers to hubs
    /// (`HUB_MESH_NAMESPACE`).
    pub hub_mesh_namespace: String,
    /// Bootstrap hub URIs (`BOOTSTRAP_HUBS`, comma-separated).
    pub bootstrap_hubs: Vec<String>,
    /// Shared bearer token; empty disables auth (`AUTH_TOKEN`).
    pub auth_token: String,
    /// Housekeeping period (`CLEANUP_INTERVAL_MS`).
    pub cleanup_interval_ms: u64,
    /// Advisory idle bound (`PEER_TIMEOUT_MS`); not enforced by the core.
    pub peer_timeout_ms: u64,
    /// Bootstrap retry cap (`MAX_RECONNECT_ATTEMPTS`).
    pub max_reconnect_attempts: u32,
    /// Delay between bootstrap retries (`RECONNECT_INTERVAL_MS`).
    pub reconnect_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            max_port_retries: 10,
            max_connections: 1000,
            cors_origin: "*".to_string(),
            is_hub: false,
            hub_mesh_namespace: "pigeonhub-mesh".to_string(),
            bootstrap_hubs: Vec::new(),
            auth_token: String::new(),
            cleanup_interval_ms: 30_000,
            peer_timeout_ms: 300_000,
            max_reconnect_attempts: 10,
            reconnect_interval_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the process environment, falling back to
    /// the defaults above for anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: env_str("HOST", d.host),
            port: env_parse("PORT", d.port),
            max_port_retries: env_parse("MAX_PORT_RETRIES", d.max_port_retries),
            max_connections: env_parse("MAX_CONNECTIONS", d.max_connections),
            cors_origin: env_str("CORS_ORIGIN", d.cors_origin),
            is_hub: env_bool("IS_HUB", d.is_hub),
            hub_mesh_namespace: env_str("HUB_MESH_NAMESPACE", d.hub_mesh_namespace),
            bootstrap_hubs: parse_bootstrap_list(&env_str("BOOTSTRAP_HUBS", String::new())),
            auth_token: env_str("AUTH_TOKEN", d.auth_token),
            cleanup_interval_ms: env_parse("CLEANUP_INTERVAL_MS", d.cleanup_interval_ms),
            peer_timeout_ms: env_parse("PEER_TIMEOUT_MS", d.peer_timeout_ms),
            max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts),
            reconnect_interval_ms: env_parse("RECONNECT_INTERVAL_MS", d.reconnect_interval_ms),
        }
    }
}

/// Split a comma-separated URI list, dropping blanks.
pub fn parse_bootstrap_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_str(key: &str, default: String) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.max_connections, 1000);
        assert_eq!(cfg.cors_origin, "*");
        assert!(!cfg.is_hub);
        assert_eq!(cfg.hub_mesh_namespace, "pigeonhub-mesh");
        assert!(cfg.bootstrap_hubs.is_empty());
        assert!(cfg.auth_token.is_empty());
        assert_eq!(cfg.cleanup_interval_ms, 30_000);
        assert_eq!(cfg.peer_timeout_ms, 300_000);
    }

    #[test]
    fn test_parse_bootstrap_list() {
        assert!(parse_bootstrap_list("").is_empty());
        assert_eq!(
            parse_bootstrap_list("ws://a:1, ws://b:2 ,,"),
            vec!["ws://a:1".to_string(), "ws://b:2".to_string()]
        );
    }
}
