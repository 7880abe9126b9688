//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote SSR server host (IP literal or domain)
    pub remote_host: String,
    /// Remote SSR server port
    pub remote_port: u16,
    /// Local SOCKS5 listen host
    pub listen_host: String,
    /// Local SOCKS5 listen port
    pub listen_port: u16,
    /// Whether UDP relaying is advertised to SOCKS5 clients
    #[serde(default)]
    pub udp: bool,
    /// Wrap the upstream connection in TLS
    #[serde(default)]
    pub over_tls_enable: bool,
    /// SNI / certificate name for the TLS wrap
    pub over_tls_server_domain: Option<String>,
    /// Cipher method selector
    pub method: String,
    /// Obfuscation protocol selector
    pub protocol: String,
    /// Obfuscation plugin selector
    pub obfs: String,
    /// Shared secret with the SSR server
    pub password: String,
    /// Advisory idle timeout in seconds. Expiry is reported, not enforced.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_idle_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Local listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 8388,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 1080,
            udp: false,
            over_tls_enable: false,
            over_tls_server_domain: None,
            method: "chacha20-poly1305".to_string(),
            protocol: "origin".to_string(),
            obfs: "plain".to_string(),
            password: String::new(),
            idle_timeout: default_idle_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:1080");
        assert_eq!(config.method, "chacha20-poly1305");
        assert!(!config.over_tls_enable);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let restored: Config = toml::from_str(&text).unwrap();
        assert_eq!(restored.remote_port, config.remote_port);
        assert_eq!(restored.idle_timeout, config.idle_timeout);
    }

    #[test]
    fn test_partial_config() {
        let text = r#"
            remote_host = "ssr.example.com"
            remote_port = 443
            listen_host = "127.0.0.1"
            listen_port = 1080
            method = "chacha20-poly1305"
            protocol = "auth-challenge"
            obfs = "plain"
            password = "secret"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.protocol, "auth-challenge");
        assert!(!config.udp);
        assert_eq!(config.idle_timeout, 300);
    }
}
