//! Configuration
//!
//! Configuration structures for the relay and the client.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::DISCOVERY_PORT;
use crate::tls::{CertificateProvider, ClientTrust, PemFileProvider, SelfSignedProvider};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub discovery: bool,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Where announcements are sent; the limited broadcast address by default
    #[serde(default = "default_discovery_addr")]
    pub discovery_addr: Ipv4Addr,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    /// Stop once the last client leaves (local ad-hoc relays)
    #[serde(default)]
    pub auto_shutdown: bool,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_cert_validity_days")]
    pub cert_validity_days: u32,
    /// Issue and cache a self-signed certificate at certfile/keyfile when
    /// they do not exist. When false both files must be supplied.
    #[serde(default = "default_true")]
    pub self_signed: bool,
    #[serde(default = "default_certfile")]
    pub certfile: PathBuf,
    #[serde(default = "default_keyfile")]
    pub keyfile: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_discovery_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

fn default_discovery_interval_ms() -> u64 {
    1000
}

fn default_service_name() -> String {
    "GhostCat".to_string()
}

fn default_cert_validity_days() -> u32 {
    3650
}

fn default_certfile() -> PathBuf {
    PathBuf::from("ghostcat-cert.pem")
}

fn default_keyfile() -> PathBuf {
    PathBuf::from("ghostcat-key.pem")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            discovery: true,
            discovery_port: DISCOVERY_PORT,
            discovery_addr: default_discovery_addr(),
            discovery_interval_ms: default_discovery_interval_ms(),
            auto_shutdown: false,
            service_name: default_service_name(),
            cert_validity_days: default_cert_validity_days(),
            self_signed: true,
            certfile: default_certfile(),
            keyfile: default_keyfile(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }

    pub fn certificate_provider(&self) -> Box<dyn CertificateProvider> {
        if self.self_signed {
            Box::new(SelfSignedProvider::new(
                self.service_name.clone(),
                self.cert_validity_days,
                self.certfile.clone(),
                self.keyfile.clone(),
            ))
        } else {
            Box::new(PemFileProvider::new(self.certfile.clone(), self.keyfile.clone()))
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay to connect to; `None` means LAN discovery
    #[serde(default)]
    pub server_host: Option<String>,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Trust any relay certificate. Protects against passive observers only.
    #[serde(default = "default_true")]
    pub accept_any_server_cert: bool,
    /// Where received files go; a fresh temp directory when unset
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_connect_timeout_ms() -> u64 {
    4000
}

fn default_discovery_timeout_ms() -> u64 {
    2500
}

fn default_nickname() -> String {
    "anonymous".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: None,
            server_port: default_port(),
            discovery_port: DISCOVERY_PORT,
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            nickname: default_nickname(),
            accept_any_server_cert: true,
            download_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn trust(&self) -> ClientTrust {
        if self.accept_any_server_cert {
            ClientTrust::AcceptAnyServerCertificate
        } else {
            ClientTrust::WebPkiRoots
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5555);
        assert_eq!(config.discovery_port, 9999);
        assert_eq!(config.discovery_addr, Ipv4Addr::BROADCAST);
        assert_eq!(config.discovery_interval(), Duration::from_secs(1));
        assert_eq!(config.service_name, "GhostCat");
        assert!(!config.auto_shutdown);
        assert_eq!(config.bind_addr(), "0.0.0.0:5555");
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server_host, None);
        assert_eq!(config.connect_timeout(), Duration::from_secs(4));
        assert_eq!(config.discovery_timeout(), Duration::from_millis(2500));
        assert_eq!(config.trust(), ClientTrust::AcceptAnyServerCertificate);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str("port = 7000\nauto_shutdown = true").unwrap();
        assert_eq!(config.port, 7000);
        assert!(config.auto_shutdown);
        assert!(config.discovery);
        assert_eq!(config.certfile, PathBuf::from("ghostcat-cert.pem"));

        let client: ClientConfig =
            toml::from_str("server_host = \"10.0.0.2\"\naccept_any_server_cert = false").unwrap();
        assert_eq!(client.server_host.as_deref(), Some("10.0.0.2"));
        assert_eq!(client.trust(), ClientTrust::WebPkiRoots);
        assert_eq!(client.nickname, "anonymous");
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            ServerConfig::from_file("/definitely/not/here.toml"),
            Err(ConfigError::IoError(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            ClientConfig::from_file(path.to_str().unwrap()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_shipped_config_files_parse() {
        let dir = env!("CARGO_MANIFEST_DIR");
        let server = ServerConfig::from_file(&format!("{}/config/server.toml", dir)).unwrap();
        assert_eq!(server.port, 5555);
        let client = ClientConfig::from_file(&format!("{}/config/client.toml", dir)).unwrap();
        assert_eq!(client.server_host, None);
        assert_eq!(client.trust(), ClientTrust::AcceptAnyServerCertificate);
    }
}
