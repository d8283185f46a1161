//! Service configuration
//!
//! `AppConfig` is read from a TOML file; every section and field has a
//! default so an empty file is a valid configuration. A few locations can be
//! overridden through the environment (`CERTBOOT_CA`, `CERTBOOT_CRT`,
//! `CERTBOOT_SECURITY_CONFIG`).
//!
//! Credentials live in a separate security file so the main configuration
//! can be shared between nodes:
//!
//! ```toml
//! username = "cbadmin"
//! password = "..."
//! sign_verify_key = """
//! -----BEGIN PUBLIC KEY-----
//! ...
//! -----END PUBLIC KEY-----
//! """
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::info;

use crate::error::{BootError, Result};

pub const CA_DIR_ENV: &str = "CERTBOOT_CA";
pub const CRT_DIR_ENV: &str = "CERTBOOT_CRT";
pub const SECURITY_CONFIG_ENV: &str = "CERTBOOT_SECURITY_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityPaths,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub root_ca_defaults: RootCADefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    7070
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Holds `ca.crt`, `ca.key` and the serial record.
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,
    /// Holds the node's own client credentials and the token store.
    #[serde(default = "default_crt_dir")]
    pub crt_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ca_dir: default_ca_dir(),
            crt_dir: default_crt_dir(),
        }
    }
}

impl StorageConfig {
    pub fn tokens_dir(&self) -> PathBuf {
        self.crt_dir.join("tokens")
    }
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("./ca")
}

fn default_crt_dir() -> PathBuf {
    PathBuf::from("./crt")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityPaths {
    /// Location of the [`SecurityConfig`] file.
    #[serde(default = "default_security_config_path")]
    pub config_path: PathBuf,
    /// Private key used to sign forwarded payloads, if this node forwards
    /// requests to endpoints that require a signed body.
    #[serde(default)]
    pub sign_key_path: Option<PathBuf>,
}

impl Default for SecurityPaths {
    fn default() -> Self {
        Self {
            config_path: default_security_config_path(),
            sign_key_path: None,
        }
    }
}

fn default_security_config_path() -> PathBuf {
    PathBuf::from("/etc/certboot/security-config.toml")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DistributionConfig {
    /// Port the peers' certboot service listens on.
    #[serde(default = "default_server_port")]
    pub peer_port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Tokens older than this are refused; 0 disables expiry.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_token_id_len")]
    pub token_id_len: usize,
    #[serde(default = "default_token_secret_len")]
    pub token_secret_len: usize,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            peer_port: default_server_port(),
            request_timeout_secs: default_request_timeout_secs(),
            token_ttl_secs: default_token_ttl_secs(),
            token_id_len: default_token_id_len(),
            token_secret_len: default_token_secret_len(),
        }
    }
}

impl DistributionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_ttl(&self) -> Option<Duration> {
        (self.token_ttl_secs > 0).then(|| Duration::from_secs(self.token_ttl_secs))
    }
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_token_id_len() -> usize {
    10
}

fn default_token_secret_len() -> usize {
    22
}

#[derive(Debug, Deserialize, Clone)]
pub struct RootCADefaults {
    #[serde(default = "default_root_ca_cn")]
    pub root_ca_common_name: String,
    #[serde(default)]
    pub root_ca_organization: String,
    #[serde(default)]
    pub root_ca_organizational_unit: String,
    #[serde(default)]
    pub root_ca_locality: String,
    #[serde(default)]
    pub root_ca_state: String,
    #[serde(default)]
    pub root_ca_country: String,
    #[serde(default = "default_root_ca_validity")]
    pub root_ca_validity_days: u32,
}

impl Default for RootCADefaults {
    fn default() -> Self {
        Self {
            root_ca_common_name: default_root_ca_cn(),
            root_ca_organization: String::new(),
            root_ca_organizational_unit: String::new(),
            root_ca_locality: String::new(),
            root_ca_state: String::new(),
            root_ca_country: String::new(),
            root_ca_validity_days: default_root_ca_validity(),
        }
    }
}

fn default_root_ca_cn() -> String {
    "certboot Root CA".to_string()
}

fn default_root_ca_validity() -> u32 {
    3650 // 10 years
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path).map_err(|e| {
            BootError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        toml::from_str(config_str)
            .map_err(|e| BootError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment overrides using `get_env` to look variables up.
    pub fn with_env_overrides(mut self, get_env: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ca_dir) = get_env(CA_DIR_ENV).filter(|v| !v.is_empty()) {
            info!("CA directory overridden by {}: {}", CA_DIR_ENV, ca_dir);
            self.storage.ca_dir = PathBuf::from(ca_dir);
        }
        if let Some(crt_dir) = get_env(CRT_DIR_ENV).filter(|v| !v.is_empty()) {
            info!("Certificate directory overridden by {}: {}", CRT_DIR_ENV, crt_dir);
            self.storage.crt_dir = PathBuf::from(crt_dir);
        }
        if let Some(path) = get_env(SECURITY_CONFIG_ENV).filter(|v| !v.is_empty()) {
            self.security.config_path = PathBuf::from(path);
        }
        self
    }
}

/// Credentials every privileged request is checked against.
#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub username: String,
    pub password: SecretString,
    /// PEM encoded public key verifying request body signatures.
    pub sign_verify_key: String,
}

impl SecurityConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            BootError::Config(format!(
                "Failed to read security config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: SecurityConfig = toml::from_str(&raw)
            .map_err(|e| BootError::Config(format!("Failed to parse security config: {}", e)))?;
        if config.username.is_empty() {
            return Err(BootError::Config(
                "security config has an empty username".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 7070);
        assert_eq!(config.storage.ca_dir, PathBuf::from("./ca"));
        assert_eq!(config.storage.tokens_dir(), PathBuf::from("./crt/tokens"));
        assert_eq!(config.distribution.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.root_ca_defaults.root_ca_validity_days, 3650);
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            port = 9000

            [distribution]
            token_ttl_secs = 0

            [root_ca_defaults]
            root_ca_common_name = "Edge CA"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.distribution.token_ttl().is_none());
        assert_eq!(config.root_ca_defaults.root_ca_common_name, "Edge CA");
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::default().with_env_overrides(|key| match key {
            CA_DIR_ENV => Some("/var/lib/certboot/ca".to_string()),
            CRT_DIR_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.storage.ca_dir, PathBuf::from("/var/lib/certboot/ca"));
        assert_eq!(config.storage.crt_dir, PathBuf::from("./crt"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            AppConfig::from_toml("[server\nport = "),
            Err(BootError::Config(_))
        ));
    }

    #[test]
    fn test_security_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.toml");
        std::fs::write(
            &path,
            "username = \"admin\"\npassword = \"s3cret\"\nsign_verify_key = \"pem\"\n",
        )
        .unwrap();

        let security = SecurityConfig::from_file(&path).unwrap();
        assert_eq!(security.username, "admin");
        assert_eq!(security.password.expose_secret(), "s3cret");
        assert!(!format!("{:?}", security).contains("s3cret"));
    }
}
