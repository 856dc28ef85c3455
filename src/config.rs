use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, bail};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;
use crate::cipher::Secret;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_target() -> String {
    "/".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

/// Client settings, usually read from `config.toml`:
///
/// ```toml
/// endpoint = "https://cloud.example.com/api/"
/// token = "..."
/// secret = "c2VjcmV0"   # base64, optional
/// chunk_size = 4096
/// default_target = "uploads/"
/// download_folder = "/home/me/Downloads"
/// ```
#[derive(Deserialize, Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub token: String,
    /// Base64 encoded shared secret for encrypted transfers
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Remote folder for uploads without a target
    #[serde(default = "default_target")]
    pub default_target: String,
    /// Local folder for downloads without a target
    #[serde(default)]
    pub download_folder: Option<PathBuf>,
    /// Seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            secret: None,
            chunk_size: default_chunk_size(),
            default_target: default_target(),
            download_folder: None,
            connect_timeout: default_connect_timeout(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        Self::from_toml_str(&config_str)
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn from_toml_str(config_str: &str) -> anyhow::Result<Self> {
        let config: ClientConfig = toml::from_str(config_str)?;

        if config.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if !config.endpoint.starts_with("http") {
            bail!("endpoint must be an http(s) url: {}", config.endpoint);
        }

        Ok(config)
    }

    pub fn shared_secret(&self) -> anyhow::Result<Secret> {
        match &self.secret {
            Some(encoded) => {
                let bytes = BASE64_STANDARD
                    .decode(encoded.trim())
                    .context("secret is not valid base64")?;
                Ok(Secret::new(bytes))
            }
            None => Ok(Secret::default()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = ClientConfig::from_toml_str(r#"
            endpoint = "http://localhost:8080/api/"
            token = "abc"
        "#).unwrap();

        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.default_target, "/");
        assert_eq!(config.download_folder, None);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.shared_secret().unwrap().is_empty());
    }

    #[test]
    fn test_secret_is_base64() {
        let config = ClientConfig::from_toml_str(r#"
            endpoint = "https://cloud.example.com"
            token = "abc"
            secret = "c2VjcmV0"
            chunk_size = 8192
        "#).unwrap();

        assert_eq!(config.shared_secret().unwrap().as_bytes(), b"secret");
        assert_eq!(config.chunk_size, 8192);

        let broken = ClientConfig { secret: Some("***".to_string()), ..config };
        assert!(broken.shared_secret().is_err());
    }

    #[test]
    fn test_download_folder_is_separate_from_remote_target() {
        let config = ClientConfig::from_toml_str(r#"
            endpoint = "http://localhost"
            token = "t"
            default_target = "uploads/"
            download_folder = "/var/tmp/inbox"
        "#).unwrap();

        assert_eq!(config.default_target, "uploads/");
        assert_eq!(config.download_folder, Some(PathBuf::from("/var/tmp/inbox")));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(ClientConfig::from_toml_str("endpoint = \"ftp://x\"\ntoken = \"t\"").is_err());
        assert!(ClientConfig::from_toml_str("endpoint = \"http://x\"\ntoken = \"t\"\nchunk_size = 0").is_err());
        assert!(ClientConfig::from_toml_str("token = \"t\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "endpoint = \"http://localhost\"\ntoken = \"t\"\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.token, "t");
        assert!(ClientConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
