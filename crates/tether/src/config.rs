//! Runtime configuration.
//!
//! Settings come from an optional TOML file plus `TETHER_*` environment
//! overrides (e.g. `TETHER_BIND_ADDR`, `TETHER_TOKEN_SECRET`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: String,
    /// Root of per-session databases.
    pub data_dir: PathBuf,
    /// Base URL of the directory service.
    pub directory_url: String,
    /// Endpoint of the global event bus.
    pub event_bus_url: String,
    /// Git provider API base.
    pub git_api_base: String,
    /// Secret the OAuth-token cipher key is derived from.
    pub token_secret: String,
    /// Idle timeout applied when a session's start call does not set one.
    pub default_idle_timeout_ms: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4180".to_string(),
            data_dir: default_data_dir(),
            directory_url: "http://localhost:4181".to_string(),
            event_bus_url: "http://localhost:4182/events".to_string(),
            git_api_base: "https://api.github.com".to_string(),
            token_secret: "tether-dev-secret".to_string(),
            default_idle_timeout_ms: 10 * 60 * 1000,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

impl Settings {
    /// Load settings from the given file (if any) and the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else if let Some(default_path) = default_config_path() {
            builder = builder.add_source(
                File::from(default_path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("TETHER").separator("__"));

        let settings = builder
            .build()
            .context("building configuration")?
            .try_deserialize::<Settings>()
            .context("deserializing configuration")?;
        Ok(settings)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.bind_addr, "127.0.0.1:4180");
        assert_eq!(settings.default_idle_timeout_ms, 600_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind_addr = \"0.0.0.0:9000\"\ntoken_secret = \"from-file\""
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.bind_addr, "0.0.0.0:9000");
        assert_eq!(settings.token_secret, "from-file");
        // Untouched keys keep their defaults.
        assert_eq!(settings.git_api_base, "https://api.github.com");
    }
}
