//! Configuration Manager

use super::Config;
use crate::listener::parse_bind_target;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

/// Environment variables recognised by `load` and `load_from_env`
pub const ENV_BIND_ADDRESS: &str = "SOCKWATCH_BIND_ADDRESS";
pub const ENV_PORT: &str = "SOCKWATCH_PORT";
pub const ENV_POLL_INTERVAL: &str = "SOCKWATCH_POLL_INTERVAL";
pub const ENV_READ_BUFFER_SIZE: &str = "SOCKWATCH_READ_BUFFER_SIZE";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "SOCKWATCH_SHUTDOWN_TIMEOUT";
pub const ENV_LOG_LEVEL: &str = "SOCKWATCH_LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then environment variables, then the file at `path`
    /// if it exists. Keys the file sets win over the environment; keys it
    /// leaves out keep their environment or default value.
    pub fn load(path: &Path) -> Result<Config> {
        Self::load_layered(path, |key| std::env::var(key).ok())
    }

    /// `load` with an injectable environment lookup
    pub fn load_layered<F>(path: &Path, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        Self::apply_env(&mut config, lookup)?;

        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let overrides: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            let mut merged = match toml::Value::try_from(&config)
                .context("Failed to encode configuration for merging")?
            {
                toml::Value::Table(table) => table,
                other => bail!("Configuration encoded as {}, expected a table", other.type_str()),
            };
            merge_tables(&mut merged, overrides);
            config = toml::Value::Table(merged)
                .try_into()
                .with_context(|| format!("Invalid settings in config file: {}", path.display()))?;
        }

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;
        Ok(config)
    }

    /// Override `config` with whatever `lookup` returns for each variable
    pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_address) = lookup(ENV_BIND_ADDRESS) {
            config.server.bind_address = bind_address;
        }

        if let Some(port) = lookup(ENV_PORT) {
            config.server.port = port
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid {} (expected 0-65535): {}", ENV_PORT, port))?;
        }

        if let Some(interval) = lookup(ENV_POLL_INTERVAL) {
            config.server.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid {}: {}", ENV_POLL_INTERVAL, interval))?;
        }

        if let Some(size) = lookup(ENV_READ_BUFFER_SIZE) {
            config.server.read_buffer_size = size
                .parse::<usize>()
                .with_context(|| format!("Invalid {}: {}", ENV_READ_BUFFER_SIZE, size))?;
        }

        if let Some(timeout) = lookup(ENV_SHUTDOWN_TIMEOUT) {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}: {}", ENV_SHUTDOWN_TIMEOUT, timeout))?;
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }

        Ok(())
    }
}

/// Recursively overlay `overrides` onto `base`
fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        parse_bind_target(&self.server.bind_address, self.server.port)?;

        if self.server.poll_interval < Duration::from_millis(10) {
            bail!("poll_interval must be at least 10ms");
        }

        if self.server.poll_interval > Duration::from_secs(60) {
            bail!("poll_interval cannot exceed 60s");
        }

        if self.server.read_buffer_size < 64 {
            bail!("read_buffer_size must be at least 64 bytes");
        }

        if self.server.read_buffer_size > 1048576 {
            bail!("read_buffer_size cannot exceed 1MB");
        }

        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        log_level: Option<&str>,
    ) {
        if let Some(bind) = bind {
            self.server.bind_address = bind.to_string();
        }

        if let Some(port) = port {
            self.server.port = port;
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_address = "::1"
port = 7000
poll_interval = "250ms"

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_address, "::1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.poll_interval, Duration::from_millis(250));
        assert_eq!(config.server.read_buffer_size, 4096);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8910);
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_address = \"not-an-ip\"").unwrap();
        assert!(ConfigManager::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BIND_ADDRESS, "0.0.0.0"),
            (ENV_PORT, "9001"),
            (ENV_POLL_INTERVAL, "500ms"),
            (ENV_LOG_LEVEL, "warn"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        ConfigManager::apply_env(&mut config, |key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.poll_interval, Duration::from_millis(500));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_layered_file_over_env_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 7100\n\n[logging]\nformat = \"json\"").unwrap();

        let vars: HashMap<&str, &str> = [
            (ENV_PORT, "9001"),
            (ENV_POLL_INTERVAL, "300ms"),
            (ENV_LOG_LEVEL, "debug"),
        ]
        .into_iter()
        .collect();
        let config =
            ConfigManager::load_layered(file.path(), |key| vars.get(key).map(|v| v.to_string()))
                .unwrap();

        // File wins where it sets a key
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.logging.format, LogFormat::Json);
        // Environment fills what the file leaves out
        assert_eq!(config.server.poll_interval, Duration::from_millis(300));
        assert_eq!(config.logging.level, "debug");
        // Defaults fill the rest
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.read_buffer_size, 4096);
    }

    #[test]
    fn test_layered_without_file_uses_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_layered(&dir.path().join("absent.toml"), |key| {
            (key == ENV_BIND_ADDRESS).then(|| "::1".to_string())
        })
        .unwrap();
        assert_eq!(config.server.bind_address, "::1");
        assert_eq!(config.server.port, 8910);
    }

    #[test]
    fn test_layered_rejects_bad_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 70000").unwrap();
        assert!(ConfigManager::load_layered(file.path(), |_| None).is_err());
    }

    #[test]
    fn test_env_port_out_of_range() {
        let mut config = Config::default();
        let result = ConfigManager::apply_env(&mut config, |key| {
            (key == ENV_PORT).then(|| "70000".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_bounds() {
        let mut config = Config::default();
        config.server.poll_interval = Duration::from_millis(1);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.read_buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_merge() {
        let mut config = Config::default();
        config.merge_with_cli_args(Some("::"), Some(0), None);
        assert_eq!(config.server.bind_address, "::");
        assert_eq!(config.server.port, 0);
        assert!(config.validate().is_ok());
    }
}
