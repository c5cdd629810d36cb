use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{ConfigError, Result};

pub const API_SERVER_ENV: &str = "PAGES_API_SERVER";
pub const API_TOKEN_ENV: &str = "PAGES_API_TOKEN";

/// Global settings from ~/.pages/config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub dev: DevConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Remote package/session API connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Dev session ports and timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevConfig {
    /// HTTPS listener for page projects
    pub proxy_port: u16,
    /// Local request-handler server for function projects
    pub function_port: u16,
    /// Port the compiler's dev server listens on for page projects
    pub dev_server_port: u16,
    pub heartbeat_secs: u64,
    pub grace_delay_ms: u64,
    pub probe: bool,
    pub probe_attempts: u32,
    pub probe_interval_ms: u64,
    pub function_timeout_secs: u64,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            proxy_port: 8443,
            function_port: 4000,
            dev_server_port: 3000,
            heartbeat_secs: 50,
            grace_delay_ms: 3000,
            probe: true,
            probe_attempts: 15,
            probe_interval_ms: 1000,
            function_timeout_secs: 60,
        }
    }
}

impl DevConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn function_timeout(&self) -> Duration {
        Duration::from_secs(self.function_timeout_secs)
    }
}

/// Where to find the tunnel binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Explicit binary, bypassing the bundled per-platform table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,

    /// Override of the bundled assets directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<PathBuf>,
}

impl GlobalConfig {
    /// Get the default path for global config (~/.pages/config.toml).
    pub fn default_path() -> Result<PathBuf> {
        let home = crate::paths::pages_home_dir().map_err(|e| {
            ConfigError::Validation(format!("Could not determine pages home directory: {}", e))
        })?;
        Ok(home.join("config.toml"))
    }

    /// Load from the default location, then apply environment overrides.
    ///
    /// A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(content)?)
    }

    /// Apply `PAGES_API_SERVER` / `PAGES_API_TOKEN`; blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(server) = non_blank(API_SERVER_ENV) {
            self.api.server = Some(server);
        }
        if let Some(token) = non_blank(API_TOKEN_ENV) {
            self.api.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let dev = &self.dev;
        for (name, port) in [
            ("dev.proxy_port", dev.proxy_port),
            ("dev.function_port", dev.function_port),
            ("dev.dev_server_port", dev.dev_server_port),
        ] {
            if port == 0 {
                return Err(ConfigError::Validation(format!("{name} must not be 0")));
            }
        }
        if dev.heartbeat_secs == 0 {
            return Err(ConfigError::Validation(
                "dev.heartbeat_secs must be at least 1".to_string(),
            ));
        }
        if dev.probe_attempts == 0 {
            return Err(ConfigError::Validation(
                "dev.probe_attempts must be at least 1".to_string(),
            ));
        }
        if dev.function_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "dev.function_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(server) = &self.api.server
            && !(server.starts_with("https://") || server.starts_with("http://"))
        {
            return Err(ConfigError::Validation(format!(
                "api.server must be an http(s) URL, got '{server}'"
            )));
        }
        Ok(())
    }
}
