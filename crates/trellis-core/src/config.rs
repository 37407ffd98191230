use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use trellis_plugin_sdk::DEFAULT_ENABLED_FILE;

use crate::plugin::PluginConfig;

/// Root configuration structure deserialized from `trellis.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub discovery: Discovery,
    pub plugins: Plugins,
    /// Per-plugin configuration keyed by plugin path.
    pub plugin_config: BTreeMap<String, PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub tls: Option<Tls>,
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".into(),
            tls: None,
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Discovery {
    /// Module root walked during discovery; empty selects every registered module.
    pub root: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self { root: "app".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Plugins {
    pub enabled_file: PathBuf,
    pub search_paths: Vec<PathBuf>,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            enabled_file: PathBuf::from(DEFAULT_ENABLED_FILE),
            search_paths: vec![PathBuf::from("plugins")],
        }
    }
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<Config>(raw).context("invalid trellis configuration")?;
        Ok(cfg)
    }

    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        if self.plugins.enabled_file.as_os_str().is_empty() {
            bail!("plugins.enabled_file must not be empty");
        }
        for name in self.plugin_config.keys() {
            if name.trim().is_empty() {
                bail!("plugin_config entries must be keyed by a plugin path");
            }
        }
        Ok(())
    }

    /// Configuration for `path`, if any was declared.
    pub fn plugin_config_for(&self, path: &str) -> Option<&PluginConfig> {
        self.plugin_config.get(path)
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<()> {
        self.parse_bind_addr()
            .with_context(|| format!("invalid server bind address `{}`", self.bind))?;
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        if self.request_timeout_secs == Some(0) {
            bail!("server.request_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn parse_bind_addr(&self) -> Result<SocketAddr> {
        if self.bind.starts_with(':') {
            let addr = format!("0.0.0.0{}", self.bind);
            Ok(SocketAddr::from_str(&addr)?)
        } else {
            Ok(SocketAddr::from_str(&self.bind)?)
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl Tls {
    pub fn validate(&self) -> Result<()> {
        if self.cert.trim().is_empty() || self.key.trim().is_empty() {
            bail!("tls cert and key paths must be provided");
        }
        Ok(())
    }
}
