use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location of the enabled-plugins list, relative to the project root.
pub const DEFAULT_ENABLED_FILE: &str = ".trellis/enabled_plugins.toml";

#[derive(Debug, Deserialize, Default)]
struct EnabledFile {
    #[serde(rename = "ENABLED_PLUGINS", default)]
    enabled: Vec<String>,
}

/// Persisted list of plugin import paths enabled for a project.
///
/// The file is a single TOML array written one entry per line:
///
/// ```text
/// ENABLED_PLUGINS = [
///     "my_app::plugins::EventBus",
/// ]
/// ```
#[derive(Debug, Clone)]
pub struct EnabledPlugins {
    file: PathBuf,
    entries: Vec<String>,
}

impl EnabledPlugins {
    /// Reads the list; a missing file yields an empty list.
    pub fn load(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        if !file.exists() {
            return Ok(Self {
                file,
                entries: Vec::new(),
            });
        }
        let raw = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let parsed: EnabledFile = toml::from_str(&raw)
            .with_context(|| format!("failed loading enabled plugins from {}", file.display()))?;
        Ok(Self {
            file,
            entries: parsed.enabled,
        })
    }

    /// Like [`EnabledPlugins::load`], but treats an unreadable file as empty.
    pub fn load_lenient(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        match Self::load(file.clone()) {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed enabled plugins file");
                Self {
                    file,
                    entries: Vec::new(),
                }
            }
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry == path)
    }

    /// Adds `path` if absent; returns whether the list changed.
    pub fn insert(&mut self, path: &str) -> bool {
        if self.contains(path) {
            return false;
        }
        self.entries.push(path.to_string());
        true
    }

    /// Writes the list back, sorted, creating the parent directory when needed.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        fs::write(&self.file, render(&self.entries))
            .with_context(|| format!("failed to write {}", self.file.display()))
    }
}

fn render(entries: &[String]) -> String {
    let mut sorted = entries.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut out = String::from("ENABLED_PLUGINS = [\n");
    for item in sorted {
        out.push_str(&format!("    {},\n", toml::Value::String(item)));
    }
    out.push_str("]\n");
    out
}
