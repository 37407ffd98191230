//! Error taxonomy for the container, command table and plugin orchestrator.
//!
//! Every variant is a programmer or configuration error surfaced to the caller
//! of `create`, `enable` or `invoke`; nothing here is retried.

use thiserror::Error;

use crate::plugin::Hook;

/// Plugin-scoped failure, mapped by the serving layer to a `500` response.
///
/// Also returned when a caller asks for a plugin that was never enabled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn not_enabled(plugin: &str) -> Self {
        Self::new(
            plugin,
            format!(
                "plugin `{plugin}` is not enabled or not installed; enable it via `trellis plugins enable <path>`"
            ),
        )
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("the serving layer must be created before using commands, plugins or routes")]
    ServingHandleNotReady,

    #[error("the container has already been created")]
    AlreadyCreated,

    #[error("command `{0}` not found")]
    CommandNotFound(String),

    #[error("command `{0}` returned nothing; plugin initializers must return a plugin API instance")]
    CommandReturnedNothing(String),

    #[error("command `{name}` failed")]
    Command {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("not a plugin: {0}")]
    NotAPlugin(String),

    #[error("plugin `{0}` requires configuration; configure it with `AppContainer::configure_plugin` or `[plugin_config]`")]
    MissingRequiredConfig(String),

    #[error("plugin `{plugin}` failed in `{hook}` hook")]
    Hook {
        plugin: String,
        hook: Hook,
        #[source]
        source: anyhow::Error,
    },

    #[error("{0}")]
    Plugin(#[from] PluginError),

    #[error("failed loading enabled plugins")]
    EnabledPlugins(#[source] anyhow::Error),

    #[error("module `{module}` failed to register its declarations")]
    Discovery {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, ContainerError>;

impl ContainerError {
    pub(crate) fn hook(plugin: &str, hook: Hook, source: anyhow::Error) -> Self {
        Self::Hook {
            plugin: plugin.to_string(),
            hook,
            source,
        }
    }
}
