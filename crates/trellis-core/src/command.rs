use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    error::{ContainerError, Result},
    plugin::{Plugin, PluginApi, PluginConfig, PluginNamespace, SetupContext},
    server::HostApp,
};

pub type CommandHandler = Arc<
    dyn Fn(&mut SetupContext<'_>, &PluginConfig) -> anyhow::Result<Option<PluginApi>> + Send + Sync,
>;

/// Named command handlers used to build plugin APIs.
///
/// Registration happens during single-threaded setup and is not synchronized;
/// registering an existing name replaces the previous handler.
#[derive(Default, Clone)]
pub struct CommandTable {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandTable {
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut SetupContext<'_>, &PluginConfig) -> anyhow::Result<Option<PluginApi>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(command = %name, "command handler replaced");
        }
    }

    /// Registers `plugin.command_name()` to run the plugin's own initializer.
    pub fn register_internal(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.command_name().to_string();
        self.register(name, move |ctx, config| plugin.internal(ctx, config));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Runs `name` against the serving layer.
    ///
    /// The serving handle is checked before the lookup, and a handler that
    /// produces no API is an error.
    pub fn invoke(
        &self,
        name: &str,
        app: Option<&mut HostApp>,
        plugins: &PluginNamespace,
        config: &PluginConfig,
    ) -> Result<PluginApi> {
        let app = app.ok_or(ContainerError::ServingHandleNotReady)?;
        let mut ctx = SetupContext { app, plugins };
        self.dispatch(name, &mut ctx, config)
    }

    pub(crate) fn dispatch(
        &self,
        name: &str,
        ctx: &mut SetupContext<'_>,
        config: &PluginConfig,
    ) -> Result<PluginApi> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| ContainerError::CommandNotFound(name.to_string()))?;
        tracing::debug!(command = %name, "invoking command");
        match handler(ctx, config) {
            Ok(Some(api)) => Ok(api),
            Ok(None) => Err(ContainerError::CommandReturnedNothing(name.to_string())),
            Err(source) => Err(ContainerError::Command {
                name: name.to_string(),
                source,
            }),
        }
    }
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("CommandTable")
            .field("commands", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServerSettings, plugin::plugin_api};

    fn table() -> CommandTable {
        let mut table = CommandTable::default();
        table.register("answer", |_ctx, _config| Ok(Some(plugin_api(42_u8))));
        table.register("nothing", |_ctx, _config| Ok(None));
        table.register("broken", |_ctx, _config| Err(anyhow::anyhow!("kaput")));
        table
    }

    #[test]
    fn serving_handle_is_checked_before_lookup() {
        let err = table()
            .invoke("missing", None, &PluginNamespace::default(), &PluginConfig::new())
            .unwrap_err();
        assert!(matches!(err, ContainerError::ServingHandleNotReady));
    }

    #[test]
    fn invoke_outcomes() {
        let table = table();
        let ns = PluginNamespace::default();
        let cfg = PluginConfig::new();
        let mut app = HostApp::new(ServerSettings::default());

        let api = table.invoke("answer", Some(&mut app), &ns, &cfg).unwrap();
        assert_eq!(api.downcast_ref::<u8>(), Some(&42));

        assert!(matches!(
            table.invoke("missing", Some(&mut app), &ns, &cfg),
            Err(ContainerError::CommandNotFound(name)) if name == "missing"
        ));
        assert!(matches!(
            table.invoke("nothing", Some(&mut app), &ns, &cfg),
            Err(ContainerError::CommandReturnedNothing(_))
        ));
        assert!(matches!(
            table.invoke("broken", Some(&mut app), &ns, &cfg),
            Err(ContainerError::Command { .. })
        ));
    }

    #[test]
    fn last_registration_wins() {
        let mut table = table();
        table.register("answer", |_ctx, _config| Ok(Some(plugin_api("replaced"))));
        let mut app = HostApp::new(ServerSettings::default());
        let api = table
            .invoke("answer", Some(&mut app), &PluginNamespace::default(), &PluginConfig::new())
            .unwrap();
        assert_eq!(api.downcast_ref::<&str>(), Some(&"replaced"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn handlers_receive_config_and_serving_layer() {
        let mut table = CommandTable::default();
        table.register("echo", |ctx, config| {
            ctx.app.route(
                http::Method::GET,
                "/echo",
                crate::router::handler_fn(|_req| async {
                    Ok(crate::server::text_response(http::StatusCode::OK, "echo"))
                }),
                vec![],
            );
            Ok(config.get("value").cloned().map(plugin_api))
        });
        let mut app = HostApp::new(ServerSettings::default());
        let mut cfg = PluginConfig::new();
        cfg.insert("value".into(), serde_json::json!("hi"));

        let api = table
            .invoke("echo", Some(&mut app), &PluginNamespace::default(), &cfg)
            .unwrap();
        assert_eq!(api.downcast_ref::<serde_json::Value>(), Some(&serde_json::json!("hi")));
        assert_eq!(app.router().len(), 1);
    }
}
