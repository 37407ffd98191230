use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use http::StatusCode;
use trellis_plugin_sdk::EnabledPlugins;

use crate::{
    command::CommandTable,
    config::Config,
    discovery::ModuleCatalog,
    error::{ContainerError, PluginError, Result},
    lifecycle::{PluginLifespan, PluginOrchestrator},
    plugin::{
        resolve_name, ActivatedPlugins, Plugin, PluginApi, PluginCatalog, PluginConfig,
        PluginNamespace, PluginRuntimeState, SetupContext,
    },
    registry::MetadataRegistry,
    router::RouteBinder,
    server::{text_response, HostApp, Server},
};

/// A plugin instance and its configuration, supplied before `create`.
#[derive(Clone)]
struct ConfiguredPlugin {
    plugin: Arc<dyn Plugin>,
    config: PluginConfig,
}

/// Owns the serving handle, the declaration registry, the command table and
/// every activated plugin of one application.
///
/// All mutation happens during setup (`&mut self`); once serving starts the
/// container is shared read-only behind an `Arc`.
pub struct AppContainer {
    pub(crate) config: Config,
    pub(crate) registry: MetadataRegistry,
    pub(crate) modules: ModuleCatalog,
    pub(crate) commands: CommandTable,
    pub(crate) catalog: PluginCatalog,
    configured: HashMap<String, ConfiguredPlugin>,
    pub(crate) namespace: PluginNamespace,
    pub(crate) activated: ActivatedPlugins,
    pub(crate) serving: Option<HostApp>,
    ready: bool,
}

impl Default for AppContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContainer {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            registry: MetadataRegistry::default(),
            modules: ModuleCatalog::default(),
            commands: CommandTable::default(),
            catalog: PluginCatalog::default(),
            configured: HashMap::new(),
            namespace: PluginNamespace::default(),
            activated: ActivatedPlugins::default(),
            serving: None,
            ready: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut MetadataRegistry {
        &mut self.registry
    }

    pub fn modules_mut(&mut self) -> &mut ModuleCatalog {
        &mut self.modules
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn register_command<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut SetupContext<'_>, &PluginConfig) -> anyhow::Result<Option<PluginApi>>
            + Send
            + Sync
            + 'static,
    {
        self.commands.register(name, handler);
    }

    pub fn catalog_mut(&mut self) -> &mut PluginCatalog {
        &mut self.catalog
    }

    /// Supplies the instance and configuration used when `P` is enabled,
    /// keyed by `P`'s path.
    pub fn configure_plugin<P: Plugin>(&mut self, plugin: P, config: PluginConfig) {
        self.configure_plugin_at(PluginCatalog::path_of::<P>(), Arc::new(plugin), config);
    }

    pub fn configure_plugin_at(
        &mut self,
        path: impl Into<String>,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
    ) {
        let path = path.into();
        tracing::debug!(plugin = %resolve_name(plugin.as_ref()), path = %path, "plugin configured");
        self.configured
            .insert(path, ConfiguredPlugin { plugin, config });
    }

    /// Configuration for the plugin at `path`: an explicit `configure_plugin`
    /// wins over `[plugin_config]` from the config file.
    pub fn plugin_config(&self, path: &str) -> PluginConfig {
        self.configured
            .get(path)
            .map(|entry| entry.config.clone())
            .filter(|config| !config.is_empty())
            .or_else(|| self.config.plugin_config_for(path).cloned())
            .unwrap_or_default()
    }

    /// Binds the serving layer, discovers and binds routes, then activates
    /// every plugin listed in the enabled-plugins file.
    pub fn create(&mut self, mut app: HostApp) -> Result<()> {
        if self.ready {
            return Err(ContainerError::AlreadyCreated);
        }

        let user_lifespan = app.take_lifespan();
        app.set_lifespan(Arc::new(PluginLifespan::wrap(user_lifespan)));
        app.exception_handler::<PluginError, _>(|err| {
            tracing::error!(plugin = %err.plugin, error = %err, "plugin error");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Plugin error: {err}"),
            )
        });

        // The handle is published only once discovery and binding succeeded.
        let root = self.config.discovery.root.clone();
        self.modules.discover(&root, &mut self.registry)?;
        RouteBinder::bind(self.registry.resolve_routes(), &mut app);
        self.serving = Some(app);
        self.ready = true;

        self.activate_enabled()?;
        tracing::info!(
            routes = self.serving().map_or(0, |app| app.router().len()),
            plugins = self.activated.len(),
            "application container created"
        );
        Ok(())
    }

    fn activate_enabled(&mut self) -> Result<()> {
        let enabled = EnabledPlugins::load(&self.config.plugins.enabled_file)
            .map_err(ContainerError::EnabledPlugins)?;
        for path in enabled.entries() {
            let plugin = match self.configured.get(path) {
                Some(entry) => Arc::clone(&entry.plugin),
                None => self.catalog.instantiate(path)?,
            };
            let config = self.plugin_config(path);
            tracing::debug!(path = %path, "enabling plugin from enabled list");
            PluginOrchestrator::activate(self, plugin, config)?;
        }
        Ok(())
    }

    /// Activates `plugin` with the configuration recorded for its path.
    pub fn enable<P: Plugin>(&mut self, plugin: P) -> Result<Option<PluginApi>> {
        let config = self.plugin_config(PluginCatalog::path_of::<P>());
        self.enable_shared(Arc::new(plugin), config)
    }

    pub fn enable_shared(
        &mut self,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> Result<Option<PluginApi>> {
        PluginOrchestrator::activate(self, plugin, config)
    }

    /// Runs command `name` against the serving layer.
    pub fn invoke(&mut self, name: &str, config: &PluginConfig) -> Result<PluginApi> {
        self.commands
            .invoke(name, self.serving.as_mut(), &self.namespace, config)
    }

    pub fn ensure_enabled(&self, name: &str) -> std::result::Result<(), PluginError> {
        if self.activated.contains(name) {
            Ok(())
        } else {
            Err(PluginError::not_enabled(name))
        }
    }

    pub fn namespace(&self) -> &PluginNamespace {
        &self.namespace
    }

    pub fn activated(&self) -> &ActivatedPlugins {
        &self.activated
    }

    pub fn state(&self, name: &str) -> Option<&PluginRuntimeState> {
        self.activated.get(name)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn serving(&self) -> Option<&HostApp> {
        self.serving.as_ref()
    }

    pub fn serving_mut(&mut self) -> Option<&mut HostApp> {
        self.serving.as_mut()
    }

    /// Drops every declaration, command, plugin and the serving handle.
    /// The loaded configuration is kept.
    pub fn reset(&mut self) {
        self.registry.clear();
        self.modules.clear();
        self.commands.clear();
        self.catalog = PluginCatalog::default();
        self.configured.clear();
        self.namespace.clear();
        self.activated.clear();
        self.serving = None;
        self.ready = false;
    }

    /// Serves until `shutdown` resolves, running plugin ready and shutdown
    /// hooks around the serving period.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        Server::new(Arc::new(self))?.run_until(shutdown).await
    }
}

impl fmt::Debug for AppContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContainer")
            .field("ready", &self.ready)
            .field("serving", &self.serving)
            .field("commands", &self.commands)
            .field("plugins", &self.activated.names())
            .finish()
    }
}
