use std::{
    any::{type_name, Any},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use trellis_plugin_sdk::PublishMetadata;

use crate::{
    container::AppContainer,
    error::{ContainerError, PluginError, Result},
    server::HostApp,
};

pub type PluginConfig = Map<String, Value>;
pub type PluginApi = Arc<dyn Any + Send + Sync>;

/// Wraps a value as a plugin API object.
pub fn plugin_api<T: Any + Send + Sync>(value: T) -> PluginApi {
    Arc::new(value)
}

/// Lifecycle hook slots a plugin may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Internal,
    PreEnable,
    Enable,
    PostEnable,
    Ready,
    ReadyAsync,
    Shutdown,
    ShutdownAsync,
}

impl Hook {
    const fn bit(self) -> u16 {
        1 << self as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Internal => "internal",
            Hook::PreEnable => "on_pre_enable",
            Hook::Enable => "on_enable",
            Hook::PostEnable => "on_post_enable",
            Hook::Ready => "on_ready",
            Hook::ReadyAsync => "on_ready_async",
            Hook::Shutdown => "on_shutdown",
            Hook::ShutdownAsync => "on_shutdown_async",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of hooks a plugin declares it provides. Only these are ever invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet(u16);

impl HookSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, hook: Hook) -> Self {
        Self(self.0 | hook.bit())
    }

    pub fn of(hooks: &[Hook]) -> Self {
        hooks.iter().fold(Self::empty(), |set, hook| set.with(*hook))
    }

    pub const fn contains(self, hook: Hook) -> bool {
        self.0 & hook.bit() != 0
    }
}

/// Mutable view handed to setup-time hooks and command handlers.
pub struct SetupContext<'a> {
    pub app: &'a mut HostApp,
    pub plugins: &'a PluginNamespace,
}

/// Capability contract every plugin implements.
///
/// Hook bodies run only when the matching [`Hook`] is present in
/// [`Plugin::hooks`]; the default bodies are never called by the orchestrator.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Slot name in the plugin namespace. An empty name falls back to the
    /// plugin's type name.
    fn public_name(&self) -> &str;

    /// Fully qualified name of the implementing type.
    fn type_name(&self) -> &'static str {
        type_name::<Self>()
    }

    /// Command invoked to build the plugin API.
    fn command_name(&self) -> &str {
        self.public_name()
    }

    fn requires_config(&self) -> bool {
        false
    }

    /// Whether activation yields an API object through the command table.
    fn returns_api(&self) -> bool {
        true
    }

    fn is_publishable(&self) -> bool {
        false
    }

    fn publish_metadata(&self) -> Option<PublishMetadata> {
        None
    }

    fn hooks(&self) -> HookSet {
        HookSet::empty()
    }

    fn internal(
        &self,
        _ctx: &mut SetupContext<'_>,
        _config: &PluginConfig,
    ) -> anyhow::Result<Option<PluginApi>> {
        Ok(None)
    }

    fn on_pre_enable(&self, _ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_enable(&self, _ctx: &mut SetupContext<'_>, _api: Option<&PluginApi>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_post_enable(
        &self,
        _ctx: &mut SetupContext<'_>,
        _api: Option<&PluginApi>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_ready(&self, _app: &AppContainer, _api: Option<&PluginApi>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_ready_async(
        &self,
        _app: &AppContainer,
        _api: Option<&PluginApi>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_shutdown(&self, _app: &AppContainer, _api: Option<&PluginApi>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown_async(
        &self,
        _app: &AppContainer,
        _api: Option<&PluginApi>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Namespace slot of `plugin`: its public name, else the last path segment
/// of its type name (generic arguments stripped).
pub fn resolve_name(plugin: &dyn Plugin) -> String {
    let public = plugin.public_name().trim();
    if !public.is_empty() {
        return public.to_string();
    }
    let full = plugin.type_name();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Rejects instances that cannot be activated.
pub(crate) fn validate_contract(plugin: &dyn Plugin) -> Result<()> {
    if plugin.returns_api() && plugin.command_name().trim().is_empty() {
        return Err(ContainerError::NotAPlugin(format!(
            "plugin `{}` returns an api but declares no command_name",
            resolve_name(plugin)
        )));
    }
    Ok(())
}

/// Per-plugin state recorded at activation. Only activated plugins have one.
#[derive(Clone)]
pub struct PluginRuntimeState {
    name: String,
    plugin: Arc<dyn Plugin>,
    config: PluginConfig,
    api: Option<PluginApi>,
}

impl PluginRuntimeState {
    pub(crate) fn activated(
        name: String,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
        api: Option<PluginApi>,
    ) -> Self {
        Self {
            name,
            plugin,
            config,
            api,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn api(&self) -> Option<&PluginApi> {
        self.api.as_ref()
    }

    pub fn provides(&self, hook: Hook) -> bool {
        self.plugin.hooks().contains(hook)
    }
}

impl fmt::Debug for PluginRuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRuntimeState")
            .field("name", &self.name())
            .field("config", &self.config)
            .field("has_api", &self.api.is_some())
            .finish()
    }
}

/// Activated plugins in activation order; one entry per public name.
#[derive(Default, Debug, Clone)]
pub struct ActivatedPlugins {
    states: Vec<PluginRuntimeState>,
}

impl ActivatedPlugins {
    /// Re-activating a name replaces the entry in place, keeping its position.
    pub(crate) fn record(&mut self, state: PluginRuntimeState) {
        match self.states.iter_mut().find(|s| s.name() == state.name()) {
            Some(slot) => *slot = state,
            None => self.states.push(state),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PluginRuntimeState> {
        self.states.iter().find(|s| s.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginRuntimeState> {
        self.states.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.states.iter().map(PluginRuntimeState::name).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.states.clear();
    }
}

/// Attribute bag with one slot per activated plugin's public name.
///
/// A slot holds `None` for plugins that expose no API.
#[derive(Default, Clone)]
pub struct PluginNamespace {
    slots: HashMap<String, Option<PluginApi>>,
}

impl PluginNamespace {
    pub(crate) fn set(&mut self, name: &str, api: Option<PluginApi>) {
        self.slots.insert(name.to_string(), api);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Raw slot value; fails when the plugin was never enabled.
    pub fn get(&self, name: &str) -> std::result::Result<Option<&PluginApi>, PluginError> {
        self.slots
            .get(name)
            .map(Option::as_ref)
            .ok_or_else(|| PluginError::not_enabled(name))
    }

    /// Typed API of an enabled plugin.
    pub fn api<T: Any + Send + Sync>(&self, name: &str) -> std::result::Result<Arc<T>, PluginError> {
        let api = self
            .get(name)?
            .ok_or_else(|| PluginError::new(name, format!("plugin `{name}` exposes no api")))?;
        Arc::clone(api).downcast::<T>().map_err(|_| {
            PluginError::new(
                name,
                format!("plugin `{name}` api is not a `{}`", type_name::<T>()),
            )
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.slots.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

impl fmt::Debug for PluginNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Maps plugin paths (as written to the enabled-plugins file) to constructors.
#[derive(Default, Clone)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl PluginCatalog {
    /// Path of `P` as used in the enabled-plugins file.
    pub fn path_of<P: ?Sized>() -> &'static str {
        type_name::<P>()
    }

    pub fn register<P: Plugin + Default>(&mut self) -> &'static str {
        let path = Self::path_of::<P>();
        self.register_with(path, || Arc::new(P::default()) as Arc<dyn Plugin>);
        path
    }

    pub fn register_with<F>(&mut self, path: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Arc::new(factory));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    pub fn instantiate(&self, path: &str) -> Result<Arc<dyn Plugin>> {
        let factory = self.factories.get(path).ok_or_else(|| {
            ContainerError::NotAPlugin(format!("no plugin registered under path `{path}`"))
        })?;
        Ok(factory())
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<_> = self.factories.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}
