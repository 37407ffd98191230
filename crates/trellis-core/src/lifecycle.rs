//! Plugin activation and the startup/shutdown sweeps.
//!
//! Activation walks one plugin through
//! `Configured → PreEnabled → Internal → Enabled → Registered → PostEnabled`.
//! The first failing step aborts activation; nothing is rolled back, and a
//! plugin that fails before `Registered` never appears in the namespace.
//!
//! The sweeps run inside the serving layer's lifespan, one plugin at a time
//! in activation order. Shutdown uses the same order as startup.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;

use crate::{
    container::AppContainer,
    error::{ContainerError, Result},
    plugin::{
        resolve_name, validate_contract, Hook, Plugin, PluginApi, PluginConfig, PluginRuntimeState,
        SetupContext,
    },
};

/// Caller-supplied lifespan, bracketing the serving period.
#[async_trait]
pub trait Lifespan: Send + Sync {
    async fn startup(&self, _app: &AppContainer) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _app: &AppContainer) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct PluginOrchestrator;

impl PluginOrchestrator {
    /// Activates `plugin` with `config` and returns its API, if it has one.
    pub fn activate(
        container: &mut AppContainer,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> Result<Option<PluginApi>> {
        validate_contract(plugin.as_ref())?;
        let name = resolve_name(plugin.as_ref());
        let hooks = plugin.hooks();

        let app = container
            .serving
            .as_mut()
            .ok_or(ContainerError::ServingHandleNotReady)?;
        if plugin.requires_config() && config.is_empty() {
            return Err(ContainerError::MissingRequiredConfig(name));
        }

        let _span = tracing::info_span!("activate", plugin = %name).entered();
        let mut ctx = SetupContext {
            app,
            plugins: &container.namespace,
        };

        if hooks.contains(Hook::PreEnable) {
            plugin
                .on_pre_enable(&mut ctx)
                .map_err(|source| ContainerError::hook(&name, Hook::PreEnable, source))?;
        }

        let api = if plugin.returns_api() {
            Some(container.commands.dispatch(plugin.command_name(), &mut ctx, &config)?)
        } else {
            if hooks.contains(Hook::Internal) {
                if let Err(err) = plugin.internal(&mut ctx, &config) {
                    tracing::warn!(
                        plugin = %name,
                        error = %err,
                        "internal initializer failed; ignored for plugin without api"
                    );
                }
            }
            None
        };

        if hooks.contains(Hook::Enable) {
            plugin
                .on_enable(&mut ctx, api.as_ref())
                .map_err(|source| ContainerError::hook(&name, Hook::Enable, source))?;
        }

        container.namespace.set(&name, api.clone());
        container.activated.record(PluginRuntimeState::activated(
            name.clone(),
            Arc::clone(&plugin),
            config,
            api.clone(),
        ));

        if hooks.contains(Hook::PostEnable) {
            let app = container
                .serving
                .as_mut()
                .ok_or(ContainerError::ServingHandleNotReady)?;
            let mut ctx = SetupContext {
                app,
                plugins: &container.namespace,
            };
            plugin
                .on_post_enable(&mut ctx, api.as_ref())
                .map_err(|source| ContainerError::hook(&name, Hook::PostEnable, source))?;
        }

        metrics::counter!("trellis_plugin_activations_total").increment(1);
        tracing::info!(plugin = %name, has_api = api.is_some(), "plugin enabled");
        Ok(api)
    }

    /// Runs ready hooks: for each plugin, the async hook then the sync hook.
    pub async fn startup(container: &AppContainer) -> Result<()> {
        for state in container.activated().iter() {
            let plugin = state.plugin();
            let name = state.name();
            if state.provides(Hook::ReadyAsync) {
                plugin
                    .on_ready_async(container, state.api())
                    .await
                    .map_err(|source| ContainerError::hook(name, Hook::ReadyAsync, source))?;
            }
            if state.provides(Hook::Ready) {
                plugin
                    .on_ready(container, state.api())
                    .map_err(|source| ContainerError::hook(name, Hook::Ready, source))?;
            }
        }
        tracing::info!(plugins = container.activated().len(), "application completed initialization");
        Ok(())
    }

    /// Runs shutdown hooks in activation order (not reversed).
    pub async fn shutdown(container: &AppContainer) -> Result<()> {
        for state in container.activated().iter() {
            let plugin = state.plugin();
            let name = state.name();
            if state.provides(Hook::ShutdownAsync) {
                tracing::info!(plugin = %name, hook = %Hook::ShutdownAsync, "shutting down plugin");
                plugin
                    .on_shutdown_async(container, state.api())
                    .await
                    .map_err(|source| ContainerError::hook(name, Hook::ShutdownAsync, source))?;
                tracing::info!(plugin = %name, hook = %Hook::ShutdownAsync, "plugin shutdown complete");
            }
            if state.provides(Hook::Shutdown) {
                tracing::info!(plugin = %name, hook = %Hook::Shutdown, "shutting down plugin");
                plugin
                    .on_shutdown(container, state.api())
                    .map_err(|source| ContainerError::hook(name, Hook::Shutdown, source))?;
                tracing::info!(plugin = %name, hook = %Hook::Shutdown, "plugin shutdown complete");
            }
        }
        Ok(())
    }
}

/// Runs the container's installed lifespan around a serving period.
pub struct LifespanDriver;

impl LifespanDriver {
    /// `startup`, then `body`, then `shutdown`. An error at any step skips
    /// the remaining ones.
    pub async fn run<F, T>(container: &AppContainer, body: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let lifespan = container
            .serving()
            .ok_or(ContainerError::ServingHandleNotReady)?
            .lifespan()
            .cloned();

        if let Some(lifespan) = &lifespan {
            lifespan.startup(container).await?;
        }
        tracing::debug!("lifespan startup complete; entering serving period");
        let output = body.await?;
        if let Some(lifespan) = &lifespan {
            lifespan.shutdown(container).await?;
        }
        Ok(output)
    }
}

/// Lifespan installed by `AppContainer::create`: plugin ready hooks run before
/// the caller's startup, plugin shutdown hooks after the caller's shutdown.
pub(crate) struct PluginLifespan {
    inner: Option<Arc<dyn Lifespan>>,
}

impl PluginLifespan {
    pub(crate) fn wrap(inner: Option<Arc<dyn Lifespan>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Lifespan for PluginLifespan {
    async fn startup(&self, app: &AppContainer) -> anyhow::Result<()> {
        PluginOrchestrator::startup(app).await?;
        if let Some(inner) = &self.inner {
            inner.startup(app).await?;
        }
        Ok(())
    }

    async fn shutdown(&self, app: &AppContainer) -> anyhow::Result<()> {
        if let Some(inner) = &self.inner {
            inner.shutdown(app).await?;
        }
        PluginOrchestrator::shutdown(app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        config::ServerSettings,
        plugin::{plugin_api, HookSet},
        server::HostApp,
    };

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Records every hook it is asked to run.
    struct Tracer {
        name: &'static str,
        hooks: HookSet,
        journal: Journal,
    }

    impl Tracer {
        fn new(name: &'static str, hooks: &[Hook], journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                name,
                hooks: HookSet::of(hooks),
                journal: Arc::clone(journal),
            })
        }

        fn log(&self, hook: Hook) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, hook));
        }
    }

    #[async_trait]
    impl Plugin for Tracer {
        fn public_name(&self) -> &str {
            self.name
        }

        fn returns_api(&self) -> bool {
            false
        }

        fn hooks(&self) -> HookSet {
            self.hooks
        }

        fn on_pre_enable(&self, _ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
            self.log(Hook::PreEnable);
            Ok(())
        }

        fn internal(
            &self,
            _ctx: &mut SetupContext<'_>,
            _config: &PluginConfig,
        ) -> anyhow::Result<Option<PluginApi>> {
            self.log(Hook::Internal);
            Ok(Some(plugin_api("ignored")))
        }

        fn on_enable(&self, _ctx: &mut SetupContext<'_>, api: Option<&PluginApi>) -> anyhow::Result<()> {
            assert!(api.is_none());
            self.log(Hook::Enable);
            Ok(())
        }

        fn on_post_enable(
            &self,
            ctx: &mut SetupContext<'_>,
            _api: Option<&PluginApi>,
        ) -> anyhow::Result<()> {
            assert!(ctx.plugins.contains(self.name));
            self.log(Hook::PostEnable);
            Ok(())
        }

        fn on_ready(&self, _app: &AppContainer, _api: Option<&PluginApi>) -> anyhow::Result<()> {
            self.log(Hook::Ready);
            Ok(())
        }

        async fn on_ready_async(
            &self,
            _app: &AppContainer,
            _api: Option<&PluginApi>,
        ) -> anyhow::Result<()> {
            self.log(Hook::ReadyAsync);
            Ok(())
        }

        fn on_shutdown(&self, _app: &AppContainer, _api: Option<&PluginApi>) -> anyhow::Result<()> {
            self.log(Hook::Shutdown);
            Ok(())
        }

        async fn on_shutdown_async(
            &self,
            _app: &AppContainer,
            _api: Option<&PluginApi>,
        ) -> anyhow::Result<()> {
            self.log(Hook::ShutdownAsync);
            Ok(())
        }
    }

    fn ready_container() -> AppContainer {
        let mut container = AppContainer::new();
        container
            .create(HostApp::new(ServerSettings::default()))
            .unwrap();
        container
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[test]
    fn activation_runs_only_declared_hooks_in_order() {
        let journal = Journal::default();
        let mut container = ready_container();
        let tracer = Tracer::new(
            "tracer",
            &[Hook::PreEnable, Hook::Internal, Hook::Enable, Hook::PostEnable],
            &journal,
        );

        let api = PluginOrchestrator::activate(&mut container, tracer, PluginConfig::new()).unwrap();

        assert!(api.is_none());
        assert_eq!(
            entries(&journal),
            vec![
                "tracer:on_pre_enable",
                "tracer:internal",
                "tracer:on_enable",
                "tracer:on_post_enable"
            ]
        );

        let silent = Journal::default();
        let bare = Tracer::new("bare", &[], &silent);
        PluginOrchestrator::activate(&mut container, bare, PluginConfig::new()).unwrap();
        assert!(entries(&silent).is_empty());
        assert_eq!(container.activated().names(), vec!["tracer", "bare"]);
    }

    #[test]
    fn activation_requires_a_created_container() {
        let journal = Journal::default();
        let mut container = AppContainer::new();
        let err = PluginOrchestrator::activate(
            &mut container,
            Tracer::new("early", &[Hook::PreEnable], &journal),
            PluginConfig::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ContainerError::ServingHandleNotReady));
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn sweeps_run_in_activation_order_for_startup_and_shutdown() {
        let journal = Journal::default();
        let all = [
            Hook::Ready,
            Hook::ReadyAsync,
            Hook::Shutdown,
            Hook::ShutdownAsync,
        ];
        let mut container = ready_container();
        for name in ["A", "B"] {
            PluginOrchestrator::activate(
                &mut container,
                Tracer::new(name, &all, &journal),
                PluginConfig::new(),
            )
            .unwrap();
        }

        PluginOrchestrator::startup(&container).await.unwrap();
        PluginOrchestrator::shutdown(&container).await.unwrap();

        // Shutdown deliberately mirrors startup order rather than reversing it.
        assert_eq!(
            entries(&journal),
            vec![
                "A:on_ready_async",
                "A:on_ready",
                "B:on_ready_async",
                "B:on_ready",
                "A:on_shutdown_async",
                "A:on_shutdown",
                "B:on_shutdown_async",
                "B:on_shutdown",
            ]
        );
    }

    struct Recording(Journal);

    #[async_trait]
    impl Lifespan for Recording {
        async fn startup(&self, _app: &AppContainer) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("user:startup".into());
            Ok(())
        }

        async fn shutdown(&self, _app: &AppContainer) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("user:shutdown".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn combined_lifespan_brackets_the_caller_lifespan() {
        let journal = Journal::default();
        let mut container = AppContainer::new();
        container
            .create(
                HostApp::new(ServerSettings::default())
                    .with_lifespan(Arc::new(Recording(Arc::clone(&journal)))),
            )
            .unwrap();
        PluginOrchestrator::activate(
            &mut container,
            Tracer::new("P", &[Hook::Ready, Hook::Shutdown], &journal),
            PluginConfig::new(),
        )
        .unwrap();

        let body_journal = Arc::clone(&journal);
        let served = LifespanDriver::run(&container, async move {
            body_journal.lock().unwrap().push("serving".into());
            Ok(17)
        })
        .await
        .unwrap();

        assert_eq!(served, 17);
        assert_eq!(
            entries(&journal),
            vec![
                "P:on_ready",
                "user:startup",
                "serving",
                "user:shutdown",
                "P:on_shutdown"
            ]
        );
    }

    struct FailingReady;

    #[async_trait]
    impl Plugin for FailingReady {
        fn public_name(&self) -> &str {
            "failing"
        }

        fn returns_api(&self) -> bool {
            false
        }

        fn hooks(&self) -> HookSet {
            HookSet::empty().with(Hook::ReadyAsync)
        }

        async fn on_ready_async(
            &self,
            _app: &AppContainer,
            _api: Option<&PluginApi>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("database unreachable")
        }
    }

    #[tokio::test]
    async fn hook_errors_propagate_out_of_the_sweep() {
        let mut container = ready_container();
        PluginOrchestrator::activate(&mut container, Arc::new(FailingReady), PluginConfig::new())
            .unwrap();
        let err = PluginOrchestrator::startup(&container).await.unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Hook { hook: Hook::ReadyAsync, .. }
        ));
    }

    /// Fails in the given hook; exposes an API built by the `broken-api` command.
    struct Faulty(Hook);

    impl Plugin for Faulty {
        fn public_name(&self) -> &str {
            "faulty"
        }

        fn command_name(&self) -> &str {
            "broken-api"
        }

        fn hooks(&self) -> HookSet {
            HookSet::of(&[self.0])
        }

        fn on_pre_enable(&self, _ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("pre-enable refused")
        }

        fn on_enable(&self, _ctx: &mut SetupContext<'_>, _api: Option<&PluginApi>) -> anyhow::Result<()> {
            anyhow::bail!("enable refused")
        }
    }

    fn assert_absent(container: &AppContainer) {
        assert!(!container.namespace().contains("faulty"));
        assert!(container.namespace().get("faulty").is_err());
        assert!(container.activated().is_empty());
    }

    #[test]
    fn failing_setup_hooks_keep_the_plugin_unregistered() {
        for hook in [Hook::PreEnable, Hook::Enable] {
            let mut container = ready_container();
            container
                .commands
                .register("broken-api", |_ctx, _config| Ok(Some(plugin_api("api"))));

            let err = PluginOrchestrator::activate(
                &mut container,
                Arc::new(Faulty(hook)),
                PluginConfig::new(),
            )
            .unwrap_err();

            assert!(
                matches!(err, ContainerError::Hook { hook: failed, .. } if failed == hook),
                "{err}"
            );
            assert_absent(&container);
        }
    }

    #[test]
    fn command_without_api_aborts_activation() {
        let mut container = ready_container();
        container
            .commands
            .register("broken-api", |_ctx, _config| Ok(None));

        let err = PluginOrchestrator::activate(
            &mut container,
            Arc::new(Faulty(Hook::PostEnable)),
            PluginConfig::new(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ContainerError::CommandReturnedNothing(ref name) if name == "broken-api"
        ));
        assert_absent(&container);
    }

    #[test]
    fn nameless_plugins_register_under_their_type_name() {
        let journal = Journal::default();
        let mut container = ready_container();
        PluginOrchestrator::activate(&mut container, Tracer::new("", &[], &journal), PluginConfig::new())
            .unwrap();
        assert!(container.namespace().contains("Tracer"));
        assert_eq!(container.activated().names(), vec!["Tracer"]);
    }
}
