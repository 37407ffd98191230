//! Explicit module discovery.
//!
//! Modules register a function that feeds declarations into the
//! [`MetadataRegistry`]. Nothing runs at registration time; only
//! [`ModuleCatalog::discover`] calls into the modules, once each.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use crate::{
    error::{ContainerError, Result},
    registry::MetadataRegistry,
};

type RegisterFn = Arc<dyn Fn(&mut MetadataRegistry) -> anyhow::Result<()> + Send + Sync>;

/// A loadable unit of declarations, addressed by a slash-separated path
/// such as `app/domains/users/controller`.
#[derive(Clone)]
pub struct DiscoveryModule {
    path: String,
    register: RegisterFn,
}

impl DiscoveryModule {
    pub fn new<F>(path: impl Into<String>, register: F) -> Self
    where
        F: Fn(&mut MetadataRegistry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            path: normalize_module_path(&path.into()),
            register: Arc::new(register),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Private modules have a path segment starting with `_`.
    pub fn is_private(&self) -> bool {
        self.path.split('/').any(|segment| segment.starts_with('_'))
    }

    fn is_under(&self, root: &str) -> bool {
        if root.is_empty() {
            return true;
        }
        match self.path.strip_prefix(root) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Debug for DiscoveryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryModule")
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub loaded: Vec<String>,
    pub skipped_private: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, DiscoveryModule>,
    loaded: BTreeSet<String>,
}

impl ModuleCatalog {
    /// Adds a module; a module registered under an existing path replaces it.
    pub fn add(&mut self, module: DiscoveryModule) {
        self.modules.insert(module.path.clone(), module);
    }

    pub fn module<F>(&mut self, path: impl Into<String>, register: F)
    where
        F: Fn(&mut MetadataRegistry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(DiscoveryModule::new(path, register));
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.loaded.contains(&normalize_module_path(path))
    }

    /// Loads every public module under `root` that has not been loaded yet,
    /// in path order. `""` and `"."` select every module.
    pub fn discover(&mut self, root: &str, registry: &mut MetadataRegistry) -> Result<DiscoveryReport> {
        let root = normalize_module_path(root);
        let mut report = DiscoveryReport::default();

        for module in self.modules.values().filter(|m| m.is_under(&root)) {
            if module.is_private() {
                tracing::debug!(module = %module.path, "skipping private module");
                report.skipped_private.push(module.path.clone());
                continue;
            }
            if self.loaded.contains(&module.path) {
                continue;
            }
            (module.register)(registry).map_err(|source| ContainerError::Discovery {
                module: module.path.clone(),
                source,
            })?;
            self.loaded.insert(module.path.clone());
            report.loaded.push(module.path.clone());
        }

        tracing::info!(
            root = %root,
            loaded = report.loaded.len(),
            skipped = report.skipped_private.len(),
            "module discovery finished"
        );
        Ok(report)
    }

    pub fn clear(&mut self) {
        self.modules.clear();
        self.loaded.clear();
    }
}

fn normalize_module_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed == "." {
        return String::new();
    }
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::{Method, StatusCode};

    use super::*;
    use crate::{
        registry::{ControllerDeclaration, RouteDeclaration},
        router::handler_fn,
        server::text_response,
    };

    fn ok() -> crate::router::Handler {
        handler_fn(|_req| async { Ok(text_response(StatusCode::OK, "ok")) })
    }

    fn catalog(counter: &Arc<AtomicUsize>) -> ModuleCatalog {
        let mut catalog = ModuleCatalog::default();
        let hits = Arc::clone(counter);
        catalog.module("app/domains/users/controller", move |registry| {
            hits.fetch_add(1, Ordering::SeqCst);
            registry.register_controller(ControllerDeclaration::new("Users", "/users").get("/", ok()));
            Ok(())
        });
        catalog.module("app/domains/health", |registry| {
            registry.register_function_route(RouteDeclaration::new(Method::GET, "/health", ok()));
            Ok(())
        });
        catalog.module("app/domains/_internal/seed", |_registry| {
            anyhow::bail!("private modules must never load")
        });
        catalog.module("application/other", |_registry| {
            anyhow::bail!("outside the discovery root")
        });
        catalog
    }

    #[test]
    fn loads_public_modules_under_root_in_path_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog(&counter);
        let mut registry = MetadataRegistry::default();

        let report = catalog.discover("app", &mut registry).unwrap();

        assert_eq!(
            report.loaded,
            vec!["app/domains/health", "app/domains/users/controller"]
        );
        assert_eq!(report.skipped_private, vec!["app/domains/_internal/seed"]);
        assert_eq!(registry.controllers().len(), 1);
        assert_eq!(registry.function_routes().len(), 1);
    }

    #[test]
    fn each_module_loads_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog(&counter);
        let mut registry = MetadataRegistry::default();

        catalog.discover("./app/", &mut registry).unwrap();
        let again = catalog.discover("app", &mut registry).unwrap();

        assert!(again.loaded.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(catalog.is_loaded("app/domains/users/controller"));
    }

    #[test]
    fn registration_failures_name_the_module() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog(&counter);
        let err = catalog
            .discover("application", &mut MetadataRegistry::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Discovery { ref module, .. } if module == "application/other"
        ));
    }

    #[test]
    fn dot_root_selects_everything_public() {
        let mut catalog = ModuleCatalog::default();
        catalog.module("a", |_r| Ok(()));
        catalog.module("b/c", |_r| Ok(()));
        let report = catalog.discover(".", &mut MetadataRegistry::default()).unwrap();
        assert_eq!(report.loaded, vec!["a", "b/c"]);
    }
}
