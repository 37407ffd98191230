//! Declarative route metadata collected during discovery.
//!
//! Nothing in this module touches the serving layer. Declarations are plain
//! data until [`crate::router::RouteBinder`] consumes the resolved list.

use std::{fmt, panic::Location};

use http::Method;

use crate::router::Handler;

const DEFAULT_GROUP: &str = "DEFAULT";

/// Normalizes a declared path: blank or absent becomes `/`, otherwise a leading slash is ensured.
pub fn normalize_path(path: Option<&str>) -> String {
    match path.map(str::trim) {
        None | Some("") => "/".to_string(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{p}"),
    }
}

/// Uppercased, slash-trimmed form of a path, used as the default route group.
pub fn derive_group(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        DEFAULT_GROUP.to_string()
    } else {
        trimmed.to_uppercase()
    }
}

fn normalize_base(base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.is_empty() {
        String::new()
    } else if base.starts_with('/') {
        base.to_string()
    } else {
        format!("/{base}")
    }
}

/// Where a declaration came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteOrigin {
    pub controller: Option<String>,
    /// `file:line:column` of the registering call.
    pub source: String,
}

impl RouteOrigin {
    #[track_caller]
    fn here() -> Self {
        let location = Location::caller();
        Self {
            controller: None,
            source: format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
        }
    }
}

/// A single route declared on a controller or a free function.
#[derive(Clone)]
pub struct RouteDeclaration {
    pub method: Method,
    pub path: String,
    pub handler: Handler,
    pub group: Option<String>,
    pub origin: RouteOrigin,
}

impl RouteDeclaration {
    #[track_caller]
    pub fn new(method: Method, path: &str, handler: Handler) -> Self {
        Self {
            method,
            path: normalize_path(Some(path)),
            handler,
            group: None,
            origin: RouteOrigin::here(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl fmt::Debug for RouteDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDeclaration")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("group", &self.group)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Routes grouped under one controller instance and a base path.
///
/// The controller instance is constructed by the caller before the declaration
/// is built; handlers capture it (see [`crate::router::method_fn`]).
#[derive(Clone, Debug)]
pub struct ControllerDeclaration {
    name: String,
    base: String,
    group: Option<String>,
    routes: Vec<RouteDeclaration>,
}

impl ControllerDeclaration {
    pub fn new(name: impl Into<String>, base: &str) -> Self {
        Self {
            name: name.into(),
            base: normalize_base(base),
            group: None,
            routes: Vec::new(),
        }
    }

    /// Names the controller after `C`'s type path.
    pub fn of<C: ?Sized>(base: &str) -> Self {
        Self::new(std::any::type_name::<C>(), base)
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[track_caller]
    pub fn route(mut self, method: Method, path: &str, handler: Handler) -> Self {
        let mut decl = RouteDeclaration::new(method, path, handler);
        decl.origin.controller = Some(self.name.clone());
        self.routes.push(decl);
        self
    }

    #[track_caller]
    pub fn get(self, path: &str, handler: Handler) -> Self {
        self.route(Method::GET, path, handler)
    }

    #[track_caller]
    pub fn post(self, path: &str, handler: Handler) -> Self {
        self.route(Method::POST, path, handler)
    }

    #[track_caller]
    pub fn put(self, path: &str, handler: Handler) -> Self {
        self.route(Method::PUT, path, handler)
    }

    #[track_caller]
    pub fn patch(self, path: &str, handler: Handler) -> Self {
        self.route(Method::PATCH, path, handler)
    }

    #[track_caller]
    pub fn delete(self, path: &str, handler: Handler) -> Self {
        self.route(Method::DELETE, path, handler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn routes(&self) -> &[RouteDeclaration] {
        &self.routes
    }

    fn default_group(&self) -> String {
        self.group.clone().unwrap_or_else(|| derive_group(&self.base))
    }
}

/// A flattened declaration with its absolute path and final group.
#[derive(Clone)]
pub struct ResolvedRoute {
    pub method: Method,
    pub path: String,
    pub handler: Handler,
    pub group: String,
    pub origin: RouteOrigin,
}

impl ResolvedRoute {
    /// Everything but the handler; stable across processes given identical declarations.
    pub fn signature(&self) -> (Method, String, String, RouteOrigin) {
        (
            self.method.clone(),
            self.path.clone(),
            self.group.clone(),
            self.origin.clone(),
        )
    }
}

impl fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("group", &self.group)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Returned by registration calls; identifies a declaration by kind and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationHandle {
    Controller(usize),
    Function(usize),
}

/// Append-only store of controller and function-route declarations.
#[derive(Default, Debug)]
pub struct MetadataRegistry {
    controllers: Vec<ControllerDeclaration>,
    functions: Vec<RouteDeclaration>,
}

impl MetadataRegistry {
    pub fn register_controller(&mut self, decl: ControllerDeclaration) -> DeclarationHandle {
        tracing::trace!(
            controller = %decl.name,
            base = %decl.base,
            routes = decl.routes.len(),
            "controller declared"
        );
        self.controllers.push(decl);
        DeclarationHandle::Controller(self.controllers.len() - 1)
    }

    pub fn register_function_route(&mut self, decl: RouteDeclaration) -> DeclarationHandle {
        tracing::trace!(method = %decl.method, path = %decl.path, "function route declared");
        self.functions.push(decl);
        DeclarationHandle::Function(self.functions.len() - 1)
    }

    /// Controllers in registration order (their routes in declaration order), then function routes.
    pub fn resolve_routes(&self) -> Vec<ResolvedRoute> {
        let controller_routes = self.controllers.iter().flat_map(|ctrl| {
            let default_group = ctrl.default_group();
            ctrl.routes.iter().map(move |route| ResolvedRoute {
                method: route.method.clone(),
                path: format!("{}{}", ctrl.base, route.path),
                handler: route.handler.clone(),
                group: route.group.clone().unwrap_or_else(|| default_group.clone()),
                origin: route.origin.clone(),
            })
        });
        let function_routes = self.functions.iter().map(|route| ResolvedRoute {
            method: route.method.clone(),
            path: route.path.clone(),
            handler: route.handler.clone(),
            group: route
                .group
                .clone()
                .unwrap_or_else(|| derive_group(&route.path)),
            origin: route.origin.clone(),
        });
        controller_routes.chain(function_routes).collect()
    }

    pub fn controllers(&self) -> &[ControllerDeclaration] {
        &self.controllers
    }

    pub fn function_routes(&self) -> &[RouteDeclaration] {
        &self.functions
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty() && self.functions.is_empty()
    }

    pub fn clear(&mut self) {
        self.controllers.clear();
        self.functions.clear();
    }
}
