use std::{fmt, future::Future, sync::Arc};

use bytes::Bytes;
use http::{Method, Request, Response};
use tower::{service_fn, util::BoxCloneSyncService};

use crate::{registry::ResolvedRoute, server::HostApp};

pub type HttpRequest = Request<Bytes>;
pub type HttpResponse = Response<Bytes>;
pub type Handler = BoxCloneSyncService<HttpRequest, HttpResponse, anyhow::Error>;

/// Wraps an async function into a route handler.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(HttpRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HttpResponse>> + Send + 'static,
{
    BoxCloneSyncService::new(service_fn(f))
}

/// Binds a controller method to an already constructed controller instance.
pub fn method_fn<C, F, Fut>(instance: &Arc<C>, f: F) -> Handler
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, HttpRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HttpResponse>> + Send + 'static,
{
    let instance = Arc::clone(instance);
    handler_fn(move |req| f(Arc::clone(&instance), req))
}

/// A route attached to the serving layer.
#[derive(Clone)]
pub struct RouteEntry {
    pub method: Method,
    pub path: String,
    pub handler: Handler,
    pub tags: Vec<String>,
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Route table owned by the serving layer.
///
/// Duplicate `(method, path)` pairs are accepted; dispatch picks the first one attached.
#[derive(Clone, Default, Debug)]
pub struct HostRouter {
    routes: Vec<RouteEntry>,
}

impl HostRouter {
    pub fn attach(&mut self, entry: RouteEntry) {
        self.routes.push(entry);
    }

    pub fn select(&self, method: &Method, path: &str) -> Option<&RouteEntry> {
        self.routes
            .iter()
            .find(|route| &route.method == method && route.path == path)
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Attaches resolved declarations to the serving layer's router.
///
/// Must run once per process: a second call attaches every route again.
pub struct RouteBinder;

impl RouteBinder {
    pub fn bind(routes: Vec<ResolvedRoute>, app: &mut HostApp) -> usize {
        let count = routes.len();
        for route in routes {
            tracing::debug!(
                method = %route.method,
                path = %route.path,
                group = %route.group,
                source = %route.origin.source,
                "binding route"
            );
            app.route(route.method, route.path, route.handler, vec![route.group]);
        }
        tracing::info!(routes = count, "routes bound to serving layer");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerSettings,
        registry::{MetadataRegistry, RouteDeclaration},
        server::text_response,
    };
    use http::StatusCode;

    fn ok(body: &'static str) -> Handler {
        handler_fn(move |_req| async move { Ok(text_response(StatusCode::OK, body)) })
    }

    #[test]
    fn bind_preserves_order_and_tags() {
        let mut registry = MetadataRegistry::default();
        registry.register_function_route(RouteDeclaration::new(Method::GET, "health", ok("up")));
        registry.register_function_route(
            RouteDeclaration::new(Method::POST, "/jobs", ok("queued")).with_group("Jobs"),
        );

        let mut app = HostApp::new(ServerSettings::default());
        let bound = RouteBinder::bind(registry.resolve_routes(), &mut app);

        assert_eq!(bound, 2);
        let entries = app.router().entries();
        assert_eq!(entries[0].path, "/health");
        assert_eq!(entries[0].tags, vec!["HEALTH".to_string()]);
        assert_eq!(entries[1].method, Method::POST);
        assert_eq!(entries[1].tags, vec!["Jobs".to_string()]);
    }

    #[test]
    fn duplicates_pass_through_and_first_wins() {
        let mut app = HostApp::new(ServerSettings::default());
        app.route(Method::GET, "/dup", ok("first"), vec![]);
        app.route(Method::GET, "/dup", ok("second"), vec![]);

        assert_eq!(app.router().len(), 2);
        let selected = app.router().select(&Method::GET, "/dup").expect("route");
        assert!(std::ptr::eq(selected, &app.router().entries()[0]));
        assert!(app.router().select(&Method::POST, "/dup").is_none());
    }
}
