use std::{convert::Infallible, fmt, future::Future, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig},
    TlsAcceptor,
};
use tower::ServiceExt;
use tracing::Instrument;

use crate::{
    config::{ServerSettings, Tls},
    container::AppContainer,
    error::ContainerError,
    lifecycle::{Lifespan, LifespanDriver},
    router::{Handler, HostRouter, HttpRequest, HttpResponse, RouteEntry},
};

type ErrorRenderer = Box<dyn Fn(&anyhow::Error) -> Option<HttpResponse> + Send + Sync>;

/// Builds a plain-text response.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// The serving handle: route table, error mappings and lifespan of one application.
pub struct HostApp {
    settings: ServerSettings,
    router: HostRouter,
    error_renderers: Vec<ErrorRenderer>,
    lifespan: Option<Arc<dyn Lifespan>>,
}

impl HostApp {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            router: HostRouter::default(),
            error_renderers: Vec::new(),
            lifespan: None,
        }
    }

    pub fn with_lifespan(mut self, lifespan: Arc<dyn Lifespan>) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn router(&self) -> &HostRouter {
        &self.router
    }

    pub fn lifespan(&self) -> Option<&Arc<dyn Lifespan>> {
        self.lifespan.as_ref()
    }

    pub(crate) fn take_lifespan(&mut self) -> Option<Arc<dyn Lifespan>> {
        self.lifespan.take()
    }

    pub(crate) fn set_lifespan(&mut self, lifespan: Arc<dyn Lifespan>) {
        self.lifespan = Some(lifespan);
    }

    /// Attaches a route. No conflict detection is performed.
    pub fn route(
        &mut self,
        method: Method,
        path: impl Into<String>,
        handler: Handler,
        tags: Vec<String>,
    ) {
        self.router.attach(RouteEntry {
            method,
            path: path.into(),
            handler,
            tags,
        });
    }

    /// Maps handler errors of type `E` (anywhere in the error chain) to a response.
    pub fn exception_handler<E, F>(&mut self, render: F)
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&E) -> HttpResponse + Send + Sync + 'static,
    {
        self.error_renderers.push(Box::new(move |err: &anyhow::Error| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<E>())
                .map(|cause| render(cause))
        }));
    }

    fn render_error(&self, err: &anyhow::Error) -> HttpResponse {
        self.error_renderers
            .iter()
            .find_map(|render| render(err))
            .unwrap_or_else(internal_error)
    }

    /// Routes one request through the table and the installed error mappings.
    pub async fn dispatch(&self, req: HttpRequest) -> HttpResponse {
        let start = Instant::now();
        let span = tracing::info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            group = tracing::field::Empty,
            status = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );
        async move {
            let span = tracing::Span::current();
            let Some(route) = self.router.select(req.method(), req.uri().path()) else {
                span.record("status", StatusCode::NOT_FOUND.as_u16());
                metrics::counter!("trellis_requests_total", "outcome" => "miss").increment(1);
                return not_found();
            };
            if let Some(group) = route.tags.first() {
                span.record("group", group.as_str());
            }

            let call = route.handler.clone().oneshot(req);
            let result = match self.settings.request_timeout() {
                Some(limit) => match timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("request timed out after {limit:?}")),
                },
                None => call.await,
            };

            let response = match result {
                Ok(response) => {
                    metrics::counter!("trellis_requests_total", "outcome" => "hit").increment(1);
                    response
                }
                Err(err) => {
                    tracing::error!(error = %err, "request handler failed");
                    metrics::counter!("trellis_requests_total", "outcome" => "error")
                        .increment(1);
                    self.render_error(&err)
                }
            };
            span.record("status", response.status().as_u16());
            span.record("duration_ms", start.elapsed().as_millis() as u64);
            response
        }
        .instrument(span)
        .await
    }
}

impl fmt::Debug for HostApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApp")
            .field("settings", &self.settings)
            .field("routes", &self.router.len())
            .field("error_renderers", &self.error_renderers.len())
            .field("lifespan", &self.lifespan.is_some())
            .finish()
    }
}

fn not_found() -> HttpResponse {
    text_response(StatusCode::NOT_FOUND, "no matching route")
}

fn internal_error() -> HttpResponse {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Serves a created container over HTTP/1.1, optionally behind TLS.
pub struct Server {
    container: Arc<AppContainer>,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    listener: Option<TcpListener>,
}

impl Server {
    pub fn new(container: Arc<AppContainer>) -> Result<Self> {
        let settings = container
            .serving()
            .ok_or(ContainerError::ServingHandleNotReady)?
            .settings()
            .clone();
        settings.validate()?;
        let addr = settings.parse_bind_addr()?;
        let acceptor = settings
            .tls
            .as_ref()
            .map(build_tls_acceptor)
            .transpose()?;
        Ok(Self {
            container,
            addr,
            acceptor,
            listener: None,
        })
    }

    /// Serves on an already bound listener instead of binding `server.bind`.
    pub fn with_listener(mut self, listener: TcpListener) -> Result<Self> {
        self.addr = listener.local_addr().context("listener has no local address")?;
        self.listener = Some(listener);
        Ok(self)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs the lifespan startup, serves until `shutdown` resolves, then runs the lifespan shutdown.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let container = Arc::clone(&self.container);
        LifespanDriver::run(&container, self.serve(shutdown)).await
    }

    async fn serve<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let tcp = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.addr)
                .await
                .with_context(|| format!("failed to bind {}", self.addr))?,
        };
        tracing::info!(addr = %self.addr, tls = self.acceptor.is_some(), "listener ready");

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received; draining connections");
                    break;
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        tracing::error!(error = %err, "connection task aborted");
                    }
                }
                accept = tcp.accept() => {
                    let (stream, peer_addr) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };
                    let container = Arc::clone(&self.container);
                    let acceptor = self.acceptor.clone();
                    let drain = drain_rx.clone();
                    connections.spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => serve_connection(tls, container, drain).await,
                                Err(err) => Err(err.into()),
                            },
                            None => serve_connection(stream, container, drain).await,
                        };
                        if let Err(err) = result {
                            tracing::warn!(error = %err, peer = %peer_addr, "connection closed with error");
                        }
                    });
                }
            }
        }

        drain_tx.send(true).ok();
        while let Some(result) = connections.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "connection task aborted");
            }
        }
        tracing::info!("all connections drained");
        Ok(())
    }
}

async fn serve_connection<I>(
    io: I,
    container: Arc<AppContainer>,
    mut drain: watch::Receiver<bool>,
) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let container = Arc::clone(&container);
        async move { Ok::<_, Infallible>(handle_request(container, req).await) }
    });
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result.context("connection handling failed"),
        _ = drain.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await.context("connection failed while draining")
        }
    }
}

async fn handle_request(
    container: Arc<AppContainer>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let response = match body.collect().await {
        Ok(collected) => {
            let req = Request::from_parts(parts, collected.to_bytes());
            match container.serving() {
                Some(app) => app.dispatch(req).await,
                None => internal_error(),
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to read request body");
            text_response(StatusCode::BAD_REQUEST, "unreadable request body")
        }
    };
    response.map(Full::new)
}

fn build_tls_acceptor(tls: &Tls) -> Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let data = std::fs::read(path).with_context(|| format!("failed to read cert {path}"))?;
    let raw = rustls_pemfile::certs(&mut data.as_slice())
        .map_err(|_| anyhow!("invalid certificate data in {path}"))?;
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let data = std::fs::read(path).with_context(|| format!("failed to read key {path}"))?;
    let mut reader = data.as_slice();
    while let Some(item) =
        rustls_pemfile::read_one(&mut reader).map_err(|_| anyhow!("invalid key format"))?
    {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    anyhow::bail!("no usable private keys found in {path}")
}
