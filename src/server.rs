//! Server assembly, request dispatch and graceful shutdown.
//!
//! # Lifecycle of one request
//!
//! ```text
//! hyper Request ─► Mux lookup ─► Context ─► m0 ─► m1 ─► … ─► handler
//!                                                               │
//! hyper Response ◄── BufferedSink ◄── Response::commit ◄────────┘
//!                                         └─► after-commit hooks
//! ```
//!
//! Exactly one commit happens per request, in `dispatch`, after the whole
//! chain has returned. A commit that fails before the status was written is
//! replaced by a plain `500`; either way the failure is logged.
//!
//! A panicking handler takes down only its own connection task; the accept
//! loop and every other connection keep running.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** (what an orchestrator sends before killing a pod) or
//! **Ctrl-C**, [`Server::serve`]:
//! 1. stops calling `listener.accept()`, so no new connections are taken,
//! 2. lets every in-flight connection task run to completion,
//! 3. returns, which lets `main` exit cleanly.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::context::{self, Body, Context};
use crate::error::{BoxError, Error, ErrorBody};
use crate::handler::Handler;
use crate::ip::{IpResolver, ResolveIp};
use crate::method::Method;
use crate::middleware::{BoxedMiddleware, Middleware};
use crate::response::Response;
use crate::router::{Group, Lookup, Mux};
use crate::sink::BufferedSink;

/// Routes, middleware and configuration for one HTTP service.
///
/// Everything is registered up front; [`serve`](Server::serve) consumes the
/// server, so the route table and [`Config`] are immutable while requests
/// are in flight.
///
/// ```rust,no_run
/// use sluice::{Context, Response, Server, middleware};
///
/// async fn hello(ctx: Context) -> Response {
///     Response::new().text(format!("hello {}", ctx.client_ip()))
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), sluice::Error> {
///     let mut server = Server::new();
///     server.trust_remote_ip_headers(true).use_middleware(middleware::trace());
///     server.get("/", hello);
///     server.serve("0.0.0.0:3000").await
/// }
/// ```
pub struct Server {
    mux: Mux,
    middleware: Vec<BoxedMiddleware>,
    ip_policy: IpResolver,
    config: Arc<Config>,
}

impl Server {
    /// An empty server: 64 MiB multipart ceiling, forwarding headers
    /// `X-Forwarded-For` and `Forwarded` configured but not trusted.
    pub fn new() -> Self {
        Self {
            mux: Mux::new(),
            middleware: Vec::new(),
            ip_policy: IpResolver::default(),
            config: Arc::new(Config::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    /// In-memory ceiling for multipart form bodies, in bytes.
    pub fn max_multipart_memory(&mut self, bytes: u64) -> &mut Self {
        Arc::make_mut(&mut self.config).max_multipart_memory = bytes;
        self
    }

    /// The forwarding headers to consult, in order. Replaces any resolver set
    /// through [`ip_resolver`](Self::ip_resolver).
    pub fn remote_ip_headers<I, S>(&mut self, headers: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ip_policy.trusted_headers = headers.into_iter().map(Into::into).collect();
        self.install_ip_policy()
    }

    /// Whether forwarding headers are honoured. Off by default; only switch it
    /// on behind proxies that overwrite these headers. Replaces any resolver
    /// set through [`ip_resolver`](Self::ip_resolver).
    pub fn trust_remote_ip_headers(&mut self, trust: bool) -> &mut Self {
        self.ip_policy.trust_headers = trust;
        self.install_ip_policy()
    }

    /// Replaces the client address resolver entirely.
    pub fn ip_resolver(&mut self, resolver: impl ResolveIp) -> &mut Self {
        Arc::make_mut(&mut self.config).ip_resolver = Arc::new(resolver);
        self
    }

    fn install_ip_policy(&mut self) -> &mut Self {
        let policy = self.ip_policy.clone();
        Arc::make_mut(&mut self.config).ip_resolver = Arc::new(policy);
        self
    }

    // ── Routes ────────────────────────────────────────────────────────────────

    /// Appends server-wide middleware. It wraps every route registered
    /// afterwards, and every group created afterwards.
    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(middleware.boxed());
        self
    }

    /// A route group under `prefix`, starting with the current server-wide
    /// middleware.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group::new(&mut self.mux, prefix.to_owned(), self.middleware.clone())
    }

    /// See [`Group::route`].
    pub fn route<I>(&mut self, method: Method, path: &str, handler: impl Handler, route_middleware: I) -> &mut Self
    where
        I: IntoIterator<Item = BoxedMiddleware>,
    {
        self.group("").route(method, path, handler, route_middleware);
        self
    }

    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.route(method, path, handler, [])
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Get, path, handler)
    }

    pub fn head(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Head, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Post, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Put, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Patch, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Delete, path, handler)
    }

    pub fn options(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Options, path, handler)
    }

    // ── Serving ───────────────────────────────────────────────────────────────

    /// Runs one request through the pipeline without a socket.
    ///
    /// `remote_addr` is the `host:port` the request appears to come from.
    pub async fn handle<B>(&self, req: http::Request<B>, remote_addr: &str) -> http::Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        dispatch(&self.mux, &self.config, req.map(context::box_body), remote_addr).await
    }

    /// Binds `addr` and serves until SIGTERM or Ctrl-C, then drains.
    pub async fn serve(self, addr: &str) -> Result<(), Error> {
        let addr: SocketAddr = addr.parse().map_err(|_| Error::Addr(addr.to_owned()))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serves connections from `listener` until `shutdown` resolves, then
    /// waits for in-flight connections to finish.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        // Shared by every connection task; nothing below mutates it.
        let app = Arc::new(self);
        info!(addr = %listener.local_addr()?, "sluice listening");

        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting at once,
                // even with connections queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let io = TokioIo::new(stream);
                    let remote_addr = peer.to_string();

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            let remote_addr = remote_addr.clone();
                            async move { Ok::<_, Infallible>(app.handle(req, &remote_addr).await) }
                        });

                        // HTTP/1.1 or HTTP/2, whatever the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %peer, "connection error: {e}");
                        }
                    });
                }

                // Reap finished tasks so the set does not grow without bound.
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!("connection task panicked");
                        }
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("sluice stopped");
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Routes one request, runs its chain and commits the result exactly once.
async fn dispatch(
    mux: &Mux,
    config: &Arc<Config>,
    req: http::Request<Body>,
    remote_addr: &str,
) -> http::Response<Full<Bytes>> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let ctx = Context::new(req, remote_addr, Arc::clone(config));
    let ip = ctx.client_ip().to_owned();

    let response = match mux.lookup(&method, &path) {
        Lookup::Found(chain, params) => chain.call(ctx.with_path_values(params)).await,
        Lookup::MethodNotAllowed(allowed) => {
            let allowed: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
            Response::new()
                .method_not_allowed_with(ErrorBody::new("MethodNotAllowed", format!("method {method} not allowed")))
                .allow(&allowed)
        }
        Lookup::NotFound => {
            Response::new().not_found_with(ErrorBody::new("NotFound", format!("no route for {path}")))
        }
    };

    let mut sink = BufferedSink::new();
    let Err(err) = response.commit(&mut sink) else {
        return sink.into_response();
    };
    // Access logs registered as after-commit hooks saw the handler's status;
    // this line carries the one actually sent.
    let res = if sink.status().is_some() { sink.into_response() } else { internal_server_error() };
    error!(
        %ip,
        %method,
        %path,
        status = res.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        error = %err,
        "unable to write response"
    );
    res
}

fn internal_server_error() -> http::Response<Full<Bytes>> {
    let body = br#"{"code":"InternalServerError","message":"unable to write response"}"#;
    let mut res = http::Response::new(Full::new(Bytes::from_static(body)));
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static(crate::response::JSON),
    );
    res
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. Windows only has Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::{BodyExt, Empty};

    use super::*;

    async fn ok(_: Context) -> &'static str {
        "ok"
    }

    fn request(method: &str, uri: &str) -> http::Request<Empty<Bytes>> {
        http::Request::builder().method(method).uri(uri).body(Empty::new()).unwrap()
    }

    async fn body_json(res: http::Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unmatched_paths_get_a_json_not_found() {
        let server = Server::new();
        let res = server.handle(request("GET", "/nope"), "127.0.0.1:1").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res).await["code"], "NotFound");
    }

    #[tokio::test]
    async fn wrong_method_lists_the_allowed_ones() {
        let mut server = Server::new();
        server.get("/item", ok).put("/item", ok);

        let res = server.handle(request("POST", "/item"), "127.0.0.1:1").await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()["allow"], "GET, HEAD, PUT");
    }

    #[tokio::test]
    async fn failed_commit_before_status_becomes_500() {
        struct Unserializable;
        impl serde::Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("no"))
            }
        }

        let mut server = Server::new();
        server.get("/bad", |_ctx: Context| async { Response::new().json(Unserializable) });

        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt().with_writer(logs.clone()).with_ansi(false).finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let res = server.handle(request("GET", "/bad"), "127.0.0.1:1").await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(res).await["code"], "InternalServerError");

        let line = logs.text();
        assert!(line.contains("unable to write response"), "{line}");
        assert!(line.contains("ip=127.0.0.1"), "{line}");
        assert!(line.contains("status=500"), "{line}");
        assert!(line.contains("duration_ms="), "{line}");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn setters_freeze_into_the_config() {
        let mut server = Server::new();
        server
            .max_multipart_memory(1024)
            .remote_ip_headers(["Forwarded"])
            .trust_remote_ip_headers(true)
            .get("/ip", |ctx: Context| async move { ctx.client_ip().to_owned() });

        assert_eq!(server.config().max_multipart_memory(), 1024);

        let req = http::Request::builder()
            .uri("/ip")
            .header("X-Forwarded-For", "203.0.113.9")
            .header("Forwarded", "for=198.51.100.4;proto=https")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let res = server.handle(req, "10.0.0.1:5000").await;
        let body = res.into_body().collect().await.unwrap().to_bytes();
        // Only the configured header is consulted.
        assert_eq!(body, "198.51.100.4");
    }
}
