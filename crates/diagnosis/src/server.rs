use crate::config::{listen_address, HttpSettings};
use crate::error::{CaptureError, DiagnosisError};
use crate::registry::ProfileRegistry;
use crate::session::{ByteSink, ByteStream, ProfileSession, Resource, FAR_FUTURE};
use crate::symbol;
use axum::body::{Body, HttpBody};
use axum::extract::{Path, Query, RawQuery, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::{Display, Write};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

pub const PATH_PREFIX: &str = "/diagnosis";

pub const DEFAULT_CPU_SECONDS: Duration = Duration::from_secs(30);
pub const DEFAULT_TRACE_SECONDS: Duration = Duration::from_secs(1);

/// Chunks buffered between a facility and the HTTP connection.
const STREAM_BUFFER: usize = 1024;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Endpoints served under [`PATH_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// GET /diagnosis - landing page
    Index,
    /// GET /diagnosis/pprof/ - profile index
    ProfileIndex,
    /// GET /diagnosis/pprof/{name} - named profile dump
    Profile { name: String },
    /// GET /diagnosis/pprof/cmdline - process arguments
    Cmdline,
    /// GET /diagnosis/pprof/profile - CPU capture
    Cpu,
    /// GET|POST /diagnosis/pprof/symbol - address to symbol lookup
    Symbol,
    /// GET /diagnosis/pprof/trace - execution trace capture
    Trace,
}

impl Route {
    pub fn to_path(&self) -> String {
        match self {
            Route::Index => PATH_PREFIX.to_string(),
            Route::ProfileIndex => format!("{}/pprof/", PATH_PREFIX),
            Route::Profile { name } => format!("{}/pprof/{}", PATH_PREFIX, name),
            Route::Cmdline => format!("{}/pprof/cmdline", PATH_PREFIX),
            Route::Cpu => format!("{}/pprof/profile", PATH_PREFIX),
            Route::Symbol => format!("{}/pprof/symbol", PATH_PREFIX),
            Route::Trace => format!("{}/pprof/trace", PATH_PREFIX),
        }
    }

    pub fn to_url(&self, addr: SocketAddr) -> String {
        format!("http://{}{}", addr, self.to_path())
    }
}

/// The diagnosis HTTP listener.
///
/// `write_timeout` bounds every response in two ways. A streamed body ends
/// once the timeout has passed since the request arrived, which also cancels
/// the capture feeding it. Independently, a socket write that makes no
/// progress for the timeout fails and the connection is dropped, so a client
/// that stops reading cannot pin a response. Requested capture windows are
/// not clamped to the timeout: keeping `write_timeout >= seconds` is up to
/// the caller.
pub struct DiagnosisServer {
    app_name: Arc<str>,
    address: String,
    write_timeout: Duration,
    registry: Arc<ProfileRegistry>,
    session: Arc<ProfileSession>,
    shutdown: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl DiagnosisServer {
    pub fn new(app_name: &str, settings: &HttpSettings) -> Self {
        Self {
            app_name: Arc::from(app_name),
            address: settings.address.clone(),
            write_timeout: settings.write_timeout,
            registry: Arc::new(ProfileRegistry::default()),
            session: Arc::new(ProfileSession::default()),
            shutdown: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    pub fn with_registry(mut self, registry: ProfileRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_session(mut self, session: ProfileSession) -> Self {
        self.session = Arc::new(session);
        self
    }

    /// Configured address, `:port` shorthand included.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// The bound address once the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn session(&self) -> &ProfileSession {
        &self.session
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            app_name: Arc::clone(&self.app_name),
            registry: Arc::clone(&self.registry),
            session: Arc::clone(&self.session),
            write_timeout: self.write_timeout,
            shutdown: self.shutdown.clone(),
        };

        Router::new()
            .route("/diagnosis", get(index))
            .route("/diagnosis/", get(index))
            .route("/diagnosis/pprof/", get(profile_index))
            .route("/diagnosis/pprof/cmdline", get(cmdline))
            .route("/diagnosis/pprof/profile", get(cpu_profile))
            .route("/diagnosis/pprof/symbol", get(symbols).post(symbols))
            .route("/diagnosis/pprof/trace", get(trace))
            .route("/diagnosis/pprof/{name}", get(named_profile))
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(
                self.write_timeout,
                bound_response,
            ))
            .with_state(state)
    }

    /// Serves on a dedicated runtime until [`stop`](Self::stop) is called.
    pub fn run(&self) -> Result<(), DiagnosisError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("diag-server")
            .enable_all()
            .build()?;
        runtime.block_on(self.serve())
    }

    /// Serves on the caller's runtime until [`stop`](Self::stop) is called.
    pub async fn serve(&self) -> Result<(), DiagnosisError> {
        if self.shutdown.is_cancelled() {
            debug!(app = %self.app_name, "diagnosis server stopped before serving");
            return Ok(());
        }

        let address = listen_address(&self.address);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| DiagnosisError::Listen {
                address: address.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);
        info!(app = %self.app_name, address = %local, "diagnosis server listening");

        let listener = DeadlineListener {
            inner: listener,
            write_timeout: self.write_timeout,
        };
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|source| DiagnosisError::Listen { address, source })
    }

    /// Closes the listener and cancels in-flight captures. Idempotent, and a
    /// no-op for the listener if it never started.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        info!(app = %self.app_name, "diagnosis server stopped");
    }
}

#[derive(Clone)]
struct AppState {
    app_name: Arc<str>,
    registry: Arc<ProfileRegistry>,
    session: Arc<ProfileSession>,
    write_timeout: Duration,
    shutdown: CancellationToken,
}

type Params = Query<HashMap<String, String>>;

impl AppState {
    /// Answers contention and start failures with an error status, otherwise
    /// returns a 200 whose body is fed by the capture as it runs.
    fn stream_capture(&self, resource: Resource, window: Duration) -> Response {
        if window > self.write_timeout {
            warn!(
                %resource,
                ?window,
                write_timeout = ?self.write_timeout,
                "capture window exceeds write timeout, output will be truncated"
            );
        }

        let armed = match self.session.arm(resource) {
            Ok(armed) => armed,
            Err(e) => return DiagnosisError::from(e).into_response(),
        };
        let (sink, stream) = ByteSink::channel(STREAM_BUFFER);
        let active = match armed.start(sink) {
            Ok(active) => active,
            Err(e) => return DiagnosisError::from(e).into_response(),
        };

        let cancel = self.shutdown.child_token();
        let disconnected = cancel.clone().drop_guard();
        tokio::spawn(async move {
            // finish() logs the outcome
            let _ = active.finish(window, &cancel).await;
        });

        let (content_type, filename) = match resource {
            Resource::Cpu => ("application/octet-stream", "profile"),
            Resource::Trace => ("application/x-ndjson", "trace"),
        };
        (
            [
                (CONTENT_TYPE, content_type.to_string()),
                (
                    CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", filename),
                ),
            ],
            Body::from_stream(capture_body(stream, disconnected)),
        )
            .into_response()
    }
}

/// Dropping the body, at the write deadline or because the client went away,
/// drops `disconnected` and cancels the capture.
fn capture_body(
    stream: ByteStream,
    disconnected: DropGuard,
) -> impl Stream<Item = Result<Vec<u8>, io::Error>> + Send + 'static {
    futures_util::stream::unfold(
        (stream, disconnected),
        |(mut stream, disconnected)| async move {
            let chunk = stream.recv().await?;
            Some((Ok(chunk), (stream, disconnected)))
        },
    )
}

/// `now + timeout`, or a deadline that never fires when that overflows.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Ends streamed bodies at the write deadline. Bodies of known length are
/// already complete and only need the socket-level bound.
async fn bound_response(
    State(write_timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let deadline = deadline_after(write_timeout);
    let path: Arc<str> = Arc::from(request.uri().path());
    let response = next.run(request).await;
    if response.body().size_hint().exact().is_some() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let data = futures_util::stream::unfold(body.into_data_stream(), move |mut data| {
        let path = Arc::clone(&path);
        async move {
            match tokio::time::timeout_at(deadline, data.next()).await {
                Ok(Some(chunk)) => Some((chunk, data)),
                Ok(None) => None,
                Err(_) => {
                    warn!(%path, "write timeout reached, truncating response");
                    None
                }
            }
        }
    });
    Response::from_parts(parts, Body::from_stream(data))
}

/// Hands out connections whose writes fail after stalling for `write_timeout`.
struct DeadlineListener {
    inner: TcpListener,
    write_timeout: Duration,
}

impl axum::serve::Listener for DeadlineListener {
    type Io = DeadlineIo<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => return (DeadlineIo::new(stream, self.write_timeout), addr),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A connection whose pending writes and flushes time out. The timer starts
/// when the peer stops accepting bytes and resets on progress.
struct DeadlineIo<T> {
    inner: T,
    write_timeout: Duration,
    stalled: Option<Pin<Box<Sleep>>>,
}

impl<T: AsyncWrite + Unpin> DeadlineIo<T> {
    fn new(inner: T, write_timeout: Duration) -> Self {
        Self {
            inner,
            write_timeout,
            stalled: None,
        }
    }

    fn poll_bounded<R>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut T>, &mut Context<'_>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        if let Poll::Ready(result) = op(Pin::new(&mut self.inner), cx) {
            self.stalled = None;
            return Poll::Ready(result);
        }
        let write_timeout = self.write_timeout;
        let stalled = self
            .stalled
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline_after(write_timeout))));
        match stalled.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.stalled = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write timeout reached",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for DeadlineIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DeadlineIo<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_bounded(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_bounded(cx, |inner, cx| inner.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_bounded(cx, |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn seconds_param(params: &HashMap<String, String>, default: Duration) -> Duration {
    params
        .get("seconds")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|s| *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .unwrap_or(default)
}

fn int_param(params: &HashMap<String, String>, key: &str, default: i32) -> i32 {
    params
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

async fn cpu_profile(State(state): State<AppState>, Query(params): Params) -> Response {
    state.stream_capture(Resource::Cpu, seconds_param(&params, DEFAULT_CPU_SECONDS))
}

async fn trace(State(state): State<AppState>, Query(params): Params) -> Response {
    state.stream_capture(Resource::Trace, seconds_param(&params, DEFAULT_TRACE_SECONDS))
}

async fn named_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Params,
) -> Response {
    let debug = int_param(&params, "debug", 0);
    let gc = int_param(&params, "gc", 0) > 0;
    let Some(content_type) = state.registry.lookup(&name).map(|p| p.content_type(debug)) else {
        return DiagnosisError::UnknownProfile(name).into_response();
    };

    let registry = Arc::clone(&state.registry);
    let dumped = tokio::task::spawn_blocking(move || {
        let mut body = Vec::new();
        registry.dump(&name, &mut body, debug, gc).map(|()| body)
    })
    .await;

    match dumped {
        Ok(Ok(body)) => ([(CONTENT_TYPE, content_type)], body).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn cmdline() -> Response {
    let args: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    ([(CONTENT_TYPE, TEXT_PLAIN)], args.join("\0")).into_response()
}

async fn symbols(method: Method, RawQuery(query): RawQuery, body: String) -> Response {
    let input = if method == Method::POST {
        body
    } else {
        query.unwrap_or_default()
    };
    match tokio::task::spawn_blocking(move || symbol::render(&input)).await {
        Ok(out) => ([(CONTENT_TYPE, TEXT_PLAIN)], out).into_response(),
        Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let app = escape_html(&state.app_name);
    let mut page = String::new();
    let _ = write!(
        page,
        "<!DOCTYPE html>\n<html>\n<head><title>{app} diagnosis</title></head>\n<body>\n\
         <h1>{app} diagnosis</h1>\n<ul>\n"
    );
    let links = [
        (Route::ProfileIndex.to_path(), "Profiles"),
        (Route::Cmdline.to_path(), "Command line"),
        (format!("{}?seconds=30", Route::Cpu.to_path()), "CPU profile (30s)"),
        (format!("{}?seconds=1", Route::Trace.to_path()), "Execution trace (1s)"),
        (Route::Symbol.to_path(), "Symbol lookup"),
    ];
    for (href, label) in links {
        let _ = writeln!(page, "<li><a href=\"{href}\">{label}</a></li>");
    }
    page.push_str("</ul>\n</body>\n</html>\n");
    Html(page)
}

async fn profile_index(State(state): State<AppState>) -> Html<String> {
    let app = escape_html(&state.app_name);
    let mut page = String::new();
    let _ = write!(
        page,
        "<!DOCTYPE html>\n<html>\n<head><title>{app} profiles</title></head>\n<body>\n\
         <h1>{app} profiles</h1>\n<table>\n<thead><td>Count</td><td>Profile</td><td>Description</td></thead>\n"
    );
    for (name, profile) in state.registry.iter() {
        let count = profile.count().map(|c| c.to_string()).unwrap_or_default();
        let path = Route::Profile {
            name: name.to_string(),
        }
        .to_path();
        let _ = writeln!(
            page,
            "<tr><td align=right>{count}</td><td><a href=\"{path}?debug=1\">{name}</a></td><td>{desc}</td></tr>",
            path = escape_html(&path),
            name = escape_html(name),
            desc = escape_html(profile.description()),
        );
    }
    let _ = writeln!(
        page,
        "<tr><td></td><td><a href=\"{}?seconds=30\">profile</a></td><td>CPU profile, pprof protobuf</td></tr>",
        Route::Cpu.to_path()
    );
    let _ = writeln!(
        page,
        "<tr><td></td><td><a href=\"{}?seconds=1\">trace</a></td><td>Execution trace, JSON lines</td></tr>",
        Route::Trace.to_path()
    );
    page.push_str("</table>\n<p>Add <code>?debug=0</code> for JSON, <code>?gc=1</code> to reclaim before a heap dump.</p>\n</body>\n</html>\n");
    Html(page)
}

async fn not_found() -> Response {
    respond_error(StatusCode::NOT_FOUND, "Not found")
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn respond_error(status: StatusCode, msg: impl Display) -> Response {
    (status, [(CONTENT_TYPE, TEXT_PLAIN)], format!("{}\n", msg)).into_response()
}

impl IntoResponse for DiagnosisError {
    fn into_response(self) -> Response {
        let status = match &self {
            DiagnosisError::UnknownProfile(_) => StatusCode::NOT_FOUND,
            DiagnosisError::Capture(CaptureError::AlreadyActive(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        respond_error(status, self)
    }
}
