//! HTTP Listener — accepts connections and serves each on its own task.
//!
//! Connections are driven by hyper's HTTP/1.1 server with the transport time
//! budgets applied per connection: header read timeout, per-request write
//! deadline, idle keep-alive close. Routing is an axum `Router`.
//!
//! The header budget starts at the first byte of each request and the idle
//! budget at the end of the previous one, so a quiet keep-alive connection is
//! governed by `idle_timeout` alone.

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::admin;
use crate::config::Config;
use crate::state::AppState;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// hyper refuses read buffers smaller than this.
const MIN_READ_BUF: usize = 8192;
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-connection transport budgets.
#[derive(Debug, Clone, Copy)]
pub struct ConnLimits {
    pub header_read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_header_bytes: usize,
}

impl ConnLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            header_read_timeout: config.header_read_timeout(),
            write_timeout: config.write_timeout(),
            idle_timeout: config.idle_timeout(),
            max_header_bytes: config.max_header_bytes,
        }
    }

    fn read_buf_size(&self) -> usize {
        self.max_header_bytes.max(MIN_READ_BUF)
    }
}

/// Start the stress-app server and run until Ctrl-C.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new(&config)?;
    let limits = ConnLimits::from_config(&config);

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("cannot bind {addr}: {e}"))?;

    let delay = state.processor.delay();
    info!(
        addr = %addr,
        delay_min_ms = delay.min.as_millis() as u64,
        delay_max_ms = delay.max.as_millis() as u64,
        instruments = %config.instruments,
        "listening"
    );
    info!(
        header_read_secs = limits.header_read_timeout.as_secs(),
        write_secs = limits.write_timeout.as_secs(),
        idle_secs = limits.idle_timeout.as_secs(),
        max_header_bytes = limits.read_buf_size(),
        "transport limits"
    );

    if let Some(port) = config.admin_port {
        tokio::spawn(admin::serve(state.clone(), config.listen_host.clone(), port));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for shutdown signal");
                // Keep the sender alive so the server keeps running.
                std::future::pending::<()>().await;
            }
        }
    });

    serve(listener, router(state, limits.write_timeout), limits, shutdown_rx).await;
    info!("shutdown complete");
    Ok(())
}

/// Main router: `/metrics` plus a catch-all that runs the processor.
pub fn router(state: AppState, write_timeout: Duration) -> Router {
    Router::new()
        .route("/metrics", get(admin::metrics))
        .fallback(stress)
        .layer(middleware::from_fn_with_state(write_timeout, deadline))
        .with_state(state)
}

async fn stress(State(state): State<AppState>, uri: Uri) -> Response {
    let processor = Arc::clone(&state.processor);
    let path = uri.path().to_owned();

    // Runs detached so a client that goes away mid-request does not cancel
    // the work or its metric updates.
    let work = tokio::spawn(async move { processor.process(&path).await });

    match work.await {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "request processing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Bound the time from request arrival to response hand-off.
async fn deadline(State(budget): State<Duration>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    match tokio::time::timeout(budget, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %path, budget_secs = budget.as_secs_f64(), "response deadline exceeded");
            (StatusCode::SERVICE_UNAVAILABLE, "response deadline exceeded\n").into_response()
        }
    }
}

/// Accept loop. Returns once `shutdown` flips to true and open connections
/// have closed (or the grace period ran out).
pub async fn serve(
    listener: TcpListener,
    app: Router,
    limits: ConnLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "accept error");
                        continue;
                    }
                };
                let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(conn_id, peer = %peer, "new connection");
                connections.spawn(serve_connection(
                    socket,
                    app.clone(),
                    limits,
                    shutdown.clone(),
                    conn_id,
                ));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!(open = connections.len(), "grace period over, dropping connections");
        connections.abort_all();
    }
}

/// Per-connection timing: requests in flight, when the connection last went
/// quiet, and when the first byte of a not-yet-dispatched request arrived.
struct Activity {
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
    header_started: Mutex<Option<Instant>>,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            header_started: Mutex::new(None),
        }
    }

    fn begin(self: &Arc<Self>) -> Busy {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut started) = self.header_started.lock() {
            *started = None;
        }
        Busy {
            activity: Arc::clone(self),
        }
    }

    fn bytes_arrived(&self) {
        if self.in_flight.load(Ordering::Relaxed) > 0 {
            return;
        }
        if let Ok(mut started) = self.header_started.lock() {
            started.get_or_insert_with(Instant::now);
        }
    }

    /// True once a request has been arriving for longer than `budget`
    /// without being dispatched.
    fn header_overdue(&self, budget: Duration) -> bool {
        self.header_started
            .lock()
            .map(|started| started.is_some_and(|t| t.elapsed() >= budget))
            .unwrap_or(false)
    }

    /// How long the connection has been quiet. Zero while a request is in
    /// flight or partially received.
    fn idle_for(&self) -> Duration {
        if self.in_flight.load(Ordering::Relaxed) > 0 {
            return Duration::ZERO;
        }
        if self.header_started.lock().map(|s| s.is_some()).unwrap_or(false) {
            return Duration::ZERO;
        }
        self.last_active
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

struct Busy {
    activity: Arc<Activity>,
}

impl Drop for Busy {
    fn drop(&mut self) {
        if let Ok(mut last) = self.activity.last_active.lock() {
            *last = Instant::now();
        }
        self.activity.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Socket that reports incoming bytes to the connection's `Activity`.
struct TrackedIo {
    inner: TcpStream,
    activity: Arc<Activity>,
}

impl AsyncRead for TrackedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.bytes_arrived();
        }
        result
    }
}

impl AsyncWrite for TrackedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

async fn serve_connection(
    socket: TcpStream,
    app: Router,
    limits: ConnLimits,
    mut shutdown: watch::Receiver<bool>,
    conn_id: u64,
) {
    let activity = Arc::new(Activity::new());

    let service = {
        let activity = Arc::clone(&activity);
        service_fn(move |request: hyper::Request<Incoming>| {
            let busy = activity.begin();
            let app = app.clone();
            async move {
                let _busy = busy;
                app.oneshot(request).await
            }
        })
    };

    // No hyper timer: its header timer also runs while a keep-alive
    // connection waits for the next request. Headers are timed below.
    let mut builder = http1::Builder::new();
    builder
        .max_buf_size(limits.read_buf_size())
        .keep_alive(true);
    let io = TrackedIo {
        inner: socket,
        activity: Arc::clone(&activity),
    };
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    let mut closing = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    // Client disconnects mid-write land here; they are expected.
                    debug!(conn_id, error = %e, "connection ended with error");
                } else {
                    debug!(conn_id, "connection closed");
                }
                break;
            }
            _ = idle_check.tick() => {
                if activity.header_overdue(limits.header_read_timeout) {
                    debug!(conn_id, "request header read timed out");
                    break;
                }
                if !closing && activity.idle_for() >= limits.idle_timeout {
                    debug!(conn_id, "closing idle connection");
                    conn.as_mut().graceful_shutdown();
                    closing = true;
                }
            }
            _ = shutdown.changed(), if !closing => {
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentSet;
    use crate::metrics::SampleValue;
    use crate::processor::tests::parse_body;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_config(min_ms: u64, max_ms: u64) -> Config {
        let mut config = Config::default();
        config.delay_min_ms = min_ms;
        config.delay_max_ms = max_ms;
        config
    }

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start(config: Config) -> TestServer {
        let state = AppState::new(&config).unwrap();
        let limits = ConnLimits::from_config(&config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let app = router(state.clone(), limits.write_timeout);
        let task = tokio::spawn(serve(listener, app, limits, rx));
        TestServer {
            addr,
            state,
            shutdown,
            task,
        }
    }

    /// Send one request with `Connection: close` and return the raw response.
    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    /// Read exactly one keep-alive response, using its content-length.
    async fn read_response(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a full response");
            raw.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some((head, body)) = text.split_once("\r\n\r\n") {
                let length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap();
                if body.len() >= length {
                    return text;
                }
            }
        }
    }

    fn split_response(raw: &str) -> (&str, &str) {
        raw.split_once("\r\n\r\n").unwrap()
    }

    fn histogram_count(state: &AppState, name: &str) -> u64 {
        state
            .registry
            .snapshot()
            .into_iter()
            .find(|m| m.name == name)
            .and_then(|m| match m.value {
                SampleValue::Histogram(h) => Some(h.count),
                _ => None,
            })
            .unwrap()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_router_any_path_says_hello() {
        let state = AppState::new(&make_config(1, 2)).unwrap();
        let app = router(state.clone(), Duration::from_secs(10));

        for (method, uri) in [("GET", "/"), ("GET", "/deep/path?x=1"), ("POST", "/submit")] {
            let request = axum::http::Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(CONTENT_TYPE).unwrap(),
                "text/plain; charset=utf-8"
            );
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert!(parse_body(std::str::from_utf8(&body).unwrap()).is_some());
        }
        assert_eq!(state.metrics.requests.get(), 3);
    }

    #[tokio::test]
    async fn test_router_deadline_exceeded() {
        let state = AppState::new(&make_config(500, 500)).unwrap();
        let app = router(state.clone(), Duration::from_millis(50));

        let request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // The detached work still finishes and is recorded once.
        let latency = state.metrics.latency.clone().unwrap();
        wait_for(|| latency.count() == 1).await;
        assert_eq!(state.metrics.requests.get(), 1);
        let gauge = state.metrics.active.clone().unwrap();
        wait_for(|| gauge.get() == 0).await;
        assert_eq!(state.pool.stats().idle, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hundred_concurrent_requests() {
        let server = start(make_config(10, 100)).await;

        let mut clients = JoinSet::new();
        for i in 0..100 {
            let addr = server.addr;
            clients.spawn(async move { http_get(addr, &format!("/load/{i}")).await });
        }
        while let Some(raw) = clients.join_next().await {
            let raw = raw.unwrap();
            let (head, body) = split_response(&raw);
            assert!(head.starts_with("HTTP/1.1 200 OK"));
            let reported = parse_body(body).unwrap();
            assert!(reported >= Duration::from_millis(10));
        }

        assert_eq!(server.state.metrics.requests.get(), 100);
        // A request stays active until the transport has released its body.
        let gauge = server.state.metrics.active.clone().unwrap();
        wait_for(|| gauge.get() == 0).await;

        let raw = http_get(server.addr, "/metrics").await;
        let (head, body) = split_response(&raw);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("app_requests_total 100\n"));
        assert!(body.contains("app_response_time_seconds_count 100\n"));
        assert!(body.contains("app_response_size_bytes_count 100\n"));
        assert!(body.contains("app_active_requests 0\n"));

        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_disconnect_still_recorded() {
        let server = start(make_config(100, 100)).await;

        {
            let mut stream = TcpStream::connect(server.addr).await.unwrap();
            stream
                .write_all(b"GET /gone HTTP/1.1\r\nHost: test\r\n\r\n")
                .await
                .unwrap();
            // Give the server a moment to pick the request up, then hang up.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let state = server.state.clone();
        wait_for(|| histogram_count(&state, "app_response_time_seconds") == 1).await;
        assert_eq!(state.metrics.requests.get(), 1);
        assert_eq!(histogram_count(&state, "app_response_size_bytes"), 1);
        wait_for(|| state.metrics.active.as_ref().unwrap().get() == 0).await;

        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_reuses_connection_and_pool() {
        let server = start(make_config(1, 1)).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        for _ in 0..3 {
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
                .await
                .unwrap();
            let raw = read_response(&mut stream).await;
            let (head, body) = split_response(&raw);
            assert!(head.starts_with("HTTP/1.1 200 OK"));
            assert!(parse_body(body).is_some());
        }

        let stats = server.state.pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 2);

        drop(stream);
        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let mut config = make_config(1, 1);
        config.idle_timeout_secs = 1;
        let server = start(config).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();
        let raw = read_response(&mut stream).await;
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        let mut buf = vec![0u8; 64];

        // Server closes the quiet keep-alive connection; the read sees EOF.
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("idle connection was not closed")
            .unwrap();
        assert_eq!(n, 0);

        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_outlives_header_timeout() {
        let mut config = make_config(1, 1);
        config.read_header_timeout_secs = 1;
        config.idle_timeout_secs = 30;
        let server = start(config).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream
            .write_all(b"GET /first HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();
        assert!(read_response(&mut stream).await.starts_with("HTTP/1.1 200 OK"));

        // Quiet for longer than the header budget, well inside the idle one.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        stream
            .write_all(b"GET /second HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();
        let raw = read_response(&mut stream).await;
        let (head, body) = split_response(&raw);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(parse_body(body).is_some());
        assert_eq!(server.state.metrics.requests.get(), 2);

        drop(stream);
        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_request_header_closed() {
        let mut config = make_config(1, 1);
        config.read_header_timeout_secs = 1;
        config.idle_timeout_secs = 30;
        let server = start(config).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream.write_all(b"GET /slow HTTP/1.1\r\nHo").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("stalled request was not cut off")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.state.metrics.requests.get(), 0);

        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_path_label_per_endpoint_series() {
        let mut config = make_config(1, 1);
        config.path_label = true;
        let server = start(config).await;

        for path in ["/alpha", "/alpha", "/beta"] {
            assert!(http_get(server.addr, path).await.starts_with("HTTP/1.1 200 OK"));
        }

        let raw = http_get(server.addr, "/metrics").await;
        let (_, body) = split_response(&raw);
        assert!(body.contains("app_requests_total{endpoint=\"/alpha\"} 2\n"));
        assert!(body.contains("app_requests_total{endpoint=\"/beta\"} 1\n"));
        assert!(body.contains("app_response_time_seconds_count{endpoint=\"/alpha\"} 2\n"));
        assert!(!body.contains("endpoint=\"/metrics\""));

        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_counter_only_instruments() {
        let mut config = make_config(1, 1);
        config.instruments = InstrumentSet::Counter;
        let server = start(config).await;

        let raw = http_get(server.addr, "/").await;
        assert!(raw.starts_with("HTTP/1.1 200 OK"));

        let raw = http_get(server.addr, "/metrics").await;
        let (_, body) = split_response(&raw);
        assert!(body.contains("app_requests_total 1\n"));
        assert!(!body.contains("app_response_time_seconds"));
        assert!(!body.contains("app_active_requests"));

        let _ = server.shutdown.send(true);
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = make_config(1, 1);
        config.listen_host = "127.0.0.1".into();
        config.listen_port = taken.local_addr().unwrap().port();

        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("cannot bind"));
    }
}
