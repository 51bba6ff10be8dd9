//! Http2Server (C8): owns the server instance, dispatches incoming streams
//! to a [`QueueDispatcher`] or runs them inline, and exposes the capability
//! interface ([`RequestHandler`]) embedders implement to shape validation,
//! response content and delay policy.

pub mod error_codes;
pub mod stream;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use h2::RecvStream;
use h2::server::SendResponse;
use http::{HeaderMap, Method, Uri};
use opentelemetry::metrics::Meter;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use crate::dispatch::{QueueDispatcher, StreamIf};
use crate::error::{Error, Result};
use crate::headers::ResponseHeader;
use crate::metrics::server::ServerMetrics;
use crate::metrics::{HistogramBuckets, MetricsSource};
use crate::rt::{Executor, TokioExecutor};
use crate::url;

pub use error_codes::StandardError;
pub use stream::RequestParts;

use stream::Stream;

/// `(status, headers, body, delay_ms)`, the output of [`RequestHandler::receive`]
/// and [`RequestHandler::receive_error`]. `status < 100` instructs
/// [`stream::Stream::commit`] to reset the stream with that HTTP/2 error
/// code instead of writing a response.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    pub status: i32,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub delay_ms: u64,
}

impl ReceiveOutcome {
    pub fn new(status: i32, headers: HeaderMap, body: Bytes, delay_ms: u64) -> Self {
        ReceiveOutcome {
            status,
            headers,
            body,
            delay_ms,
        }
    }
}

/// The capability interface a server embeds. Only [`receive`](RequestHandler::receive) is
/// mandatory; everything else has a permissive default.
pub trait RequestHandler: Send + Sync + 'static {
    /// Returns whether `method` is allowed for the request currently being
    /// validated, filling `allowed` with the methods to report in a 405's
    /// `Allow` header when it isn't.
    fn check_method_is_allowed(&self, method: &Method, allowed: &mut Vec<String>) -> bool {
        let _ = (method, allowed);
        true
    }

    fn check_method_is_implemented(&self, method: &Method) -> bool {
        let _ = method;
        true
    }

    fn check_headers(&self, headers: &HeaderMap) -> bool {
        let _ = headers;
        true
    }

    /// Whether incoming body chunks should be copied into the stream's
    /// buffer at all.
    fn receive_data_len(&self, method: &Method) -> bool {
        let _ = method;
        true
    }

    /// Whether to pre-reserve the body buffer to the server's running
    /// maximum observed body size before the first append.
    fn pre_reserve_request_body(&self) -> bool {
        true
    }

    /// Mandatory: fill in the response for a validated request.
    fn receive(&self, reception_id: u64, parts: &RequestParts, body: &[u8], reception_ts_us: u64) -> ReceiveOutcome;

    /// Default formats `{"cause":"<text>"}` (or `{}` if `error.cause` is
    /// empty) as `application/problem+json`, with `Allow`/`Location`
    /// attached when supplied.
    fn receive_error(
        &self,
        parts: &RequestParts,
        body: &[u8],
        error: StandardError,
        location: Option<&str>,
        allowed: Option<&[String]>,
    ) -> ReceiveOutcome {
        let _ = (parts, body);
        let body_json = if error.cause.is_empty() {
            "{}".to_string()
        } else {
            format!("{{\"cause\":\"{}\"}}", error.cause)
        };
        let response_header = ResponseHeader::new("", location.unwrap_or(""), allowed.map(<[String]>::to_vec).unwrap_or_default());
        let headers = response_header.build(body_json.len(), error.status);
        ReceiveOutcome::new(error.status as i32, headers, Bytes::from(body_json), 0)
    }

    /// Polled by `commit` before writing and after every scheduled wait;
    /// returning a positive microsecond count arms another wait.
    fn response_delay_timer(&self, reception_id: u64) -> u64 {
        let _ = reception_id;
        0
    }

    /// Observability hook fired when a stream terminates on a transport
    /// reset (RST_STREAM) or connection-level GOAWAY.
    fn stream_error(&self, error_code: u32, server_name: &str, reception_id: u64, parts: &RequestParts) {
        let _ = (error_code, server_name, reception_id, parts);
    }
}

/// Construction parameters (see "Server configuration" in the crate docs).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key. Only unencrypted PEM keys
    /// are currently supported; a configured passphrase is logged and
    /// otherwise ignored (see DESIGN.md).
    pub key_passphrase: Option<String>,
    pub protocol_threads: usize,
    pub worker_threads: usize,
    pub max_worker_threads: usize,
    pub queue_max_size: i64,
    pub api_name: Option<String>,
    pub api_version: Option<String>,
    pub read_keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 0,
            key_path: None,
            cert_path: None,
            key_passphrase: None,
            protocol_threads: 2,
            worker_threads: 1,
            max_worker_threads: 0,
            queue_max_size: -1,
            api_name: None,
            api_version: None,
            read_keepalive: Duration::from_secs(60),
        }
    }
}

type TimerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

struct ServerCore<H: RequestHandler> {
    name: String,
    config: ServerConfig,
    handler: Arc<H>,
    dispatcher: Option<QueueDispatcher>,
    reception_id: AtomicU64,
    max_body_size: AtomicUsize,
    metrics: Mutex<Option<ServerMetrics>>,
    executor: Mutex<Option<Arc<dyn Executor<TimerFuture> + Send + Sync>>>,
}

impl<H: RequestHandler> ServerCore<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatcher(&self) -> Option<&QueueDispatcher> {
        self.dispatcher.as_ref()
    }

    fn metrics(&self) -> Option<ServerMetrics> {
        self.metrics.lock().unwrap().clone()
    }

    fn next_reception_id(&self) -> u64 {
        self.reception_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observed_max_body_size(&self) -> usize {
        self.max_body_size.load(Ordering::Relaxed)
    }

    /// Monotonic running maximum observed request body size, read (without
    /// reservation) before the stream's first append.
    fn observe_body_len(&self, len: usize) {
        let mut current = self.max_body_size.load(Ordering::Relaxed);
        while len > current {
            match self
                .max_body_size
                .compare_exchange_weak(current, len, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn api_path_allowed(&self, path: &str) -> bool {
        match (&self.config.api_name, &self.config.api_version) {
            (Some(name), Some(version)) => {
                let prefix = format!("/{name}/{version}");
                url::match_prefix(path, &prefix)
            }
            _ => true,
        }
    }

    /// Congestion policy: only meaningful when a dispatcher
    /// exists; `busy`/`size` are the snapshot a worker observed just before
    /// releasing the dispatcher's lock.
    fn is_congested(&self, busy: usize, size: usize) -> bool {
        match &self.dispatcher {
            Some(dispatcher) => {
                self.config.queue_max_size >= 0 && busy == dispatcher.threads() && size as i64 > self.config.queue_max_size
            }
            None => false,
        }
    }

    /// Hands the delay-wait-and-commit off to the server's timer/executor
    /// context, never blocking the calling (dispatcher or protocol) thread.
    fn spawn_commit(self: Arc<Self>, stream: Stream<H>) {
        let executor = self
            .executor
            .lock()
            .unwrap()
            .clone()
            .expect("server executor not initialized before accepting streams");
        let fut: TimerFuture = Box::pin(async move { stream.commit().await });
        executor.execute(fut);
    }
}

struct Control {
    thread: std::thread::JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

/// Owns one server instance: its dedicated OS thread, multi-threaded Tokio
/// runtime (sized by `protocol_threads`), listener and connection fan-out.
/// Mirrors [`crate::client::connection::Http2Connection`]'s thread-owning
/// pattern on the server side.
pub struct Http2Server<H: RequestHandler> {
    core: Arc<ServerCore<H>>,
    control: Mutex<Option<Control>>,
}

impl<H: RequestHandler> Http2Server<H> {
    pub fn new(name: impl Into<String>, handler: H, config: ServerConfig) -> Self {
        Self::build(name, handler, config, None)
    }

    /// Like [`Http2Server::new`], but supplies the timer/executor context
    /// (§5: "a separate embedder-supplied I/O context") that
    /// `Stream::commit`'s response-delay wait runs on, instead of letting
    /// `start()` default it to the protocol runtime. Useful for embedders
    /// that want delay waits to run on their own runtime rather than
    /// compete with accept/frame processing for protocol threads.
    pub fn with_timer_context<E>(name: impl Into<String>, handler: H, config: ServerConfig, timer_context: E) -> Self
    where
        E: Executor<TimerFuture> + Send + Sync + 'static,
    {
        Self::build(name, handler, config, Some(Arc::new(timer_context) as Arc<dyn Executor<TimerFuture> + Send + Sync>))
    }

    fn build(name: impl Into<String>, handler: H, config: ServerConfig, timer_context: Option<Arc<dyn Executor<TimerFuture> + Send + Sync>>) -> Self {
        let name = name.into();
        let dispatcher = if config.worker_threads > 1 {
            Some(QueueDispatcher::new(name.clone(), config.worker_threads, config.max_worker_threads))
        } else {
            None
        };

        Http2Server {
            core: Arc::new(ServerCore {
                name,
                config,
                handler: Arc::new(handler),
                dispatcher,
                reception_id: AtomicU64::new(0),
                max_body_size: AtomicUsize::new(0),
                metrics: Mutex::new(None),
                executor: Mutex::new(timer_context),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Idempotent: a second call is a no-op.
    pub fn enable_metrics(&self, meter: &Meter, buckets: HistogramBuckets, source_label: Option<String>) {
        let mut guard = self.core.metrics.lock().unwrap();
        if guard.is_some() {
            tracing::debug!(name = %self.core.name, "metrics already enabled, ignoring");
            return;
        }
        tracing::debug!(
            name = %self.core.name,
            delay_buckets = ?buckets.delay_seconds,
            size_buckets = ?buckets.size_bytes,
            "enabling server metrics"
        );
        let source = MetricsSource::new(self.core.name.clone(), source_label);
        *guard = Some(ServerMetrics::new(meter, source));
    }

    /// Binds the listener and launches the server's dedicated thread. Blocks
    /// until the bind has either succeeded or failed, so a configuration
    /// error (bad address, port in use, bad TLS material) surfaces here
    /// rather than silently on the background thread.
    pub fn start(&self) -> Result<()> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let core = self.core.clone();

        let thread = std::thread::Builder::new()
            .name(format!("{}-h2-server", core.name()))
            .spawn(move || run_server(core, shutdown_rx, ready_tx))
            .expect("failed to spawn http/2 server thread");

        *self.control.lock().unwrap() = Some(Control {
            thread,
            shutdown_tx: Some(shutdown_tx),
        });

        ready_rx
            .recv()
            .map_err(|_| Error::new_listen("server thread exited before reporting bind result"))?
    }

    /// Idempotent: signals the dedicated thread to begin graceful shutdown.
    /// Does not block; call [`Http2Server::join`] to wait for completion.
    pub fn stop(&self) {
        if let Some(control) = self.control.lock().unwrap().as_mut() {
            if let Some(tx) = control.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Blocks until the server's thread has exited.
    pub fn join(&self) {
        let control = self.control.lock().unwrap().take();
        if let Some(control) = control {
            let _ = control.thread.join();
        }
    }
}

fn run_server<H: RequestHandler>(
    core: Arc<ServerCore<H>>,
    shutdown_rx: oneshot::Receiver<()>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let worker_threads = core.config.protocol_threads.max(1);
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            let _ = ready_tx.send(Err(Error::new_listen(err)));
            return;
        }
    };

    {
        let mut executor = core.executor.lock().unwrap();
        if executor.is_none() {
            *executor = Some(Arc::new(TokioExecutor::new(rt.handle().clone())) as Arc<dyn Executor<TimerFuture> + Send + Sync>);
        }
    }

    let tls_acceptor = match load_tls_acceptor(&core.config) {
        Ok(acceptor) => acceptor,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    rt.block_on(async move {
        let addr = format!("{}:{}", core.config.bind_addr, core.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let _ = ready_tx.send(Ok(()));
                listener
            }
            Err(err) => {
                let _ = ready_tx.send(Err(Error::new_listen(err)));
                return;
            }
        };

        tracing::info!(name = %core.name(), addr = %addr, "http/2 server listening");

        let shutdown = tokio_graceful::Shutdown::new(async move {
            let _ = shutdown_rx.await;
        });

        shutdown.spawn_task_fn(move |guard| async move {
            accept_loop(core, listener, tls_acceptor, guard).await;
        });

        shutdown.shutdown_with_limit(Duration::from_secs(30)).await.ok();
    });
}

async fn accept_loop<H: RequestHandler>(
    core: Arc<ServerCore<H>>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    guard: tokio_graceful::ShutdownGuard,
) {
    loop {
        tokio::select! {
            _ = guard.cancelled() => {
                tracing::debug!(name = %core.name(), "no longer accepting new connections");
                return;
            }
            accepted = listener.accept() => {
                let (socket, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                socket.set_nodelay(true).ok();
                let core = core.clone();
                let tls_acceptor = tls_acceptor.clone();
                guard.spawn_task_fn(move |guard| async move {
                    handle_connection(core, socket, tls_acceptor, guard).await;
                });
            }
        }
    }
}

async fn handle_connection<H: RequestHandler>(
    core: Arc<ServerCore<H>>,
    socket: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    guard: tokio_graceful::ShutdownGuard,
) {
    let result = match tls_acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls) => serve_h2(core, tls, guard).await,
            Err(err) => {
                tracing::warn!(error = %err, "tls handshake failed");
                return;
            }
        },
        None => serve_h2(core, socket, guard).await,
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "http/2 connection ended with error");
    }
}

async fn serve_h2<H, IO>(core: Arc<ServerCore<H>>, io: IO, guard: tokio_graceful::ShutdownGuard) -> Result<()>
where
    H: RequestHandler,
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let read_keepalive = core.config.read_keepalive;
    let handshake = tokio::time::timeout(read_keepalive, h2::server::Builder::new().enable_connect_protocol().handshake(io));
    let mut connection = match handshake.await {
        Ok(result) => result?,
        Err(_elapsed) => {
            tracing::debug!(name = %core.name(), "http/2 handshake timed out waiting for the client");
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            _ = guard.cancelled() => {
                connection.graceful_shutdown();
                break;
            }
            accepted = tokio::time::timeout(read_keepalive, connection.accept()) => {
                match accepted {
                    Ok(Some(Ok((request, respond)))) => {
                        let core = core.clone();
                        guard.spawn_task_fn(move |_guard| handle_request(core, request, respond));
                    }
                    Ok(Some(Err(err))) => return Err(Error::from(err)),
                    Ok(None) => return Ok(()),
                    Err(_elapsed) => {
                        tracing::debug!(name = %core.name(), "closing idle http/2 connection past its read keep-alive");
                        connection.abrupt_shutdown(h2::Reason::NO_ERROR);
                        return Ok(());
                    }
                }
            }
        }
    }

    while let Some(accepted) = connection.accept().await {
        match accepted {
            Ok((request, respond)) => {
                let core = core.clone();
                guard.spawn_task_fn(move |_guard| handle_request(core, request, respond));
            }
            Err(err) => return Err(Error::from(err)),
        }
    }
    Ok(())
}

async fn handle_request<H: RequestHandler>(core: Arc<ServerCore<H>>, request: http::Request<RecvStream>, respond: SendResponse<Bytes>) {
    let (parts, mut recv_stream) = request.into_parts();
    let request_parts = RequestParts {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
    };
    let stream = Stream::new(core.clone(), request_parts, respond);

    if let Some(metrics) = core.metrics() {
        metrics.record_accepted(stream.method().as_str());
    }

    let watcher = stream.clone();
    tokio::spawn(watcher.watch_reset());

    loop {
        match recv_stream.data().await {
            Some(Ok(chunk)) => {
                let _ = recv_stream.flow_control().release_capacity(chunk.len());
                if !chunk.is_empty() {
                    stream.append_body(&chunk);
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "error reading http/2 request body");
                stream.error(error_codes::code_for_h2_error(&err));
                return;
            }
            None => break,
        }
    }

    let reception_id = core.next_reception_id();
    stream.assign_reception_id(reception_id);

    if let Some(dispatcher) = core.dispatcher() {
        dispatcher.dispatch(Box::new(stream));
    } else {
        Box::new(stream).process(0, 0);
    }
}

fn load_tls_acceptor(config: &ServerConfig) -> Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) else {
        return Ok(None);
    };

    static INSTALL_CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    if config.key_passphrase.is_some() {
        tracing::warn!("key_passphrase configured but encrypted PEM private keys are not supported; ignoring");
    }

    let cert_file = std::fs::File::open(cert_path).map_err(Error::new_tls)?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<rustls::pki_types::CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(Error::new_tls)?;

    let key_file = std::fs::File::open(key_path).map_err(Error::new_tls)?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(Error::new_tls)?
        .ok_or_else(|| Error::new_tls("no private key found in key file"))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::new_tls)?;

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}
