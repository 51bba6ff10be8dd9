//! Owns one client-side HTTP/2 session (C5).
//!
//! Unlike the rest of the crate, which is happy to run on whatever runtime
//! the embedder drives, a connection is given its own dedicated OS thread
//! running a single-threaded Tokio runtime — mirroring the original's
//! `boost::asio::io_context` + `std::thread` pairing in `Http2Connection.cpp`.
//! That thread drives the h2 connection future to completion; the rest of
//! the crate only ever touches the connection through its `Mutex`-guarded
//! status and a cloned `SendRequest` handle.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use h2::client::SendRequest;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Connection lifecycle: NOT_OPEN -> OPEN -> CLOSED, or
/// NOT_OPEN -> CLOSED directly if the initial connect fails. CLOSED is
/// terminal for a given instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotOpen,
    Open,
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::NotOpen => "NOT_OPEN",
            Status::Open => "OPEN",
            Status::Closed => "CLOSED",
        })
    }
}

type CloseCallback = dyn Fn() + Send + Sync;

struct Shared {
    status: Status,
    send_request: Option<SendRequest<Bytes>>,
}

struct Driver {
    thread: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct Inner {
    host: String,
    port: u16,
    secure: bool,
    shared: Mutex<Shared>,
    cv: Condvar,
    close_callback: Mutex<Option<Box<CloseCallback>>>,
    driver: Mutex<Driver>,
    reconnect_lock: Mutex<()>,
}

/// One client-side HTTP/2 session over plain TCP or TLS.
///
/// Neither `Clone` nor movable out of its owning `Arc` once its I/O thread
/// is running: the whole point of the type is to own that thread and join
/// it on close. Callers share it through `Arc<Http2Connection>`.
pub struct Http2Connection {
    inner: Arc<Inner>,
}

impl Http2Connection {
    /// `(host, port, secure)` launches an owned I/O thread that drives the
    /// session to completion. The thread is spawned synchronously but the
    /// handshake itself runs asynchronously; callers that need to know the
    /// outcome should follow up with [`Http2Connection::wait_to_be_connected`].
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        let host = host.into();
        let inner = Arc::new(Inner {
            host: host.clone(),
            port,
            secure,
            shared: Mutex::new(Shared {
                status: Status::NotOpen,
                send_request: None,
            }),
            cv: Condvar::new(),
            close_callback: Mutex::new(None),
            driver: Mutex::new(Driver {
                thread: None,
                shutdown: None,
            }),
            reconnect_lock: Mutex::new(()),
        });

        spawn_driver(&inner);

        Http2Connection { inner }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    pub fn status(&self) -> Status {
        self.inner.shared.lock().unwrap().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Open
    }

    /// A cloned handle to submit requests on, if the session is currently
    /// open. `h2::client::SendRequest` is cheaply `Clone`, so this can be
    /// called once per request.
    pub fn session(&self) -> Option<SendRequest<Bytes>> {
        self.inner.shared.lock().unwrap().send_request.clone()
    }

    /// Register a callback invoked (on the connection's own I/O thread)
    /// whenever the connection transitions to CLOSED.
    pub fn on_close<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.inner.close_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Block until status != NOT_OPEN or `timeout` elapses. Returns whether
    /// the connection ended up OPEN.
    pub fn wait_to_be_connected(&self, timeout: Duration) -> bool {
        let guard = self.inner.shared.lock().unwrap();
        let (guard, _) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |s| s.status == Status::NotOpen)
            .unwrap();
        guard.status == Status::Open
    }

    /// Block until status != OPEN or `timeout` elapses. Returns whether the
    /// connection ended up disconnected.
    pub fn wait_to_be_disconnected(&self, timeout: Duration) -> bool {
        let guard = self.inner.shared.lock().unwrap();
        let (guard, _) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |s| s.status == Status::Open)
            .unwrap();
        guard.status != Status::Open
    }

    /// Idempotent: transitions to CLOSED, shuts down the session, stops the
    /// I/O thread and joins it.
    pub fn close(&self) {
        close_driver(&self.inner);
    }

    /// Replace the session with a freshly dialed one, implementing
    /// best-effort, non-blocking reconnection. Returns `true` if this call
    /// actually performed the reconnect (another concurrent caller may have
    /// already been doing so, in which case this returns `false`
    /// immediately without blocking).
    pub fn try_reconnect(&self) -> bool {
        let Ok(_guard) = self.inner.reconnect_lock.try_lock() else {
            return false;
        };

        close_driver(&self.inner);
        {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.status = Status::NotOpen;
            shared.send_request = None;
        }
        spawn_driver(&self.inner);
        true
    }
}

impl fmt::Display for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{} [{}]",
            if self.inner.secure { "https" } else { "http" },
            self.inner.host,
            self.inner.port,
            self.status()
        )
    }
}

impl Drop for Http2Connection {
    fn drop(&mut self) {
        close_driver(&self.inner);
    }
}

fn close_driver(inner: &Arc<Inner>) {
    let mut driver = inner.driver.lock().unwrap();
    if let Some(shutdown) = driver.shutdown.take() {
        let _ = shutdown.send(());
    }
    if let Some(thread) = driver.thread.take() {
        drop(driver);
        let _ = thread.join();
    }
}

fn spawn_driver(inner: &Arc<Inner>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let thread_inner = inner.clone();
    let name = format!("{}:{}-h2-conn", inner.host, inner.port);

    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || run_session(thread_inner, shutdown_rx))
        .expect("failed to spawn http/2 connection thread");

    let mut driver = inner.driver.lock().unwrap();
    driver.thread = Some(thread);
    driver.shutdown = Some(shutdown_tx);
}

fn run_session(inner: Arc<Inner>, shutdown_rx: oneshot::Receiver<()>) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(error = %err, "failed to build http/2 connection runtime");
            set_closed(&inner);
            return;
        }
    };

    rt.block_on(drive(inner, shutdown_rx));
}

async fn drive(inner: Arc<Inner>, mut shutdown_rx: oneshot::Receiver<()>) {
    let handshake = connect_and_handshake(&inner.host, inner.port, inner.secure);
    let (send_request, connection) = match handshake.await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(
                host = %inner.host, port = inner.port, error = %err,
                "http/2 connect failed"
            );
            set_closed(&inner);
            return;
        }
    };

    {
        let mut shared = inner.shared.lock().unwrap();
        shared.status = Status::Open;
        shared.send_request = Some(send_request);
    }
    inner.cv.notify_all();
    tracing::info!(host = %inner.host, port = inner.port, "http/2 connection established");

    tokio::select! {
        _ = &mut shutdown_rx => {
            tracing::debug!(host = %inner.host, port = inner.port, "closing connection on explicit request");
        }
        result = &mut connection => {
            if let Err(err) = result {
                tracing::warn!(host = %inner.host, port = inner.port, error = %err, "http/2 connection driver ended with error");
            }
        }
    }

    set_closed(&inner);
}

fn set_closed(inner: &Arc<Inner>) {
    let already_closed = {
        let mut shared = inner.shared.lock().unwrap();
        let was_closed = shared.status == Status::Closed;
        shared.status = Status::Closed;
        shared.send_request = None;
        was_closed
    };
    inner.cv.notify_all();
    if !already_closed {
        if let Some(cb) = inner.close_callback.lock().unwrap().as_ref() {
            cb();
        }
    }
}

type ConnectionFuture = Pin<Box<dyn Future<Output = std::result::Result<(), h2::Error>> + Send>>;

/// Dials `host:port` and runs the h2 client handshake. The returned future
/// drives the connection and is type-erased so the caller doesn't need to
/// be generic over plain-TCP vs. TLS streams.
async fn connect_and_handshake(
    host: &str,
    port: u16,
    secure: bool,
) -> Result<(SendRequest<Bytes>, ConnectionFuture)> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|err| Error::new_not_connected().with(err))?;
    tcp.set_nodelay(true).ok();

    if secure {
        let connector = tls_connector();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| Error::new_tls(format!("invalid server name '{host}': {err}")))?;
        let tls = connector.connect(server_name, tcp).await.map_err(Error::new_tls)?;
        let (send_request, connection) = h2::client::handshake(tls).await.map_err(Error::from)?;
        Ok((send_request, Box::pin(connection)))
    } else {
        let (send_request, connection) = h2::client::handshake(tcp).await.map_err(Error::from)?;
        Ok((send_request, Box::pin(connection)))
    }
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    static INSTALL_CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_not_open_and_reaches_closed_when_unreachable() {
        // Port 0 always fails to connect immediately, driving NOT_OPEN -> CLOSED
        // without ever reaching OPEN, .
        let conn = Http2Connection::new("127.0.0.1", 0, false);
        assert!(!conn.wait_to_be_connected(Duration::from_millis(500)));
        assert_eq!(conn.status(), Status::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let conn = Http2Connection::new("127.0.0.1", 0, false);
        conn.wait_to_be_connected(Duration::from_millis(500));
        conn.close();
        conn.close();
        assert_eq!(conn.status(), Status::Closed);
    }

    #[test]
    fn display_contains_scheme_host_port() {
        let conn = Http2Connection::new("example.invalid", 443, true);
        let text = conn.to_string();
        assert!(text.contains("https://example.invalid:443"));
    }
}
