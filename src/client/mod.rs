//! Http2Client (C6): a façade over [`Http2Connection`] that turns a single
//! persistent session into a request/response call with a per-call timeout,
//! late-answer suppression and best-effort reconnection.

pub mod connection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use h2::client::SendRequest;
use http::{HeaderMap, Method, Request};
use opentelemetry::metrics::Meter;
use tokio::sync::oneshot;

use crate::metrics::client::ClientMetrics;
use crate::metrics::{HistogramBuckets, MetricsSource};
use crate::timestamp::now_micros;

pub use connection::{Http2Connection, Status};

/// Virtual extension point invoked when a request elapses its timeout.
/// Mirrors the original's `responseTimeout()` hook; the default does
/// nothing beyond what `send` itself already does (bump the metric, return
/// the `-2` sentinel).
pub trait ResponseTimeoutHook: Send + Sync + 'static {
    fn response_timeout(&self, method: &Method, path: &str) {
        let _ = (method, path);
    }
}

/// The hook used by [`Http2Client::new`] when the caller doesn't need one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimeoutHook;

impl ResponseTimeoutHook for NoopTimeoutHook {}

/// Client-side response value. `status` carries either a real HTTP
/// status (>= 100) or one of the framework's sentinels: -1 connection
/// error/not open, -2 timeout, -3 submit error, -4 stream closed
/// prematurely.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: i32,
    pub body: String,
    pub headers: HeaderMap,
    pub sent_at_us: u64,
    pub received_at_us: u64,
}

pub const STATUS_CONNECTION_ERROR: i32 = -1;
pub const STATUS_TIMEOUT: i32 = -2;
pub const STATUS_SUBMIT_ERROR: i32 = -3;
pub const STATUS_STREAM_CLOSED: i32 = -4;

impl Response {
    fn sentinel(status: i32) -> Self {
        let now = now_micros();
        Response {
            status,
            body: String::new(),
            headers: HeaderMap::new(),
            sent_at_us: now,
            received_at_us: now,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.status < 100
    }
}

/// Façade over [`Http2Connection`]: send request, handle timeout, reconnect,
/// metrics (C6). Generic over the response-timeout hook so embedders can
/// plug in their own without paying for a trait object when they don't need
/// one.
pub struct Http2Client<H: ResponseTimeoutHook = NoopTimeoutHook> {
    name: String,
    connection: Arc<Http2Connection>,
    metrics: Mutex<Option<ClientMetrics>>,
    hooks: H,
}

impl Http2Client<NoopTimeoutHook> {
    /// `(name, host, port, secure)`: creates and owns an [`Http2Connection`].
    /// Doesn't throw; a failed initial connect is logged by the connection
    /// itself and surfaces to the caller as `-1` on the next `send`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self::with_hooks(name, host, port, secure, NoopTimeoutHook)
    }
}

impl<H: ResponseTimeoutHook> Http2Client<H> {
    pub fn with_hooks(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        secure: bool,
        hooks: H,
    ) -> Self {
        let name = name.into();
        Http2Client {
            connection: Arc::new(Http2Connection::new(host, port, secure)),
            metrics: Mutex::new(None),
            hooks,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_status(&self) -> Status {
        self.connection.status()
    }

    /// Idempotent: a second call is a no-op. `buckets` documents the
    /// histogram boundaries the embedder should register on its
    /// `SdkMeterProvider` via a `View` — the OpenTelemetry `Meter` API has
    /// no per-instrument way to set them directly.
    pub fn enable_metrics(&self, meter: &Meter, buckets: HistogramBuckets, source_label: Option<String>) {
        let mut guard = self.metrics.lock().unwrap();
        if guard.is_some() {
            tracing::debug!(name = %self.name, "metrics already enabled, ignoring");
            return;
        }
        tracing::debug!(
            name = %self.name,
            delay_buckets = ?buckets.delay_seconds,
            size_buckets = ?buckets.size_bytes,
            "enabling client metrics"
        );
        let source = MetricsSource::new(self.name.clone(), source_label);
        *guard = Some(ClientMetrics::new(meter, source));
    }

    fn metrics(&self) -> Option<ClientMetrics> {
        self.metrics.lock().unwrap().clone()
    }

    /// `send` algorithm:
    /// 1. reconnect-and-fail-fast if not OPEN,
    /// 2. drop body for GET/DELETE/HEAD,
    /// 3. submit on a background task so it outlives this call's timeout,
    /// 4. race the caller's `timeout` against the background task's result.
    pub async fn send(
        &self,
        method: Method,
        path: impl Into<String>,
        body: Bytes,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Response {
        let path = path.into();
        let method_label = method.as_str().to_string();

        let send_request = match self.ready_session() {
            Some(sr) => sr,
            None => {
                self.connection.try_reconnect();
                if let Some(metrics) = self.metrics() {
                    metrics.record_unsent(&method_label);
                }
                return Response::sentinel(STATUS_CONNECTION_ERROR);
            }
        };

        let body = if matches!(method, Method::GET | Method::DELETE | Method::HEAD) {
            Bytes::new()
        } else {
            body
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path.clone())
            .version(http::Version::HTTP_2);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let request = match builder.body(()) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(error = %err, "failed to build http/2 request");
                return Response::sentinel(STATUS_SUBMIT_ERROR);
            }
        };

        let sent_at_us = now_micros();
        let metrics = self.metrics();
        if let Some(metrics) = &metrics {
            metrics.record_sent(&method_label, body.len() as u64);
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = oneshot::channel();

        let task_metrics = metrics.clone();
        let task_method_label = method_label.clone();
        let task_timed_out = timed_out.clone();
        let task_connection = self.connection.clone();
        tokio::spawn(async move {
            let response = submit_and_await(
                send_request,
                request,
                body,
                sent_at_us,
                task_method_label,
                task_metrics,
                task_timed_out,
                task_connection,
            )
            .await;
            let _ = result_tx.send(response);
        });

        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::sentinel(STATUS_STREAM_CLOSED),
            Err(_elapsed) => {
                timed_out.store(true, Ordering::SeqCst);
                if let Some(metrics) = &metrics {
                    metrics.record_timedout(&method_label);
                }
                self.hooks.response_timeout(&method, &path);
                Response::sentinel(STATUS_TIMEOUT)
            }
        }
    }

    /// Step 1 of `send`: only attempt to hand out a session when the
    /// connection is actually OPEN, so the caller falls straight through to
    /// the reconnect-and-`-1` path otherwise.
    fn ready_session(&self) -> Option<SendRequest<Bytes>> {
        if !self.connection.is_connected() {
            return None;
        }
        self.connection.session()
    }
}

async fn submit_and_await(
    mut send_request: SendRequest<Bytes>,
    request: Request<()>,
    body: Bytes,
    sent_at_us: u64,
    method_label: String,
    metrics: Option<ClientMetrics>,
    timed_out: Arc<AtomicBool>,
    connection: Arc<Http2Connection>,
) -> Response {
    if let Err(err) = std::future::poll_fn(|cx| send_request.poll_ready(cx)).await {
        tracing::warn!(error = %err, "http/2 session not ready for request");
        connection.close();
        return Response::sentinel(STATUS_SUBMIT_ERROR);
    }

    let end_of_stream = body.is_empty();
    let (response_fut, mut send_stream) = match send_request.send_request(request, end_of_stream) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(error = %err, "failed to submit http/2 request");
            connection.close();
            return Response::sentinel(STATUS_SUBMIT_ERROR);
        }
    };

    if !end_of_stream {
        if let Err(err) = send_stream.send_data(body, true) {
            tracing::warn!(error = %err, "failed to write request body");
            connection.close();
            return Response::sentinel(STATUS_SUBMIT_ERROR);
        }
    }

    let response = match response_fut.await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "stream closed before a response was received");
            return Response::sentinel(STATUS_STREAM_CLOSED);
        }
    };

    if timed_out.load(Ordering::SeqCst) {
        return Response::sentinel(STATUS_TIMEOUT);
    }

    let status = response.status().as_u16() as i32;
    let headers = response.headers().clone();
    let mut recv_stream = response.into_body();
    let mut body_bytes = Vec::new();

    while let Some(chunk) = recv_stream.data().await {
        match chunk {
            Ok(bytes) => {
                let _ = recv_stream.flow_control().release_capacity(bytes.len());
                body_bytes.extend_from_slice(&bytes);
            }
            Err(err) => {
                tracing::warn!(error = %err, "error reading http/2 response body");
                break;
            }
        }
        if timed_out.load(Ordering::SeqCst) {
            return Response::sentinel(STATUS_TIMEOUT);
        }
    }

    let received_at_us = now_micros();
    if timed_out.load(Ordering::SeqCst) {
        return Response::sentinel(STATUS_TIMEOUT);
    }

    if let Some(metrics) = &metrics {
        let delay_seconds = received_at_us.saturating_sub(sent_at_us) as f64 / 1_000_000.0;
        metrics.record_received(&method_label, status, delay_seconds, body_bytes.len() as u64);
    }

    Response {
        status,
        body: String::from_utf8_lossy(&body_bytes).into_owned(),
        headers,
        sent_at_us,
        received_at_us,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_statuses_are_below_100() {
        assert!(Response::sentinel(STATUS_CONNECTION_ERROR).is_sentinel());
        assert!(Response::sentinel(STATUS_TIMEOUT).is_sentinel());
        assert!(Response::sentinel(STATUS_SUBMIT_ERROR).is_sentinel());
        assert!(Response::sentinel(STATUS_STREAM_CLOSED).is_sentinel());
    }

    #[tokio::test]
    async fn send_to_unreachable_host_returns_connection_error() {
        let client = Http2Client::new("test-client", "127.0.0.1", 0, false);
        // give the connection thread a moment to observe the failed connect.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let response = client
            .send(
                Method::GET,
                "/x",
                Bytes::new(),
                HeaderMap::new(),
                Duration::from_millis(200),
            )
            .await;
        assert_eq!(response.status, STATUS_CONNECTION_ERROR);
    }
}
