//! Per-request server-side state (C7): accumulates the request body, runs
//! validation and the user handler, schedules an optional response delay,
//! commits the response, and updates metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use h2::server::SendResponse;
use h2::Reason;
use http::{HeaderMap, Method, Response as HttpResponse, Uri};
use tokio::sync::Notify;

use crate::dispatch::StreamIf;
use crate::server::error_codes::{self, METHOD_NOT_ALLOWED, METHOD_NOT_IMPLEMENTED, UNSUPPORTED_MEDIA_TYPE, WRONG_API_NAME_OR_VERSION};
use crate::server::{ReceiveOutcome, RequestHandler, ServerCore};
use crate::timestamp::now_micros;

/// The immutable parts of the incoming request a [`RequestHandler`] sees.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// The one terminal state a stream may reach: either a normal close (with
/// whatever status was written, or none if the stream was reset before a
/// response existed) or a transport-level error. Mutually exclusive by
/// construction — see [`Shared::terminal`].
#[derive(Debug, Clone, Copy)]
enum Terminal {
    Closed { status_code: u16 },
    Errored { rst_stream_goaway_error_code: u32 },
}

struct Shared {
    terminal: Option<Terminal>,
    outcome: Option<ReceiveOutcome>,
    need_timer: bool,
    delay_us: u64,
}

struct Inner<H: RequestHandler> {
    server: Arc<ServerCore<H>>,
    parts: RequestParts,
    reception_id: AtomicU64,
    reception_ts_us: AtomicU64,
    body: Mutex<BytesMut>,
    respond: Mutex<Option<SendResponse<Bytes>>>,
    shared: Mutex<Shared>,
    /// Notified on every terminal transition, so the reset watcher (see
    /// [`Stream::watch_reset`]) stops polling `poll_reset` once the stream
    /// is done rather than parking forever on a connection that no longer
    /// wakes it.
    terminal_notify: Notify,
}

/// A reference-counted handle to one request's server-side state, shared
/// between the connection task (which feeds it body chunks and eventually
/// signals close/error) and whichever thread runs the user handler.
pub struct Stream<H: RequestHandler> {
    inner: Arc<Inner<H>>,
}

impl<H: RequestHandler> Clone for Stream<H> {
    fn clone(&self) -> Self {
        Stream { inner: self.inner.clone() }
    }
}

impl<H: RequestHandler> Stream<H> {
    pub(crate) fn new(server: Arc<ServerCore<H>>, parts: RequestParts, respond: SendResponse<Bytes>) -> Self {
        Stream {
            inner: Arc::new(Inner {
                server,
                parts,
                reception_id: AtomicU64::new(0),
                reception_ts_us: AtomicU64::new(0),
                body: Mutex::new(BytesMut::new()),
                respond: Mutex::new(Some(respond)),
                shared: Mutex::new(Shared {
                    terminal: None,
                    outcome: None,
                    need_timer: false,
                    delay_us: 0,
                }),
                terminal_notify: Notify::new(),
            }),
        }
    }

    pub(crate) fn method(&self) -> &Method {
        &self.inner.parts.method
    }

    /// Append a non-empty body chunk, growing the buffer to the server's
    /// running maximum the first time if pre-reservation is enabled.
    pub(crate) fn append_body(&self, chunk: &[u8]) {
        if !self.inner.server.handler.receive_data_len(self.method()) {
            return;
        }
        let mut body = self.inner.body.lock().unwrap();
        if body.capacity() == 0 && self.inner.server.handler.pre_reserve_request_body() {
            body.reserve(self.inner.server.observed_max_body_size());
        }
        body.extend_from_slice(chunk);
        self.inner.server.observe_body_len(chunk.len());
    }

    pub(crate) fn assign_reception_id(&self, id: u64) {
        self.inner.reception_id.store(id, Ordering::SeqCst);
    }

    /// `reception(congestion)`: validates and calls the
    /// user handler (or `receive_error` directly on congestion/validation
    /// failure), then computes whether a response delay needs to be armed.
    pub(crate) fn reception(&self, congestion: bool) {
        let reception_ts_us = now_micros();
        self.inner.reception_ts_us.store(reception_ts_us, Ordering::SeqCst);
        let reception_id = self.inner.reception_id.load(Ordering::SeqCst);
        let handler = &self.inner.server.handler;
        let parts = &self.inner.parts;
        let body = self.inner.body.lock().unwrap();

        let run_handler = std::panic::AssertUnwindSafe(|| {
            if congestion {
                handler.receive_error(parts, &body, error_codes::SERVICE_UNAVAILABLE, None, None)
            } else {
                let mut allowed = Vec::new();
                if !handler.check_method_is_allowed(&parts.method, &mut allowed) {
                    handler.receive_error(parts, &body, METHOD_NOT_ALLOWED, None, Some(&allowed))
                } else if !handler.check_method_is_implemented(&parts.method) {
                    handler.receive_error(parts, &body, METHOD_NOT_IMPLEMENTED, None, None)
                } else if !handler.check_headers(&parts.headers) {
                    handler.receive_error(parts, &body, UNSUPPORTED_MEDIA_TYPE, None, None)
                } else if !self.inner.server.api_path_allowed(parts.uri.path()) {
                    handler.receive_error(parts, &body, WRONG_API_NAME_OR_VERSION, None, None)
                } else {
                    handler.receive(reception_id, parts, &body, reception_ts_us)
                }
            }
        });

        // user handlers may panic; the worker logs and falls back to
        // a 500 rather than taking down the dispatcher thread.
        let outcome = match std::panic::catch_unwind(run_handler) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(&payload);
                tracing::error!(name = %self.inner.server.name(), reception_id, error = %message, "user request handler panicked");
                handler.receive_error(parts, &body, error_codes::SYSTEM_FAILURE, None, None)
            }
        };
        drop(body);

        let (need_timer, delay_us) = self.compute_delay(&outcome, reception_id, reception_ts_us);

        let mut shared = self.inner.shared.lock().unwrap();
        shared.outcome = Some(outcome);
        shared.need_timer = need_timer;
        shared.delay_us = delay_us;
    }

    /// Two-stage delay composition: the per-request `delay_ms` runs first,
    /// with the processing-time correction clamped at zero so a slow handler
    /// never arms a negative wait; only when it's absent do we consult the
    /// server-level poll hook.
    fn compute_delay(&self, outcome: &ReceiveOutcome, reception_id: u64, reception_ts_us: u64) -> (bool, u64) {
        if outcome.delay_ms > 0 {
            let requested_us = outcome.delay_ms.saturating_mul(1000);
            let elapsed_us = now_micros().saturating_sub(reception_ts_us);
            let delay_us = requested_us.saturating_sub(elapsed_us);
            return (true, delay_us);
        }
        let polled_us = self.inner.server.handler.response_delay_timer(reception_id);
        if polled_us > 0 {
            (true, polled_us)
        } else {
            (false, 0)
        }
    }

    /// `commit()`: waits out any armed delay (re-polling the
    /// server hook until it stops requesting more), then writes the
    /// response — or drops it silently if the stream already terminated.
    /// Runs on the server's timer/executor context, never on a protocol or
    /// worker thread, so it's safe for this to sleep.
    pub(crate) async fn commit(self) {
        loop {
            let (need_timer, delay_us) = {
                let shared = self.inner.shared.lock().unwrap();
                (shared.need_timer, shared.delay_us)
            };
            if !need_timer {
                break;
            }
            if delay_us > 0 {
                tokio::time::sleep(Duration::from_micros(delay_us)).await;
            }
            if self.is_terminal() {
                return;
            }
            let reception_id = self.inner.reception_id.load(Ordering::SeqCst);
            let polled_us = self.inner.server.handler.response_delay_timer(reception_id);
            let mut shared = self.inner.shared.lock().unwrap();
            if polled_us > 0 {
                shared.need_timer = true;
                shared.delay_us = polled_us;
            } else {
                shared.need_timer = false;
                shared.delay_us = 0;
            }
        }

        if self.is_terminal() {
            return;
        }
        self.write_response();
    }

    fn is_terminal(&self) -> bool {
        self.inner.shared.lock().unwrap().terminal.is_some()
    }

    /// Writes (or resets) the response, then transitions to `Closed`.
    /// `status_code < 100` means "reset the stream with this HTTP/2 error
    /// code instead of writing a response".
    fn write_response(&self) {
        let outcome = {
            let shared = self.inner.shared.lock().unwrap();
            match &shared.outcome {
                Some(outcome) => outcome.clone(),
                None => return,
            }
        };

        let mut respond_guard = self.inner.respond.lock().unwrap();
        let Some(mut respond) = respond_guard.take() else {
            return;
        };

        if outcome.status < 100 {
            let reason = error_codes::reason_for_code(outcome.status.unsigned_abs());
            respond.send_reset(reason);
            drop(respond_guard);
            self.close(0);
            return;
        }

        let status_code = outcome.status as u16;
        let status = http::StatusCode::from_u16(status_code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = HttpResponse::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            *headers = outcome.headers.clone();
        }
        let response = match builder.body(()) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "failed to build http/2 response");
                drop(respond_guard);
                self.close(500);
                return;
            }
        };

        let end_of_stream = outcome.body.is_empty();
        match respond.send_response(response, end_of_stream) {
            Ok(mut send_stream) => {
                if !end_of_stream {
                    if let Err(err) = send_stream.send_data(outcome.body.clone(), true) {
                        tracing::warn!(error = %err, "failed writing http/2 response body, peer likely reset the stream");
                        drop(respond_guard);
                        self.error(error_codes::code_for_h2_error(&err));
                        return;
                    }
                }
                drop(respond_guard);
                self.close(status_code);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed writing http/2 response head, peer likely reset the stream");
                drop(respond_guard);
                self.error(error_codes::code_for_h2_error(&err));
            }
        }
    }

    /// `close(status_code)`: the protocol loop's close callback with no
    /// transport error. Called either by `write_response` right after a
    /// successful write (with the status that was just written) or by the
    /// reset watcher when the peer's stream terminated with `NO_ERROR`
    /// before any response existed (status 0). A no-op once a terminal
    /// state has already been recorded, either by a prior call or a racing
    /// `error()`.
    pub(crate) fn close(&self, status_code: u16) {
        let already = {
            let shared = self.inner.shared.lock().unwrap();
            shared.terminal.is_some()
        };
        if !already {
            self.finish(Terminal::Closed { status_code });
        }
    }

    /// `error(error_code)`: the protocol loop's close callback on a
    /// RST_STREAM/GOAWAY from the peer.
    pub(crate) fn error(&self, error_code: u32) {
        let already = {
            let shared = self.inner.shared.lock().unwrap();
            shared.terminal.is_some()
        };
        if already {
            return;
        }
        self.finish(Terminal::Errored {
            rst_stream_goaway_error_code: error_code,
        });
        self.inner.server.handler.stream_error(
            error_code,
            self.inner.server.name(),
            self.inner.reception_id.load(Ordering::SeqCst),
            &self.inner.parts,
        );
    }

    fn finish(&self, terminal: Terminal) {
        let already = {
            let mut shared = self.inner.shared.lock().unwrap();
            let was_set = shared.terminal.is_some();
            if !was_set {
                shared.terminal = Some(terminal);
            }
            was_set
        };
        if already {
            return;
        }

        let now_us = now_micros();
        let reception_ts_us = self.inner.reception_ts_us.load(Ordering::SeqCst);
        let delay_seconds = now_us.saturating_sub(reception_ts_us) as f64 / 1_000_000.0;
        let received_bytes = self.inner.body.lock().unwrap().len() as u64;
        let sent_bytes = {
            let shared = self.inner.shared.lock().unwrap();
            shared.outcome.as_ref().map(|o| o.body.len()).unwrap_or(0) as u64
        };
        let method = self.inner.parts.method.as_str();

        if let Some(metrics) = self.inner.server.metrics() {
            match terminal {
                Terminal::Closed { status_code } => {
                    metrics.record_closed(method, status_code as u32, delay_seconds, received_bytes, sent_bytes);
                }
                Terminal::Errored {
                    rst_stream_goaway_error_code,
                } => {
                    metrics.record_errored(method, rst_stream_goaway_error_code);
                }
            }
        }

        self.inner.terminal_notify.notify_one();
    }

    fn poll_stream_reset(&self, cx: &mut Context<'_>) -> Poll<Option<std::result::Result<Reason, h2::Error>>> {
        let mut respond_guard = self.inner.respond.lock().unwrap();
        match respond_guard.as_mut() {
            Some(respond) => respond.poll_reset(cx).map(Some),
            None => Poll::Ready(None),
        }
    }

    /// Watches the peer side of the response stream for a RST_STREAM/GOAWAY
    /// that arrives before `write_response` has taken `respond` out of its
    /// slot — i.e. while the handler is still running or the response delay
    /// is still armed. Drives the same `close()`/`error()` callbacks the
    /// protocol loop uses, so a mid-flight reset is observed instead of
    /// `commit()` waking up, finding no terminal state recorded, and trying
    /// to write a response nobody will read. Returns once the stream has
    /// reached a terminal state by any path.
    pub(crate) async fn watch_reset(self) {
        loop {
            let notified = self.inner.terminal_notify.notified();
            tokio::select! {
                biased;
                () = notified => return,
                polled = std::future::poll_fn(|cx| self.poll_stream_reset(cx)) => {
                    match polled {
                        Some(Ok(reason)) if reason == Reason::NO_ERROR => {
                            self.close(0);
                            return;
                        }
                        Some(Ok(reason)) => {
                            self.error(error_codes::code_for_reason(reason));
                            return;
                        }
                        Some(Err(err)) => {
                            self.error(error_codes::code_for_h2_error(&err));
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Best-effort extraction of a human-readable message from a caught panic
/// payload (the common `&str`/`String` cases; anything else is reported
/// generically).
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<H: RequestHandler> StreamIf for Stream<H> {
    /// Runs on a dispatcher worker thread (or, for inline servers, directly
    /// on the protocol task). Applies the congestion policy, runs
    /// `reception`, then hands the stream off to the executor for the
    /// delay wait and commit — freeing this thread immediately.
    fn process(self: Box<Self>, busy_consumers: usize, queue_size: usize) {
        let congestion = self.inner.server.is_congested(busy_consumers, queue_size);
        self.reception(congestion);
        let server = self.inner.server.clone();
        server.spawn_commit(*self);
    }
}
