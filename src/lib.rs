//! h2flow: an HTTP/2 communications framework built on top of the [`h2`]
//! crate, providing a worker-pool-dispatching server with response-delay
//! scheduling, congestion control and metrics, and a client with a
//! persistent session, reconnection and per-call timeouts.
//!
//! The server and client halves are independent; embedders typically only
//! depend on one. Both share the same error type, the same header/URL
//! helpers, and the same metrics shape (an opaque family of OpenTelemetry
//! counters/histograms per instance).

pub mod client;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod metrics;
pub mod rt;
pub mod server;
mod timestamp;
pub mod url;

pub use client::{Http2Client, Http2Connection, NoopTimeoutHook, Response, ResponseTimeoutHook, Status};
pub use client::{STATUS_CONNECTION_ERROR, STATUS_STREAM_CLOSED, STATUS_SUBMIT_ERROR, STATUS_TIMEOUT};
pub use dispatch::{QueueDispatcher, StreamIf};
pub use error::{Error, Result};
pub use headers::{Http2Headers, ResponseHeader};
pub use server::{Http2Server, ReceiveOutcome, RequestHandler, RequestParts, ServerConfig};
pub use server::error_codes::StandardError;
