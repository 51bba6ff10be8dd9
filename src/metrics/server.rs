//! Server-side metric families: `observed_requests_accepted`,
//! `observed_requests_errored`, `observed_responses`, `responses_delay_seconds`,
//! `received_messages_size_bytes`, `sent_messages_size_bytes`.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use super::MetricsSource;

#[derive(Clone)]
pub struct ServerMetrics {
    source: MetricsSource,
    requests_accepted: Counter<u64>,
    requests_errored: Counter<u64>,
    responses: Counter<u64>,
    delay_seconds: Histogram<f64>,
    received_size_bytes: Histogram<u64>,
    sent_size_bytes: Histogram<u64>,
}

impl ServerMetrics {
    pub fn new(meter: &Meter, source: MetricsSource) -> Self {
        ServerMetrics {
            requests_accepted: super::counter(
                meter,
                source.family("observed_requests_accepted"),
                "requests the server has accepted for processing",
            ),
            requests_errored: super::counter(
                meter,
                source.family("observed_requests_errored"),
                "streams terminated by a peer reset or GOAWAY",
            ),
            responses: super::counter(
                meter,
                source.family("observed_responses"),
                "terminal stream outcomes, successful or not",
            ),
            delay_seconds: super::delay_histogram(meter, source.family("responses_delay_seconds")),
            received_size_bytes: super::size_histogram(
                meter,
                source.family("received_messages_size_bytes"),
            ),
            sent_size_bytes: super::size_histogram(meter, source.family("sent_messages_size_bytes")),
            source,
        }
    }

    /// Called when a `Stream` is created for a newly accepted request.
    pub fn record_accepted(&self, method: &str) {
        self.requests_accepted
            .add(1, &[KeyValue::new("method", method.to_string()), self.source.source_kv()]);
    }

    /// Called from `Stream::error`: the stream died to a transport reset or
    /// GOAWAY before a response could be written.
    pub fn record_errored(&self, method: &str, rst_stream_goaway_error_code: u32) {
        let attrs = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new(
                "rst_stream_goaway_error_code",
                rst_stream_goaway_error_code.to_string(),
            ),
            self.source.source_kv(),
        ];
        self.requests_errored.add(1, &attrs);
        self.responses.add(1, &attrs);
    }

    /// Called from `Stream::close`: a response was written (or dropped after
    /// the peer closed the stream first), labeled with the final status.
    pub fn record_closed(
        &self,
        method: &str,
        status_code: u32,
        delay_seconds: f64,
        received_bytes: u64,
        sent_bytes: u64,
    ) {
        let attrs = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status_code", status_code.to_string()),
            self.source.source_kv(),
        ];
        self.responses.add(1, &attrs);

        let method_attrs = [KeyValue::new("method", method.to_string()), self.source.source_kv()];
        self.delay_seconds.record(delay_seconds, &method_attrs);
        self.received_size_bytes.record(received_bytes, &method_attrs);
        self.sent_size_bytes.record(sent_bytes, &method_attrs);
    }
}
