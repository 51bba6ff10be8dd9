//! Client-side metric families: `observed_requests_sents`,
//! `observed_requests_unsents`, `observed_responses_received`,
//! `observed_responses_timedout`, `responses_delay_seconds`,
//! `sent_messages_size_bytes`, `received_messages_size_bytes`.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use super::MetricsSource;

#[derive(Clone)]
pub struct ClientMetrics {
    source: MetricsSource,
    requests_sent: Counter<u64>,
    requests_unsent: Counter<u64>,
    responses_received: Counter<u64>,
    responses_timedout: Counter<u64>,
    delay_seconds: Histogram<f64>,
    sent_size_bytes: Histogram<u64>,
    received_size_bytes: Histogram<u64>,
}

impl ClientMetrics {
    pub fn new(meter: &Meter, source: MetricsSource) -> Self {
        ClientMetrics {
            requests_sent: super::counter(
                meter,
                source.family("observed_requests_sents"),
                "requests successfully submitted to the session",
            ),
            requests_unsent: super::counter(
                meter,
                source.family("observed_requests_unsents"),
                "requests that could not be submitted because the connection was not open",
            ),
            responses_received: super::counter(
                meter,
                source.family("observed_responses_received"),
                "responses received before the caller's timeout elapsed",
            ),
            responses_timedout: super::counter(
                meter,
                source.family("observed_responses_timedout"),
                "requests for which the caller's timeout elapsed first",
            ),
            delay_seconds: super::delay_histogram(meter, source.family("responses_delay_seconds")),
            sent_size_bytes: super::size_histogram(meter, source.family("sent_messages_size_bytes")),
            received_size_bytes: super::size_histogram(
                meter,
                source.family("received_messages_size_bytes"),
            ),
            source,
        }
    }

    /// Called from `send` step 1 when the connection isn't open.
    pub fn record_unsent(&self, method: &str) {
        self.requests_unsent
            .add(1, &[KeyValue::new("method", method.to_string()), self.source.source_kv()]);
    }

    /// Called from `send` step 3, before handing the request to the session.
    pub fn record_sent(&self, method: &str, body_bytes: u64) {
        let attrs = [KeyValue::new("method", method.to_string()), self.source.source_kv()];
        self.requests_sent.add(1, &attrs);
        self.sent_size_bytes.record(body_bytes, &attrs);
    }

    /// Called from `on_response`, when the response arrives before the timeout.
    pub fn record_received(&self, method: &str, status: i32, delay_seconds: f64, body_bytes: u64) {
        let attrs = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status_code", status.to_string()),
            self.source.source_kv(),
        ];
        self.responses_received.add(1, &attrs);

        let method_attrs = [KeyValue::new("method", method.to_string()), self.source.source_kv()];
        self.delay_seconds.record(delay_seconds, &method_attrs);
        self.received_size_bytes.record(body_bytes, &method_attrs);
    }

    /// Called when `send`'s wait on the future elapses first.
    pub fn record_timedout(&self, method: &str) {
        self.responses_timedout
            .add(1, &[KeyValue::new("method", method.to_string()), self.source.source_kv()]);
    }
}
