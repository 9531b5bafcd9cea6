//! Prometheus metrics for the data path.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::{
    counter::Counter, family::Family, gauge::Gauge, histogram::Histogram,
};
use prometheus_client::registry::Registry;
use std::time::Duration;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct RequestLabels {
    pub method: String,
    pub status: StatusFamily,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct MethodLabels {
    pub method: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ErrorLabels {
    pub kind: &'static str,
}

/// An HTTP status bucketed into its hundreds family ("2xx", "5xx", ...).
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct StatusFamily(u16);

impl From<http::StatusCode> for StatusFamily {
    fn from(status: http::StatusCode) -> Self {
        Self(status.as_u16() / 100)
    }
}

impl EncodeLabelValue for StatusFamily {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelValueEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use std::fmt::Write;
        write!(encoder, "{}xx", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Metrics {
    inbound_requests: Family<RequestLabels, Counter>,
    inbound_request_duration: Family<MethodLabels, Histogram>,
    headers_propagated: Counter,
    upstream_errors: Family<ErrorLabels, Counter>,
    rate_limited: Counter,
    active_connections: Gauge,
}

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let inbound_requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "inbound_requests",
            "Requests handled by the forwarder listener",
            inbound_requests.clone(),
        );

        let inbound_request_duration =
            Family::<MethodLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ])
            });
        reg.register(
            "inbound_request_duration_seconds",
            "Time spent handling a request",
            inbound_request_duration.clone(),
        );

        let headers_propagated = Counter::default();
        reg.register(
            "headers_propagated",
            "Header values recorded into request scopes",
            headers_propagated.clone(),
        );

        let upstream_errors = Family::<ErrorLabels, Counter>::default();
        reg.register(
            "upstream_errors",
            "Upstream failures surfaced to clients as 5xx",
            upstream_errors.clone(),
        );

        let rate_limited = Counter::default();
        reg.register(
            "rate_limited",
            "Requests rejected by the rate limiter",
            rate_limited.clone(),
        );

        let active_connections = Gauge::default();
        reg.register(
            "active_connections",
            "Open client connections, including CONNECT tunnels",
            active_connections.clone(),
        );

        Self {
            inbound_requests,
            inbound_request_duration,
            headers_propagated,
            upstream_errors,
            rate_limited,
            active_connections,
        }
    }

    pub fn record_request(&self, method: &http::Method, status: http::StatusCode, elapsed: Duration) {
        self.inbound_requests
            .get_or_create(&RequestLabels {
                method: method.as_str().to_string(),
                status: status.into(),
            })
            .inc();
        self.inbound_request_duration
            .get_or_create(&MethodLabels {
                method: method.as_str().to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_propagated(&self, count: usize) {
        if count > 0 {
            self.headers_propagated.inc_by(count as u64);
        }
    }

    pub fn record_upstream_error(&self, kind: &'static str) {
        self.upstream_errors.get_or_create(&ErrorLabels { kind }).inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.inc();
    }

    /// Tracks one client connection for the lifetime of the returned guard.
    pub fn connection(&self) -> ConnectionGuard {
        self.active_connections.inc();
        ConnectionGuard(self.active_connections.clone())
    }
}

pub struct ConnectionGuard(Gauge);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}
