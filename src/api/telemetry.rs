//! Request instruments for the HTTP surface
//!
//! Every request is counted by route and status. Uploads additionally carry
//! the forwarding outcome the handler leaves in the response extensions, so
//! local fallbacks can be told apart from forwarded writes.

use super::ApiState;
use crate::cluster::ForwardOutcome;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::time::Instant;
use tracing::{field, info_span, warn, Instrument};

/// Attribute naming the forwarding outcome of an upload
pub const FORWARD_RESULT_ATTRIBUTE: &str = "telefed.forward.result";

/// Label shared by requests that matched no route
const UNMATCHED_ROUTE: &str = "unmatched";

pub(crate) struct HttpMetrics {
    requests: Counter<u64>,
    duration_seconds: Histogram<f64>,
    upload_bytes: Histogram<u64>,
}

impl HttpMetrics {
    pub(crate) fn new(meter: &Meter) -> Self {
        Self {
            requests: meter
                .u64_counter("telefed.api.requests")
                .with_description("HTTP requests handled by the telefed API")
                .init(),
            duration_seconds: meter
                .f64_histogram("telefed.api.request.duration")
                .with_description("HTTP request duration")
                .with_unit("s")
                .init(),
            upload_bytes: meter
                .u64_histogram("telefed.api.upload.size")
                .with_description("Declared body size of agent uploads")
                .with_unit("By")
                .init(),
        }
    }
}

fn declared_length(req: &Request) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Record count, duration and upload size for each request
pub(crate) async fn track_requests(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let body_bytes = declared_length(&req);

    let span = info_span!(
        "http.request",
        otel.kind = "server",
        http.request.method = %method,
        http.route = %route,
        telefed.forward.result = field::Empty,
    );
    let response = next.run(req).instrument(span.clone()).await;
    let status = response.status();

    let mut attrs = vec![
        KeyValue::new("http.request.method", method),
        KeyValue::new("http.response.status_code", status.as_u16() as i64),
    ];
    if let Some(outcome) = response.extensions().get::<ForwardOutcome>() {
        span.record(FORWARD_RESULT_ATTRIBUTE, outcome.as_str());
        attrs.push(KeyValue::new(FORWARD_RESULT_ATTRIBUTE, outcome.as_str()));
        if let Some(bytes) = body_bytes {
            state.http.upload_bytes.record(bytes, &attrs);
        }
    }
    if status.is_server_error() {
        warn!(route = %route, status = status.as_u16(), "Request failed");
    }
    attrs.push(KeyValue::new("http.route", route));

    state.http.requests.add(1, &attrs);
    state
        .http
        .duration_seconds
        .record(started.elapsed().as_secs_f64(), &attrs);

    response
}
