//! Agent uploads and federation reads
//!
//! Both endpoints carry metric families in the payload codec: length-delimited
//! protobuf inside a snappy frame stream.

use crate::api::ApiState;
use crate::schema::{decode_families, drop_empty_families, encode_families, metrics_count};
use crate::store::{PartitionedMetrics, Store};
use crate::Error;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, warn};

/// Header naming the partition an upload belongs to
pub const PARTITION_KEY_HEADER: &str = "x-partition-key";

/// Content type of the payload codec
pub const PAYLOAD_CONTENT_TYPE: &str = "application/vnd.telefed.metrics";

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

/// Accept a batch from an agent
///
/// Families without samples are dropped; an upload left empty is accepted
/// without a write.
///
/// POST /upload
/// X-Partition-Key: <key>
pub async fn upload(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let partition_key = match headers
        .get(PARTITION_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "missing X-Partition-Key header",
            )
        }
    };

    let mut families = match decode_families(body.as_ref()) {
        Ok(families) => families,
        Err(e) => {
            debug!(partition_key = %partition_key, error = %e, "Rejected malformed upload");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    let dropped = drop_empty_families(&mut families);
    if families.is_empty() {
        debug!(partition_key = %partition_key, dropped, "Upload has no samples");
        return StatusCode::NO_CONTENT.into_response();
    }
    let samples = metrics_count(&families);

    match state
        .coordinator
        .write_metrics_with_outcome(PartitionedMetrics::new(partition_key.clone(), families))
        .await
    {
        Ok(outcome) => {
            debug!(
                partition_key = %partition_key,
                samples,
                dropped,
                result = outcome.as_str(),
                "Accepted upload"
            );
            let mut response = StatusCode::NO_CONTENT.into_response();
            response.extensions_mut().insert(outcome);
            response
        }
        Err(e @ Error::WriteLimitReached { .. }) => {
            error_response(StatusCode::TOO_MANY_REQUESTS, e.to_string())
        }
        Err(e) => {
            warn!(partition_key = %partition_key, error = %e, "Failed to store upload");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FederateParams {
    #[serde(default)]
    pub min_timestamp_ms: i64,
}

/// Serve every local partition with samples at or after `min_timestamp_ms`
///
/// GET /federate?min_timestamp_ms=<ms>
pub async fn federate(
    State(state): State<ApiState>,
    Query(params): Query<FederateParams>,
) -> Response {
    let partitions = match state.coordinator.read_metrics(params.min_timestamp_ms).await {
        Ok(partitions) => partitions,
        Err(e) => {
            warn!(error = %e, "Failed to read metrics for federation");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let count = partitions.len();
    let families: Vec<_> = partitions.into_iter().flat_map(|p| p.families).collect();

    let mut body = Vec::new();
    if let Err(e) = encode_families(&mut body, &families) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, PAYLOAD_CONTENT_TYPE.to_string()),
            (
                header::HeaderName::from_static("x-partition-count"),
                count.to_string(),
            ),
        ],
        body,
    )
        .into_response()
}
