//! Route handlers.
//!
//! Store, remove and retrieve replies carry the operation's correlation id
//! in `X-Correlation-Id`. Bodies are plain text.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kvlog_core::{CORRELATION_ID_HEADER, CorrelationId};
use serde::Deserialize;
use tracing::{error, warn};

use crate::{ApiState, X_CORRELATION_ID};

#[derive(Debug, Deserialize)]
pub struct StoreRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

/// Non-blank `X-Correlation-Id` from the request, else a fresh id.
fn request_correlation_id(headers: &HeaderMap) -> CorrelationId {
    headers
        .get(X_CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| CorrelationId(v.to_string()))
        .unwrap_or_else(CorrelationId::generate)
}

fn with_correlation(correlation_id: &str, status: StatusCode, body: String) -> Response {
    let mut resp = (status, body).into_response();
    match HeaderValue::from_str(correlation_id) {
        Ok(value) => {
            resp.headers_mut().insert(X_CORRELATION_ID, value);
        }
        Err(_) => warn!(%correlation_id, "correlation id is not a valid header value, omitted"),
    }
    resp
}

fn disabled() -> Response {
    (StatusCode::NOT_FOUND, "disabled").into_response()
}

// ── Writes ─────────────────────────────────────────────────────────

/// A store request decoded to bytes.
struct Upsert {
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Vec<(String, Vec<u8>)>,
    correlation_id: CorrelationId,
}

fn upsert_from(
    request: StoreRequest,
    http_headers: &HeaderMap,
    decode: impl Fn(&str) -> Result<Vec<u8>, String>,
) -> Result<Upsert, String> {
    let body_headers = request.headers.unwrap_or_default();
    // Precedence: body header, then request header, then generated.
    let correlation_id = match body_headers.get(CORRELATION_ID_HEADER) {
        Some(id) => CorrelationId(id.clone()),
        None => request_correlation_id(http_headers),
    };
    let headers = body_headers
        .iter()
        .map(|(name, value)| Ok((name.clone(), decode(value)?)))
        .collect::<Result<Vec<_>, String>>()?;
    Ok(Upsert {
        key: decode(&request.key)?,
        value: decode(&request.value)?,
        headers,
        correlation_id,
    })
}

async fn publish_upsert(state: &ApiState, upsert: Upsert) -> Response {
    let Some(publisher) = &state.publisher else {
        return disabled();
    };
    let correlation_id = upsert.correlation_id.as_str();
    match publisher
        .publish(&upsert.key, Some(&upsert.value), &upsert.headers, correlation_id)
        .await
    {
        Ok(()) => with_correlation(correlation_id, StatusCode::OK, "Stored".to_string()),
        Err(_) => with_correlation(
            correlation_id,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Storage failed".to_string(),
        ),
    }
}

/// POST /store
pub async fn store(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<StoreRequest>,
) -> Response {
    let utf8 = |s: &str| Ok::<_, String>(s.as_bytes().to_vec());
    match upsert_from(request, &headers, utf8) {
        Ok(upsert) => publish_upsert(&state, upsert).await,
        Err(e) => (StatusCode::BAD_REQUEST, e).into_response(),
    }
}

/// POST /store/b64
pub async fn store_b64(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<StoreRequest>,
) -> Response {
    let b64 = |s: &str| STANDARD.decode(s).map_err(|e| format!("invalid base64: {e}"));
    match upsert_from(request, &headers, b64) {
        Ok(upsert) => publish_upsert(&state, upsert).await,
        Err(e) => {
            let correlation_id = request_correlation_id(&headers);
            with_correlation(correlation_id.as_str(), StatusCode::BAD_REQUEST, e)
        }
    }
}

/// POST /remove
pub async fn remove(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<KeyRequest>,
) -> Response {
    let Some(publisher) = &state.publisher else {
        return disabled();
    };
    let correlation_id = request_correlation_id(&headers);
    let correlation_id = correlation_id.as_str();
    match publisher
        .publish(request.key.as_bytes(), None, &[], correlation_id)
        .await
    {
        Ok(()) => with_correlation(correlation_id, StatusCode::OK, "Removed".to_string()),
        Err(_) => with_correlation(
            correlation_id,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Removal failed".to_string(),
        ),
    }
}

// ── Reads ──────────────────────────────────────────────────────────

/// Look `key` up and render a hit with `render`. A miss answers 200 with an
/// empty body and the request's correlation id.
async fn lookup(
    state: &ApiState,
    headers: &HeaderMap,
    key: &[u8],
    render: impl Fn(Vec<u8>) -> String,
) -> Response {
    let Some(store) = &state.store else {
        return disabled();
    };
    let requested = request_correlation_id(headers);
    match store.try_retrieve(key).await {
        Ok(Some(hit)) => with_correlation(&hit.correlation_id, StatusCode::OK, render(hit.value)),
        Ok(None) => with_correlation(requested.as_str(), StatusCode::OK, String::new()),
        Err(e) => {
            error!(correlation_id = %requested, error = %e, "state store read failed");
            with_correlation(
                requested.as_str(),
                StatusCode::INTERNAL_SERVER_ERROR,
                "Retrieval failed".to_string(),
            )
        }
    }
}

/// POST /retrieve
pub async fn retrieve(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<KeyRequest>,
) -> Response {
    lookup(&state, &headers, request.key.as_bytes(), |value| {
        String::from_utf8_lossy(&value).into_owned()
    })
    .await
}

/// POST /retrieve/b64
pub async fn retrieve_b64(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<KeyRequest>,
) -> Response {
    let key = match STANDARD.decode(&request.key) {
        Ok(key) => key,
        Err(e) => {
            let correlation_id = request_correlation_id(&headers);
            return with_correlation(
                correlation_id.as_str(),
                StatusCode::BAD_REQUEST,
                format!("invalid base64: {e}"),
            );
        }
    };
    lookup(&state, &headers, &key, |value| STANDARD.encode(value)).await
}

// ── Health ─────────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "Started successfully")
}

/// GET /healthz/live
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, "Alive and well")
}

/// GET /healthz/ready
pub async fn ready(State(state): State<ApiState>) -> Response {
    let Some(store) = &state.store else {
        let body = if state.publisher.is_some() {
            "ready"
        } else {
            "Both reading and writing are disabled"
        };
        return (StatusCode::OK, body).into_response();
    };

    match store.ready().await {
        Ok(true) => (StatusCode::OK, "ready").into_response(),
        Ok(false) => {
            let mut body = String::from("State hasn't caught up");
            match store.readiness_progress().await {
                Ok(progress) => {
                    for p in progress {
                        let consumed = p
                            .consumed
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "none".to_string());
                        let _ = write!(
                            body,
                            "\npartition {}: consumed {consumed} / target {}",
                            p.partition, p.target
                        );
                    }
                }
                Err(e) => warn!(error = %e, "readiness diagnostic unavailable"),
            }
            (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
        }
        Err(e) => {
            error!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "State hasn't caught up").into_response()
        }
    }
}
