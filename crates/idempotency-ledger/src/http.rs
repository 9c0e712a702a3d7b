//! HTTP contract for idempotent write endpoints.
//!
//! Mount with `axum::middleware::from_fn_with_state(ledger, idempotency_middleware)`
//! behind whatever layer authenticates the caller and inserts [`OrgId`].
//!
//! | Situation                         | Response                                        |
//! |-----------------------------------|-------------------------------------------------|
//! | no key header                     | 400 `idempotency_key_required`                  |
//! | malformed key                     | 400 `idempotency_key_invalid`                   |
//! | no org context                    | 400 `org_context_required`                      |
//! | same key, different request       | 409 `idempotency_key_reused`                    |
//! | same request still running        | 409 `idempotency_request_in_progress` + `Retry-After` |
//! | same request already answered     | stored response + `Idempotent-Replayed: true`   |
//! | handler answers 5xx               | passed through, claim released                  |
//! | response cannot be stored         | passed through, claim released                  |
//!
//! Safe methods (GET, HEAD, OPTIONS, TRACE) pass through untouched.

use crate::fingerprint::fingerprint;
use crate::ledger::{ClaimOutcome, IdempotencyLedger};
use crate::LedgerError;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use courier_database::{IdempotencyRecord, StoredResponse};
use serde_json::json;
use tracing::{error, warn};

pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Tenant of the current request, inserted by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgId(pub String);

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": code, "message": message.into() }))).into_response()
}

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

pub async fn idempotency_middleware(
    State(ledger): State<IdempotencyLedger>,
    request: Request,
    next: Next,
) -> Response {
    if is_safe(request.method()) {
        return next.run(request).await;
    }

    let header_name = match HeaderName::from_bytes(ledger.config().header_name.as_bytes()) {
        Ok(name) => name,
        Err(e) => {
            error!(header = %ledger.config().header_name, error = %e, "Invalid idempotency header name");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "idempotency_unavailable", "misconfigured");
        }
    };

    let Some(key_value) = request.headers().get(&header_name).cloned() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "idempotency_key_required",
            format!("{} header is required", ledger.config().header_name),
        );
    };

    let response = handle_keyed(&ledger, &key_value, request, next).await;
    with_key(response, &header_name, key_value)
}

async fn handle_keyed(ledger: &IdempotencyLedger, key_value: &HeaderValue, request: Request, next: Next) -> Response {
    let Ok(key) = key_value.to_str() else {
        return error_response(StatusCode::BAD_REQUEST, "idempotency_key_invalid", "key must be visible ASCII");
    };
    let key = key.to_string();

    let Some(OrgId(org_id)) = request.extensions().get::<OrgId>().cloned() else {
        return error_response(StatusCode::BAD_REQUEST, "org_context_required", "request has no org context");
    };

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, ledger.config().max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", "request body too large");
        }
    };

    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let endpoint = format!("{method} {path}");
    let hash = fingerprint(&method, &path, &bytes);

    let claim = match ledger.claim_or_replay(&org_id, &key, &endpoint, &hash).await {
        Ok(ClaimOutcome::Claimed(record)) => record,
        Ok(ClaimOutcome::CachedResponse(record)) => return replay(&record),
        Ok(ClaimOutcome::InProgress { retry_after }) => {
            let mut response = error_response(
                StatusCode::CONFLICT,
                "idempotency_request_in_progress",
                "a request with this key is still being processed",
            );
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
            return response;
        }
        Ok(ClaimOutcome::Conflict(_)) => {
            return error_response(
                StatusCode::CONFLICT,
                "idempotency_key_reused",
                "this key was already used with a different request",
            );
        }
        Err(LedgerError::InvalidKey(reason)) => {
            return error_response(StatusCode::BAD_REQUEST, "idempotency_key_invalid", reason);
        }
        Err(LedgerError::MissingOrg) => {
            return error_response(StatusCode::BAD_REQUEST, "org_context_required", "request has no org context");
        }
        Err(e) => {
            error!(org_id = %org_id, key = %key, error = %e, "Idempotency claim failed");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "idempotency_unavailable",
                "idempotency ledger unavailable",
            );
        }
    };

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    if response.status().is_server_error() {
        if let Err(e) = ledger.mark_failed(&claim).await {
            warn!(org_id = %org_id, key = %key, error = %e, "Failed to release idempotency claim");
        }
        return response;
    }

    let (parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            warn!(org_id = %org_id, key = %key, error = %e, "Failed to read handler response");
            if let Err(e) = ledger.mark_failed(&claim).await {
                warn!(org_id = %org_id, key = %key, error = %e, "Failed to release idempotency claim");
            }
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "response_unreadable", "handler response could not be read");
        }
    };

    let stored = StoredResponse {
        status: parts.status.as_u16(),
        body: body.to_vec(),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    store_response(&ledger, &claim, stored).await;

    Response::from_parts(parts, Body::from(body))
}

/// Save the handler's response, retrying once. If it still cannot be saved the
/// claim is released, so a retry is answered by the handler instead of
/// `in_progress` until the lease runs out.
async fn store_response(ledger: &IdempotencyLedger, claim: &IdempotencyRecord, stored: StoredResponse) {
    let (org_id, key) = (&claim.org_id, &claim.idempotency_key);
    let err = match ledger.save_response(claim, stored.clone()).await {
        Ok(()) => return,
        Err(LedgerError::ClaimLost(_)) => {
            warn!(org_id = %org_id, key = %key, "Idempotency claim lost before response was stored");
            return;
        }
        Err(e) => e,
    };
    warn!(org_id = %org_id, key = %key, error = %err, "Failed to store idempotent response, retrying");

    let err = match ledger.save_response(claim, stored).await {
        Ok(()) => return,
        Err(LedgerError::ClaimLost(_)) => return,
        Err(e) => e,
    };
    error!(org_id = %org_id, key = %key, error = %err, "Failed to store idempotent response, releasing claim");
    if let Err(e) = ledger.mark_failed(claim).await {
        warn!(org_id = %org_id, key = %key, error = %e, "Failed to release idempotency claim");
    }
}

/// Rebuild a stored response.
fn replay(record: &IdempotencyRecord) -> Response {
    let status = record
        .response_status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(record.response_body.clone().unwrap_or_default()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Some(content_type) = record
        .response_content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(HeaderName::from_static(REPLAYED_HEADER), HeaderValue::from_static("true"));
    response
}

fn with_key(mut response: Response, header_name: &HeaderName, key: HeaderValue) -> Response {
    response.headers_mut().insert(header_name.clone(), key);
    response
}
