//! The idempotency middleware driven through an axum router.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use courier_core::IdempotencyConfig;
use courier_database::AsyncDatabase;
use futures_util::future::join_all;
use idempotency_ledger::{idempotency_middleware, IdempotencyLedger, OrgId, REPLAYED_HEADER};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Stand-in for the authentication layer.
async fn org_from_header(mut request: Request<Body>, next: Next) -> Response {
    if let Some(org) = request
        .headers()
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        request.extensions_mut().insert(OrgId(org));
    }
    next.run(request).await
}

struct TestApp {
    router: Router,
    executions: Arc<AtomicUsize>,
    db: AsyncDatabase,
}

/// `/bookings` sleeps `delay`, then answers 201 with a counter. `/flaky`
/// answers 500 on its first call and 201 afterwards.
async fn app(delay: Duration) -> TestApp {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let ledger = IdempotencyLedger::new(db.clone(), IdempotencyConfig::default());
    let executions = Arc::new(AtomicUsize::new(0));

    let bookings = {
        let executions = executions.clone();
        move |Json(body): Json<Value>| {
            let executions = executions.clone();
            async move {
                tokio::time::sleep(delay).await;
                let n = executions.fetch_add(1, Ordering::SeqCst) + 1;
                (StatusCode::CREATED, Json(json!({"booking": n, "echo": body})))
            }
        }
    };
    let flaky = {
        let executions = executions.clone();
        move || {
            let executions = executions.clone();
            async move {
                if executions.fetch_add(1, Ordering::SeqCst) == 0 {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                } else {
                    (StatusCode::CREATED, "ok").into_response()
                }
            }
        }
    };

    let router = Router::new()
        .route("/bookings", post(bookings).get(|| async { "listing" }))
        .route("/flaky", post(flaky))
        .layer(middleware::from_fn_with_state(ledger, idempotency_middleware))
        .layer(middleware::from_fn(org_from_header));

    TestApp {
        router,
        executions,
        db,
    }
}

fn post_json(path: &str, key: Option<&str>, org: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    if let Some(org) = org {
        builder = builder.header("x-org-id", org);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_key_is_rejected() {
    let app = app(Duration::ZERO).await;
    let response = app
        .router
        .oneshot(post_json("/bookings", None, Some("org-a"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "idempotency_key_required");
    assert_eq!(app.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_overlong_key_is_rejected() {
    let app = app(Duration::ZERO).await;
    let key = "k".repeat(256);
    let response = app
        .router
        .oneshot(post_json("/bookings", Some(&key), Some("org-a"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "idempotency_key_invalid");
}

#[tokio::test]
async fn test_missing_org_is_rejected() {
    let app = app(Duration::ZERO).await;
    let response = app
        .router
        .oneshot(post_json("/bookings", Some("k1"), None, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "org_context_required");
}

#[tokio::test]
async fn test_retry_replays_stored_response() {
    let app = app(Duration::ZERO).await;

    let first = app
        .router
        .clone()
        .oneshot(post_json("/bookings", Some("k1"), Some("org-a"), json!({"a": 1, "b": 2})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(first.headers()["idempotency-key"], "k1");
    assert!(first.headers().get(REPLAYED_HEADER).is_none());
    let first_body = json_body(first).await;

    // same body, different key order
    let retry = Request::builder()
        .method("POST")
        .uri("/bookings")
        .header("content-type", "application/json")
        .header("Idempotency-Key", "k1")
        .header("x-org-id", "org-a")
        .body(Body::from(r#"{ "b": 2, "a": 1 }"#))
        .unwrap();
    let second = app.router.clone().oneshot(retry).await.unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers()[REPLAYED_HEADER], "true");
    assert_eq!(second.headers()["content-type"], "application/json");
    assert_eq!(json_body(second).await, first_body);

    assert_eq!(app.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_body_conflicts() {
    let app = app(Duration::ZERO).await;
    app.router
        .clone()
        .oneshot(post_json("/bookings", Some("k1"), Some("org-a"), json!({"a": 1})))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post_json("/bookings", Some("k1"), Some("org-a"), json!({"a": 2})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"], "idempotency_key_reused");
    assert_eq!(app.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_requests_execute_once() {
    let app = app(Duration::from_millis(200)).await;

    let responses = join_all((0..6).map(|_| {
        app.router
            .clone()
            .oneshot(post_json("/bookings", Some("k1"), Some("org-a"), json!({"a": 1})))
    }))
    .await;

    let mut created = 0;
    let mut in_progress = 0;
    for response in responses {
        let response = response.unwrap();
        match response.status() {
            StatusCode::CREATED => created += 1,
            StatusCode::CONFLICT => {
                assert_eq!(response.headers()["retry-after"], "1");
                assert_eq!(json_body(response).await["error"], "idempotency_request_in_progress");
                in_progress += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(created + in_progress, 6);
    assert!(created >= 1);
    assert_eq!(app.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_error_releases_claim() {
    let app = app(Duration::ZERO).await;

    let first = app
        .router
        .clone()
        .oneshot(post_json("/flaky", Some("k1"), Some("org-a"), json!({})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(first.headers()["idempotency-key"], "k1");

    let second = app
        .router
        .clone()
        .oneshot(post_json("/flaky", Some("k1"), Some("org-a"), json!({})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert!(second.headers().get(REPLAYED_HEADER).is_none());
    assert_eq!(app.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_safe_methods_pass_through() {
    let app = app(Duration::ZERO).await;
    let request = Request::builder()
        .method("GET")
        .uri("/bookings")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("idempotency-key").is_none());
}

#[tokio::test]
async fn test_unsaveable_response_releases_claim() {
    let app = app(Duration::ZERO).await;
    app.db
        .call(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_completion
                 BEFORE UPDATE OF status ON idempotency_records
                 WHEN NEW.status = 'completed'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let first = app
        .router
        .clone()
        .oneshot(post_json("/bookings", Some("key-1"), Some("org-a"), json!({"slot": "09:00"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    // nothing was stored and nothing is pending, so the retry runs the handler
    let retry = app
        .router
        .clone()
        .oneshot(post_json("/bookings", Some("key-1"), Some("org-a"), json!({"slot": "09:00"})))
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::CREATED);
    assert!(retry.headers().get(REPLAYED_HEADER).is_none());
    assert_eq!(app.executions.load(Ordering::SeqCst), 2);
}
