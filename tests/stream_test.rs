//! `/v1/decisions/stream`: `new` is scored and truncated, `deleted` passes
//! through untouched.

mod helpers;

use http_body_util::BodyExt;
use tower::ServiceExt;

use helpers::{build_router, spawn_mock_upstream, test_config};

fn decision_json(id: i64, value: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id, "origin": "crowdsec", "type": "ban", "scope": "ip",
        "value": value, "duration": "4h", "scenario": "default",
        "created_at": "2024-01-01T00:00:00Z",
    })
}

#[tokio::test]
async fn deleted_decisions_are_never_scored_or_truncated() {
    let mock = axum::Router::new().route(
        "/v1/decisions/stream",
        axum::routing::get(|| async {
            axum::Json(serde_json::json!({
                "new": (1..=5).map(|id| decision_json(id, &format!("1.1.1.{id}"))).collect::<Vec<_>>(),
                "deleted": (6..=7).map(|id| decision_json(id, &format!("2.2.2.{id}"))).collect::<Vec<_>>(),
            }))
        }),
    );
    let addr = spawn_mock_upstream(mock).await;
    let config = test_config(addr, "max_decisions: 3\n");
    let (router, _state) = build_router(config);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/decisions/stream")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let stream: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stream["new"].as_array().unwrap().len(), 3);
    let deleted = stream["deleted"].as_array().unwrap();
    assert_eq!(deleted.len(), 2);
    let deleted_ids: Vec<i64> = deleted.iter().map(|d| d["id"].as_i64().unwrap()).collect();
    assert_eq!(deleted_ids, vec![6, 7]);
}

#[tokio::test]
async fn startup_flag_is_forwarded_to_upstream() {
    let saw_startup = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = saw_startup.clone();
    let mock = axum::Router::new().route(
        "/v1/decisions/stream",
        axum::routing::get(move |axum::extract::RawQuery(q): axum::extract::RawQuery| {
            let flag = flag.clone();
            async move {
                if q.as_deref() == Some("startup=true") {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                axum::Json(serde_json::json!({"new": [], "deleted": []}))
            }
        }),
    );
    let addr = spawn_mock_upstream(mock).await;
    let config = test_config(addr, "");
    let (router, _state) = build_router(config);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/decisions/stream?startup=true")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    assert!(saw_startup.load(std::sync::atomic::Ordering::SeqCst));
}
