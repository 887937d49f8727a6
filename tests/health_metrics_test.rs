//! `/health` and `/metrics`: upstream health reflection and Prometheus
//! exposition rendering.

mod helpers;

use http_body_util::BodyExt;
use tower::ServiceExt;

use helpers::{build_router, spawn_mock_upstream, test_config};

#[tokio::test]
async fn health_reports_healthy_when_upstream_responds() {
    let mock = axum::Router::new()
        .route("/health", axum::routing::get(|| async { axum::http::StatusCode::OK }));
    let addr = spawn_mock_upstream(mock).await;
    let config = test_config(addr, "");
    let (router, _state) = build_router(config);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["upstream_healthy"], true);
}

#[tokio::test]
async fn health_reports_degraded_when_upstream_is_down() {
    // Nothing bound at this address: the dialed connection is refused.
    let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let config = test_config(addr, "");
    let (router, _state) = build_router(config);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text_after_a_scoring_pass() {
    let mock = axum::Router::new().route(
        "/v1/decisions",
        axum::routing::get(|| async {
            axum::Json(serde_json::json!([
                {"id": 1, "origin": "crowdsec", "type": "ban", "scope": "ip", "value": "1.1.1.1", "duration": "4h", "scenario": "default", "created_at": "2024-01-01T00:00:00Z"},
            ]))
        }),
    );
    let addr = spawn_mock_upstream(mock).await;
    let config = test_config(addr, "");
    let (router, _state) = build_router(config);

    let fetch = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/decisions")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(fetch.status(), axum::http::StatusCode::OK);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/metrics")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("crowdsec_sidecar_requests_total"));
    assert!(text.contains("crowdsec_sidecar_decisions_total 1"));
    assert!(text.contains("crowdsec_sidecar_cache_misses_total 1"));
}
