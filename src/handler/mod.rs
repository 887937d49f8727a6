//! HTTP routing, caching, passthrough, and metrics rendering.
//!
//! The front door of the proxy: owns the single cache slot, the operational
//! counters, and the last-computed [`Stats`] used to render `/metrics`.

mod auditor;
mod metrics;
mod passthrough;

pub use auditor::spawn_auditor;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::scorer::{score_and_truncate, Stats};
use crate::types::{Decision, DecisionStream};
use crate::upstream::UpstreamClient;

struct CacheEntry {
    decisions: Vec<Decision>,
    stats: Arc<Stats>,
    stored_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entry: Option<CacheEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Default)]
struct OperationalCounters {
    total_requests: u64,
    failed_requests: u64,
    upstream_latency: std::time::Duration,
    last_upstream_call: u64,
}

struct Inner {
    config: Arc<Config>,
    upstream: UpstreamClient,
    cache: tokio::sync::RwLock<CacheState>,
    counters: tokio::sync::RwLock<OperationalCounters>,
    current_stats: tokio::sync::RwLock<Arc<Stats>>,
    dropped_ips: tokio::sync::RwLock<HashSet<String>>,
    false_negatives_total: AtomicU64,
    last_check: AtomicU64,
    start_time: Instant,
}

/// Shared, cloneable application state. Cheap to clone: one `Arc` bump.
#[derive(Clone)]
pub struct AppState(Arc<Inner>);

impl AppState {
    #[must_use]
    pub fn new(config: Arc<Config>, upstream: UpstreamClient) -> Self {
        Self(Arc::new(Inner {
            config,
            upstream,
            cache: tokio::sync::RwLock::new(CacheState::default()),
            counters: tokio::sync::RwLock::new(OperationalCounters::default()),
            current_stats: tokio::sync::RwLock::new(Arc::new(Stats::default())),
            dropped_ips: tokio::sync::RwLock::new(HashSet::new()),
            false_negatives_total: AtomicU64::new(0),
            last_check: AtomicU64::new(0),
            start_time: Instant::now(),
        }))
    }

    async fn record_request(&self) {
        self.0.counters.write().await.total_requests += 1;
    }

    async fn record_upstream_success(&self, latency: std::time::Duration) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut counters = self.0.counters.write().await;
        counters.upstream_latency = latency;
        counters.last_upstream_call = now;
    }

    async fn record_upstream_failure(&self) {
        self.0.counters.write().await.failed_requests += 1;
    }

    async fn overwrite_dropped_ips(&self, stats: &Stats) {
        let mut dropped_ips = self.0.dropped_ips.write().await;
        dropped_ips.clone_from(&stats.dropped_ips);
    }

    /// Snapshot of the current `dropped_ips` set, for the auditor.
    async fn dropped_ips_snapshot(&self) -> HashSet<String> {
        self.0.dropped_ips.read().await.clone()
    }

    fn record_false_negatives(&self, count: u64) {
        if count > 0 {
            self.0
                .false_negatives_total
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    fn touch_last_check(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.0.last_check.store(now, Ordering::Relaxed);
    }
}

/// Build the full router: scoring endpoints, health, metrics, and a
/// transparent-passthrough fallback for everything else.
#[must_use = "the router must be served to be of any use"]
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/decisions", get(get_decisions))
        .route("/v1/decisions/stream", get(get_stream));

    if state.0.config.health.enabled {
        router = router.route(&state.0.config.health.path, get(get_health));
    }
    if state.0.config.metrics.enabled {
        router = router.route(&state.0.config.metrics.path, get(get_metrics));
    }

    router
        .fallback(passthrough::passthrough)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

fn decisions_response(decisions: &[Decision]) -> Response {
    if decisions.is_empty() {
        (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            "null",
        )
            .into_response()
    } else {
        Json(decisions).into_response()
    }
}

async fn get_decisions(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    state.record_request().await;

    let fresh = {
        let cache = state.0.cache.read().await;
        cache
            .entry
            .as_ref()
            .filter(|entry| entry.stored_at.elapsed() < state.0.config.cache_ttl)
            .map(|entry| (entry.decisions.clone(), entry.stats.clone()))
    };

    if let Some((decisions, stats)) = fresh {
        state.0.cache.write().await.hits += 1;
        *state.0.current_stats.write().await = stats;
        return decisions_response(&decisions);
    }
    state.0.cache.write().await.misses += 1;

    let started = Instant::now();
    match state.0.upstream.get_decisions(query.as_deref()).await {
        Ok(decisions) => {
            let latency = started.elapsed();
            let (scored, stats) =
                score_and_truncate(&state.0.config.scoring, decisions, state.0.config.max_decisions);
            let stats = Arc::new(stats);

            info!(
                returned = scored.len(),
                total = stats.total,
                min_score = stats.min_score,
                max_score = stats.max_score,
                "decisions fetched"
            );

            state.overwrite_dropped_ips(&stats).await;
            *state.0.current_stats.write().await = stats.clone();
            state.0.cache.write().await.entry = Some(CacheEntry {
                decisions: scored.clone(),
                stats,
                stored_at: Instant::now(),
            });
            state.record_upstream_success(latency).await;

            decisions_response(&scored)
        }
        Err(err) => {
            state.record_upstream_failure().await;
            error!(error = %err, "upstream decisions fetch failed");
            err.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    #[serde(default)]
    startup: bool,
}

async fn get_stream(State(state): State<AppState>, Query(params): Query<StreamParams>) -> Response {
    state.record_request().await;

    let started = Instant::now();
    match state.0.upstream.get_stream(params.startup).await {
        Ok(stream) => {
            let latency = started.elapsed();
            let deleted_count = stream.deleted.len();
            let (new, stats) = score_and_truncate(
                &state.0.config.scoring,
                stream.new,
                state.0.config.max_decisions,
            );
            let stats = Arc::new(stats);

            info!(
                new_count = new.len(),
                deleted_count,
                startup = params.startup,
                "stream processed"
            );

            state.overwrite_dropped_ips(&stats).await;
            *state.0.current_stats.write().await = stats;
            state.record_upstream_success(latency).await;

            Json(DecisionStream {
                new,
                deleted: stream.deleted,
            })
            .into_response()
        }
        Err(err) => {
            state.record_upstream_failure().await;
            error!(error = %err, "upstream stream fetch failed");
            err.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime: String,
    upstream_healthy: bool,
}

async fn get_health(State(state): State<AppState>) -> Response {
    let upstream_healthy = state.0.upstream.health().await.is_ok();
    let status = if upstream_healthy { "healthy" } else { "degraded" };
    let uptime = humantime::format_duration(state.0.start_time.elapsed()).to_string();
    let code = if upstream_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse {
        status,
        uptime,
        upstream_healthy,
    }))
        .into_response()
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    let (total_requests, failed_requests, upstream_latency, last_upstream_call) = {
        let counters = state.0.counters.read().await;
        (
            counters.total_requests,
            counters.failed_requests,
            counters.upstream_latency,
            counters.last_upstream_call,
        )
    };
    let (cached_decisions, hits, misses) = {
        let cache = state.0.cache.read().await;
        (
            cache.entry.as_ref().map_or(0, |e| e.decisions.len()),
            cache.hits,
            cache.misses,
        )
    };
    let stats = state.0.current_stats.read().await.clone();
    let false_negatives_total = state.0.false_negatives_total.load(Ordering::Relaxed);
    let last_check = state.0.last_check.load(Ordering::Relaxed);
    let uptime = state.0.start_time.elapsed().as_secs_f64();

    let body = metrics::render(&metrics::Snapshot {
        total_requests,
        failed_requests,
        cache_hits: hits,
        cache_misses: misses,
        cached_decisions,
        upstream_latency_seconds: upstream_latency.as_secs_f64(),
        max_decisions: state.0.config.max_decisions,
        uptime_seconds: uptime,
        false_negatives_total,
        false_negative_check_time: last_check,
        last_upstream_call,
        top_scenarios: state.0.config.effectiveness.top_scenarios,
        stats: &stats,
    });

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}
