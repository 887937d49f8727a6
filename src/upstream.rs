//! HTTP client for the upstream `CrowdSec` LAPI: decisions, decision streams,
//! and alerts, plus the duration/timestamp parsing `CrowdSec`'s wire format
//! requires.

use std::time::Duration;

use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode as AxumStatusCode, Json};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::StatusCode;
use tracing::warn;

use crate::types::{Alert, Decision, DecisionStream};

/// Upper bound on how much of a non-2xx response body is kept for the error
/// message, so a misbehaving upstream can't balloon memory via its error
/// page.
const ERROR_BODY_EXCERPT_LEN: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
}

/// Every upstream failure surfaces to the caller as `502 Bad Gateway`: from
/// the bouncer's perspective, the proxy itself is healthy, the LAPI behind
/// it is not.
impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        (
            AxumStatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": self.to_string()})),
        )
            .into_response()
    }
}

/// Client for the three upstream operations the proxy needs.
///
/// Built on a single shared [`reqwest::Client`] for connection pooling. Every
/// call injects `X-Api-Key` and `Accept: application/json`.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is static and always valid");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .header("Accept", "application/json")
    }

    async fn send_json<T>(&self, builder: reqwest::RequestBuilder) -> Result<T, UpstreamError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT_LEN).collect();
            return Err(UpstreamError::Status {
                status,
                body: excerpt,
            });
        }
        let value: T = response.json().await?;
        Ok(value)
    }

    /// `GET /v1/decisions?<query>`. An upstream `null` body is normalized to
    /// an empty sequence; the handler re-emits `null` downstream itself when
    /// appropriate.
    pub async fn get_decisions(&self, query: Option<&str>) -> Result<Vec<Decision>, UpstreamError> {
        let path = match query {
            Some(q) if !q.is_empty() => format!("/v1/decisions?{q}"),
            _ => "/v1/decisions".to_string(),
        };
        let builder = self.request(reqwest::Method::GET, &path);
        let decisions: Option<Vec<Decision>> = self.send_json(builder).await?;
        let mut decisions = decisions.unwrap_or_default();
        for decision in &mut decisions {
            fill_parsed_fields(decision);
        }
        Ok(decisions)
    }

    /// `GET /v1/decisions/stream[?startup=true]`.
    pub async fn get_stream(&self, startup: bool) -> Result<DecisionStream, UpstreamError> {
        let path = if startup {
            "/v1/decisions/stream?startup=true"
        } else {
            "/v1/decisions/stream"
        };
        let builder = self.request(reqwest::Method::GET, path);
        let mut stream: DecisionStream = self.send_json(builder).await?;
        for decision in stream.new.iter_mut().chain(stream.deleted.iter_mut()) {
            fill_parsed_fields(decision);
        }
        Ok(stream)
    }

    /// `GET /v1/alerts?<query>`, used by the auditor with `since=<lookback>`.
    pub async fn get_alerts(&self, query: Option<&str>) -> Result<Vec<Alert>, UpstreamError> {
        let path = match query {
            Some(q) if !q.is_empty() => format!("/v1/alerts?{q}"),
            _ => "/v1/alerts".to_string(),
        };
        let builder = self.request(reqwest::Method::GET, &path);
        let alerts: Option<Vec<Alert>> = self.send_json(builder).await?;
        Ok(alerts.unwrap_or_default())
    }

    /// `GET /health`, with an independent 5-second ceiling rather than the
    /// configured `upstream_timeout`.
    pub async fn health(&self) -> Result<(), UpstreamError> {
        let builder = self
            .request(reqwest::Method::GET, "/health")
            .timeout(Duration::from_secs(5));
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Status {
                status: response.status(),
                body: String::new(),
            })
        }
    }

    /// Forward an arbitrary request to the upstream verbatim, injecting the
    /// credential header. Used for paths the handler doesn't recognize.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        mut headers: reqwest::header::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        headers.remove(reqwest::header::HOST);
        let response = self
            .http
            .request(method, format!("{}{path_and_query}", self.base_url))
            .headers(headers)
            .header("X-Api-Key", &self.api_key)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

/// Fill `parsed_duration` and `parsed_created` from their string forms.
/// Parse failures leave the derived field zero-valued; the decision itself
/// is always kept.
fn fill_parsed_fields(decision: &mut Decision) {
    decision.parsed_duration = parse_go_duration(&decision.duration).unwrap_or_default();
    decision.parsed_created = parse_timestamp(&decision.created_at);
}

/// Parse a Go-style duration string (`"4h"`, `"168h"`, `"24h30m"`, `"90s"`).
///
/// This is `CrowdSec`'s own duration grammar on the wire, distinct from the
/// `humantime` grammar the config file uses: a sequence of `<number><unit>`
/// pairs with units `h`, `m`, `s` (optionally signed with a leading `-`,
/// which `CrowdSec` uses for already-expired decisions).
fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if negative {
        // A negative/expired duration has no positive remaining TTL.
        return Some(Duration::ZERO);
    }

    let mut total_secs: f64 = 0.0;
    let mut num = String::new();
    let mut saw_any = false;
    for c in rest.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
        } else {
            let value: f64 = num.parse().ok()?;
            num.clear();
            let unit_secs = match c {
                'h' => 3600.0,
                'm' => 60.0,
                's' => 1.0,
                _ => return None,
            };
            total_secs += value * unit_secs;
            saw_any = true;
        }
    }
    if !num.is_empty() || !saw_any {
        return None;
    }
    Some(Duration::from_secs_f64(total_secs.max(0.0)))
}

/// Fixed fallback timestamp formats tried after RFC3339, in order.
const FALLBACK_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%d %H:%M:%S %z UTC",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a creation timestamp, trying RFC3339 first and then a fixed list of
/// fallback formats. Returns `None` (leaving the derived field zero) rather
/// than failing the request.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in FALLBACK_TIMESTAMP_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    warn!(timestamp = %s, "unable to parse decision timestamp, treating as zero");
    None
}
