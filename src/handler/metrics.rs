//! Prometheus text-exposition rendering for `/metrics`.
//!
//! Builds a fresh [`Registry`] on every call from a point-in-time
//! [`Snapshot`] rather than mutating long-lived global gauges: scenario and
//! origin labels are dynamic, and a long-lived `GaugeVec` would accumulate
//! label combinations that fell out of the top-N window. Rebuilding per call
//! keeps the exposed label set exactly equal to what `top_scenarios` allows.

use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::scorer::Stats;

const SCORE_BUCKET_THRESHOLDS: [i64; 6] = [25, 50, 75, 100, 150, 200];

pub struct Snapshot<'a> {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cached_decisions: usize,
    pub upstream_latency_seconds: f64,
    pub max_decisions: usize,
    pub uptime_seconds: f64,
    pub false_negatives_total: u64,
    pub false_negative_check_time: u64,
    pub last_upstream_call: u64,
    pub top_scenarios: usize,
    pub stats: &'a Stats,
}

/// Render the full metric family set as Prometheus exposition text.
#[must_use]
pub fn render(snapshot: &Snapshot<'_>) -> String {
    let registry = Registry::new();
    register_operational(&registry, snapshot);
    register_effectiveness(&registry, snapshot);

    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buf)
        .expect("in-memory prometheus encode never fails");
    String::from_utf8(buf).expect("prometheus text encoding is always valid UTF-8")
}

fn register_operational(registry: &Registry, snapshot: &Snapshot<'_>) {
    let requests_total = IntCounter::new(
        "crowdsec_sidecar_requests_total",
        "Total HTTP requests handled.",
    )
    .unwrap();
    requests_total.inc_by(snapshot.total_requests);
    registry.register(Box::new(requests_total)).unwrap();

    let requests_failed_total = IntCounter::new(
        "crowdsec_sidecar_requests_failed_total",
        "Total requests that failed due to an upstream error.",
    )
    .unwrap();
    requests_failed_total.inc_by(snapshot.failed_requests);
    registry
        .register(Box::new(requests_failed_total))
        .unwrap();

    let cache_hits_total = IntCounter::new(
        "crowdsec_sidecar_cache_hits_total",
        "Total decision cache hits.",
    )
    .unwrap();
    cache_hits_total.inc_by(snapshot.cache_hits);
    registry.register(Box::new(cache_hits_total)).unwrap();

    let cache_misses_total = IntCounter::new(
        "crowdsec_sidecar_cache_misses_total",
        "Total decision cache misses.",
    )
    .unwrap();
    cache_misses_total.inc_by(snapshot.cache_misses);
    registry.register(Box::new(cache_misses_total)).unwrap();

    let cached_decisions = IntGauge::new(
        "crowdsec_sidecar_cached_decisions",
        "Number of decisions currently held in the cache slot.",
    )
    .unwrap();
    cached_decisions.set(snapshot.cached_decisions as i64);
    registry.register(Box::new(cached_decisions)).unwrap();

    let upstream_latency_seconds = Gauge::new(
        "crowdsec_sidecar_upstream_latency_seconds",
        "Duration of the most recent upstream call.",
    )
    .unwrap();
    upstream_latency_seconds.set(snapshot.upstream_latency_seconds);
    registry
        .register(Box::new(upstream_latency_seconds))
        .unwrap();

    let max_decisions = IntGauge::new(
        "crowdsec_sidecar_max_decisions",
        "Configured maximum number of decisions returned downstream.",
    )
    .unwrap();
    max_decisions.set(snapshot.max_decisions as i64);
    registry.register(Box::new(max_decisions)).unwrap();

    let decisions_total = IntGauge::new(
        "crowdsec_sidecar_decisions_total",
        "Total decisions seen in the most recent scoring pass.",
    )
    .unwrap();
    decisions_total.set(snapshot.stats.total as i64);
    registry.register(Box::new(decisions_total)).unwrap();

    let decisions_dropped = IntGauge::new(
        "crowdsec_sidecar_decisions_dropped",
        "Decisions dropped by truncation in the most recent scoring pass.",
    )
    .unwrap();
    decisions_dropped.set(snapshot.stats.dropped as i64);
    registry.register(Box::new(decisions_dropped)).unwrap();

    let uptime_seconds = Gauge::new(
        "crowdsec_sidecar_uptime_seconds",
        "Seconds since process start.",
    )
    .unwrap();
    uptime_seconds.set(snapshot.uptime_seconds);
    registry.register(Box::new(uptime_seconds)).unwrap();

    let last_upstream_call = IntGauge::new(
        "crowdsec_sidecar_last_upstream_call_time",
        "Unix timestamp of the most recent successful upstream call.",
    )
    .unwrap();
    last_upstream_call.set(snapshot.last_upstream_call as i64);
    registry.register(Box::new(last_upstream_call)).unwrap();
}

fn register_effectiveness(registry: &Registry, snapshot: &Snapshot<'_>) {
    register_breakdowns(registry, snapshot);
    register_score_distribution(registry, snapshot.stats);

    let false_negatives_total = IntCounter::new(
        "crowdsec_sidecar_false_negatives_total",
        "Total truncated decisions later confirmed by a local alert.",
    )
    .unwrap();
    false_negatives_total.inc_by(snapshot.false_negatives_total);
    registry
        .register(Box::new(false_negatives_total))
        .unwrap();

    let false_negative_check_time = IntGauge::new(
        "crowdsec_sidecar_false_negative_check_time",
        "Unix timestamp of the most recent false-negative audit tick.",
    )
    .unwrap();
    false_negative_check_time.set(snapshot.false_negative_check_time as i64);
    registry
        .register(Box::new(false_negative_check_time))
        .unwrap();
}

/// Register the per-origin and per-scenario kept/dropped `GaugeVec`s.
fn register_breakdowns(registry: &Registry, snapshot: &Snapshot<'_>) {
    let stats = snapshot.stats;

    let decisions_kept = GaugeVec::new(
        Opts::new(
            "crowdsec_sidecar_decisions_kept",
            "Decisions kept by origin in the most recent scoring pass.",
        ),
        &["origin"],
    )
    .unwrap();
    for (origin, count) in &stats.origin_kept {
        decisions_kept
            .with_label_values(&[origin])
            .set(*count as f64);
    }
    registry.register(Box::new(decisions_kept)).unwrap();

    let decisions_dropped_by_origin = GaugeVec::new(
        Opts::new(
            "crowdsec_sidecar_decisions_dropped_by_origin",
            "Decisions dropped by origin in the most recent scoring pass.",
        ),
        &["origin"],
    )
    .unwrap();
    for (origin, count) in &stats.origin_dropped {
        decisions_dropped_by_origin
            .with_label_values(&[origin])
            .set(*count as f64);
    }
    registry
        .register(Box::new(decisions_dropped_by_origin))
        .unwrap();

    let top = top_scenarios(stats, snapshot.top_scenarios);

    let scenario_kept = GaugeVec::new(
        Opts::new(
            "crowdsec_sidecar_scenario_kept",
            "Decisions kept by scenario (top-N plus an aggregated \"other\" bucket).",
        ),
        &["scenario"],
    )
    .unwrap();
    for (label, count) in bucketed(&stats.scenario_kept, &top) {
        scenario_kept
            .with_label_values(&[&label])
            .set(count as f64);
    }
    registry.register(Box::new(scenario_kept)).unwrap();

    let scenario_dropped = GaugeVec::new(
        Opts::new(
            "crowdsec_sidecar_scenario_dropped",
            "Decisions dropped by scenario (top-N plus an aggregated \"other\" bucket).",
        ),
        &["scenario"],
    )
    .unwrap();
    for (label, count) in bucketed(&stats.scenario_dropped, &top) {
        scenario_dropped
            .with_label_values(&[&label])
            .set(count as f64);
    }
    registry.register(Box::new(scenario_dropped)).unwrap();
}

/// Register the score-cutoff/max/median/bucket and recidivism gauges.
fn register_score_distribution(registry: &Registry, stats: &Stats) {
    let score_cutoff = IntGauge::new(
        "crowdsec_sidecar_score_cutoff",
        "Lowest score that survived truncation in the most recent scoring pass.",
    )
    .unwrap();
    score_cutoff.set(stats.score_cutoff);
    registry.register(Box::new(score_cutoff)).unwrap();

    let score_max = IntGauge::new(
        "crowdsec_sidecar_score_max",
        "Highest score in the most recent scoring pass.",
    )
    .unwrap();
    score_max.set(stats.max_score);
    registry.register(Box::new(score_max)).unwrap();

    let score_median = IntGauge::new(
        "crowdsec_sidecar_score_median",
        "Median score in the most recent scoring pass.",
    )
    .unwrap();
    score_median.set(stats.median_score);
    registry.register(Box::new(score_median)).unwrap();

    let score_bucket = GaugeVec::new(
        Opts::new(
            "crowdsec_sidecar_score_bucket",
            "Cumulative count of decisions with score <= le.",
        ),
        &["le"],
    )
    .unwrap();
    for threshold in SCORE_BUCKET_THRESHOLDS {
        let count = stats.score_buckets.get(&threshold).copied().unwrap_or(0);
        score_bucket
            .with_label_values(&[&threshold.to_string()])
            .set(count as f64);
    }
    registry.register(Box::new(score_bucket)).unwrap();

    let recidivism_ips = IntGauge::new(
        "crowdsec_sidecar_recidivism_ips",
        "Distinct IPs with two or more decisions in the most recent scoring pass.",
    )
    .unwrap();
    recidivism_ips.set(stats.recidivism_ips as i64);
    registry.register(Box::new(recidivism_ips)).unwrap();

    let recidivism_boosts = IntGauge::new(
        "crowdsec_sidecar_recidivism_boosts",
        "Total recidivism bonus points awarded in the most recent scoring pass.",
    )
    .unwrap();
    recidivism_boosts.set(stats.recidivism_boosts);
    registry.register(Box::new(recidivism_boosts)).unwrap();
}

/// The top-N scenario names by combined kept+dropped count, descending.
/// Ties broken by name for determinism across renders.
fn top_scenarios(stats: &Stats, n: usize) -> std::collections::HashSet<String> {
    let mut totals: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for (scenario, count) in &stats.scenario_kept {
        *totals.entry(scenario.as_str()).or_insert(0) += count;
    }
    for (scenario, count) in &stats.scenario_dropped {
        *totals.entry(scenario.as_str()).or_insert(0) += count;
    }
    let mut ranked: Vec<(&str, usize)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(n)
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Collapse a scenario → count map into `(label, count)` pairs, aggregating
/// everything outside `top` into a single `"other"` entry.
fn bucketed(
    map: &std::collections::HashMap<String, usize>,
    top: &std::collections::HashSet<String>,
) -> Vec<(String, usize)> {
    let mut result = Vec::new();
    let mut other = 0;
    for (scenario, count) in map {
        if top.contains(scenario) {
            result.push((scenario.clone(), *count));
        } else {
            other += count;
        }
    }
    if other > 0 {
        result.push(("other".to_string(), other));
    }
    result
}
