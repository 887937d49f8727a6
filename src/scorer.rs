//! Deterministic, pure scoring and truncation of a decision set.
//!
//! Everything in this module is synchronous and allocation-light; there is
//! no I/O here at all, which makes it trivially unit-testable and keeps the
//! async Handler code free of scoring logic.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::config::ScoringConfig;
use crate::types::Decision;

/// Fixed cumulative histogram thresholds for `score_buckets`.
const SCORE_BUCKET_THRESHOLDS: [i64; 6] = [25, 50, 75, 100, 150, 200];

/// The result of a single scoring pass. Produced fresh per pass; never
/// mutated afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub returned: usize,
    pub dropped: usize,
    pub max_score: i64,
    pub min_score: i64,
    pub median_score: i64,
    pub avg_score: f64,
    pub score_cutoff: i64,
    pub score_buckets: HashMap<i64, usize>,
    pub origin_kept: HashMap<String, usize>,
    pub origin_dropped: HashMap<String, usize>,
    pub scenario_kept: HashMap<String, usize>,
    pub scenario_dropped: HashMap<String, usize>,
    pub recidivism_ips: usize,
    pub recidivism_boosts: i64,
    pub dropped_ips: std::collections::HashSet<String>,
}

/// Score every decision, sort by score desc / id asc, and truncate to
/// `max_n`. Returns the truncated, sorted decisions and the [`Stats`] for
/// the full input set.
///
/// Idempotent: re-running this on its own output with `max_n` at least the
/// size of that output returns the same sequence, since scores and order
/// are a pure function of the decisions themselves.
#[must_use]
pub fn score_and_truncate(
    config: &ScoringConfig,
    mut decisions: Vec<Decision>,
    max_n: usize,
) -> (Vec<Decision>, Stats) {
    if decisions.is_empty() {
        return (Vec::new(), Stats::default());
    }

    let recidivism_counts = count_by_value(&decisions);
    let now = Utc::now();

    for decision in &mut decisions {
        decision.score = score_decision(config, decision, &recidivism_counts, now);
    }

    decisions.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

    let total = decisions.len();
    let returned_count = max_n.min(total);
    let dropped_count = total - returned_count;

    let mut stats = Stats {
        total,
        returned: returned_count,
        dropped: dropped_count,
        ..Stats::default()
    };

    let scores: Vec<i64> = decisions.iter().map(|d| d.score).collect();
    stats.max_score = scores.iter().copied().max().unwrap_or(0);
    stats.min_score = scores.iter().copied().min().unwrap_or(0);
    stats.avg_score = scores.iter().sum::<i64>() as f64 / total as f64;
    stats.median_score = scores[total / 2];
    stats.score_cutoff = if returned_count > 0 {
        decisions[returned_count - 1].score
    } else {
        0
    };

    for threshold in SCORE_BUCKET_THRESHOLDS {
        let count = scores.iter().filter(|&&s| s <= threshold).count();
        stats.score_buckets.insert(threshold, count);
    }

    for (ip, count) in &recidivism_counts {
        if *count >= 2 {
            stats.recidivism_ips += 1;
            let _ = ip;
        }
    }
    stats.recidivism_boosts = decisions
        .iter()
        .map(|d| {
            let count = recidivism_counts.get(&d.value).copied().unwrap_or(1);
            if count > 1 {
                config.recidivism_bonus * i64::from(count - 1)
            } else {
                0
            }
        })
        .sum();

    for (idx, decision) in decisions.iter().enumerate() {
        let kept = idx < returned_count;
        let (origin_map, scenario_map) = if kept {
            (&mut stats.origin_kept, &mut stats.scenario_kept)
        } else {
            (&mut stats.origin_dropped, &mut stats.scenario_dropped)
        };
        *origin_map.entry(decision.origin.clone()).or_insert(0) += 1;
        *scenario_map.entry(decision.scenario.clone()).or_insert(0) += 1;
        if !kept {
            stats.dropped_ips.insert(decision.value.clone());
        }
    }

    decisions.truncate(returned_count);
    (decisions, stats)
}

fn count_by_value(decisions: &[Decision]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for decision in decisions {
        *counts.entry(decision.value.clone()).or_insert(0u32) += 1;
    }
    counts
}

/// Sum of the seven additive scoring factors for a single decision. No
/// cross-factor coupling except recidivism, which depends only on the group
/// count of `decision.value`.
fn score_decision(
    config: &ScoringConfig,
    decision: &Decision,
    recidivism_counts: &HashMap<String, u32>,
    now: chrono::DateTime<Utc>,
) -> i64 {
    let scenario = scenario_factor(config, &decision.scenario);
    let origin = config.origin_score(&decision.origin);
    let ttl = ttl_factor(config, decision.parsed_duration);
    let decision_type = config.decision_type_score(&decision.decision_type);
    let freshness = freshness_factor(config, decision.parsed_created, now);
    let cidr = decision
        .cidr_prefix()
        .map_or(0, |prefix| config.cidr_bonus(prefix));
    let recidivism = recidivism_factor(config, decision, recidivism_counts);

    scenario + origin + ttl + decision_type + freshness + cidr + recidivism
}

fn scenario_factor(config: &ScoringConfig, scenario: &str) -> i64 {
    let base = config.scenario_score(scenario);
    (base as f64 * config.scenario_multiplier) as i64
}

fn ttl_factor(config: &ScoringConfig, parsed_duration: Duration) -> i64 {
    let ttl_scoring = config.ttl_scoring;
    if !ttl_scoring.enabled || parsed_duration.is_zero() {
        return 0;
    }
    let capped = parsed_duration.min(ttl_scoring.max_ttl);
    let ratio = capped.as_secs_f64() / ttl_scoring.max_ttl.as_secs_f64();
    (ratio * ttl_scoring.max_bonus as f64).floor() as i64
}

fn freshness_factor(
    config: &ScoringConfig,
    parsed_created: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> i64 {
    let Some(created) = parsed_created else {
        return 0;
    };
    let age = (now - created).to_std().unwrap_or(Duration::ZERO);
    config.freshness_bonus(age)
}

fn recidivism_factor(
    config: &ScoringConfig,
    decision: &Decision,
    recidivism_counts: &HashMap<String, u32>,
) -> i64 {
    let count = recidivism_counts.get(&decision.value).copied().unwrap_or(1);
    if count > 1 {
        config.recidivism_bonus * i64::from(count - 1)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn decision(id: i64, scenario: &str, origin: &str, value: &str) -> Decision {
        Decision {
            id,
            origin: origin.to_string(),
            decision_type: "ban".to_string(),
            scope: "ip".to_string(),
            value: value.to_string(),
            duration: String::new(),
            scenario: scenario.to_string(),
            created_at: String::new(),
            uuid: None,
            parsed_duration: Duration::ZERO,
            parsed_created: None,
            score: 0,
        }
    }

    fn config_from(yaml: &str) -> crate::config::ScoringConfig {
        let full = format!(
            "upstream_lapi_url: \"http://x\"\nupstream_lapi_key: \"k\"\n{yaml}"
        );
        Config::from_yaml_str(&full).unwrap().scoring
    }

    #[test]
    fn empty_input_returns_empty_and_zero_stats() {
        let config = config_from("");
        let (kept, stats) = score_and_truncate(&config, Vec::new(), 10);
        assert!(kept.is_empty());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.returned, 0);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn max_decisions_zero_drops_everything() {
        let config = config_from("scoring:\n  scenarios:\n    default: 1\n");
        let decisions = vec![decision(1, "x", "crowdsec", "1.1.1.1")];
        let (kept, stats) = score_and_truncate(&config, decisions, 0);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.returned, 0);
    }

    #[test]
    fn max_decisions_greater_than_input_keeps_all() {
        let config = config_from("scoring:\n  scenarios:\n    default: 1\n");
        let decisions = vec![
            decision(1, "x", "crowdsec", "1.1.1.1"),
            decision(2, "x", "crowdsec", "2.2.2.2"),
        ];
        let (kept, stats) = score_and_truncate(&config, decisions, 10);
        assert_eq!(kept.len(), 2);
        assert_eq!(stats.dropped, 0);
        assert!(stats.dropped_ips.is_empty());
    }

    /// Concrete scenario 1 from spec.md §8: scenario priority.
    #[test]
    fn scenario_priority_scenario() {
        let config = config_from(
            "scoring:\n  scenarios:\n    ssh-bf: 50\n    default: 10\n  scenario_multiplier: 2.0\n",
        );
        let decisions = vec![
            decision(1, "default", "o", "1.1.1.1"),
            decision(2, "ssh-bf", "o", "2.2.2.2"),
            decision(3, "default", "o", "3.3.3.3"),
            decision(4, "ssh-bf", "o", "4.4.4.4"),
            decision(5, "default", "o", "5.5.5.5"),
        ];
        let (kept, stats) = score_and_truncate(&config, decisions, 2);
        let ids: Vec<i64> = kept.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(kept[0].score, 100);
        assert_eq!(stats.dropped, 3);
    }

    /// Concrete scenario 2 from spec.md §8: origin preservation.
    #[test]
    fn origin_preservation_scenario() {
        let config = config_from(
            "scoring:\n  scenarios:\n    default: 10\n  origins:\n    crowdsec: 25\n    CAPI: 10\n  scenario_multiplier: 2.0\n",
        );
        let decisions = vec![
            decision(1, "default", "crowdsec", "1.1.1.1"),
            decision(2, "default", "CAPI", "2.2.2.2"),
            decision(3, "default", "CAPI", "3.3.3.3"),
            decision(4, "default", "CAPI", "4.4.4.4"),
            decision(5, "default", "CAPI", "5.5.5.5"),
        ];
        let (kept, stats) = score_and_truncate(&config, decisions, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].origin, "crowdsec");
        assert_eq!(stats.origin_kept.get("crowdsec"), Some(&1));
        assert_eq!(stats.origin_dropped.get("CAPI"), Some(&4));
    }

    /// Concrete scenario 3 from spec.md §8: TTL scaling.
    #[test]
    fn ttl_scaling_scenario() {
        let config = config_from(
            "scoring:\n  scenarios:\n    default: 0\n  scenario_multiplier: 2.0\n  ttl_scoring:\n    enabled: true\n    max_bonus: 10\n    max_ttl: \"168h\"\n",
        );
        let mut d24 = decision(1, "default", "o", "1.1.1.1");
        d24.parsed_duration = Duration::from_secs(24 * 3600);
        let mut d84 = decision(2, "default", "o", "2.2.2.2");
        d84.parsed_duration = Duration::from_secs(84 * 3600);
        let mut d168 = decision(3, "default", "o", "3.3.3.3");
        d168.parsed_duration = Duration::from_secs(168 * 3600);

        let (kept, _) = score_and_truncate(&config, vec![d24, d84, d168], 10);
        let by_id: HashMap<i64, i64> = kept.iter().map(|d| (d.id, d.score)).collect();
        assert_eq!(by_id[&1], 1);
        assert_eq!(by_id[&2], 5);
        assert_eq!(by_id[&3], 10);
    }

    /// Concrete scenario 4 from spec.md §8: recidivism.
    #[test]
    fn recidivism_scenario() {
        let config = config_from(
            "scoring:\n  scenarios:\n    ssh-bf: 50\n    default: 10\n  scenario_multiplier: 2.0\n  recidivism_bonus: 15\n",
        );
        let decisions = vec![
            decision(1, "ssh-bf", "o", "1.2.3.4"),
            decision(2, "ssh-bf", "o", "1.2.3.4"),
            decision(3, "ssh-bf", "o", "1.2.3.4"),
            decision(4, "default", "o", "9.8.7.6"),
            decision(5, "default", "o", "9.8.7.6"),
            decision(6, "default", "o", "6.6.6.6"),
        ];
        let (kept, stats) = score_and_truncate(&config, decisions, 6);
        assert_eq!(kept[0].score, 130);
        let unique = kept.iter().find(|d| d.value == "6.6.6.6").unwrap();
        assert_eq!(unique.score, 20);
        assert_eq!(stats.recidivism_ips, 2);
    }

    #[test]
    fn ties_broken_by_ascending_id() {
        let config = config_from("scoring:\n  scenarios:\n    default: 10\n");
        let decisions = vec![
            decision(3, "default", "o", "1.1.1.1"),
            decision(1, "default", "o", "2.2.2.2"),
            decision(2, "default", "o", "3.3.3.3"),
        ];
        let (kept, _) = score_and_truncate(&config, decisions, 10);
        let ids: Vec<i64> = kept.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let config = config_from("scoring:\n  scenarios:\n    default: 10\n");
        let decisions = vec![
            decision(1, "default", "o", "1.1.1.1"),
            decision(2, "default", "o", "2.2.2.2"),
            decision(3, "default", "o", "3.3.3.3"),
        ];
        let (first, _) = score_and_truncate(&config, decisions, 2);
        let first_ids: Vec<i64> = first.iter().map(|d| d.id).collect();
        let (second, _) = score_and_truncate(&config, first, 2);
        let second_ids: Vec<i64> = second.iter().map(|d| d.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn score_buckets_monotonically_non_decreasing() {
        let config = config_from("scoring:\n  scenarios:\n    default: 10\n");
        let decisions = (0..20)
            .map(|i| decision(i, "default", "o", &format!("1.1.1.{i}")))
            .collect();
        let (_, stats) = score_and_truncate(&config, decisions, 20);
        let mut prev = 0;
        for threshold in SCORE_BUCKET_THRESHOLDS {
            let count = stats.score_buckets[&threshold];
            assert!(count >= prev);
            prev = count;
        }
    }
}
