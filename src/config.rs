//! Typed, validated server configuration.
//!
//! Loads a declarative YAML document at startup and produces an immutable
//! [`Config`] for the rest of the process's lifetime. Nothing here ever
//! re-reads the document after [`Config::load`] returns.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// Everything that can go wrong while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A duration parsed from a humantime-style string (`"60s"`, `"2m"`, `"168h"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"60s\" or \"2m\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(v)
                    .map(HumanDuration)
                    .map_err(|e| E::custom(format!("invalid duration {v:?}: {e}")))
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&humantime::format_duration(self.0))
    }
}

// ---------------------------------------------------------------------------
// Raw (as-deserialized) document
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    listen_addr: Option<String>,
    upstream_lapi_url: Option<String>,
    upstream_lapi_key: Option<String>,
    max_decisions: Option<i64>,
    cache_ttl: Option<HumanDuration>,
    upstream_timeout: Option<HumanDuration>,
    log_level: Option<String>,
    #[serde(default)]
    health: RawHealthConfig,
    #[serde(default)]
    metrics: RawMetricsConfig,
    #[serde(default)]
    scoring: RawScoringConfig,
    #[serde(default)]
    effectiveness: RawEffectivenessConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawHealthConfig {
    enabled: Option<bool>,
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetricsConfig {
    enabled: Option<bool>,
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawScoringConfig {
    #[serde(default)]
    scenarios: IndexMap<String, i64>,
    #[serde(default)]
    origins: HashMap<String, i64>,
    #[serde(default)]
    decision_types: HashMap<String, i64>,
    scenario_multiplier: Option<f64>,
    recidivism_bonus: Option<i64>,
    #[serde(default)]
    ttl_scoring: RawTtlScoring,
    #[serde(default)]
    freshness_bonuses: Vec<RawFreshnessBonus>,
    #[serde(default)]
    cidr_bonuses: Vec<RawCidrBonus>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTtlScoring {
    enabled: Option<bool>,
    max_bonus: Option<i64>,
    max_ttl: Option<HumanDuration>,
}

#[derive(Debug, Deserialize)]
struct RawFreshnessBonus {
    max_age: HumanDuration,
    bonus: i64,
}

#[derive(Debug, Deserialize)]
struct RawCidrBonus {
    min_prefix: u8,
    max_prefix: u8,
    bonus: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawEffectivenessConfig {
    top_scenarios: Option<usize>,
    #[serde(default)]
    false_negative_check: RawFalseNegativeCheck,
}

#[derive(Debug, Default, Deserialize)]
struct RawFalseNegativeCheck {
    enabled: Option<bool>,
    interval: Option<HumanDuration>,
    lookback: Option<HumanDuration>,
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Fully validated, process-lifetime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub upstream_lapi_url: String,
    pub upstream_lapi_key: String,
    pub max_decisions: usize,
    pub cache_ttl: Duration,
    pub upstream_timeout: Duration,
    pub log_level: String,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub scoring: ScoringConfig,
    pub effectiveness: EffectivenessConfig,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct EffectivenessConfig {
    pub top_scenarios: usize,
    pub false_negative_check: FalseNegativeCheckConfig,
}

#[derive(Debug, Clone)]
pub struct FalseNegativeCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub lookback: Duration,
}

/// A single compiled scenario pattern: an anchored regex plus its base score.
#[derive(Debug, Clone)]
struct ScenarioPattern {
    regex: Regex,
    score: i64,
}

/// Immutable, compiled scoring configuration. Once constructed this never
/// changes for the life of the process.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    scenario_exact: HashMap<String, i64>,
    scenario_patterns: Vec<ScenarioPattern>,
    scenario_default: i64,
    pub scenario_multiplier: f64,
    origins: HashMap<String, i64>,
    decision_types: HashMap<String, i64>,
    pub recidivism_bonus: i64,
    pub ttl_scoring: TtlScoring,
    freshness_bonuses: Vec<(Duration, i64)>,
    cidr_bonuses: Vec<(u8, u8, i64)>,
}

#[derive(Debug, Clone, Copy)]
pub struct TtlScoring {
    pub enabled: bool,
    pub max_bonus: i64,
    pub max_ttl: Duration,
}

impl ScoringConfig {
    /// Resolve a scenario name to its base score.
    ///
    /// Lookup order: (1) exact match, (2) first matching anchored pattern in
    /// insertion order, (3) the `"default"` entry, (4) 0.
    #[must_use]
    pub fn scenario_score(&self, scenario: &str) -> i64 {
        if let Some(score) = self.scenario_exact.get(scenario) {
            return *score;
        }
        for pattern in &self.scenario_patterns {
            if pattern.regex.is_match(scenario) {
                return pattern.score;
            }
        }
        self.scenario_default
    }

    #[must_use]
    pub fn origin_score(&self, origin: &str) -> i64 {
        self.origins.get(origin).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn decision_type_score(&self, decision_type: &str) -> i64 {
        self.decision_types.get(decision_type).copied().unwrap_or(0)
    }

    /// Freshness bonus for an age. Tiers are evaluated in configured order;
    /// the first tier whose `max_age` is `>= age` wins.
    #[must_use]
    pub fn freshness_bonus(&self, age: Duration) -> i64 {
        for (max_age, bonus) in &self.freshness_bonuses {
            if *max_age >= age {
                return *bonus;
            }
        }
        0
    }

    /// CIDR bonus for a prefix length. First matching range wins.
    #[must_use]
    pub fn cidr_bonus(&self, prefix: u8) -> i64 {
        for (min_prefix, max_prefix, bonus) in &self.cidr_bonuses {
            if *min_prefix <= prefix && prefix <= *max_prefix {
                return *bonus;
            }
        }
        0
    }
}

impl Config {
    /// Load and validate configuration from a YAML file at `path`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate configuration from an in-memory YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let upstream_lapi_url = raw
            .upstream_lapi_url
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid("upstream_lapi_url is required".into()))?;
        let upstream_lapi_key = raw
            .upstream_lapi_key
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid("upstream_lapi_key is required".into()))?;

        let max_decisions = raw.max_decisions.unwrap_or(15_000);
        if max_decisions <= 0 {
            return Err(ConfigError::Invalid(
                "max_decisions must be positive".into(),
            ));
        }

        let cache_ttl = raw
            .cache_ttl
            .map_or(Duration::from_secs(60), HumanDuration::as_duration);

        let upstream_timeout = raw
            .upstream_timeout
            .map_or(Duration::from_secs(120), HumanDuration::as_duration);

        let log_level = raw.log_level.unwrap_or_else(|| "info".to_string());
        if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::Invalid(format!(
                "log_level must be one of debug|info|warn|error, got {log_level:?}"
            )));
        }

        let health = HealthConfig {
            enabled: raw.health.enabled.unwrap_or(true),
            path: raw.health.path.unwrap_or_else(|| "/health".to_string()),
        };
        let metrics = MetricsConfig {
            enabled: raw.metrics.enabled.unwrap_or(true),
            path: raw.metrics.path.unwrap_or_else(|| "/metrics".to_string()),
        };

        let scoring = Self::build_scoring_config(raw.scoring)?;

        let fnc = raw.effectiveness.false_negative_check;
        let false_negative_check = FalseNegativeCheckConfig {
            enabled: fnc.enabled.unwrap_or(true),
            interval: fnc
                .interval
                .map_or(Duration::from_secs(5 * 60), HumanDuration::as_duration),
            lookback: fnc
                .lookback
                .map_or(Duration::from_secs(15 * 60), HumanDuration::as_duration),
        };
        let effectiveness = EffectivenessConfig {
            top_scenarios: raw.effectiveness.top_scenarios.unwrap_or(20),
            false_negative_check,
        };

        Ok(Self {
            listen_addr: raw
                .listen_addr
                .unwrap_or_else(|| "127.0.0.1:8081".to_string()),
            upstream_lapi_url,
            upstream_lapi_key,
            max_decisions: max_decisions as usize,
            cache_ttl,
            upstream_timeout,
            log_level,
            health,
            metrics,
            scoring,
            effectiveness,
        })
    }

    fn build_scoring_config(raw: RawScoringConfig) -> Result<ScoringConfig, ConfigError> {
        let mut scenario_exact = HashMap::new();
        let mut scenario_patterns = Vec::new();
        let mut scenario_default = 0;

        for (key, score) in raw.scenarios {
            if key == "default" {
                scenario_default = score;
                continue;
            }
            // Exact name lookups always take priority over the anchored
            // regex fallback, but we still compile the pattern since a
            // scenario key also serves as a regular expression.
            let anchored = format!("^{key}$");
            let regex = Regex::new(&anchored).map_err(|e| {
                ConfigError::Invalid(format!("invalid scenario pattern {key:?}: {e}"))
            })?;
            scenario_exact.insert(key, score);
            scenario_patterns.push(ScenarioPattern { regex, score });
        }

        let scenario_multiplier = match raw.scenario_multiplier {
            Some(m) if m > 0.0 => m,
            _ => 2.0,
        };

        let ttl_scoring = TtlScoring {
            enabled: raw.ttl_scoring.enabled.unwrap_or(false),
            max_bonus: raw.ttl_scoring.max_bonus.unwrap_or(0),
            max_ttl: raw
                .ttl_scoring
                .max_ttl
                .map_or(Duration::from_secs(168 * 3600), HumanDuration::as_duration),
        };

        let freshness_bonuses = raw
            .freshness_bonuses
            .into_iter()
            .map(|b| (b.max_age.as_duration(), b.bonus))
            .collect();

        let cidr_bonuses = raw
            .cidr_bonuses
            .into_iter()
            .map(|b| (b.min_prefix, b.max_prefix, b.bonus))
            .collect();

        Ok(ScoringConfig {
            scenario_exact,
            scenario_patterns,
            scenario_default,
            scenario_multiplier,
            origins: raw.origins,
            decision_types: raw.decision_types,
            recidivism_bonus: raw.recidivism_bonus.unwrap_or(0),
            ttl_scoring,
            freshness_bonuses,
            cidr_bonuses,
        })
    }
}
