//! Wire data model shared between the upstream client, the scorer, and the
//! handler: [`Decision`], [`DecisionStream`], and [`Alert`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An advisory record that some IP (or CIDR) should be blocked.
///
/// `parsed_duration`, `parsed_created`, and `score` are derived fields: they
/// are never present on the upstream wire and are skipped on serialization,
/// so a [`Decision`] re-serializes to exactly the shape the upstream sent
/// (plus nothing), which is what downstream passthrough requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub origin: String,
    #[serde(rename = "type")]
    pub decision_type: String,
    pub scope: String,
    pub value: String,
    pub duration: String,
    pub scenario: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(skip, default)]
    pub parsed_duration: Duration,
    #[serde(skip, default)]
    pub parsed_created: Option<DateTime<Utc>>,
    #[serde(skip, default)]
    pub score: i64,
}

impl Decision {
    /// CIDR prefix length implied by `value`/`scope`.
    ///
    /// If `value` carries a `/<prefix>` suffix, that prefix is used.
    /// Otherwise a bare IP (`scope` of `"ip"`/`"Ip"`/empty) is treated as
    /// `/32`. Returns `None` when neither rule applies.
    #[must_use]
    pub fn cidr_prefix(&self) -> Option<u8> {
        if let Some((_, suffix)) = self.value.split_once('/') {
            return suffix.parse::<u8>().ok();
        }
        let scope = self.scope.as_str();
        if scope.is_empty() || scope.eq_ignore_ascii_case("ip") {
            return Some(32);
        }
        None
    }
}

/// Two ordered sequences of [`Decision`] representing a delta update.
///
/// `deleted` is never scored or truncated — invariant enforced by callers,
/// not by this type itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionStream {
    #[serde(default)]
    pub new: Vec<Decision>,
    #[serde(default)]
    pub deleted: Vec<Decision>,
}

/// A locally generated detection record, used only to detect false
/// negatives in the auditor.
#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub scenario: String,
    pub source: AlertSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertSource {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Alert {
    /// The source IP, preferring `source.value` and falling back to
    /// `source.ip`.
    #[must_use]
    pub fn source_ip(&self) -> Option<&str> {
        self.source
            .value
            .as_deref()
            .or(self.source.ip.as_deref())
            .filter(|s| !s.is_empty())
    }
}
