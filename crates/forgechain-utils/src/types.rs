//! Small cross-cutting types shared by every `forgechain-*` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five primary orchestrator modes plus the generic cascade mode (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    Generate,
    Modify,
    Qa,
    Qfile,
    Batch,
    Cascade,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::Generate => "GENERATE",
            RunMode::Modify => "MODIFY",
            RunMode::Qa => "QA",
            RunMode::Qfile => "QFILE",
            RunMode::Batch => "BATCH",
            RunMode::Cascade => "CASCADE",
        };
        write!(f, "{s}")
    }
}

/// Terminal and intermediate lifecycle states for a run (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    StoppedByUser,
    ForceKilled,
}

/// A unique run identifier: `RUN_DDMMYYYYhhmm_XXXX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Construct a new run id from the given timestamp and a 4-character
    /// random alphanumeric suffix supplied by the caller (kept injectable
    /// so orchestration tests can assert on deterministic ids).
    #[must_use]
    pub fn new(at: DateTime<Utc>, suffix: &str) -> Self {
        Self(format!("RUN_{}_{}", at.format("%d%m%Y%H%M"), suffix))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a previously generated run id back, validating the expected
    /// `RUN_<12 digits>_<suffix>` shape.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("RUN_")?;
        let (stamp, suffix) = rest.split_once('_')?;
        if stamp.len() != 12 || !stamp.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(s.to_string()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a 4-character random alphanumeric suffix for a new run id.
pub fn random_suffix() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..4)
        .map(|_| {
            let idx = rng.random_range(0..CHARS.len());
            CHARS[idx] as char
        })
        .collect()
}

/// An append-only log line written to `events.jsonl` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Capability flags as a sum type (Design Note §9) distinguishing a
/// confirmed rejection from a probe that never ran cleanly.
///
/// The on-disk/wire format still uses the legacy boolean+`errors` map shape
/// (§6 capability cache file); [`Support::into_legacy`] /
/// [`Support::from_legacy`] convert at that serialization boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Support {
    Yes,
    No(String),
    Inconclusive(String),
}

impl Support {
    #[must_use]
    pub fn as_bool(&self) -> bool {
        !matches!(self, Support::No(_))
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Support::Yes => None,
            Support::No(r) | Support::Inconclusive(r) => Some(r),
        }
    }

    /// Convert to the legacy `(bool, Option<reason>)` encoding used by the
    /// on-disk capability record.
    #[must_use]
    pub fn into_legacy(self) -> (bool, Option<String>) {
        match self {
            Support::Yes => (true, None),
            Support::No(r) => (false, Some(r)),
            Support::Inconclusive(r) => (true, Some(format!("inconclusive: {r}"))),
        }
    }

    /// Reconstruct from the legacy encoding. A reason prefixed with
    /// `inconclusive:` round-trips back to `Inconclusive`; any other reason
    /// paired with `flag=false` is a confirmed `No`.
    #[must_use]
    pub fn from_legacy(flag: bool, reason: Option<&str>) -> Self {
        match (flag, reason) {
            (true, Some(r)) if r.starts_with("inconclusive:") => {
                Support::Inconclusive(r.trim_start_matches("inconclusive:").trim().to_string())
            }
            (true, _) => Support::Yes,
            (false, Some(r)) => Support::No(r.to_string()),
            (false, None) => Support::No("unknown".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_id_round_trips() {
        let at = Utc.with_ymd_and_hms(2026, 7, 27, 10, 30, 0).unwrap();
        let id = RunId::new(at, "AB12");
        assert_eq!(id.as_str(), "RUN_270720261030_AB12");
        assert!(RunId::parse(id.as_str()).is_some());
    }

    #[test]
    fn run_id_rejects_malformed() {
        assert!(RunId::parse("not-a-run-id").is_none());
        assert!(RunId::parse("RUN_123_AB12").is_none());
    }

    #[test]
    fn support_legacy_round_trip() {
        for s in [
            Support::Yes,
            Support::No("rejected".into()),
            Support::Inconclusive("timeout".into()),
        ] {
            let (flag, reason) = s.clone().into_legacy();
            let back = Support::from_legacy(flag, reason.as_deref());
            assert_eq!(s, back);
        }
    }

    #[test]
    fn random_suffix_is_four_alphanumeric() {
        let s = random_suffix();
        assert_eq!(s.len(), 4);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
