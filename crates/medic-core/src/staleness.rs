//! Per-state dwell thresholds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::duration;
use crate::types::{PrState, PullRequestRecord};

const MINUTE: u64 = 60;

/// Maximum dwell per non-terminal state before a PR counts as stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessPolicy {
    thresholds: BTreeMap<PrState, Duration>,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        let thresholds = [
            (PrState::Created, 5),
            (PrState::ChecksRunning, 60),
            (PrState::ChecksPassed, 15),
            (PrState::ChecksFailed, 30),
            (PrState::PolicyEvaluating, 30),
            (PrState::PolicyPassed, 15),
            (PrState::PolicyFailed, 10),
            (PrState::Approved, 10),
            (PrState::Merging, 5),
        ]
        .into_iter()
        .map(|(state, minutes)| (state, Duration::from_secs(minutes * MINUTE)))
        .collect();

        Self { thresholds }
    }
}

impl StalenessPolicy {
    /// A policy with no thresholds; nothing is ever stale.
    pub fn empty() -> Self {
        Self {
            thresholds: BTreeMap::new(),
        }
    }

    pub fn with_threshold(mut self, state: PrState, threshold: Duration) -> Self {
        self.thresholds.insert(state, threshold);
        self
    }

    pub fn threshold(&self, state: PrState) -> Option<Duration> {
        if state.is_terminal() {
            return None;
        }
        self.thresholds.get(&state).copied()
    }

    pub fn thresholds(&self) -> impl Iterator<Item = (PrState, Duration)> + '_ {
        self.thresholds.iter().map(|(s, d)| (*s, *d))
    }

    /// True when `dwell` exceeds the threshold for `state`.
    pub fn exceeds(&self, state: PrState, dwell: Duration) -> bool {
        self.threshold(state).is_some_and(|limit| dwell > limit)
    }

    pub fn is_stale(&self, record: &PullRequestRecord, now: DateTime<Utc>) -> bool {
        self.exceeds(record.state, record.dwell(now))
    }

    /// Overlay `other` on top of this policy.
    pub(crate) fn merge(&mut self, other: BTreeMap<PrState, Duration>) {
        self.thresholds.extend(other);
    }

    /// States configured with a threshold that can never apply.
    pub(crate) fn terminal_entries(&self) -> Vec<PrState> {
        self.thresholds
            .keys()
            .copied()
            .filter(|s| s.is_terminal())
            .collect()
    }
}

impl Serialize for StalenessPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        duration::human_map::serialize(&self.thresholds, serializer)
    }
}

impl<'de> Deserialize<'de> for StalenessPolicy {
    /// Entries overlay the defaults; unspecified states keep their default.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let overrides = duration::human_map::deserialize(deserializer)?;
        let mut policy = Self::default();
        policy.merge(overrides);
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrRef;
    use chrono::TimeZone;

    fn record(state: PrState, minutes_ago: i64, now: DateTime<Utc>) -> PullRequestRecord {
        PullRequestRecord::new(
            PrRef::new("acme/api", 42),
            state,
            now - chrono::Duration::minutes(minutes_ago),
        )
    }

    #[test]
    fn test_default_thresholds() {
        let policy = StalenessPolicy::default();
        assert_eq!(policy.threshold(PrState::Created), Some(Duration::from_secs(300)));
        assert_eq!(
            policy.threshold(PrState::ChecksRunning),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(policy.threshold(PrState::Merged), None);
    }

    #[test]
    fn test_stale_after_threshold() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let policy = StalenessPolicy::default();

        assert!(policy.is_stale(&record(PrState::ChecksFailed, 35, now), now));
        assert!(!policy.is_stale(&record(PrState::ChecksFailed, 30, now), now));
        assert!(!policy.is_stale(&record(PrState::ChecksFailed, 10, now), now));
    }

    #[test]
    fn test_terminal_never_stale() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let policy = StalenessPolicy::default()
            .with_threshold(PrState::Merged, Duration::from_secs(1));
        assert!(!policy.is_stale(&record(PrState::Merged, 600, now), now));
        assert!(!policy.is_stale(&record(PrState::NeedsIntervention, 600, now), now));
    }

    #[test]
    fn test_yaml_overlays_defaults() {
        let policy: StalenessPolicy = serde_yaml::from_str("CREATED: 2m\nMERGING: 1h\n").unwrap();
        assert_eq!(policy.threshold(PrState::Created), Some(Duration::from_secs(120)));
        assert_eq!(policy.threshold(PrState::Merging), Some(Duration::from_secs(3600)));
        assert_eq!(
            policy.threshold(PrState::ChecksFailed),
            Some(Duration::from_secs(1800))
        );
    }
}
