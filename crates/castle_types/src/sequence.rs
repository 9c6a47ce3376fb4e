//! Bounded time series of datapoint states

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::DatapointState;

/// Decides whether a new observation is appended to a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCondition {
    /// Append only if the value differs from the latest entry
    #[default]
    Value,
    /// Append only if the timestamp differs from the latest entry
    At,
}

/// Retention policy of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceLimit {
    /// Hard cap, oldest entries are dropped first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    /// Maximum age in milliseconds relative to "now"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
}

impl SequenceLimit {
    pub fn count(max_count: usize) -> Self {
        Self {
            max_count: Some(max_count),
            max_age: None,
        }
    }

    pub fn age(max_age_ms: i64) -> Self {
        Self {
            max_count: None,
            max_age: Some(max_age_ms),
        }
    }
}

/// Descriptor of a sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointSequence {
    pub id: String,
    pub name: String,
    /// Datapoint whose states are recorded
    pub datapoint_id: String,
    #[serde(default)]
    pub condition: ChangeCondition,
    #[serde(default)]
    pub limit: SequenceLimit,
}

/// Recorded states of a sequence, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceState {
    pub id: String,
    pub states: VecDeque<DatapointState>,
}

impl SequenceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            states: VecDeque::new(),
        }
    }

    pub fn first(&self) -> Option<&DatapointState> {
        self.states.front()
    }

    pub fn last(&self) -> Option<&DatapointState> {
        self.states.back()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatapointState> {
        self.states.iter()
    }

    /// Whether `condition` lets `state` be appended after the latest entry
    pub fn accepts(&self, state: &DatapointState, condition: ChangeCondition) -> bool {
        match (self.states.back(), condition) {
            (None, _) => true,
            (Some(last), ChangeCondition::Value) => !last.same_value(state),
            (Some(last), ChangeCondition::At) => last.at != state.at,
        }
    }

    /// Whether `prune` would drop anything
    pub fn exceeds(&self, limit: &SequenceLimit, now: i64) -> bool {
        let over_count = limit.max_count.is_some_and(|max| self.states.len() > max);
        let over_age = match (limit.max_age, self.states.front()) {
            (Some(max_age), Some(oldest)) => now - oldest.at > max_age,
            _ => false,
        };
        over_count || over_age
    }

    /// Append `state` if `condition` allows it, then apply `limit`
    ///
    /// Returns whether the state was appended.
    pub fn push(
        &mut self,
        state: DatapointState,
        condition: ChangeCondition,
        limit: &SequenceLimit,
        now: i64,
    ) -> bool {
        let accepted = self.accepts(&state, condition);
        if accepted {
            self.states.push_back(state);
        }
        self.prune(limit, now);
        accepted
    }

    /// Drop entries exceeding `limit`
    ///
    /// An entry whose age equals `max_age` exactly is kept.
    pub fn prune(&mut self, limit: &SequenceLimit, now: i64) {
        if let Some(max_count) = limit.max_count {
            while self.states.len() > max_count {
                self.states.pop_front();
            }
        }
        if let Some(max_age) = limit.max_age {
            while self
                .states
                .front()
                .is_some_and(|oldest| now - oldest.at > max_age)
            {
                self.states.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: i64, value: f64) -> DatapointState {
        DatapointState::number("p", at, value)
    }

    #[test]
    fn test_max_count_keeps_latest_in_order() {
        let mut seq = SequenceState::new("s");
        let limit = SequenceLimit::count(3);
        for i in 0..5 {
            seq.push(sample(i, i as f64), ChangeCondition::Value, &limit, 10);
        }
        let ats: Vec<i64> = seq.iter().map(|s| s.at).collect();
        assert_eq!(ats, vec![2, 3, 4]);
    }

    #[test]
    fn test_max_age_boundary_is_kept() {
        let mut seq = SequenceState::new("s");
        let none = SequenceLimit::default();
        for (i, at) in [0, 30_000, 61_000, 90_000].into_iter().enumerate() {
            seq.push(sample(at, i as f64), ChangeCondition::Value, &none, at);
        }
        let limit = SequenceLimit::age(60_000);
        assert!(seq.exceeds(&limit, 90_000));
        seq.prune(&limit, 90_000);
        assert!(!seq.exceeds(&limit, 90_000));
        let ats: Vec<i64> = seq.iter().map(|s| s.at).collect();
        assert_eq!(ats, vec![30_000, 61_000, 90_000]);
    }

    #[test]
    fn test_value_condition_skips_unchanged() {
        let mut seq = SequenceState::new("s");
        let none = SequenceLimit::default();
        assert!(seq.push(sample(1, 1.0), ChangeCondition::Value, &none, 1));
        assert!(!seq.push(sample(2, 1.0), ChangeCondition::Value, &none, 2));
        assert!(seq.push(sample(3, 2.0), ChangeCondition::Value, &none, 3));
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn test_at_condition_skips_same_timestamp() {
        let mut seq = SequenceState::new("s");
        let none = SequenceLimit::default();
        assert!(seq.push(sample(1, 1.0), ChangeCondition::At, &none, 1));
        assert!(!seq.push(sample(1, 5.0), ChangeCondition::At, &none, 1));
        assert!(seq.push(sample(2, 1.0), ChangeCondition::At, &none, 2));
        assert_eq!(seq.len(), 2);
    }
}
