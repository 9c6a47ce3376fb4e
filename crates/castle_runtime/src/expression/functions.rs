//! Sequence arithmetic behind the expression functions

use std::str::FromStr;

use castle_types::{DatapointState, SequenceState};

/// Length of a duration unit in milliseconds
pub fn unit_ms(unit: &str) -> Option<f64> {
    let ms = match unit {
        "ms" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "second" | "seconds" => 1_000.0,
        "m" | "min" | "minute" | "minutes" => 60_000.0,
        "h" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        _ => return None,
    };
    Some(ms)
}

/// Span between first and last sample; 0 for fewer than two samples
pub fn seq_duration(sequence: &SequenceState, unit_ms: f64) -> f64 {
    match (sequence.first(), sequence.last()) {
        (Some(first), Some(last)) => (last.at - first.at) as f64 / unit_ms,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    First,
    Last,
}

impl FromStr for Which {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Which::First),
            "last" => Ok(Which::Last),
            other => Err(format!("expected \"first\" or \"last\", got \"{other}\"")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aspect {
    At,
    Value,
}

impl FromStr for Aspect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "at" => Ok(Aspect::At),
            "value" => Ok(Aspect::Value),
            other => Err(format!("expected \"at\" or \"value\", got \"{other}\"")),
        }
    }
}

/// First or last sample satisfying `matches`
pub fn seq_find<'a>(
    sequence: &'a SequenceState,
    which: Which,
    matches: impl Fn(&DatapointState) -> bool,
) -> Option<&'a DatapointState> {
    match which {
        Which::First => sequence.iter().find(|s| matches(s)),
        Which::Last => sequence.states.iter().rev().find(|s| matches(s)),
    }
}

/// Trapezoid integral over consecutive samples, time measured in `unit_ms`
pub fn seq_integral(sequence: &SequenceState, unit_ms: f64) -> Result<f64, String> {
    let mut values = Vec::with_capacity(sequence.len());
    for state in sequence.iter() {
        match state.value_num {
            Some(value) => values.push((state.at, value)),
            None => {
                return Err(format!(
                    "sequence {} has a non-numeric sample at {}",
                    sequence.id, state.at
                ));
            }
        }
    }

    let area: f64 = values
        .windows(2)
        .map(|pair| {
            let (t0, y0) = pair[0];
            let (t1, y1) = pair[1];
            (t1 - t0) as f64 * (y0 + y1) / 2.0
        })
        .sum();
    Ok(area / unit_ms)
}

/// Index of the highest limit not above `value`
///
/// Limits are expected in ascending order.
pub fn range_index(value: f64, limits: &[f64]) -> Option<usize> {
    (0..limits.len()).rev().find(|&i| limits[i] <= value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_types::{ChangeCondition, SequenceLimit};

    fn sequence(samples: &[(i64, f64)]) -> SequenceState {
        let mut seq = SequenceState::new("s");
        for &(at, value) in samples {
            seq.push(
                DatapointState::number("p", at, value),
                ChangeCondition::At,
                &SequenceLimit::default(),
                at,
            );
        }
        seq
    }

    #[test]
    fn test_units() {
        assert_eq!(unit_ms("s"), Some(1000.0));
        assert_eq!(unit_ms("hours"), Some(3_600_000.0));
        assert_eq!(unit_ms("fortnight"), None);
    }

    #[test]
    fn test_duration() {
        let seq = sequence(&[(1000, 1.0), (4000, 2.0), (61_000, 3.0)]);
        assert_eq!(seq_duration(&seq, 1000.0), 60.0);
        assert_eq!(seq_duration(&sequence(&[(5, 1.0)]), 1.0), 0.0);
        assert_eq!(seq_duration(&SequenceState::new("empty"), 1.0), 0.0);
    }

    #[test]
    fn test_integral_is_trapezoid() {
        let ramp = sequence(&[(0, 0.0), (1000, 10.0)]);
        assert_eq!(seq_integral(&ramp, 1000.0), Ok(5.0));
        assert_eq!(seq_integral(&ramp, 1.0), Ok(5000.0));

        let seq = sequence(&[(0, 0.0), (1000, 10.0), (3000, 10.0)]);
        assert_eq!(seq_integral(&seq, 1000.0), Ok(25.0));
        assert_eq!(seq_integral(&sequence(&[(0, 4.0)]), 1000.0), Ok(0.0));
    }

    #[test]
    fn test_integral_rejects_strings() {
        let mut seq = sequence(&[(0, 1.0)]);
        seq.states.push_back(DatapointState::string("p", 10, "on"));
        assert!(seq_integral(&seq, 1.0).is_err());
    }

    #[test]
    fn test_find_first_and_last() {
        let seq = sequence(&[(1, 1.0), (2, 0.0), (3, 1.0)]);
        let is_on = |s: &DatapointState| s.value_num == Some(1.0);
        assert_eq!(seq_find(&seq, Which::First, is_on).map(|s| s.at), Some(1));
        assert_eq!(seq_find(&seq, Which::Last, is_on).map(|s| s.at), Some(3));
        assert!(seq_find(&seq, Which::Last, |s| s.value_num == Some(7.0)).is_none());
        assert!("middle".parse::<Which>().is_err());
    }

    #[test]
    fn test_range_index() {
        let limits = [0.0, 10.0, 20.0];
        assert_eq!(range_index(15.0, &limits), Some(1));
        assert_eq!(range_index(20.0, &limits), Some(2));
        assert_eq!(range_index(-1.0, &limits), None);
    }
}
