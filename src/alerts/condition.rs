//! Pure evaluation of a rule condition over a window of readings.
//!
//! Only Good-quality readings are considered. A window with no usable
//! Good reading yields [`Evaluation::NoData`], which neither fires nor
//! clears anything.

use crate::models::{NormalizedReading, RuleCondition};

// ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    /// Condition holds. `value` is the triggering observation (a reading
    /// value, or a rate per minute for rate-of-change rules).
    Breached { value: f64, threshold: f64 },
    /// Condition does not hold.
    Normal { value: f64 },
    NoData,
}

impl Evaluation {
    pub fn is_breached(&self) -> bool {
        matches!(self, Evaluation::Breached { .. })
    }
}

/// Evaluate `condition` against `readings`, given in insertion order.
///
/// Readings are ranked by effective timestamp. Among readings sharing a
/// timestamp the one inserted last supersedes the others, so a
/// same-timestamp correction wins.
///
/// Boundary values breach: `ThresholdAbove` uses `>=`, `ThresholdBelow`
/// uses `<=`, `RateOfChange` uses `>=`.
pub fn evaluate(condition: &RuleCondition, readings: &[NormalizedReading]) -> Evaluation {
    // ---
    let mut good: Vec<&NormalizedReading> =
        readings.iter().filter(|r| r.quality.is_good()).collect();
    // Stable, so ties keep insertion order
    good.sort_by_key(|r| r.effective_ts());
    good.reverse();
    good.dedup_by_key(|r| r.effective_ts());
    good.reverse();

    match *condition {
        RuleCondition::ThresholdAbove { threshold } => match good.last() {
            Some(r) => compare(r.value, threshold, r.value >= threshold),
            None => Evaluation::NoData,
        },
        RuleCondition::ThresholdBelow { threshold } => match good.last() {
            Some(r) => compare(r.value, threshold, r.value <= threshold),
            None => Evaluation::NoData,
        },
        RuleCondition::RateOfChange {
            max_change_per_minute,
        } => {
            let [.., prev, last] = good.as_slice() else {
                return Evaluation::NoData;
            };
            let minutes = (last.effective_ts() - prev.effective_ts()).num_milliseconds() as f64
                / 60_000.0;
            if minutes <= 0.0 {
                return Evaluation::NoData;
            }
            let rate = (last.value - prev.value).abs() / minutes;
            compare(rate, max_change_per_minute, rate >= max_change_per_minute)
        }
    }
}

fn compare(value: f64, threshold: f64, breached: bool) -> Evaluation {
    // ---
    if breached {
        Evaluation::Breached { value, threshold }
    } else {
        Evaluation::Normal { value }
    }
}
