//! [`Evaluator`] – verdict predicate engine.
//!
//! Every registered [`EvaluationRule`] is applied to the closed cycles of a
//! test, in insertion order.  The first rule that fails decides the verdict
//! (FAIL) and its cause; when every rule passes the verdict is PASS.
//!
//! [`Evaluator::standard`] registers the three station predicates:
//!
//! | Order | Rule                  | Cause               |
//! |-------|-----------------------|---------------------|
//! | 1     | [`ForceBandRule`]     | `force_out_of_band` |
//! | 2     | [`PeakDeviationRule`] | `force_deviation`   |
//! | 3     | [`OverRangeRule`]     | `over_range`        |

use eolforce_types::{CycleResult, Tolerance, Verdict};
use tracing::{debug, info};

// ────────────────────────────────────────────────────────────────────────────
// Outcome
// ────────────────────────────────────────────────────────────────────────────

/// A failed predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    /// Machine-readable cause stored in the record.
    pub cause: &'static str,
    /// Human-readable context for the log.
    pub detail: String,
}

/// Verdict and cause produced by [`Evaluator::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Empty on PASS.
    pub cause: String,
    pub detail: Option<String>,
}

impl Evaluation {
    fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            cause: String::new(),
            detail: None,
        }
    }

    fn fail(failure: RuleFailure) -> Self {
        Self {
            verdict: Verdict::Fail,
            cause: failure.cause.to_string(),
            detail: Some(failure.detail),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single acceptance predicate over the cycles of a test.
pub trait EvaluationRule: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, cycles: &[CycleResult], tolerance: &Tolerance) -> Result<(), RuleFailure>;
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluator
// ────────────────────────────────────────────────────────────────────────────

/// Ordered list of [`EvaluationRule`]s.
///
/// # Example
///
/// ```
/// use eolforce_kernel::Evaluator;
/// use eolforce_types::{Tolerance, Verdict};
///
/// let tolerance = Tolerance { min_force: 10.0, max_force: 50.0, max_deviation_per_cycle: 5.0 };
/// // A test without cycles never passes.
/// assert_eq!(Evaluator::standard().evaluate(&[], &tolerance).verdict, Verdict::Fail);
/// ```
#[derive(Default)]
pub struct Evaluator {
    rules: Vec<Box<dyn EvaluationRule>>,
}

impl Evaluator {
    /// An evaluator with no rules; it only rejects an empty cycle list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force band, then peak deviation, then over-range.
    pub fn standard() -> Self {
        let mut evaluator = Self::new();
        evaluator.add_rule(Box::new(ForceBandRule));
        evaluator.add_rule(Box::new(PeakDeviationRule));
        evaluator.add_rule(Box::new(OverRangeRule));
        evaluator
    }

    /// Register a rule.  Rules run in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn EvaluationRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn evaluate(&self, cycles: &[CycleResult], tolerance: &Tolerance) -> Evaluation {
        if cycles.is_empty() {
            return Evaluation::fail(RuleFailure {
                cause: "no_cycles",
                detail: "no cycle was recorded".to_string(),
            });
        }
        for rule in &self.rules {
            if let Err(failure) = rule.check(cycles, tolerance) {
                info!(rule = rule.name(), cause = failure.cause, detail = %failure.detail, "evaluation failed");
                return Evaluation::fail(failure);
            }
            debug!(rule = rule.name(), "rule passed");
        }
        Evaluation::pass()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Every sample of every cycle lies in `[min_force, max_force]`.
pub struct ForceBandRule;

impl EvaluationRule for ForceBandRule {
    fn name(&self) -> &str {
        "force_band"
    }

    fn check(&self, cycles: &[CycleResult], tolerance: &Tolerance) -> Result<(), RuleFailure> {
        for cycle in cycles {
            if let Some(sample) = cycle.samples().iter().find(|s| !tolerance.contains(s.force_n)) {
                return Err(RuleFailure {
                    cause: "force_out_of_band",
                    detail: format!(
                        "cycle {} at t={} ns: {} N outside [{}, {}]",
                        cycle.cycle_index,
                        sample.t_ns,
                        sample.force_n,
                        tolerance.min_force,
                        tolerance.max_force
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Each cycle's peak force stays within `max_deviation_per_cycle` of the
/// median peak force.
pub struct PeakDeviationRule;

/// Median of a non-empty slice; mean of the two middle values for even
/// lengths.
fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

impl EvaluationRule for PeakDeviationRule {
    fn name(&self) -> &str {
        "peak_deviation"
    }

    fn check(&self, cycles: &[CycleResult], tolerance: &Tolerance) -> Result<(), RuleFailure> {
        let peaks: Vec<f64> = cycles.iter().map(|c| c.peak_force).collect();
        let median = median(&peaks);
        for cycle in cycles {
            let deviation = (cycle.peak_force - median).abs();
            if deviation > tolerance.max_deviation_per_cycle {
                return Err(RuleFailure {
                    cause: "force_deviation",
                    detail: format!(
                        "cycle {} peak {} N deviates {deviation:.3} N from median {median} N (max {})",
                        cycle.cycle_index, cycle.peak_force, tolerance.max_deviation_per_cycle
                    ),
                });
            }
        }
        Ok(())
    }
}

/// No sample is flagged over-range.
pub struct OverRangeRule;

impl EvaluationRule for OverRangeRule {
    fn name(&self) -> &str {
        "over_range"
    }

    fn check(&self, cycles: &[CycleResult], _tolerance: &Tolerance) -> Result<(), RuleFailure> {
        for cycle in cycles {
            if let Some(sample) = cycle.samples().iter().find(|s| s.over_range) {
                return Err(RuleFailure {
                    cause: "over_range",
                    detail: format!("cycle {} at t={} ns", cycle.cycle_index, sample.t_ns),
                });
            }
        }
        Ok(())
    }
}
