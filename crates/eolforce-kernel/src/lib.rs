//! `eolforce-kernel` – Verdict & Safety Rules
//!
//! Pure decision logic of the test station.  Nothing in this crate performs
//! device I/O; the runtime feeds it measured data and acts on the outcome.
//!
//! # Modules
//!
//! - [`evaluator`] – [`Evaluator`][evaluator::Evaluator]: applies the
//!   profile's tolerance predicates to the closed cycles of a test, in order,
//!   and returns PASS or the first failing predicate as the FAIL cause.
//! - [`interlock`] – [`InterlockMonitor`][interlock::InterlockMonitor]:
//!   decides whether any configured safety input (door switch, e-stop
//!   button) is asserted given the sampled input levels.

pub mod evaluator;
pub mod interlock;

pub use evaluator::{
    Evaluation, EvaluationRule, Evaluator, ForceBandRule, OverRangeRule, PeakDeviationRule,
    RuleFailure,
};
pub use interlock::{InterlockMonitor, InterlockTrip};
