//! Measurement and record model.
//!
//! | Type            | Built by            | Frozen when                      |
//! |-----------------|---------------------|----------------------------------|
//! | [`Sample`]      | cycle loop          | on construction                  |
//! | [`CycleResult`] | cycle loop          | [`CycleResult::close`]           |
//! | [`TestRecord`]  | PREPARE             | [`TestRecord::finalize`]         |
//!
//! All invariants are checked at construction time and reported as
//! [`MeasurementError`]; nothing in this module panics on bad input.
//!
//! # Wire layout
//!
//! A cycle serializes its samples as aligned column arrays:
//!
//! ```json
//! "samples": { "t_ns": [..], "cmd_pos_um": [..], "act_pos_um": [..],
//!              "force_n": [..], "temp_c": [..], "over_range": [..] }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StationLimits;
use crate::error::{EolError, MeasurementError};
use crate::health::FaultEntry;
use crate::profile::{Profile, Tolerance};

/// Process exit code for a usage error of the launcher.
pub const EXIT_USAGE: i32 = 64;

// ────────────────────────────────────────────────────────────────────────────
// DUT identity
// ────────────────────────────────────────────────────────────────────────────

/// Identity of the unit under test and of the people and station testing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutIdentity {
    pub serial_number: String,
    #[serde(default)]
    pub part_number: String,
    #[serde(default)]
    pub operator_id: String,
    #[serde(default)]
    pub station_id: String,
}

impl DutIdentity {
    pub fn new(
        serial_number: impl Into<String>,
        part_number: impl Into<String>,
        operator_id: impl Into<String>,
        station_id: impl Into<String>,
    ) -> Self {
        Self {
            serial_number: serial_number.into(),
            part_number: part_number.into(),
            operator_id: operator_id.into(),
            station_id: station_id.into(),
        }
    }

    /// # Errors
    ///
    /// [`EolError::DutInvalid`] when the serial number is blank.
    pub fn validate(&self) -> Result<(), EolError> {
        if self.serial_number.trim().is_empty() {
            return Err(EolError::DutInvalid("serial number is empty".into()));
        }
        if self.serial_number.chars().any(char::is_control) {
            return Err(EolError::DutInvalid(
                "serial number contains control characters".into(),
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sample
// ────────────────────────────────────────────────────────────────────────────

/// Round `force_n` to 6 decimals so a JSON round trip is bit-identical.
pub fn quantize_force(force_n: f64) -> f64 {
    (force_n * 1e6).round() / 1e6
}

/// One synchronized force/position reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Nanoseconds since the test clock origin.
    pub t_ns: u64,
    pub cmd_pos_um: f64,
    pub act_pos_um: f64,
    pub force_n: f64,
    pub temp_c: f64,
    pub over_range: bool,
}

impl Sample {
    /// Validate and build a sample.
    ///
    /// # Errors
    ///
    /// - [`MeasurementError::NonFiniteForce`] for NaN or infinite force.
    /// - [`MeasurementError::PositionOutOfLimits`] when the actual position
    ///   leaves the axis soft limits.
    pub fn new(
        t_ns: u64,
        cmd_pos_um: f64,
        act_pos_um: f64,
        force_n: f64,
        temp_c: f64,
        limits: &StationLimits,
    ) -> Result<Self, MeasurementError> {
        if !force_n.is_finite() {
            return Err(MeasurementError::NonFiniteForce(force_n));
        }
        if !act_pos_um.is_finite() || !limits.position_allowed(act_pos_um) {
            return Err(MeasurementError::PositionOutOfLimits {
                position_um: act_pos_um,
                min_um: limits.soft_limit_min_um,
                max_um: limits.soft_limit_max_um,
            });
        }
        Ok(Self {
            t_ns,
            cmd_pos_um,
            act_pos_um,
            force_n: quantize_force(force_n),
            temp_c,
            over_range: false,
        })
    }

    pub fn with_over_range(mut self, over_range: bool) -> Self {
        self.over_range = over_range;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CycleResult
// ────────────────────────────────────────────────────────────────────────────

/// Samples and statistics of one execution of the stroke plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_index: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "columns")]
    samples: Vec<Sample>,
    pub peak_force: f64,
    pub mean_force: f64,
    /// Every sample lies inside the profile's force band.
    pub within_tolerance: bool,
    /// `false` when the cycle was cut short by an abort.
    pub complete: bool,
    /// Set when at least one sample gap exceeded twice the nominal period.
    pub degraded: bool,
    pub gap_count: u32,
    #[serde(skip)]
    expected_period_ns: u64,
}

impl CycleResult {
    /// Start an empty, open cycle.
    pub fn open(cycle_index: u32, started_at: DateTime<Utc>, expected_period: Duration) -> Self {
        Self {
            cycle_index,
            started_at,
            ended_at: None,
            samples: Vec::new(),
            peak_force: 0.0,
            mean_force: 0.0,
            within_tolerance: false,
            complete: false,
            degraded: false,
            gap_count: 0,
            expected_period_ns: u64::try_from(expected_period.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn last_sample(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Append a sample to an open cycle.
    ///
    /// # Errors
    ///
    /// [`MeasurementError::CycleClosed`] after [`close`](Self::close), and
    /// [`MeasurementError::NonMonotonicTimestamp`] when `sample.t_ns` does not
    /// strictly advance.
    pub fn append(&mut self, sample: Sample) -> Result<(), MeasurementError> {
        if self.is_closed() {
            return Err(MeasurementError::CycleClosed(self.cycle_index));
        }
        if let Some(prev) = self.samples.last() {
            if sample.t_ns <= prev.t_ns {
                return Err(MeasurementError::NonMonotonicTimestamp {
                    prev_ns: prev.t_ns,
                    next_ns: sample.t_ns,
                });
            }
            let gap = sample.t_ns - prev.t_ns;
            if self.expected_period_ns > 0 && gap > self.expected_period_ns.saturating_mul(2) {
                self.degraded = true;
                self.gap_count += 1;
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Freeze a fully executed cycle and compute its statistics.
    ///
    /// # Errors
    ///
    /// [`MeasurementError::EmptyCycle`] when no sample was appended.
    pub fn close(
        &mut self,
        ended_at: DateTime<Utc>,
        tolerance: &Tolerance,
    ) -> Result<(), MeasurementError> {
        self.freeze(ended_at, tolerance, true)
    }

    /// Freeze a cycle interrupted by an abort.
    pub fn close_incomplete(
        &mut self,
        ended_at: DateTime<Utc>,
        tolerance: &Tolerance,
    ) -> Result<(), MeasurementError> {
        self.freeze(ended_at, tolerance, false)
    }

    fn freeze(
        &mut self,
        ended_at: DateTime<Utc>,
        tolerance: &Tolerance,
        complete: bool,
    ) -> Result<(), MeasurementError> {
        if self.is_closed() {
            return Err(MeasurementError::CycleClosed(self.cycle_index));
        }
        if self.samples.is_empty() {
            return Err(MeasurementError::EmptyCycle(self.cycle_index));
        }
        let forces = self.samples.iter().map(|s| s.force_n);
        self.peak_force = forces.clone().fold(f64::NEG_INFINITY, f64::max);
        self.mean_force = quantize_force(forces.sum::<f64>() / self.samples.len() as f64);
        self.within_tolerance = self.samples.iter().all(|s| tolerance.contains(s.force_n));
        self.complete = complete;
        self.ended_at = Some(ended_at);
        Ok(())
    }
}

/// Column-array encoding of a cycle's samples.
mod columns {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Sample;

    #[derive(Serialize, Deserialize, Default)]
    struct Columns {
        t_ns: Vec<u64>,
        cmd_pos_um: Vec<f64>,
        act_pos_um: Vec<f64>,
        force_n: Vec<f64>,
        temp_c: Vec<f64>,
        #[serde(default)]
        over_range: Vec<bool>,
    }

    pub fn serialize<S: Serializer>(samples: &[Sample], s: S) -> Result<S::Ok, S::Error> {
        let mut cols = Columns::default();
        for sample in samples {
            cols.t_ns.push(sample.t_ns);
            cols.cmd_pos_um.push(sample.cmd_pos_um);
            cols.act_pos_um.push(sample.act_pos_um);
            cols.force_n.push(sample.force_n);
            cols.temp_c.push(sample.temp_c);
            cols.over_range.push(sample.over_range);
        }
        cols.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Sample>, D::Error> {
        let cols = Columns::deserialize(d)?;
        let n = cols.t_ns.len();
        let aligned = [
            cols.cmd_pos_um.len(),
            cols.act_pos_um.len(),
            cols.force_n.len(),
            cols.temp_c.len(),
        ]
        .iter()
        .all(|len| *len == n);
        if !aligned || !(cols.over_range.is_empty() || cols.over_range.len() == n) {
            return Err(D::Error::custom("sample columns are not aligned"));
        }
        Ok((0..n)
            .map(|i| Sample {
                t_ns: cols.t_ns[i],
                cmd_pos_um: cols.cmd_pos_um[i],
                act_pos_um: cols.act_pos_um[i],
                force_n: cols.force_n[i],
                temp_c: cols.temp_c[i],
                over_range: cols.over_range.get(i).copied().unwrap_or(false),
            })
            .collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Verdict & TestRecord
// ────────────────────────────────────────────────────────────────────────────

/// Final categorical outcome of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Aborted,
    Error,
}

impl Verdict {
    /// Exit code of the launcher for this verdict.
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 2,
            Verdict::Aborted => 3,
            Verdict::Error => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Aborted => "ABORTED",
            Verdict::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PASS" => Some(Verdict::Pass),
            "FAIL" => Some(Verdict::Fail),
            "ABORTED" => Some(Verdict::Aborted),
            "ERROR" => Some(Verdict::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one test, persisted as a single JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: Uuid,
    pub dut: DutIdentity,
    pub profile: Profile,
    cycles: Vec<CycleResult>,
    pub verdict: Verdict,
    /// Empty on PASS.
    pub cause: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub station: String,
    pub operator: String,
    /// Device faults observed while the test ran, in arrival order.
    #[serde(default)]
    pub faults: Vec<FaultEntry>,
}

impl TestRecord {
    /// Create an unfinished record.  The verdict stays ERROR until
    /// [`finalize`](Self::finalize) is called.
    pub fn new(dut: DutIdentity, profile: Profile, started_at: DateTime<Utc>) -> Self {
        let station = dut.station_id.clone();
        let operator = dut.operator_id.clone();
        Self {
            id: Uuid::new_v4(),
            dut,
            profile,
            cycles: Vec::new(),
            verdict: Verdict::Error,
            cause: "unfinished".to_string(),
            started_at,
            ended_at: started_at,
            station,
            operator,
            faults: Vec::new(),
        }
    }

    pub fn cycles(&self) -> &[CycleResult] {
        &self.cycles
    }

    /// Append a closed cycle.  Cycles must arrive in index order.
    ///
    /// # Errors
    ///
    /// [`MeasurementError::CycleOpen`] for a cycle that was not closed and
    /// [`MeasurementError::CycleOutOfOrder`] for a skipped or repeated index.
    pub fn push_cycle(&mut self, cycle: CycleResult) -> Result<(), MeasurementError> {
        if !cycle.is_closed() {
            return Err(MeasurementError::CycleOpen(cycle.cycle_index));
        }
        let expected = self.cycles.len() as u32;
        if cycle.cycle_index != expected {
            return Err(MeasurementError::CycleOutOfOrder {
                expected,
                got: cycle.cycle_index,
            });
        }
        self.cycles.push(cycle);
        Ok(())
    }

    /// Set the verdict, cause and end time.  PASS always clears the cause.
    pub fn finalize(&mut self, verdict: Verdict, cause: impl Into<String>, ended_at: DateTime<Utc>) {
        self.verdict = verdict;
        self.cause = if verdict == Verdict::Pass {
            String::new()
        } else {
            cause.into()
        };
        self.ended_at = ended_at.max(self.started_at);
    }

    /// Every sample of every cycle in order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.cycles.iter().flat_map(|c| c.samples().iter())
    }

    /// File name of the persisted record: `<serial>_<start>_<id>.json`.
    pub fn file_name(&self) -> String {
        let serial: String = self
            .dut
            .serial_number
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{serial}_{}_{}.json",
            self.started_at.format("%Y%m%dT%H%M%S"),
            self.id.simple()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tolerance() -> Tolerance {
        Tolerance {
            min_force: 10.0,
            max_force: 50.0,
            max_deviation_per_cycle: 5.0,
        }
    }

    fn sample(t_ns: u64, force: f64) -> Sample {
        Sample::new(t_ns, 100.0, 99.5, force, 40.0, &StationLimits::default()).unwrap()
    }

    #[test]
    fn sample_rejects_nan_and_out_of_limit_position() {
        let limits = StationLimits::default();
        assert!(matches!(
            Sample::new(0, 0.0, 0.0, f64::NAN, 25.0, &limits),
            Err(MeasurementError::NonFiniteForce(_))
        ));
        assert!(matches!(
            Sample::new(0, 0.0, -9_999.0, 1.0, 25.0, &limits),
            Err(MeasurementError::PositionOutOfLimits { .. })
        ));
    }

    #[test]
    fn sample_force_is_quantized() {
        let s = sample(1, 20.123_456_789);
        assert_eq!(s.force_n, 20.123_457);
    }

    #[test]
    fn append_enforces_monotonic_time_and_freeze() {
        let mut c = CycleResult::open(0, Utc::now(), Duration::from_millis(10));
        c.append(sample(10, 20.0)).unwrap();
        assert!(matches!(
            c.append(sample(10, 20.0)),
            Err(MeasurementError::NonMonotonicTimestamp { prev_ns: 10, next_ns: 10 })
        ));
        c.close(Utc::now(), &tolerance()).unwrap();
        assert!(matches!(c.append(sample(20, 20.0)), Err(MeasurementError::CycleClosed(0))));
    }

    #[test]
    fn empty_cycle_cannot_close() {
        let mut c = CycleResult::open(4, Utc::now(), Duration::from_millis(10));
        assert!(matches!(
            c.close(Utc::now(), &tolerance()),
            Err(MeasurementError::EmptyCycle(4))
        ));
    }

    #[test]
    fn gap_marks_cycle_degraded() {
        let mut c = CycleResult::open(0, Utc::now(), Duration::from_millis(10));
        c.append(sample(10_000_000, 20.0)).unwrap();
        c.append(sample(20_000_000, 20.0)).unwrap();
        assert!(!c.degraded);
        c.append(sample(45_000_000, 20.0)).unwrap();
        assert!(c.degraded);
        assert_eq!(c.gap_count, 1);
    }

    #[test]
    fn close_computes_statistics() {
        let mut c = CycleResult::open(0, Utc::now(), Duration::from_millis(10));
        for (i, f) in [12.0, 20.0, 28.0].iter().enumerate() {
            c.append(sample(i as u64 + 1, *f)).unwrap();
        }
        c.close(Utc::now(), &tolerance()).unwrap();
        assert_eq!(c.peak_force, 28.0);
        assert_eq!(c.mean_force, 20.0);
        assert!(c.within_tolerance);
        assert!(c.complete);

        let mut c = CycleResult::open(1, Utc::now(), Duration::from_millis(10));
        c.append(sample(1, 60.0)).unwrap();
        c.close_incomplete(Utc::now(), &tolerance()).unwrap();
        assert!(!c.within_tolerance);
        assert!(!c.complete);
    }

    #[test]
    fn record_requires_closed_cycles_in_order() {
        let dut = DutIdentity::new("SN1", "PN", "op", "EOL-01");
        let profile: Profile = toml::from_str(
            r#"
            stroke_plan = [1000.0]
            velocity_plan = [500.0]
            temperature_setpoint = 40
            voltage_setpoint = 12.0
            current_limit = 2.0
            cycle_count = 2
            [tolerance]
            min_force = 10.0
            max_force = 50.0
            max_deviation_per_cycle = 5.0
        "#,
        )
        .unwrap();
        let mut record = TestRecord::new(dut, profile, Utc::now());

        let mut open = CycleResult::open(0, Utc::now(), Duration::ZERO);
        open.append(sample(1, 20.0)).unwrap();
        assert!(matches!(
            record.push_cycle(open.clone()),
            Err(MeasurementError::CycleOpen(0))
        ));

        let mut skipped = CycleResult::open(1, Utc::now(), Duration::ZERO);
        skipped.append(sample(1, 20.0)).unwrap();
        skipped.close(Utc::now(), &tolerance()).unwrap();
        assert!(matches!(
            record.push_cycle(skipped),
            Err(MeasurementError::CycleOutOfOrder { expected: 0, got: 1 })
        ));

        open.close(Utc::now(), &tolerance()).unwrap();
        record.push_cycle(open).unwrap();
        assert_eq!(record.cycles().len(), 1);
        assert_eq!(record.samples().count(), 1);

        record.finalize(Verdict::Pass, "ignored", Utc::now());
        assert!(record.cause.is_empty());
        assert!(record.ended_at >= record.started_at);
    }

    #[test]
    fn record_json_uses_column_layout() {
        let mut c = CycleResult::open(0, Utc::now(), Duration::ZERO);
        c.append(sample(5, 20.5)).unwrap();
        c.append(sample(9, 21.25).with_over_range(true)).unwrap();
        c.close(Utc::now(), &tolerance()).unwrap();

        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["samples"]["t_ns"], serde_json::json!([5, 9]));
        assert_eq!(json["samples"]["force_n"], serde_json::json!([20.5, 21.25]));
        assert_eq!(json["samples"]["over_range"], serde_json::json!([false, true]));

        let back: CycleResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.samples(), c.samples());
    }

    #[test]
    fn misaligned_columns_are_rejected() {
        let raw = serde_json::json!({
            "cycle_index": 0,
            "started_at": "2024-01-01T00:00:00Z",
            "ended_at": "2024-01-01T00:00:01Z",
            "samples": {
                "t_ns": [1, 2], "cmd_pos_um": [0.0], "act_pos_um": [0.0, 0.0],
                "force_n": [1.0, 1.0], "temp_c": [25.0, 25.0]
            },
            "peak_force": 1.0, "mean_force": 1.0, "within_tolerance": false,
            "complete": true, "degraded": false, "gap_count": 0
        });
        assert!(serde_json::from_value::<CycleResult>(raw).is_err());
    }

    #[test]
    fn verdict_exit_codes_and_names() {
        assert_eq!(Verdict::Pass.exit_code(), 0);
        assert_eq!(Verdict::Fail.exit_code(), 2);
        assert_eq!(Verdict::Aborted.exit_code(), 3);
        assert_eq!(Verdict::Error.exit_code(), 4);
        assert_eq!(serde_json::to_string(&Verdict::Aborted).unwrap(), "\"ABORTED\"");
        assert_eq!(Verdict::parse("FAIL"), Some(Verdict::Fail));
    }

    #[test]
    fn dut_serial_must_not_be_blank() {
        assert!(DutIdentity::new("  ", "", "", "").validate().is_err());
        assert!(DutIdentity::new("SN-1", "", "", "").validate().is_ok());
    }
}
