//! [`Profile`] – the immutable parameter bundle of one EOL test.
//!
//! A profile is loaded once, validated against the station's
//! [`StationLimits`] before any device is touched, and never mutated while a
//! test runs.  The record keeps a snapshot of it.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::StationLimits;
use crate::error::EolError;

/// Settle-time key applied after the power output is switched on.
pub const SETTLE_POWER_ON: &str = "power_on";
/// Settle-time key used as the dwell of thermal stabilisation.
pub const SETTLE_THERMAL: &str = "thermal";
/// Settle-time key applied after every stroke.
pub const SETTLE_STROKE: &str = "stroke";
/// Settle-time key applied after the power output is switched off.
pub const SETTLE_COOLDOWN: &str = "cooldown";

/// Force acceptance band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub min_force: f64,
    pub max_force: f64,
    pub max_deviation_per_cycle: f64,
}

impl Tolerance {
    /// Forces above this value abort the test immediately.
    pub fn overrange_threshold(&self) -> f64 {
        self.max_force * 1.25
    }

    pub fn contains(&self, force_n: f64) -> bool {
        force_n >= self.min_force && force_n <= self.max_force
    }
}

/// Parameters of a single EOL force test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default = "default_profile_name")]
    pub name: String,

    /// Target positions of one cycle, in order (µm, signed).
    pub stroke_plan: Vec<f64>,
    /// Speed of each stroke (µm/s); same length as `stroke_plan`.
    pub velocity_plan: Vec<f64>,

    pub temperature_setpoint: i32,
    /// Half-width of the thermal stability band (°C).
    #[serde(default = "default_temperature_band")]
    pub temperature_band: f64,

    pub voltage_setpoint: f64,
    pub current_limit: f64,
    /// Accepted deviation of the measured output voltage (V).
    #[serde(default = "default_voltage_band")]
    pub voltage_band: f64,

    pub cycle_count: u32,

    /// Settle durations keyed by phase name (ms).  Signed so that a bad
    /// configuration is reported instead of silently wrapping.
    #[serde(default)]
    pub settle_times: BTreeMap<String, i64>,

    pub tolerance: Tolerance,

    #[serde(default = "default_ramp")]
    pub acceleration_um_s2: f64,
    #[serde(default = "default_ramp")]
    pub deceleration_um_s2: f64,

    /// Force sampling rate during strokes.
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,

    /// Timeout of thermal stabilisation; the station default applies when
    /// unset.
    #[serde(default)]
    pub thermal_timeout_ms: Option<u64>,

    #[serde(default = "default_power_up_timeout")]
    pub power_up_timeout_ms: u64,

    /// Axes in homing order.  The first axis carries the stroke plan.
    #[serde(default = "default_axes")]
    pub axes: Vec<u8>,

    #[serde(default = "default_home_tolerance")]
    pub home_tolerance_um: f64,

    #[serde(default)]
    pub fan_speed_pct: Option<u8>,

    /// Temperature commanded during cooldown.
    #[serde(default)]
    pub standby_temperature_c: Option<i32>,
}

fn default_profile_name() -> String {
    "default".to_string()
}
fn default_temperature_band() -> f64 {
    0.5
}
fn default_voltage_band() -> f64 {
    0.2
}
fn default_ramp() -> f64 {
    100_000.0
}
fn default_sample_rate() -> u32 {
    100
}
fn default_power_up_timeout() -> u64 {
    5_000
}
fn default_axes() -> Vec<u8> {
    vec![0]
}
fn default_home_tolerance() -> f64 {
    10.0
}

/// Reference profile: out 1 mm and back at 0.5 mm/s, three cycles,
/// 10–50 N band at 40 °C and 18 V.
impl Default for Profile {
    fn default() -> Self {
        Self {
            name: default_profile_name(),
            stroke_plan: vec![1000.0, 0.0],
            velocity_plan: vec![500.0, 500.0],
            temperature_setpoint: 40,
            temperature_band: default_temperature_band(),
            voltage_setpoint: 18.0,
            current_limit: 5.0,
            voltage_band: default_voltage_band(),
            cycle_count: 3,
            settle_times: BTreeMap::from([(SETTLE_THERMAL.to_string(), 1000)]),
            tolerance: Tolerance {
                min_force: 10.0,
                max_force: 50.0,
                max_deviation_per_cycle: 5.0,
            },
            acceleration_um_s2: default_ramp(),
            deceleration_um_s2: default_ramp(),
            sample_rate_hz: default_sample_rate(),
            thermal_timeout_ms: None,
            power_up_timeout_ms: default_power_up_timeout(),
            axes: default_axes(),
            home_tolerance_um: default_home_tolerance(),
            fan_speed_pct: None,
            standby_temperature_c: None,
        }
    }
}

impl Profile {
    /// Check every profile invariant against the station limits.
    ///
    /// # Errors
    ///
    /// Returns [`EolError::ProfileInvalid`] naming the first violation.
    pub fn validate(&self, limits: &StationLimits) -> Result<(), EolError> {
        let invalid = |reason: String| Err(EolError::ProfileInvalid(reason));

        if self.stroke_plan.is_empty() {
            return invalid("stroke_plan is empty".into());
        }
        if self.stroke_plan.len() != self.velocity_plan.len() {
            return invalid(format!(
                "stroke_plan has {} entries but velocity_plan has {}",
                self.stroke_plan.len(),
                self.velocity_plan.len()
            ));
        }
        for (i, target) in self.stroke_plan.iter().enumerate() {
            if !target.is_finite() || !limits.position_allowed(*target) {
                return invalid(format!(
                    "stroke {i} target {target} µm outside soft limits [{}, {}]",
                    limits.soft_limit_min_um, limits.soft_limit_max_um
                ));
            }
        }
        for (i, v) in self.velocity_plan.iter().enumerate() {
            if !v.is_finite() || *v <= 0.0 {
                return invalid(format!("velocity {i} must be > 0, got {v}"));
            }
            if *v > limits.max_velocity_um_s {
                return invalid(format!(
                    "velocity {i} of {v} µm/s exceeds station maximum {}",
                    limits.max_velocity_um_s
                ));
            }
        }
        if self.cycle_count < 1 {
            return invalid("cycle_count must be >= 1".into());
        }
        if !(limits.min_voltage..=limits.max_voltage).contains(&self.voltage_setpoint) {
            return invalid(format!(
                "voltage_setpoint {} V outside safe range [{}, {}]",
                self.voltage_setpoint, limits.min_voltage, limits.max_voltage
            ));
        }
        if !(self.current_limit > 0.0 && self.current_limit <= limits.max_current) {
            return invalid(format!(
                "current_limit {} A must be in (0, {}]",
                self.current_limit, limits.max_current
            ));
        }
        if let Some((phase, ms)) = self.settle_times.iter().find(|(_, ms)| **ms < 0) {
            return invalid(format!("settle time '{phase}' is negative ({ms} ms)"));
        }
        let t = &self.tolerance;
        if !(t.min_force.is_finite() && t.max_force.is_finite() && t.min_force <= t.max_force) {
            return invalid(format!(
                "force band [{}, {}] is not a valid interval",
                t.min_force, t.max_force
            ));
        }
        if !(t.max_deviation_per_cycle.is_finite() && t.max_deviation_per_cycle >= 0.0) {
            return invalid("max_deviation_per_cycle must be >= 0".into());
        }
        if !(self.temperature_band > 0.0) {
            return invalid("temperature_band must be > 0".into());
        }
        if !(self.voltage_band > 0.0) {
            return invalid("voltage_band must be > 0".into());
        }
        if self.sample_rate_hz == 0 {
            return invalid("sample_rate_hz must be > 0".into());
        }
        if !(self.acceleration_um_s2 > 0.0 && self.deceleration_um_s2 > 0.0) {
            return invalid("acceleration and deceleration must be > 0".into());
        }
        if self.axes.is_empty() {
            return invalid("at least one axis is required".into());
        }
        if !(self.home_tolerance_um >= 0.0) {
            return invalid("home_tolerance_um must be >= 0".into());
        }
        if let Some(pct) = self.fan_speed_pct.filter(|pct| *pct > 100) {
            return invalid(format!("fan_speed_pct {pct} exceeds 100"));
        }
        if self.estimated_duration().is_none() {
            return invalid("stroke plan duration is not representable".into());
        }
        Ok(())
    }

    /// Settle duration for `phase`; zero when the phase has no entry.
    pub fn settle(&self, phase: &str) -> Duration {
        let ms = self.settle_times.get(phase).copied().unwrap_or(0).max(0);
        Duration::from_millis(ms as u64)
    }

    /// Axis that executes the stroke plan.
    pub fn stroke_axis(&self) -> u8 {
        self.axes.first().copied().unwrap_or(0)
    }

    /// Nominal interval between two force samples.
    pub fn sample_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.sample_rate_hz.max(1)))
    }

    /// Rough duration of the whole test, used for operator display.
    ///
    /// Motion time assumes constant velocity from the home position; ramps
    /// are ignored.  `None` when the total does not fit a [`Duration`].
    pub fn estimated_duration(&self) -> Option<Duration> {
        let mut motion_s = 0.0;
        let mut position = 0.0;
        for (target, velocity) in self.stroke_plan.iter().zip(&self.velocity_plan) {
            motion_s += (target - position).abs() / velocity;
            position = *target;
        }
        let strokes = u32::try_from(self.stroke_plan.len()).ok()?;
        let per_cycle = Duration::try_from_secs_f64(motion_s)
            .ok()?
            .checked_add(self.settle(SETTLE_STROKE).checked_mul(strokes)?)?;
        per_cycle
            .checked_mul(self.cycle_count)?
            .checked_add(self.settle(SETTLE_POWER_ON))?
            .checked_add(self.settle(SETTLE_THERMAL))?
            .checked_add(self.settle(SETTLE_COOLDOWN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile {
            name: "unit".into(),
            ..Profile::default()
        }
    }

    fn reason(p: &Profile) -> String {
        match p.validate(&StationLimits::default()) {
            Err(EolError::ProfileInvalid(r)) => r,
            other => panic!("expected ProfileInvalid, got {other:?}"),
        }
    }

    #[test]
    fn valid_profile_passes() {
        assert!(profile().validate(&StationLimits::default()).is_ok());
    }

    #[test]
    fn empty_stroke_plan_is_invalid() {
        let mut p = profile();
        p.stroke_plan.clear();
        p.velocity_plan.clear();
        assert!(reason(&p).contains("stroke_plan is empty"));
    }

    #[test]
    fn mismatched_plans_are_invalid() {
        let mut p = profile();
        p.velocity_plan.pop();
        assert!(reason(&p).contains("velocity_plan"));
    }

    #[test]
    fn non_positive_velocity_is_invalid() {
        let mut p = profile();
        p.velocity_plan[1] = 0.0;
        assert!(reason(&p).contains("velocity 1"));
    }

    #[test]
    fn zero_cycles_is_invalid() {
        let mut p = profile();
        p.cycle_count = 0;
        assert!(reason(&p).contains("cycle_count"));
    }

    #[test]
    fn electrical_limits_are_enforced() {
        let mut p = profile();
        p.voltage_setpoint = 48.0;
        assert!(reason(&p).contains("voltage_setpoint"));

        let mut p = profile();
        p.current_limit = 0.0;
        assert!(reason(&p).contains("current_limit"));

        let mut p = profile();
        p.current_limit = 31.0;
        assert!(reason(&p).contains("current_limit"));
    }

    #[test]
    fn negative_settle_time_is_invalid() {
        let mut p = profile();
        p.settle_times.insert(SETTLE_COOLDOWN.into(), -1);
        assert!(reason(&p).contains("cooldown"));
    }

    #[test]
    fn settle_lookup_and_period() {
        let p = profile();
        assert_eq!(p.settle(SETTLE_THERMAL), Duration::from_secs(1));
        assert_eq!(p.settle(SETTLE_STROKE), Duration::ZERO);
        assert_eq!(p.sample_period(), Duration::from_millis(10));
    }

    #[test]
    fn estimated_duration_counts_motion_and_dwell() {
        let p = profile();
        // 2 s out + 2 s back per cycle, three cycles, one second thermal dwell.
        assert_eq!(p.estimated_duration(), Some(Duration::from_secs(13)));
    }

    #[test]
    fn vanishing_velocity_is_invalid() {
        let mut p = profile();
        p.velocity_plan = vec![1e-300, 500.0];
        assert_eq!(p.estimated_duration(), None);
        assert!(reason(&p).contains("not representable"));
    }

    #[test]
    fn long_settle_times_do_not_overflow_the_estimate() {
        let mut p = profile();
        p.settle_times.insert(SETTLE_STROKE.into(), i64::MAX);
        p.cycle_count = u32::MAX;
        assert_eq!(p.estimated_duration(), None);
    }

    #[test]
    fn profile_loads_from_toml_with_defaults() {
        let raw = r#"
            stroke_plan = [1000.0, 0.0]
            velocity_plan = [500.0, 500.0]
            temperature_setpoint = 40
            voltage_setpoint = 18.0
            current_limit = 5.0
            cycle_count = 1

            [tolerance]
            min_force = 10.0
            max_force = 50.0
            max_deviation_per_cycle = 5.0
        "#;
        let p: Profile = toml::from_str(raw).unwrap();
        assert_eq!(p.sample_rate_hz, 100);
        assert_eq!(p.axes, vec![0]);
        assert!(p.validate(&StationLimits::default()).is_ok());
    }
}
