//! [`InterlockMonitor`] – safety-input rule set.
//!
//! The runtime samples the configured input bits at every suspension point
//! and hands the levels to [`InterlockMonitor::check`].  An asserted input
//! forces an immediate abort with cause `interlock`.

use std::collections::BTreeMap;
use std::fmt;

use eolforce_types::SafetyInput;
use tracing::warn;

/// The safety input that tripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterlockTrip {
    pub label: String,
    pub bit: u16,
    pub level: bool,
}

impl fmt::Display for InterlockTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (bit {}) asserted", self.label, self.bit)
    }
}

/// Decides whether any configured safety input is asserted.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use eolforce_kernel::InterlockMonitor;
/// use eolforce_types::SafetyInput;
///
/// let monitor = InterlockMonitor::new(vec![SafetyInput {
///     label: "door".into(),
///     bit: 3,
///     active_high: true,
/// }]);
/// assert!(monitor.check(&BTreeMap::from([(3, false)])).is_none());
/// assert!(monitor.check(&BTreeMap::from([(3, true)])).is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InterlockMonitor {
    inputs: Vec<SafetyInput>,
}

impl InterlockMonitor {
    pub fn new(inputs: Vec<SafetyInput>) -> Self {
        Self { inputs }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Input bits to sample, in configuration order.
    pub fn bits(&self) -> impl Iterator<Item = u16> + '_ {
        self.inputs.iter().map(|i| i.bit)
    }

    /// First asserted input, if any.  Bits missing from `levels` count as
    /// not asserted.
    pub fn check(&self, levels: &BTreeMap<u16, bool>) -> Option<InterlockTrip> {
        let trip = self.inputs.iter().find_map(|input| {
            let level = *levels.get(&input.bit)?;
            (level == input.active_high).then(|| InterlockTrip {
                label: input.label.clone(),
                bit: input.bit,
                level,
            })
        })?;
        warn!(label = %trip.label, bit = trip.bit, "safety interlock asserted");
        Some(trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(label: &str, bit: u16, active_high: bool) -> SafetyInput {
        SafetyInput {
            label: label.into(),
            bit,
            active_high,
        }
    }

    #[test]
    fn empty_monitor_never_trips() {
        let monitor = InterlockMonitor::default();
        assert!(monitor.is_empty());
        assert!(monitor.check(&BTreeMap::from([(0, true)])).is_none());
    }

    #[test]
    fn active_low_input_trips_on_low_level() {
        let monitor = InterlockMonitor::new(vec![input("estop", 1, false)]);
        assert!(monitor.check(&BTreeMap::from([(1, true)])).is_none());
        let trip = monitor.check(&BTreeMap::from([(1, false)])).unwrap();
        assert_eq!(trip.label, "estop");
        assert!(!trip.level);
    }

    #[test]
    fn first_configured_input_is_reported() {
        let monitor = InterlockMonitor::new(vec![input("door", 3, true), input("curtain", 4, true)]);
        let trip = monitor
            .check(&BTreeMap::from([(3, true), (4, true)]))
            .unwrap();
        assert_eq!(trip.to_string(), "door (bit 3) asserted");
        assert_eq!(monitor.bits().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn unread_bits_do_not_trip() {
        let monitor = InterlockMonitor::new(vec![input("door", 3, true)]);
        assert!(monitor.check(&BTreeMap::new()).is_none());
    }
}
