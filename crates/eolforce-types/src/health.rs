//! Device classes, session states and the health snapshot published by the
//! hardware facade.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five device classes a station is built from.
///
/// The declaration order is the connect order; disconnects run in reverse so
/// that power is released last and stays on while motion parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Power,
    Robot,
    Mcu,
    Loadcell,
    DigitalIo,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::Power,
        DeviceKind::Robot,
        DeviceKind::Mcu,
        DeviceKind::Loadcell,
        DeviceKind::DigitalIo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Power => "power",
            DeviceKind::Robot => "robot",
            DeviceKind::Mcu => "mcu",
            DeviceKind::Loadcell => "loadcell",
            DeviceKind::DigitalIo => "digital_io",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Configured,
    Active,
    Faulted,
    Disconnecting,
}

impl SessionState {
    /// States in which device calls are accepted.
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Configured | SessionState::Active
        )
    }
}

/// Health of one device as reported by its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    Connected,
    Degraded,
    Disconnected,
    Faulted,
}

/// Aggregate readiness of the whole station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Every critical device is connected.
    Ready,
    /// Some critical devices are connected, others are faulted.
    Partial,
    /// No critical device is usable.
    NotReady,
}

/// A fault raised by a device, either from a failed call or from the
/// driver's asynchronous event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEntry {
    pub device: String,
    pub kind: DeviceKind,
    pub at: DateTime<Utc>,
    pub code: u32,
    pub message: String,
}

/// Point-in-time status of a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub kind: DeviceKind,
    pub critical: bool,
    pub state: SessionState,
    pub health: DeviceHealth,
    pub last_error: Option<String>,
}

/// Cached health map of every device owned by the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub devices: BTreeMap<String, DeviceStatus>,
    pub refreshed_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self {
            devices: BTreeMap::new(),
            refreshed_at: Utc::now(),
        }
    }

    /// Aggregate readiness: READY only when every critical device is
    /// connected; optional devices never block READY.
    pub fn readiness(&self) -> Readiness {
        let critical: Vec<&DeviceStatus> =
            self.devices.values().filter(|d| d.critical).collect();
        let connected = critical
            .iter()
            .filter(|d| matches!(d.health, DeviceHealth::Connected | DeviceHealth::Degraded))
            .count();
        if connected == critical.len() {
            Readiness::Ready
        } else if connected > 0 {
            Readiness::Partial
        } else {
            Readiness::NotReady
        }
    }

    /// Names of critical devices that are not connected.
    pub fn unavailable_critical(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, d)| {
                d.critical && !matches!(d.health, DeviceHealth::Connected | DeviceHealth::Degraded)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `true` if any device session is in [`SessionState::Active`].
    pub fn any_active(&self) -> bool {
        self.devices.values().any(|d| d.state == SessionState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(kind: DeviceKind, critical: bool, health: DeviceHealth) -> DeviceStatus {
        DeviceStatus {
            kind,
            critical,
            state: SessionState::Configured,
            health,
            last_error: None,
        }
    }

    #[test]
    fn readiness_ignores_optional_devices() {
        let mut snap = StatusSnapshot::empty();
        snap.devices
            .insert("robot".into(), status(DeviceKind::Robot, true, DeviceHealth::Connected));
        snap.devices
            .insert("dio".into(), status(DeviceKind::DigitalIo, false, DeviceHealth::Faulted));
        assert_eq!(snap.readiness(), Readiness::Ready);
        assert!(snap.unavailable_critical().is_empty());
    }

    #[test]
    fn readiness_partial_and_not_ready() {
        let mut snap = StatusSnapshot::empty();
        snap.devices
            .insert("robot".into(), status(DeviceKind::Robot, true, DeviceHealth::Connected));
        snap.devices
            .insert("power".into(), status(DeviceKind::Power, true, DeviceHealth::Faulted));
        assert_eq!(snap.readiness(), Readiness::Partial);
        assert_eq!(snap.unavailable_critical(), vec!["power".to_string()]);

        snap.devices
            .insert("robot".into(), status(DeviceKind::Robot, true, DeviceHealth::Disconnected));
        assert_eq!(snap.readiness(), Readiness::NotReady);
    }

    #[test]
    fn disconnect_order_puts_power_last() {
        let mut order = DeviceKind::ALL.to_vec();
        order.reverse();
        assert_eq!(order.last(), Some(&DeviceKind::Power));
    }
}
