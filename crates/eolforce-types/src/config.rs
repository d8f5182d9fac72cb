//! Station configuration: everything that describes the physical test
//! station rather than the unit being tested.
//!
//! Every field carries a serde default so a partial TOML file (or an empty
//! one) yields a usable configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::health::DeviceKind;

/// Hard limits of the station hardware, used to validate profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationLimits {
    /// Lowest voltage setpoint the DUT supply may be asked for (V).
    #[serde(default = "default_min_voltage")]
    pub min_voltage: f64,
    /// Highest voltage setpoint the DUT supply may be asked for (V).
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Hardware maximum of the supply's current limit (A).
    #[serde(default = "default_max_current")]
    pub max_current: f64,
    /// Lower soft limit of the stroke axis (µm).
    #[serde(default = "default_soft_min")]
    pub soft_limit_min_um: f64,
    /// Upper soft limit of the stroke axis (µm).
    #[serde(default = "default_soft_max")]
    pub soft_limit_max_um: f64,
    /// Fastest stroke velocity the axis supports (µm/s).
    #[serde(default = "default_max_velocity")]
    pub max_velocity_um_s: f64,
}

fn default_min_voltage() -> f64 {
    0.0
}
fn default_max_voltage() -> f64 {
    30.0
}
fn default_max_current() -> f64 {
    30.0
}
fn default_soft_min() -> f64 {
    -1_000.0
}
fn default_soft_max() -> f64 {
    250_000.0
}
fn default_max_velocity() -> f64 {
    50_000.0
}

impl Default for StationLimits {
    fn default() -> Self {
        Self {
            min_voltage: default_min_voltage(),
            max_voltage: default_max_voltage(),
            max_current: default_max_current(),
            soft_limit_min_um: default_soft_min(),
            soft_limit_max_um: default_soft_max(),
            max_velocity_um_s: default_max_velocity(),
        }
    }
}

impl StationLimits {
    /// `true` when `position_um` lies inside the axis soft limits.
    pub fn position_allowed(&self, position_um: f64) -> bool {
        position_um >= self.soft_limit_min_um && position_um <= self.soft_limit_max_um
    }
}

/// Per-device session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Critical devices must be connected for the station to be READY.
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Connect attempts before the session gives up and faults.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Default timeout for a single short device call (ms).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            critical: true,
            connect_attempts: default_connect_attempts(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Session settings per device class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTable {
    #[serde(default)]
    pub power: DeviceSettings,
    #[serde(default)]
    pub robot: DeviceSettings,
    #[serde(default)]
    pub mcu: DeviceSettings,
    #[serde(default)]
    pub loadcell: DeviceSettings,
    #[serde(default)]
    pub digital_io: DeviceSettings,
}

/// A digital input whose assertion must abort the test (door switch,
/// e-stop button, light curtain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyInput {
    pub label: String,
    pub bit: u16,
    /// Input level that means "unsafe".
    #[serde(default = "default_true")]
    pub active_high: bool,
}

/// Output bits of the optional tower lamp and buzzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerLamp {
    pub green: Option<u16>,
    pub yellow: Option<u16>,
    pub red: Option<u16>,
    pub buzzer: Option<u16>,
    /// Duration of the buzzer pulse on a non-passing verdict (ms).
    #[serde(default = "default_buzzer_ms")]
    pub buzzer_ms: u64,
}

fn default_buzzer_ms() -> u64 {
    500
}

impl Default for TowerLamp {
    fn default() -> Self {
        Self {
            green: None,
            yellow: None,
            red: None,
            buzzer: None,
            buzzer_ms: default_buzzer_ms(),
        }
    }
}

/// Everything the engine needs to know about the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_station_id")]
    pub station_id: String,

    #[serde(default)]
    pub limits: StationLimits,

    #[serde(default)]
    pub devices: DeviceTable,

    #[serde(default)]
    pub safety_inputs: Vec<SafetyInput>,

    #[serde(default)]
    pub tower_lamp: TowerLamp,

    /// Timeout of `wait_until_stable` when the profile does not set one (ms).
    #[serde(default = "default_stable_timeout_ms")]
    pub stable_timeout_ms: u64,

    /// Background health-check period of the facade (ms, at most 1000).
    #[serde(default = "default_status_refresh_ms")]
    pub status_refresh_ms: u64,

    /// Directory receiving one JSON record per test.
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,

    /// Optional SQLite history index.
    #[serde(default)]
    pub history_db: Option<PathBuf>,

    /// Connect the facade at PREPARE when it is not READY.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Disconnect every device when a test finishes.
    #[serde(default = "default_true")]
    pub disconnect_after_test: bool,
}

fn default_station_id() -> String {
    "EOL-01".to_string()
}
fn default_stable_timeout_ms() -> u64 {
    120_000
}
fn default_status_refresh_ms() -> u64 {
    500
}
fn default_record_dir() -> PathBuf {
    PathBuf::from("records")
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_id: default_station_id(),
            limits: StationLimits::default(),
            devices: DeviceTable::default(),
            safety_inputs: Vec::new(),
            tower_lamp: TowerLamp::default(),
            stable_timeout_ms: default_stable_timeout_ms(),
            status_refresh_ms: default_status_refresh_ms(),
            record_dir: default_record_dir(),
            history_db: None,
            auto_connect: true,
            disconnect_after_test: true,
        }
    }
}

impl StationConfig {
    /// Settings for `kind`.
    pub fn device(&self, kind: DeviceKind) -> &DeviceSettings {
        match kind {
            DeviceKind::Power => &self.devices.power,
            DeviceKind::Robot => &self.devices.robot,
            DeviceKind::Mcu => &self.devices.mcu,
            DeviceKind::Loadcell => &self.devices.loadcell,
            DeviceKind::DigitalIo => &self.devices.digital_io,
        }
    }

    /// Clamp values that would break the facade's freshness guarantee.
    pub fn status_refresh_ms(&self) -> u64 {
        self.status_refresh_ms.clamp(10, 1_000)
    }
}
