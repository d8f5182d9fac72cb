//! Shared vocabulary of the EOL force-test station.
//!
//! Every other crate in the workspace depends on this one: it holds the
//! error taxonomy, the station configuration, the test profile, the
//! measurement/record model and the progress events.  It performs no I/O.

pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod profile;
pub mod record;

pub use config::{DeviceSettings, SafetyInput, StationConfig, StationLimits, TowerLamp};
pub use error::{DeviceError, EolError, MeasurementError};
pub use event::{Phase, ProgressEvent, ProgressSnapshot};
pub use health::{
    DeviceHealth, DeviceKind, DeviceStatus, FaultEntry, Readiness, SessionState, StatusSnapshot,
};
pub use profile::{Profile, Tolerance};
pub use record::{CycleResult, DutIdentity, EXIT_USAGE, Sample, TestRecord, Verdict};
