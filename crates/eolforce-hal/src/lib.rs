//! `eolforce-hal` – Device Sessions & Hardware Facade
//!
//! Everything between the test engine and the physical station.
//!
//! # Modules
//!
//! - [`device`] – [`Device`][device::Device]: the lifecycle contract every
//!   driver implements (connect, configure, disconnect, probe, events).
//! - [`robot`], [`power`], [`mcu`], [`loadcell`], [`digital_io`] – the five
//!   capability traits built on top of [`Device`][device::Device].
//! - [`session`] – [`DeviceSession`][session::DeviceSession]: per-device
//!   worker, state machine, retry/backoff and the preempting safety lane.
//! - [`facade`] – [`HardwareFacade`][facade::HardwareFacade]: owns every
//!   session; bulk connect/disconnect, cached status and emergency stop.
//! - [`sim`] / [`sim_station`] – deterministic simulated drivers and a
//!   ready-wired simulated station.

pub mod device;
pub mod digital_io;
pub mod facade;
pub mod loadcell;
pub mod mcu;
pub mod power;
pub mod robot;
pub mod session;
pub mod sim;
pub mod sim_station;

pub use device::{Device, DeviceEvent};
pub use digital_io::DigitalIoService;
pub use facade::{ConnectReport, DeviceSlot, EmergencyStopReport, FacadeBuilder, HardwareFacade};
pub use loadcell::{ForceReading, LoadcellService};
pub use mcu::McuService;
pub use power::PowerService;
pub use robot::{MotionProfile, RobotService};
pub use session::{DeviceSession, ManagedSession};
pub use sim_station::SimStation;
