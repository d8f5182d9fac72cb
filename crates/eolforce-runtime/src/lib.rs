//! `eolforce-runtime` – Test Engine
//!
//! Drives one end-of-line force test from PREPARE to a terminal verdict and
//! owns the station while it runs.
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: validates a
//!   run request, enforces one test at a time, exposes `cancel` and
//!   `emergency_stop`, and releases or disconnects the devices afterwards.
//! - [`sequence`] – [`EolSequence`][sequence::EolSequence]: the test state
//!   machine.  Every state maps its failures to a transition; ABORT always
//!   runs the safe-park order and the record is written in both terminal
//!   paths.
//! - [`cancel`] – [`CancelSignal`][cancel::CancelSignal]: soft cancel and
//!   emergency stop as one escalating signal.
//! - [`retry`] – [`ProtocolRetry`][retry::ProtocolRetry]: one retry per
//!   state for transient device errors.
//! - [`clock`] – [`TestClock`][clock::TestClock]: monotonic sample
//!   timestamps anchored to the record's wall-clock start.
//! - [`lamp`] – [`StationLamp`][lamp::StationLamp]: tower lamp and buzzer.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export, tagged with the station id.

pub mod cancel;
pub mod clock;
pub mod lamp;
pub mod retry;
pub mod sequence;
pub mod supervisor;
pub mod telemetry;

pub use cancel::{CancelReason, CancelSignal};
pub use clock::TestClock;
pub use lamp::StationLamp;
pub use retry::ProtocolRetry;
pub use sequence::{Abort, EolSequence};
pub use supervisor::Supervisor;
pub use telemetry::{TelemetryOptions, TracerProviderGuard, init_tracing};
