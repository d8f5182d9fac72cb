//! `eolforce-middleware` – Observer Stream
//!
//! Carries test progress from the engine to any number of in-process
//! observers (operator display, CLI, logging) without ever blocking the
//! engine.
//!
//! # Modules
//!
//! - [`bus`] – [`ProgressBus`][bus::ProgressBus]: a guaranteed-delivery
//!   control lane for phase/cycle/verdict events, a latest-wins telemetry
//!   lane for samples, and a continuously updated
//!   [`ProgressSnapshot`][eolforce_types::ProgressSnapshot].

pub mod bus;

pub use bus::{ProgressBus, ProgressSubscriber, encode_event};
