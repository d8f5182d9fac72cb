//! [`Supervisor`] – owner of the single live test.
//!
//! The supervisor validates a run request, claims the station, drives an
//! [`EolSequence`] to a terminal state and puts the devices back the way the
//! station configuration asks for.  It is the only entry point for
//! cancellation and emergency stop while a test runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use eolforce_hal::SimStation;
//! use eolforce_memory::MemorySink;
//! use eolforce_runtime::Supervisor;
//! use eolforce_types::{DutIdentity, Profile};
//!
//! # async fn demo() -> Result<(), eolforce_types::EolError> {
//! let station = SimStation::builder().build();
//! let supervisor = Supervisor::new(station.facade.clone(), station.config.clone(), Arc::new(MemorySink::new()));
//! let dut = DutIdentity::new("SN-0001", "PN-7", "op-1", "");
//! let record = supervisor.run(Profile::default(), dut).await?;
//! println!("{} ({})", record.verdict, record.cause);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eolforce_hal::{EmergencyStopReport, HardwareFacade};
use eolforce_memory::RecordSink;
use eolforce_middleware::{ProgressBus, ProgressSubscriber};
use eolforce_types::{
    DeviceKind, DutIdentity, EolError, Profile, ProgressSnapshot, StationConfig, TestRecord,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelReason, CancelSignal};
use crate::sequence::EolSequence;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Devices a test cannot run without.
const REQUIRED: [DeviceKind; 4] = [
    DeviceKind::Power,
    DeviceKind::Robot,
    DeviceKind::Mcu,
    DeviceKind::Loadcell,
];

pub struct Supervisor {
    facade: Arc<HardwareFacade>,
    config: StationConfig,
    sink: Arc<dyn RecordSink>,
    bus: ProgressBus,
    cancel: CancelSignal,
    running: AtomicBool,
    /// Serialises claiming the station against raising an emergency stop.
    gate: Mutex<()>,
    /// `true` whenever no test is in flight.
    idle: watch::Sender<bool>,
    last_estop: Mutex<Option<EmergencyStopReport>>,
}

/// Releases the busy flag when `run` returns, even when its future is
/// dropped mid-test.
struct RunGuard<'a> {
    supervisor: &'a Supervisor,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.running.store(false, Ordering::SeqCst);
        self.supervisor.idle.send_replace(true);
    }
}

impl Supervisor {
    pub fn new(
        facade: Arc<HardwareFacade>,
        config: StationConfig,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            facade,
            config,
            sink,
            bus: ProgressBus::new(),
            cancel: CancelSignal::new(),
            running: AtomicBool::new(false),
            gate: Mutex::new(()),
            idle,
            last_estop: Mutex::new(None),
        }
    }

    pub fn facade(&self) -> &Arc<HardwareFacade> {
        &self.facade
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// The observer stream of every test this supervisor runs.
    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn subscribe(&self) -> ProgressSubscriber {
        self.bus.subscribe()
    }

    /// `{phase, cycle_index, percent, last_sample}` of the current test.
    pub fn progress(&self) -> ProgressSnapshot {
        self.bus.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Report of the most recent emergency stop, until the next `run`.
    pub fn last_emergency_stop(&self) -> Option<EmergencyStopReport> {
        lock(&self.last_estop).clone()
    }

    /// Run one test to a terminal state and return its record.
    ///
    /// # Errors
    ///
    /// Request errors only; every failure once the test has started is
    /// expressed through the record's verdict and cause.
    ///
    /// - [`EolError::ProfileInvalid`] / [`EolError::DutInvalid`] when the
    ///   request fails validation.  No device is touched and no record is
    ///   written.
    /// - [`EolError::DeviceUnconfigured`] when the station lacks a device
    ///   the test needs.
    /// - [`EolError::Busy`] while another test is running.
    pub async fn run(&self, profile: Profile, mut dut: DutIdentity) -> Result<TestRecord, EolError> {
        profile.validate(&self.config.limits)?;
        if dut.station_id.is_empty() {
            dut.station_id = self.config.station_id.clone();
        }
        dut.validate()?;
        self.check_devices()?;

        let _guard = {
            let _gate = lock(&self.gate);
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!(serial = %dut.serial_number, "test rejected: station busy");
                return Err(EolError::Busy);
            }
            self.cancel.reset();
            *lock(&self.last_estop) = None;
            RunGuard { supervisor: self }
        };
        self.bus.reset();
        self.idle.send_replace(false);
        let stale = self.facade.drain_faults();
        if !stale.is_empty() {
            debug!(count = stale.len(), "discarding faults raised between tests");
        }

        let record = EolSequence::new(
            Arc::clone(&self.facade),
            &self.config,
            self.bus.clone(),
            &*self.sink,
            self.cancel.clone(),
            profile,
            dut,
        )
        .run()
        .await;

        if self.config.disconnect_after_test {
            self.facade.disconnect_all().await;
        } else {
            self.facade.release_all();
        }
        info!(id = %record.id, verdict = %record.verdict, cause = %record.cause, "run finished");
        Ok(record)
    }

    fn check_devices(&self) -> Result<(), EolError> {
        for kind in REQUIRED {
            if self.facade.slot(kind).is_none() {
                return Err(EolError::DeviceUnconfigured(kind.as_str().to_string()));
            }
        }
        if !self.config.safety_inputs.is_empty() && self.facade.digital_io().is_none() {
            return Err(EolError::DeviceUnconfigured(format!(
                "{} (required by safety inputs)",
                DeviceKind::DigitalIo.as_str()
            )));
        }
        Ok(())
    }

    /// Ask the running test to abort at its next suspension point.  Returns
    /// `false` when there is nothing to cancel.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let raised = self.cancel.cancel(CancelReason::Cancelled);
        if raised {
            info!("cancel requested");
        }
        raised
    }

    /// Stop all motion and switch the DUT supply off through the safety
    /// lane, then wait until the running test (if any) has parked and
    /// written its record.
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        let running = {
            let _gate = lock(&self.gate);
            self.cancel.cancel(CancelReason::EmergencyStop);
            self.is_running()
        };
        let report = self.facade.emergency_stop().await;
        if !report.errors.is_empty() {
            error!(errors = ?report.errors, "emergency stop incomplete");
        }
        *lock(&self.last_estop) = Some(report.clone());

        if running {
            let mut idle = self.idle.subscribe();
            let _ = idle.wait_for(|idle| *idle).await;
        }
        report
    }
}
