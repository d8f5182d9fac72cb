//! [`HardwareFacade`] – the single owner of every device session.
//!
//! The facade keeps one [`DeviceSlot`] per device class.  Bulk operations
//! fan out over the slots; the engine reaches individual devices through the
//! typed accessors ([`robot`](HardwareFacade::robot),
//! [`power`](HardwareFacade::power), …).
//!
//! # Status cache
//!
//! [`snapshot_status`](HardwareFacade::snapshot_status) never performs I/O:
//! it clones the last [`StatusSnapshot`] published by the background
//! refresher, which health-checks every session each
//! `StationConfig::status_refresh_ms` (at most one second).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use eolforce_types::{
    DeviceKind, FaultEntry, Readiness, SessionState, StationConfig, StatusSnapshot,
};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::digital_io::DigitalIoService;
use crate::loadcell::LoadcellService;
use crate::mcu::McuService;
use crate::power::PowerService;
use crate::robot::RobotService;
use crate::session::{DeviceSession, ManagedSession};

/// Time budget of [`HardwareFacade::emergency_stop`].
pub const EMERGENCY_STOP_BUDGET: Duration = Duration::from_millis(500);

/// A device session tagged with its class.
#[derive(Clone)]
pub enum DeviceSlot {
    Power(Arc<DeviceSession<dyn PowerService>>),
    Robot(Arc<DeviceSession<dyn RobotService>>),
    Mcu(Arc<DeviceSession<dyn McuService>>),
    Loadcell(Arc<DeviceSession<dyn LoadcellService>>),
    DigitalIo(Arc<DeviceSession<dyn DigitalIoService>>),
}

impl DeviceSlot {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceSlot::Power(_) => DeviceKind::Power,
            DeviceSlot::Robot(_) => DeviceKind::Robot,
            DeviceSlot::Mcu(_) => DeviceKind::Mcu,
            DeviceSlot::Loadcell(_) => DeviceKind::Loadcell,
            DeviceSlot::DigitalIo(_) => DeviceKind::DigitalIo,
        }
    }

    pub fn session(&self) -> &dyn ManagedSession {
        match self {
            DeviceSlot::Power(s) => s.as_ref(),
            DeviceSlot::Robot(s) => s.as_ref(),
            DeviceSlot::Mcu(s) => s.as_ref(),
            DeviceSlot::Loadcell(s) => s.as_ref(),
            DeviceSlot::DigitalIo(s) => s.as_ref(),
        }
    }
}

/// Outcome of [`HardwareFacade::connect_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReport {
    pub readiness: Readiness,
    /// Devices whose connect failed, critical or not.
    pub faulted: Vec<String>,
}

/// Outcome of [`HardwareFacade::emergency_stop`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyStopReport {
    pub motion_stopped: bool,
    pub power_off: bool,
    pub elapsed: Duration,
    pub errors: Vec<String>,
}

impl EmergencyStopReport {
    pub fn within_budget(&self) -> bool {
        self.elapsed <= EMERGENCY_STOP_BUDGET
    }
}

/// Builder wiring drivers into sessions.
pub struct FacadeBuilder {
    config: StationConfig,
    slots: BTreeMap<DeviceKind, DeviceSlot>,
}

impl FacadeBuilder {
    fn settings(&self, kind: DeviceKind) -> eolforce_types::DeviceSettings {
        self.config.device(kind).clone()
    }

    pub fn power(mut self, driver: Arc<dyn PowerService>) -> Self {
        let session = DeviceSession::new(DeviceKind::Power, driver, self.settings(DeviceKind::Power));
        self.slots.insert(DeviceKind::Power, DeviceSlot::Power(Arc::new(session)));
        self
    }

    pub fn robot(mut self, driver: Arc<dyn RobotService>) -> Self {
        let session = DeviceSession::new(DeviceKind::Robot, driver, self.settings(DeviceKind::Robot));
        self.slots.insert(DeviceKind::Robot, DeviceSlot::Robot(Arc::new(session)));
        self
    }

    pub fn mcu(mut self, driver: Arc<dyn McuService>) -> Self {
        let session = DeviceSession::new(DeviceKind::Mcu, driver, self.settings(DeviceKind::Mcu));
        self.slots.insert(DeviceKind::Mcu, DeviceSlot::Mcu(Arc::new(session)));
        self
    }

    pub fn loadcell(mut self, driver: Arc<dyn LoadcellService>) -> Self {
        let session =
            DeviceSession::new(DeviceKind::Loadcell, driver, self.settings(DeviceKind::Loadcell));
        self.slots.insert(DeviceKind::Loadcell, DeviceSlot::Loadcell(Arc::new(session)));
        self
    }

    pub fn digital_io(mut self, driver: Arc<dyn DigitalIoService>) -> Self {
        let session =
            DeviceSession::new(DeviceKind::DigitalIo, driver, self.settings(DeviceKind::DigitalIo));
        self.slots.insert(DeviceKind::DigitalIo, DeviceSlot::DigitalIo(Arc::new(session)));
        self
    }

    /// Build the facade and start its status refresher.  Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> Arc<HardwareFacade> {
        let refresh = Duration::from_millis(self.config.status_refresh_ms());
        let (status, _) = watch::channel(StatusSnapshot::empty());
        let facade = Arc::new(HardwareFacade {
            slots: self.slots,
            status,
            refresher: Mutex::new(None),
        });
        facade.publish_status();
        let handle = tokio::spawn(refresh_loop(Arc::downgrade(&facade), refresh));
        *facade.refresher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        facade
    }
}

async fn refresh_loop(facade: Weak<HardwareFacade>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(facade) = facade.upgrade() else {
            break;
        };
        facade.refresh_status().await;
    }
}

/// Aggregate owner of every device session.
pub struct HardwareFacade {
    slots: BTreeMap<DeviceKind, DeviceSlot>,
    status: watch::Sender<StatusSnapshot>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HardwareFacade {
    fn drop(&mut self) {
        if let Some(handle) = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl HardwareFacade {
    pub fn builder(config: StationConfig) -> FacadeBuilder {
        FacadeBuilder {
            config,
            slots: BTreeMap::new(),
        }
    }

    /// Sessions in connect order.
    pub fn sessions(&self) -> impl Iterator<Item = &dyn ManagedSession> {
        self.slots.values().map(DeviceSlot::session)
    }

    pub fn slot(&self, kind: DeviceKind) -> Option<&DeviceSlot> {
        self.slots.get(&kind)
    }

    pub fn robot(&self) -> Option<&Arc<DeviceSession<dyn RobotService>>> {
        match self.slots.get(&DeviceKind::Robot) {
            Some(DeviceSlot::Robot(s)) => Some(s),
            _ => None,
        }
    }

    pub fn power(&self) -> Option<&Arc<DeviceSession<dyn PowerService>>> {
        match self.slots.get(&DeviceKind::Power) {
            Some(DeviceSlot::Power(s)) => Some(s),
            _ => None,
        }
    }

    pub fn mcu(&self) -> Option<&Arc<DeviceSession<dyn McuService>>> {
        match self.slots.get(&DeviceKind::Mcu) {
            Some(DeviceSlot::Mcu(s)) => Some(s),
            _ => None,
        }
    }

    pub fn loadcell(&self) -> Option<&Arc<DeviceSession<dyn LoadcellService>>> {
        match self.slots.get(&DeviceKind::Loadcell) {
            Some(DeviceSlot::Loadcell(s)) => Some(s),
            _ => None,
        }
    }

    pub fn digital_io(&self) -> Option<&Arc<DeviceSession<dyn DigitalIoService>>> {
        match self.slots.get(&DeviceKind::DigitalIo) {
            Some(DeviceSlot::DigitalIo(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_critical(&self, kind: DeviceKind) -> bool {
        self.slots
            .get(&kind)
            .is_some_and(|slot| slot.session().is_critical())
    }

    // ── Status ──────────────────────────────────────────────────────────────

    /// Last published status.  Never blocks on device I/O.
    pub fn snapshot_status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Watch the status cache.
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn readiness(&self) -> Readiness {
        self.status.borrow().readiness()
    }

    /// Publish a snapshot built from session state alone.
    fn publish_status(&self) {
        let devices = self
            .sessions()
            .map(|s| (s.name().to_string(), s.status()))
            .collect();
        self.status.send_replace(StatusSnapshot {
            devices,
            refreshed_at: Utc::now(),
        });
    }

    /// Health-check every session concurrently, then publish.
    pub async fn refresh_status(&self) {
        join_all(self.sessions().map(|s| s.health_check())).await;
        self.publish_status();
    }

    // ── Bulk lifecycle ──────────────────────────────────────────────────────

    /// Connect every session concurrently.
    pub async fn connect_all(&self) -> ConnectReport {
        let results = join_all(self.sessions().map(|s| async move {
            (s.name().to_string(), s.is_critical(), s.connect().await)
        }))
        .await;

        let mut faulted = Vec::new();
        for (name, critical, result) in results {
            if let Err(err) = result {
                if critical {
                    error!(device = %name, error = %err, "critical device failed to connect");
                } else {
                    warn!(device = %name, error = %err, "optional device failed to connect");
                }
                faulted.push(name);
            }
        }
        self.publish_status();
        let readiness = self.readiness();
        info!(?readiness, faulted = faulted.len(), "connect_all finished");
        ConnectReport { readiness, faulted }
    }

    /// Disconnect in reverse dependency order; power goes last so it stays
    /// on while motion parks.
    pub async fn disconnect_all(&self) {
        for slot in self.slots.values().rev() {
            let session = slot.session();
            if let Err(err) = session.disconnect().await {
                warn!(device = %session.name(), error = %err, "disconnect reported an error");
            }
        }
        self.publish_status();
        info!("all devices disconnected");
    }

    /// Mark every usable session ACTIVE for the duration of a test.
    pub fn activate_all(&self) {
        for session in self.sessions() {
            session.activate();
        }
        self.publish_status();
    }

    /// Return ACTIVE sessions to CONFIGURED.
    pub fn release_all(&self) {
        for session in self.sessions() {
            session.release();
        }
        self.publish_status();
    }

    pub fn any_active(&self) -> bool {
        self.sessions().any(|s| s.state() == SessionState::Active)
    }

    /// Every queued device fault, earliest first.
    pub fn drain_faults(&self) -> Vec<FaultEntry> {
        let mut faults: Vec<FaultEntry> = self.sessions().flat_map(|s| s.drain_faults()).collect();
        faults.sort_by_key(|f| f.at);
        faults
    }

    // ── Safety ──────────────────────────────────────────────────────────────

    /// Abandon the in-flight and queued normal-lane calls of every session.
    pub fn preempt_all(&self) {
        for session in self.sessions() {
            session.preempt();
        }
    }

    /// Stop all motion, then switch the DUT supply off, both through the
    /// safety lane.  Safe to call concurrently with any other operation.
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        let started = Instant::now();
        let mut errors = Vec::new();
        error!("emergency stop");

        let motion_stopped = match self.robot() {
            Some(robot) => match robot.emergency_stop_all().await {
                Ok(()) => true,
                Err(err) => {
                    errors.push(format!("{}: {err}", robot.name()));
                    false
                }
            },
            None => true,
        };

        let power_off = match self.power() {
            Some(power) => match power.output_off_now().await {
                Ok(()) => true,
                Err(err) => {
                    errors.push(format!("{}: {err}", power.name()));
                    false
                }
            },
            None => true,
        };

        let report = EmergencyStopReport {
            motion_stopped,
            power_off,
            elapsed: started.elapsed(),
            errors,
        };
        if report.within_budget() {
            warn!(elapsed = ?report.elapsed, motion_stopped, power_off, "emergency stop complete");
        } else {
            error!(elapsed = ?report.elapsed, "emergency stop exceeded its time budget");
        }
        self.publish_status();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDigitalIo, SimPower, SimRobot};
    use crate::sim_station::SimStation;
    use eolforce_types::{DeviceError, DeviceHealth};

    #[tokio::test]
    async fn connect_all_reports_ready() {
        let station = SimStation::builder().build();
        let report = station.facade.connect_all().await;
        assert_eq!(report.readiness, Readiness::Ready);
        assert!(report.faulted.is_empty());
        let snap = station.facade.snapshot_status();
        assert_eq!(snap.devices.len(), 5);
        assert!(snap.devices.values().all(|d| d.state == SessionState::Configured));
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_yields_partial() {
        let station = SimStation::builder().build();
        station
            .power
            .link()
            .fail_next_connects([DeviceError::fault(1, "no response to *IDN?")]);
        let report = station.facade.connect_all().await;
        assert_eq!(report.readiness, Readiness::Partial);
        assert_eq!(report.faulted, vec!["power".to_string()]);
        assert_eq!(
            station.facade.snapshot_status().unavailable_critical(),
            vec!["power".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn optional_failure_keeps_ready() {
        let mut config = StationConfig::default();
        config.devices.digital_io.critical = false;
        config.devices.digital_io.connect_attempts = 1;
        let station = SimStation::builder().config(config).build();
        let dio = station.dio.as_ref().unwrap();
        dio.link().fail_next_connects([DeviceError::timeout("connect", 50)]);
        let report = station.facade.connect_all().await;
        assert_eq!(report.readiness, Readiness::Ready);
        assert_eq!(report.faulted, vec!["digital_io".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_all_releases_power_last() {
        let station = SimStation::builder().build();
        station.facade.connect_all().await;
        station.facade.disconnect_all().await;
        let order: Vec<DeviceKind> = station.facade.slots.values().rev().map(DeviceSlot::kind).collect();
        assert_eq!(order.last(), Some(&DeviceKind::Power));
        assert!(!station.power.link().is_connected());
        assert!(!station.robot.link().is_connected());
        assert_eq!(station.facade.readiness(), Readiness::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_halts_motion_and_power() {
        let station = SimStation::builder().build();
        let facade = &station.facade;
        facade.connect_all().await;
        let robot = facade.robot().unwrap();
        let power = facade.power().unwrap();
        robot.servo_on(0).await.unwrap();
        power.apply(12.0, 2.0).await.unwrap();
        power.output_on().await.unwrap();
        robot
            .move_absolute(0, 5_000.0, crate::robot::MotionProfile {
                velocity_um_s: 1_000.0,
                accel_um_s2: 100_000.0,
                decel_um_s2: 100_000.0,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let report = facade.emergency_stop().await;
        assert!(report.motion_stopped && report.power_off);
        assert!(report.within_budget());
        assert!(!station.robot.in_motion(0));
        assert!(!station.power.output_enabled());
        assert_eq!(station.robot.estop_count(), 1);
    }

    #[tokio::test]
    async fn emergency_stop_without_connection_reports_errors() {
        let facade = HardwareFacade::builder(StationConfig::default())
            .robot(SimRobot::new("robot", Duration::ZERO))
            .power(SimPower::new("power", Duration::ZERO, 0.0))
            .build();
        let report = facade.emergency_stop().await;
        assert!(!report.motion_stopped);
        assert!(!report.power_off);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn faults_surface_earliest_first() {
        let station = SimStation::builder().build();
        station.facade.connect_all().await;
        station
            .power
            .link()
            .raise_event(crate::device::DeviceEvent::new(2, "overtemperature"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        station
            .robot
            .link()
            .raise_event(crate::device::DeviceEvent::new(7, "following error"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let faults = station.facade.drain_faults();
        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].kind, DeviceKind::Power);
        assert_eq!(faults[1].kind, DeviceKind::Robot);
        assert!(station.facade.drain_faults().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_picks_up_alarms() {
        let station = SimStation::builder().build();
        station.facade.connect_all().await;
        station
            .robot
            .link()
            .set_alarm(Some(crate::device::DeviceEvent::new(9, "servo alarm")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snap = station.facade.snapshot_status();
        assert_eq!(snap.devices["robot"].health, DeviceHealth::Faulted);
        assert_eq!(snap.readiness(), Readiness::Partial);
    }

    #[tokio::test(start_paused = true)]
    async fn preempt_all_unblocks_a_long_thermal_wait() {
        let station = SimStation::builder()
            .thermal(crate::sim::ThermalModel::Fixed(25.0))
            .build();
        station.facade.connect_all().await;
        let mcu = Arc::clone(station.facade.mcu().unwrap());
        mcu.set_temperature(40.0).await.unwrap();
        let wait = tokio::spawn(async move {
            mcu.wait_until_stable(0.5, Duration::from_secs(1), Duration::from_secs(600))
                .await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        station.facade.preempt_all();
        assert_eq!(wait.await.unwrap(), Err(DeviceError::Cancelled));
        let started = Instant::now();
        station.facade.disconnect_all().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!station.mcu.link().is_connected());
    }

    #[tokio::test]
    async fn activate_and_release_all() {
        let station = SimStation::builder().build();
        station.facade.connect_all().await;
        station.facade.activate_all();
        assert!(station.facade.any_active());
        assert!(station.facade.snapshot_status().any_active());
        station.facade.release_all();
        assert!(!station.facade.any_active());
    }

    #[tokio::test]
    async fn missing_device_class_has_no_accessor() {
        let facade = HardwareFacade::builder(StationConfig::default())
            .digital_io(SimDigitalIo::new("dio"))
            .build();
        assert!(facade.robot().is_none());
        assert!(facade.digital_io().is_some());
        assert!(facade.is_critical(DeviceKind::DigitalIo));
        assert!(!facade.is_critical(DeviceKind::Robot));
    }
}
