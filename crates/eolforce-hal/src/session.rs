//! [`DeviceSession`] – stateful wrapper around one physical device.
//!
//! # Lanes
//!
//! | Lane    | Entry point                     | Behaviour                                   |
//! |---------|---------------------------------|---------------------------------------------|
//! | normal  | [`DeviceSession::call`]         | queued, executed one at a time by a worker  |
//! | safety  | [`DeviceSession::safety`]       | calls the driver directly, preempts queue   |
//!
//! Every normal call is confined to the session's worker task so a driver
//! blocking on its transport never stalls the engine.  A safety call, or an
//! explicit [`DeviceSession::preempt`], bumps the session *generation*: the
//! call in flight on the worker is abandoned, queued calls from an older
//! generation are dropped and callers still waiting on one observe
//! [`DeviceError::Cancelled`].
//!
//! # State machine
//!
//! ```text
//! DISCONNECTED → CONNECTING → CONNECTED → CONFIGURED ⇄ ACTIVE
//!       ↑              ↓                        ↓
//!       └─ DISCONNECTING ←──────── FAULTED ←────┘
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eolforce_types::{
    DeviceError, DeviceHealth, DeviceKind, DeviceSettings, DeviceStatus, FaultEntry, SessionState,
};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceEvent};
use crate::digital_io::DigitalIoService;
use crate::loadcell::{ForceReading, LoadcellService};
use crate::mcu::McuService;
use crate::power::PowerService;
use crate::robot::{MotionProfile, RobotService};

/// First connect retry delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Upper bound of the connect retry delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Budget of a single safety-lane call.
pub const SAFETY_CALL_TIMEOUT: Duration = Duration::from_millis(200);

/// Delay before connect retry number `attempt` (0-based):
/// `min(200 ms × 2^attempt, 5 s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Job<D> = Box<dyn FnOnce(Arc<D>) -> BoxFuture<'static, ()> + Send>;

struct Queued<D: ?Sized> {
    generation: u64,
    job: Job<D>,
}

struct Inner {
    state: SessionState,
    health: DeviceHealth,
    last_error: Option<DeviceError>,
    faults: VecDeque<FaultEntry>,
}

/// State shared between the session handle, its worker and its event pump.
struct Shared {
    name: String,
    kind: DeviceKind,
    inner: Mutex<Inner>,
    generation: watch::Sender<u64>,
    /// Jobs submitted to the worker and not finished yet.
    pending: AtomicUsize,
}

impl Shared {
    fn record_fault(&self, code: u32, message: String) {
        warn!(device = %self.name, code, %message, "device fault");
        let mut inner = lock(&self.inner);
        inner.faults.push_back(FaultEntry {
            device: self.name.clone(),
            kind: self.kind,
            at: Utc::now(),
            code,
            message: message.clone(),
        });
        inner.last_error = Some(DeviceError::DeviceFault { code, message });
        if inner.health == DeviceHealth::Connected {
            inner.health = DeviceHealth::Degraded;
        }
    }
}

async fn run_worker<D>(driver: Arc<D>, shared: Arc<Shared>, mut jobs: mpsc::UnboundedReceiver<Queued<D>>)
where
    D: ?Sized + Device + 'static,
{
    let mut preempted = shared.generation.subscribe();
    while let Some(queued) = jobs.recv().await {
        if queued.generation < *preempted.borrow_and_update() {
            debug!(device = %shared.name, "dropping call queued before preemption");
        } else {
            tokio::select! {
                () = (queued.job)(Arc::clone(&driver)) => {}
                _ = preempted.changed() => {
                    debug!(device = %shared.name, "call in flight abandoned on preemption");
                }
            }
        }
        shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One device, its worker task and its lifecycle state.
pub struct DeviceSession<D: ?Sized + Device> {
    name: String,
    kind: DeviceKind,
    settings: DeviceSettings,
    driver: Arc<D>,
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Queued<D>>,
    worker: JoinHandle<()>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl<D: ?Sized + Device> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.worker.abort();
        if let Some(pump) = lock(&self.event_pump).take() {
            pump.abort();
        }
    }
}

impl<D: ?Sized + Device + 'static> DeviceSession<D> {
    /// Wrap `driver` and spawn its worker.  Must be called inside a Tokio
    /// runtime.
    pub fn new(kind: DeviceKind, driver: Arc<D>, settings: DeviceSettings) -> Self {
        let name = driver.name().to_string();
        let (generation, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            name: name.clone(),
            kind,
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                health: DeviceHealth::Disconnected,
                last_error: None,
                faults: VecDeque::new(),
            }),
            generation,
            pending: AtomicUsize::new(0),
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(Arc::clone(&driver), Arc::clone(&shared), rx));
        Self {
            name,
            kind,
            settings,
            driver,
            shared,
            jobs,
            worker,
            event_pump: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_critical(&self) -> bool {
        self.settings.critical
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.inner).state
    }

    pub fn health(&self) -> DeviceHealth {
        lock(&self.shared.inner).health
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.call_timeout_ms)
    }

    fn set_state(&self, state: SessionState) {
        let mut inner = lock(&self.shared.inner);
        if inner.state != state {
            debug!(device = %self.name, from = ?inner.state, to = ?state, "session transition");
            inner.state = state;
        }
    }

    fn set_health(&self, health: DeviceHealth) {
        lock(&self.shared.inner).health = health;
    }

    /// Fail unless the session accepts device calls.
    pub fn ensure_usable(&self) -> Result<(), DeviceError> {
        match self.state() {
            s if s.is_usable() => Ok(()),
            SessionState::Faulted => Err(DeviceError::fault(
                0,
                format!("{} session is faulted", self.name),
            )),
            _ => Err(DeviceError::NotConnected),
        }
    }

    // ── Normal lane ─────────────────────────────────────────────────────────

    /// Run `f` on the worker with the session's default call timeout.
    pub async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        self.call_with_timeout(op, self.call_timeout(), f).await
    }

    /// Run `f` on the worker, failing with [`DeviceError::Timeout`] after
    /// `timeout`.
    pub async fn call_with_timeout<T, F, Fut>(
        &self,
        op: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        self.ensure_usable()?;
        self.submit(op, timeout, f).await
    }

    async fn submit<T, F, Fut>(&self, op: &'static str, timeout: Duration, f: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        let mut preempted = self.shared.generation.subscribe();
        let generation = *preempted.borrow_and_update();
        let (tx, rx) = oneshot::channel();
        let job: Job<D> = Box::new(move |driver: Arc<D>| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let _ = tx.send(f(driver).await);
            })
        });
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(Queued { generation, job }).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DeviceError::NotConnected);
        }

        let result = tokio::select! {
            reply = rx => reply.unwrap_or(Err(DeviceError::Cancelled)),
            _ = preempted.changed() => Err(DeviceError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(DeviceError::timeout(op, millis(timeout))),
        };
        self.observe(op, &result);
        result
    }

    fn observe<T>(&self, op: &'static str, result: &Result<T, DeviceError>) {
        match result {
            Ok(_) => {
                let mut inner = lock(&self.shared.inner);
                if inner.last_error.as_ref().is_some_and(DeviceError::is_transient) {
                    inner.last_error = None;
                    if inner.health == DeviceHealth::Degraded {
                        inner.health = DeviceHealth::Connected;
                    }
                }
            }
            Err(DeviceError::Cancelled) => {
                debug!(device = %self.name, op, "call cancelled");
            }
            Err(DeviceError::DeviceFault { code, message }) => {
                self.shared.record_fault(*code, format!("{op}: {message}"));
            }
            Err(err) => {
                warn!(device = %self.name, op, error = %err, "device call failed");
                let mut inner = lock(&self.shared.inner);
                if err.is_transient() && inner.health == DeviceHealth::Connected {
                    inner.health = DeviceHealth::Degraded;
                }
                inner.last_error = Some(err.clone());
            }
        }
    }

    // ── Safety lane ─────────────────────────────────────────────────────────

    /// Call the driver directly, bypassing and cancelling queued work.
    ///
    /// Runs even while a normal call is in flight on the worker.  Bounded by
    /// [`SAFETY_CALL_TIMEOUT`].
    pub async fn safety<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        if self.state() == SessionState::Disconnected {
            return Err(DeviceError::NotConnected);
        }
        self.shared.generation.send_modify(|g| *g += 1);
        warn!(device = %self.name, op, "safety lane");
        let result = match tokio::time::timeout(SAFETY_CALL_TIMEOUT, f(Arc::clone(&self.driver))).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::timeout(op, millis(SAFETY_CALL_TIMEOUT))),
        };
        if let Err(err) = &result {
            error!(device = %self.name, op, error = %err, "safety call failed");
        }
        result
    }

    /// Abandon the call in flight and every queued call without touching
    /// the device.
    pub fn preempt(&self) {
        self.shared.generation.send_modify(|g| *g += 1);
        debug!(device = %self.name, "normal lane preempted");
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Connect then configure, retrying transient failures with exponential
    /// backoff.  A session that is already usable is left untouched.
    ///
    /// # Errors
    ///
    /// The last error once attempts are exhausted, or the first
    /// non-transient error.  The session is FAULTED in both cases.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        if self.state().is_usable() {
            return Ok(());
        }
        let attempts = self.settings.connect_attempts.max(1);
        let timeout = self.call_timeout();
        let mut attempt = 0;
        loop {
            self.set_state(SessionState::Connecting);
            let result = async {
                self.submit("connect", timeout, |d: Arc<D>| async move { d.connect().await })
                    .await?;
                self.set_state(SessionState::Connected);
                self.submit("configure", timeout, |d: Arc<D>| async move { d.configure().await })
                    .await
            }
            .await;

            match result {
                Ok(()) => {
                    self.set_state(SessionState::Configured);
                    {
                        let mut inner = lock(&self.shared.inner);
                        inner.health = DeviceHealth::Connected;
                        inner.last_error = None;
                    }
                    self.start_event_pump();
                    info!(device = %self.name, attempt, "device connected");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(device = %self.name, attempt, ?delay, error = %err, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(device = %self.name, attempt, error = %err, "connect failed");
                    self.set_state(SessionState::Faulted);
                    let mut inner = lock(&self.shared.inner);
                    inner.health = DeviceHealth::Faulted;
                    inner.last_error = Some(err.clone());
                    return Err(err);
                }
            }
        }
    }

    /// Close the device from any state.  A second call is a no-op.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        if self.state() == SessionState::Disconnected {
            return Ok(());
        }
        self.set_state(SessionState::Disconnecting);
        let result = self
            .submit("disconnect", self.call_timeout(), |d: Arc<D>| async move {
                d.disconnect().await
            })
            .await;
        if let Err(err) = &result {
            warn!(device = %self.name, error = %err, "disconnect failed, link considered closed");
        }
        self.set_state(SessionState::Disconnected);
        self.set_health(DeviceHealth::Disconnected);
        info!(device = %self.name, "device disconnected");
        result
    }

    /// Non-destructive probe on the worker lane.  An alarm reported by the
    /// device faults the session.  While other calls are pending the probe is
    /// skipped and the last known health is returned.
    pub async fn health_check(&self) -> DeviceHealth {
        let state = self.state();
        if !state.is_usable() {
            let health = if state == SessionState::Faulted {
                DeviceHealth::Faulted
            } else {
                DeviceHealth::Disconnected
            };
            self.set_health(health);
            return health;
        }
        if self.shared.pending.load(Ordering::SeqCst) > 0 {
            return self.health();
        }
        let probe = self
            .submit("probe", self.call_timeout(), |d: Arc<D>| async move { d.probe().await })
            .await;
        let health = match probe {
            Ok(None) => {
                let inner = lock(&self.shared.inner);
                match &inner.last_error {
                    Some(err) if err.is_transient() => DeviceHealth::Degraded,
                    _ => DeviceHealth::Connected,
                }
            }
            Ok(Some(alarm)) => {
                self.shared.record_fault(alarm.code, alarm.message);
                self.set_state(SessionState::Faulted);
                DeviceHealth::Faulted
            }
            Err(DeviceError::Cancelled) => return self.health(),
            Err(err) if err.is_transient() => DeviceHealth::Degraded,
            Err(err) => {
                error!(device = %self.name, error = %err, "health probe failed");
                self.set_state(SessionState::Faulted);
                DeviceHealth::Faulted
            }
        };
        self.set_health(health);
        health
    }

    /// CONFIGURED → ACTIVE.
    pub fn activate(&self) {
        let mut inner = lock(&self.shared.inner);
        if matches!(inner.state, SessionState::Connected | SessionState::Configured) {
            inner.state = SessionState::Active;
        }
    }

    /// ACTIVE → CONFIGURED.
    pub fn release(&self) {
        let mut inner = lock(&self.shared.inner);
        if inner.state == SessionState::Active {
            inner.state = SessionState::Configured;
        }
    }

    /// Take every fault queued since the last drain, oldest first.
    pub fn drain_faults(&self) -> Vec<FaultEntry> {
        lock(&self.shared.inner).faults.drain(..).collect()
    }

    pub fn status(&self) -> DeviceStatus {
        let inner = lock(&self.shared.inner);
        DeviceStatus {
            kind: self.kind,
            critical: self.settings.critical,
            state: inner.state,
            health: inner.health,
            last_error: inner.last_error.as_ref().map(ToString::to_string),
        }
    }

    fn start_event_pump(&self) {
        let mut pump = lock(&self.event_pump);
        if pump.is_some() {
            return;
        }
        if let Some(mut events) = self.driver.take_events() {
            let shared = Arc::clone(&self.shared);
            *pump = Some(tokio::spawn(async move {
                while let Some(DeviceEvent { code, message }) = events.recv().await {
                    shared.record_fault(code, message);
                }
            }));
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Object-safe view used by the facade
// ────────────────────────────────────────────────────────────────────────────

/// Class-independent operations of a session.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn is_critical(&self) -> bool;
    fn state(&self) -> SessionState;
    fn status(&self) -> DeviceStatus;
    fn drain_faults(&self) -> Vec<FaultEntry>;
    fn activate(&self);
    fn release(&self);
    async fn connect(&self) -> Result<(), DeviceError>;
    async fn disconnect(&self) -> Result<(), DeviceError>;
    async fn health_check(&self) -> DeviceHealth;
    fn preempt(&self);
}

#[async_trait]
impl<D: ?Sized + Device + 'static> ManagedSession for DeviceSession<D> {
    fn name(&self) -> &str {
        DeviceSession::name(self)
    }
    fn kind(&self) -> DeviceKind {
        DeviceSession::kind(self)
    }
    fn is_critical(&self) -> bool {
        DeviceSession::is_critical(self)
    }
    fn state(&self) -> SessionState {
        DeviceSession::state(self)
    }
    fn status(&self) -> DeviceStatus {
        DeviceSession::status(self)
    }
    fn drain_faults(&self) -> Vec<FaultEntry> {
        DeviceSession::drain_faults(self)
    }
    fn activate(&self) {
        DeviceSession::activate(self)
    }
    fn release(&self) {
        DeviceSession::release(self)
    }
    async fn connect(&self) -> Result<(), DeviceError> {
        DeviceSession::connect(self).await
    }
    async fn disconnect(&self) -> Result<(), DeviceError> {
        DeviceSession::disconnect(self).await
    }
    async fn health_check(&self) -> DeviceHealth {
        DeviceSession::health_check(self).await
    }
    fn preempt(&self) {
        DeviceSession::preempt(self)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Typed capability calls
// ────────────────────────────────────────────────────────────────────────────

impl DeviceSession<dyn RobotService> {
    pub async fn home(&self, axis: u8, timeout: Duration) -> Result<(), DeviceError> {
        self.call_with_timeout("home", timeout, move |d: Arc<dyn RobotService>| async move {
            d.home(axis).await
        })
        .await
    }

    pub async fn move_absolute(
        &self,
        axis: u8,
        position_um: f64,
        motion: MotionProfile,
    ) -> Result<(), DeviceError> {
        self.call("move_absolute", move |d: Arc<dyn RobotService>| async move {
            d.move_absolute(axis, position_um, motion).await
        })
        .await
    }

    pub async fn move_relative(
        &self,
        axis: u8,
        distance_um: f64,
        motion: MotionProfile,
    ) -> Result<(), DeviceError> {
        self.call("move_relative", move |d: Arc<dyn RobotService>| async move {
            d.move_relative(axis, distance_um, motion).await
        })
        .await
    }

    pub async fn stop(&self, axis: u8, decel_um_s2: f64) -> Result<(), DeviceError> {
        self.call("stop", move |d: Arc<dyn RobotService>| async move {
            d.stop(axis, decel_um_s2).await
        })
        .await
    }

    /// Controlled stop through the safety lane.
    pub async fn stop_now(&self, axis: u8, decel_um_s2: f64) -> Result<(), DeviceError> {
        self.safety("stop", |d| async move { d.stop(axis, decel_um_s2).await })
            .await
    }

    pub async fn emergency_stop_all(&self) -> Result<(), DeviceError> {
        self.safety("emergency_stop_all", |d| async move { d.emergency_stop_all().await })
            .await
    }

    pub async fn read_position(&self, axis: u8) -> Result<f64, DeviceError> {
        self.call("read_position", move |d: Arc<dyn RobotService>| async move {
            d.read_position(axis).await
        })
        .await
    }

    pub async fn read_alarm(&self, axis: u8) -> Result<Option<u32>, DeviceError> {
        self.call("read_alarm", move |d: Arc<dyn RobotService>| async move {
            d.read_alarm(axis).await
        })
        .await
    }

    pub async fn servo_on(&self, axis: u8) -> Result<(), DeviceError> {
        self.call("servo_on", move |d: Arc<dyn RobotService>| async move {
            d.servo_on(axis).await
        })
        .await
    }

    pub async fn servo_off(&self, axis: u8) -> Result<(), DeviceError> {
        self.call("servo_off", move |d: Arc<dyn RobotService>| async move {
            d.servo_off(axis).await
        })
        .await
    }

    pub async fn is_in_motion(&self, axis: u8) -> Result<bool, DeviceError> {
        self.call("is_in_motion", move |d: Arc<dyn RobotService>| async move {
            d.is_in_motion(axis).await
        })
        .await
    }

    pub async fn is_servo_on(&self, axis: u8) -> Result<bool, DeviceError> {
        self.call("is_servo_on", move |d: Arc<dyn RobotService>| async move {
            d.is_servo_on(axis).await
        })
        .await
    }
}

impl DeviceSession<dyn PowerService> {
    pub async fn apply(&self, voltage: f64, current_limit: f64) -> Result<(), DeviceError> {
        self.call("apply", move |d: Arc<dyn PowerService>| async move {
            d.apply(voltage, current_limit).await
        })
        .await
    }

    pub async fn output_on(&self) -> Result<(), DeviceError> {
        self.call("output_on", |d: Arc<dyn PowerService>| async move { d.output_on().await })
            .await
    }

    pub async fn output_off(&self) -> Result<(), DeviceError> {
        self.call("output_off", |d: Arc<dyn PowerService>| async move { d.output_off().await })
            .await
    }

    /// Output off through the safety lane.
    pub async fn output_off_now(&self) -> Result<(), DeviceError> {
        self.safety("output_off", |d| async move { d.output_off().await })
            .await
    }

    pub async fn is_output_on(&self) -> Result<bool, DeviceError> {
        self.call("is_output_on", |d: Arc<dyn PowerService>| async move {
            d.is_output_on().await
        })
        .await
    }

    pub async fn measure_voltage(&self) -> Result<f64, DeviceError> {
        self.call("measure_voltage", |d: Arc<dyn PowerService>| async move {
            d.measure_voltage().await
        })
        .await
    }

    pub async fn measure_current(&self) -> Result<f64, DeviceError> {
        self.call("measure_current", |d: Arc<dyn PowerService>| async move {
            d.measure_current().await
        })
        .await
    }

    pub async fn fail_on_overcurrent(&self, current_limit: f64) -> Result<(), DeviceError> {
        self.call("fail_on_overcurrent", move |d: Arc<dyn PowerService>| async move {
            d.fail_on_overcurrent(current_limit).await
        })
        .await
    }
}

impl DeviceSession<dyn McuService> {
    pub async fn set_temperature(&self, target_c: f64) -> Result<(), DeviceError> {
        self.call("set_temperature", move |d: Arc<dyn McuService>| async move {
            d.set_temperature(target_c).await
        })
        .await
    }

    pub async fn read_temperature(&self) -> Result<f64, DeviceError> {
        self.call("read_temperature", |d: Arc<dyn McuService>| async move {
            d.read_temperature().await
        })
        .await
    }

    pub async fn set_fan_speed(&self, pct: u8) -> Result<(), DeviceError> {
        self.call("set_fan_speed", move |d: Arc<dyn McuService>| async move {
            d.set_fan_speed(pct).await
        })
        .await
    }

    /// The device-side wait is bounded by `timeout`; the session adds its
    /// call timeout on top so the device reports the timeout first.
    pub async fn wait_until_stable(
        &self,
        band_c: f64,
        dwell: Duration,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        self.call_with_timeout(
            "wait_until_stable",
            timeout + self.call_timeout(),
            move |d: Arc<dyn McuService>| async move { d.wait_until_stable(band_c, dwell, timeout).await },
        )
        .await
    }
}

impl DeviceSession<dyn LoadcellService> {
    pub async fn zero(&self) -> Result<(), DeviceError> {
        self.call("zero", |d: Arc<dyn LoadcellService>| async move { d.zero().await })
            .await
    }

    pub async fn read_force(&self) -> Result<ForceReading, DeviceError> {
        self.call("read_force", |d: Arc<dyn LoadcellService>| async move {
            d.read_force().await
        })
        .await
    }

    /// Open a force stream.  Dropping the stream releases it.
    pub fn stream_force(
        &self,
        rate_hz: u32,
    ) -> Result<BoxStream<'static, Result<ForceReading, DeviceError>>, DeviceError> {
        self.ensure_usable()?;
        Ok(self.driver.stream_force(rate_hz))
    }
}

impl DeviceSession<dyn DigitalIoService> {
    pub async fn read_input(&self, bit: u16) -> Result<bool, DeviceError> {
        self.call("read_input", move |d: Arc<dyn DigitalIoService>| async move {
            d.read_input(bit).await
        })
        .await
    }

    pub async fn write_output(&self, bit: u16, level: bool) -> Result<(), DeviceError> {
        self.call("write_output", move |d: Arc<dyn DigitalIoService>| async move {
            d.write_output(bit, level).await
        })
        .await
    }

    pub async fn pulse_output(&self, bit: u16, duration: Duration) -> Result<(), DeviceError> {
        self.call_with_timeout(
            "pulse_output",
            duration + self.call_timeout(),
            move |d: Arc<dyn DigitalIoService>| async move { d.pulse_output(bit, duration).await },
        )
        .await
    }
}
