//! In-process simulated drivers for CI and bench runs without a station.
//!
//! | Driver            | Behaviour                                                        |
//! |-------------------|------------------------------------------------------------------|
//! | [`SimRobot`]      | time-based linear motion, interruptible homing, servo tracking   |
//! | [`SimPower`]      | linear voltage ramp after `output_on`, constant load current     |
//! | [`SimMcu`]        | [`ThermalModel`]: track the setpoint, oscillate or stay fixed    |
//! | [`SimLoadcell`]   | scripted force per `(cycle, sample)`; cycle advances on `zero`   |
//! | [`SimDigitalIo`]  | settable inputs, recorded output writes                          |
//!
//! All timing uses [`tokio::time`], so tests running with a paused clock
//! are deterministic.  Every driver embeds a [`SimLink`] that scripts the
//! transport (connect failures, alarms, asynchronous events).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use eolforce_types::DeviceError;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::device::{Device, DeviceEvent, EVENT_CHANNEL_CAPACITY};
use crate::digital_io::DigitalIoService;
use crate::loadcell::{ForceReading, LoadcellService};
use crate::mcu::McuService;
use crate::power::PowerService;
use crate::robot::{MotionProfile, RobotService};

/// Fault code of a motion command issued with the servo disabled.
pub const SERVO_OFF_FAULT: u32 = 0x21;
/// Fault code of a homing run interrupted by a stop.
pub const HOMING_ABORTED_FAULT: u32 = 0x22;

const AMBIENT_C: f64 = 25.0;
const HOMING_POLL: Duration = Duration::from_millis(5);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated transport
// ────────────────────────────────────────────────────────────────────────────

/// Scripted transport shared by every simulated driver.
pub struct SimLink {
    name: String,
    connected: Arc<AtomicBool>,
    connect_errors: Mutex<VecDeque<DeviceError>>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    alarm: Mutex<Option<DeviceEvent>>,
    event_tx: mpsc::Sender<DeviceEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
}

impl SimLink {
    fn new(name: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            connected: Arc::new(AtomicBool::new(false)),
            connect_errors: Mutex::new(VecDeque::new()),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            alarm: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    fn ensure(&self) -> Result<(), DeviceError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn open(&self) -> Result<(), DeviceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.connect_errors).pop_front() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make the next connects fail with `errors`, in order.
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = DeviceError>) {
        lock(&self.connect_errors).extend(errors);
    }

    /// Report `alarm` from every subsequent health probe.
    pub fn set_alarm(&self, alarm: Option<DeviceEvent>) {
        *lock(&self.alarm) = alarm;
    }

    /// Push an asynchronous event; `false` when the channel is full.
    pub fn raise_event(&self, event: DeviceEvent) -> bool {
        self.event_tx.try_send(event).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

macro_rules! sim_device {
    ($ty:ty) => {
        #[async_trait]
        impl Device for $ty {
            fn name(&self) -> &str {
                &self.link.name
            }

            async fn connect(&self) -> Result<(), DeviceError> {
                self.link.open()
            }

            async fn disconnect(&self) -> Result<(), DeviceError> {
                self.link.close();
                Ok(())
            }

            async fn probe(&self) -> Result<Option<DeviceEvent>, DeviceError> {
                self.link.ensure()?;
                Ok(lock(&self.link.alarm).clone())
            }

            fn take_events(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
                lock(&self.link.event_rx).take()
            }
        }

        impl $ty {
            pub fn link(&self) -> &SimLink {
                &self.link
            }
        }
    };
}

// ────────────────────────────────────────────────────────────────────────────
// Robot
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Motion {
    from_um: f64,
    to_um: f64,
    started: Instant,
    duration: Duration,
}

#[derive(Debug, Default)]
struct Axis {
    position_um: f64,
    servo: bool,
    homed: bool,
    motion: Option<Motion>,
}

impl Axis {
    fn position_at(&self, now: Instant) -> f64 {
        match self.motion {
            Some(m) if !m.duration.is_zero() => {
                let f = (now.duration_since(m.started).as_secs_f64() / m.duration.as_secs_f64())
                    .min(1.0);
                m.from_um + (m.to_um - m.from_um) * f
            }
            Some(m) => m.to_um,
            None => self.position_um,
        }
    }

    /// Retire a motion whose end time has passed.
    fn settle(&mut self, now: Instant) {
        if let Some(m) = self.motion {
            if m.started.checked_add(m.duration).is_some_and(|end| now >= end) {
                self.position_um = m.to_um;
                self.motion = None;
            }
        }
    }

    fn freeze(&mut self, now: Instant) {
        self.position_um = self.position_at(now);
        self.motion = None;
    }

    fn start(&mut self, to_um: f64, velocity_um_s: f64, now: Instant) {
        let from_um = self.position_at(now);
        let duration = if velocity_um_s > 0.0 {
            Duration::try_from_secs_f64((to_um - from_um).abs() / velocity_um_s).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        self.motion = Some(Motion {
            from_um,
            to_um,
            started: now,
            duration,
        });
    }
}

/// Simulated multi-axis motion controller.
pub struct SimRobot {
    link: SimLink,
    axes: Mutex<HashMap<u8, Axis>>,
    homing_time: Duration,
    home_errors: Mutex<VecDeque<DeviceError>>,
    stops: AtomicU32,
    estops: AtomicU32,
}

sim_device!(SimRobot);

impl SimRobot {
    pub fn new(name: impl Into<String>, homing_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            link: SimLink::new(name),
            axes: Mutex::new(HashMap::new()),
            homing_time,
            home_errors: Mutex::new(VecDeque::new()),
            stops: AtomicU32::new(0),
            estops: AtomicU32::new(0),
        })
    }

    fn with_axis<T>(&self, axis: u8, f: impl FnOnce(&mut Axis, Instant) -> T) -> T {
        let now = Instant::now();
        let mut axes = lock(&self.axes);
        let state = axes.entry(axis).or_default();
        state.settle(now);
        f(state, now)
    }

    pub fn position(&self, axis: u8) -> f64 {
        self.with_axis(axis, |a, now| a.position_at(now))
    }

    pub fn in_motion(&self, axis: u8) -> bool {
        self.with_axis(axis, |a, _| a.motion.is_some())
    }

    pub fn servo_enabled(&self, axis: u8) -> bool {
        self.with_axis(axis, |a, _| a.servo)
    }

    pub fn homed(&self, axis: u8) -> bool {
        self.with_axis(axis, |a, _| a.homed)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn estop_count(&self) -> u32 {
        self.estops.load(Ordering::SeqCst)
    }

    /// Make the next `home` calls fail with `errors`, in order.
    pub fn fail_next_home(&self, errors: impl IntoIterator<Item = DeviceError>) {
        lock(&self.home_errors).extend(errors);
    }

    fn require_servo(&self, axis: u8) -> Result<(), DeviceError> {
        if self.servo_enabled(axis) {
            Ok(())
        } else {
            Err(DeviceError::fault(SERVO_OFF_FAULT, format!("axis {axis} servo is off")))
        }
    }
}

#[async_trait]
impl RobotService for SimRobot {
    async fn home(&self, axis: u8) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.require_servo(axis)?;
        if let Some(err) = lock(&self.home_errors).pop_front() {
            return Err(err);
        }
        let velocity = {
            let from = self.position(axis).abs();
            if self.homing_time.is_zero() || from == 0.0 {
                f64::INFINITY
            } else {
                from / self.homing_time.as_secs_f64()
            }
        };
        self.with_axis(axis, |a, now| {
            a.homed = false;
            a.start(0.0, velocity, now);
        });
        let deadline = Instant::now() + self.homing_time;
        loop {
            let (moving, position) = self.with_axis(axis, |a, now| (a.motion.is_some(), a.position_at(now)));
            if !moving {
                if position != 0.0 {
                    return Err(DeviceError::fault(HOMING_ABORTED_FAULT, "homing interrupted"));
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
            tokio::time::sleep(HOMING_POLL).await;
        }
        self.with_axis(axis, |a, _| a.homed = true);
        Ok(())
    }

    async fn move_absolute(
        &self,
        axis: u8,
        position_um: f64,
        motion: MotionProfile,
    ) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.require_servo(axis)?;
        self.with_axis(axis, |a, now| a.start(position_um, motion.velocity_um_s, now));
        Ok(())
    }

    async fn move_relative(
        &self,
        axis: u8,
        distance_um: f64,
        motion: MotionProfile,
    ) -> Result<(), DeviceError> {
        let target = self.position(axis) + distance_um;
        self.move_absolute(axis, target, motion).await
    }

    async fn stop(&self, axis: u8, _decel_um_s2: f64) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.with_axis(axis, |a, now| a.freeze(now));
        Ok(())
    }

    async fn emergency_stop_all(&self) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.estops.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        for axis in lock(&self.axes).values_mut() {
            axis.freeze(now);
            axis.servo = false;
        }
        Ok(())
    }

    async fn read_position(&self, axis: u8) -> Result<f64, DeviceError> {
        self.link.ensure()?;
        Ok(self.position(axis))
    }

    async fn read_alarm(&self, _axis: u8) -> Result<Option<u32>, DeviceError> {
        self.link.ensure()?;
        Ok(lock(&self.link.alarm).as_ref().map(|a| a.code))
    }

    async fn servo_on(&self, axis: u8) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.with_axis(axis, |a, _| a.servo = true);
        Ok(())
    }

    async fn servo_off(&self, axis: u8) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.with_axis(axis, |a, now| {
            a.freeze(now);
            a.servo = false;
        });
        Ok(())
    }

    async fn is_in_motion(&self, axis: u8) -> Result<bool, DeviceError> {
        self.link.ensure()?;
        Ok(self.in_motion(axis))
    }

    async fn is_servo_on(&self, axis: u8) -> Result<bool, DeviceError> {
        self.link.ensure()?;
        Ok(self.servo_enabled(axis))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Power supply
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Supply {
    voltage_set: f64,
    current_limit: f64,
    switched_on_at: Option<Instant>,
}

/// Simulated programmable supply.
pub struct SimPower {
    link: SimLink,
    supply: Mutex<Supply>,
    ramp: Duration,
    load_current: Mutex<f64>,
    apply_errors: Mutex<VecDeque<DeviceError>>,
}

sim_device!(SimPower);

impl SimPower {
    /// `ramp` is the time the output needs to reach its setpoint.
    pub fn new(name: impl Into<String>, ramp: Duration, load_current: f64) -> Arc<Self> {
        Arc::new(Self {
            link: SimLink::new(name),
            supply: Mutex::new(Supply::default()),
            ramp,
            load_current: Mutex::new(load_current),
            apply_errors: Mutex::new(VecDeque::new()),
        })
    }

    pub fn output_enabled(&self) -> bool {
        lock(&self.supply).switched_on_at.is_some()
    }

    pub fn set_load_current(&self, amps: f64) {
        *lock(&self.load_current) = amps;
    }

    /// Make the next `apply` calls fail with `errors`, in order.
    pub fn fail_next_apply(&self, errors: impl IntoIterator<Item = DeviceError>) {
        lock(&self.apply_errors).extend(errors);
    }
}

#[async_trait]
impl PowerService for SimPower {
    async fn apply(&self, voltage: f64, current_limit: f64) -> Result<(), DeviceError> {
        self.link.ensure()?;
        if let Some(err) = lock(&self.apply_errors).pop_front() {
            return Err(err);
        }
        let mut supply = lock(&self.supply);
        supply.voltage_set = voltage;
        supply.current_limit = current_limit;
        Ok(())
    }

    async fn output_on(&self) -> Result<(), DeviceError> {
        self.link.ensure()?;
        lock(&self.supply).switched_on_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    async fn output_off(&self) -> Result<(), DeviceError> {
        self.link.ensure()?;
        lock(&self.supply).switched_on_at = None;
        Ok(())
    }

    async fn is_output_on(&self) -> Result<bool, DeviceError> {
        self.link.ensure()?;
        Ok(self.output_enabled())
    }

    async fn measure_voltage(&self) -> Result<f64, DeviceError> {
        self.link.ensure()?;
        let supply = lock(&self.supply);
        Ok(match supply.switched_on_at {
            None => 0.0,
            Some(_) if self.ramp.is_zero() => supply.voltage_set,
            Some(at) => {
                let f = (at.elapsed().as_secs_f64() / self.ramp.as_secs_f64()).min(1.0);
                supply.voltage_set * f
            }
        })
    }

    async fn measure_current(&self) -> Result<f64, DeviceError> {
        self.link.ensure()?;
        Ok(if self.output_enabled() {
            *lock(&self.load_current)
        } else {
            0.0
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MCU
// ────────────────────────────────────────────────────────────────────────────

/// Temperature behaviour of [`SimMcu`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThermalModel {
    /// Linear approach to the setpoint over `settle`, then exact.
    Track { settle: Duration },
    /// `setpoint + amplitude · sin(2π t / period)` forever.
    Oscillate { amplitude_c: f64, period: Duration },
    /// Constant temperature regardless of the setpoint.
    Fixed(f64),
}

#[derive(Debug)]
struct Thermal {
    setpoint: f64,
    from_c: f64,
    set_at: Instant,
    fan_pct: u8,
}

/// Simulated heater/fan microcontroller.
pub struct SimMcu {
    link: SimLink,
    model: ThermalModel,
    thermal: Mutex<Thermal>,
}

sim_device!(SimMcu);

impl SimMcu {
    pub fn new(name: impl Into<String>, model: ThermalModel) -> Arc<Self> {
        Arc::new(Self {
            link: SimLink::new(name),
            model,
            thermal: Mutex::new(Thermal {
                setpoint: AMBIENT_C,
                from_c: AMBIENT_C,
                set_at: Instant::now(),
                fan_pct: 0,
            }),
        })
    }

    pub fn temperature(&self) -> f64 {
        let t = lock(&self.thermal);
        let elapsed = t.set_at.elapsed();
        match self.model {
            ThermalModel::Track { settle } if settle.is_zero() => t.setpoint,
            ThermalModel::Track { settle } => {
                let f = (elapsed.as_secs_f64() / settle.as_secs_f64()).min(1.0);
                t.from_c + (t.setpoint - t.from_c) * f
            }
            ThermalModel::Oscillate { amplitude_c, period } => {
                let phase = elapsed.as_secs_f64() / period.as_secs_f64().max(f64::EPSILON);
                t.setpoint + amplitude_c * (std::f64::consts::TAU * phase).sin()
            }
            ThermalModel::Fixed(c) => c,
        }
    }

    pub fn setpoint(&self) -> f64 {
        lock(&self.thermal).setpoint
    }

    pub fn fan_speed(&self) -> u8 {
        lock(&self.thermal).fan_pct
    }
}

#[async_trait]
impl McuService for SimMcu {
    async fn set_temperature(&self, target_c: f64) -> Result<(), DeviceError> {
        self.link.ensure()?;
        let current = self.temperature();
        let mut t = lock(&self.thermal);
        t.from_c = current;
        t.setpoint = target_c;
        t.set_at = Instant::now();
        Ok(())
    }

    async fn read_setpoint(&self) -> Result<f64, DeviceError> {
        self.link.ensure()?;
        Ok(self.setpoint())
    }

    async fn read_temperature(&self) -> Result<f64, DeviceError> {
        self.link.ensure()?;
        Ok(self.temperature())
    }

    async fn set_fan_speed(&self, pct: u8) -> Result<(), DeviceError> {
        self.link.ensure()?;
        if pct > 100 {
            return Err(DeviceError::OutOfRange(format!("fan speed {pct} %")));
        }
        lock(&self.thermal).fan_pct = pct;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loadcell
// ────────────────────────────────────────────────────────────────────────────

/// Force in newtons for `(cycle, sample)`; both 0-based.  The cycle advances
/// on every `zero`, the sample index on every streamed reading.
pub type ForceScript = Arc<dyn Fn(u32, u64) -> f64 + Send + Sync>;

#[derive(Debug, Default)]
struct Cell {
    cycle: Option<u32>,
    sample: u64,
}

struct Trigger {
    cycle: u32,
    sample: u64,
    notify: Arc<Notify>,
}

/// Simulated load cell.
pub struct SimLoadcell {
    link: SimLink,
    script: ForceScript,
    capacity_n: f64,
    cell: Arc<Mutex<Cell>>,
    trigger: Option<Arc<Trigger>>,
    zeros: AtomicU32,
}

sim_device!(SimLoadcell);

impl SimLoadcell {
    pub fn new(name: impl Into<String>, script: ForceScript, capacity_n: f64) -> Self {
        Self {
            link: SimLink::new(name),
            script,
            capacity_n,
            cell: Arc::new(Mutex::new(Cell::default())),
            trigger: None,
            zeros: AtomicU32::new(0),
        }
    }

    /// Wake `notify` when reading `sample` of `cycle` is streamed.
    pub fn with_trigger(mut self, cycle: u32, sample: u64, notify: Arc<Notify>) -> Self {
        self.trigger = Some(Arc::new(Trigger {
            cycle,
            sample,
            notify,
        }));
        self
    }

    pub fn zero_count(&self) -> u32 {
        self.zeros.load(Ordering::SeqCst)
    }

    fn reading(script: &ForceScript, capacity_n: f64, cycle: u32, sample: u64, t_ns: u64) -> ForceReading {
        let raw = script(cycle, sample);
        let saturated = raw.abs() >= capacity_n;
        ForceReading {
            t_ns,
            force_n: raw.clamp(-capacity_n, capacity_n),
            saturated,
        }
    }
}

#[async_trait]
impl LoadcellService for SimLoadcell {
    async fn zero(&self) -> Result<(), DeviceError> {
        self.link.ensure()?;
        self.zeros.fetch_add(1, Ordering::SeqCst);
        let mut cell = lock(&self.cell);
        cell.cycle = Some(cell.cycle.map_or(0, |c| c + 1));
        cell.sample = 0;
        Ok(())
    }

    async fn read_force(&self) -> Result<ForceReading, DeviceError> {
        self.link.ensure()?;
        let cell = lock(&self.cell);
        Ok(Self::reading(
            &self.script,
            self.capacity_n,
            cell.cycle.unwrap_or(0),
            cell.sample,
            0,
        ))
    }

    fn stream_force(&self, rate_hz: u32) -> BoxStream<'static, Result<ForceReading, DeviceError>> {
        let period = Duration::from_nanos(1_000_000_000 / u64::from(rate_hz.max(1)));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let connected = Arc::clone(&self.link.connected);
        let cell = Arc::clone(&self.cell);
        let script = Arc::clone(&self.script);
        let trigger = self.trigger.clone();
        let capacity_n = self.capacity_n;
        let started = Instant::now();

        futures_util::stream::unfold((ticker, false), move |(mut ticker, done)| {
            let connected = Arc::clone(&connected);
            let cell = Arc::clone(&cell);
            let script = Arc::clone(&script);
            let trigger = trigger.clone();
            async move {
                if done {
                    return None;
                }
                ticker.tick().await;
                if !connected.load(Ordering::SeqCst) {
                    return Some((Err(DeviceError::NotConnected), (ticker, true)));
                }
                let (cycle, sample) = {
                    let mut cell = lock(&cell);
                    let index = cell.sample;
                    cell.sample += 1;
                    (cell.cycle.unwrap_or(0), index)
                };
                let t_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                let reading = SimLoadcell::reading(&script, capacity_n, cycle, sample, t_ns);
                if let Some(t) = trigger.filter(|t| t.cycle == cycle && t.sample == sample) {
                    t.notify.notify_one();
                }
                Some((Ok(reading), (ticker, false)))
            }
        })
        .boxed()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Digital I/O
// ────────────────────────────────────────────────────────────────────────────

/// Simulated digital I/O module.
pub struct SimDigitalIo {
    link: SimLink,
    inputs: Mutex<HashMap<u16, bool>>,
    outputs: Mutex<HashMap<u16, bool>>,
    writes: Mutex<Vec<(u16, bool)>>,
}

sim_device!(SimDigitalIo);

impl SimDigitalIo {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            link: SimLink::new(name),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_input(&self, bit: u16, level: bool) {
        lock(&self.inputs).insert(bit, level);
    }

    pub fn output(&self, bit: u16) -> bool {
        lock(&self.outputs).get(&bit).copied().unwrap_or(false)
    }

    /// Every output write in order.
    pub fn output_writes(&self) -> Vec<(u16, bool)> {
        lock(&self.writes).clone()
    }
}

#[async_trait]
impl DigitalIoService for SimDigitalIo {
    async fn read_input(&self, bit: u16) -> Result<bool, DeviceError> {
        self.link.ensure()?;
        Ok(lock(&self.inputs).get(&bit).copied().unwrap_or(false))
    }

    async fn write_output(&self, bit: u16, level: bool) -> Result<(), DeviceError> {
        self.link.ensure()?;
        lock(&self.outputs).insert(bit, level);
        lock(&self.writes).push((bit, level));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOTION: MotionProfile = MotionProfile {
        velocity_um_s: 500.0,
        accel_um_s2: 100_000.0,
        decel_um_s2: 100_000.0,
    };

    #[tokio::test]
    async fn calls_fail_until_connected() {
        let robot = SimRobot::new("robot", Duration::ZERO);
        assert_eq!(robot.read_position(0).await, Err(DeviceError::NotConnected));
        robot.connect().await.unwrap();
        assert_eq!(robot.read_position(0).await, Ok(0.0));
        robot.disconnect().await.unwrap();
        assert_eq!(robot.link().disconnects(), 1);
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let psu = SimPower::new("power", Duration::ZERO, 1.0);
        psu.link().fail_next_connects([DeviceError::timeout("connect", 10)]);
        assert!(psu.connect().await.is_err());
        assert!(psu.connect().await.is_ok());
        assert_eq!(psu.link().connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn robot_moves_over_time_and_stops() {
        let robot = SimRobot::new("robot", Duration::ZERO);
        robot.connect().await.unwrap();
        assert!(robot.move_absolute(0, 1000.0, MOTION).await.is_err());

        robot.servo_on(0).await.unwrap();
        robot.move_absolute(0, 1000.0, MOTION).await.unwrap();
        assert!(robot.is_in_motion(0).await.unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((robot.read_position(0).await.unwrap() - 500.0).abs() < 1e-6);

        robot.stop(0, 100_000.0).await.unwrap();
        assert!(!robot.is_in_motion(0).await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((robot.position(0) - 500.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn homing_takes_configured_time_and_can_be_interrupted() {
        let robot = SimRobot::new("robot", Duration::from_millis(400));
        robot.connect().await.unwrap();
        robot.servo_on(0).await.unwrap();
        let started = Instant::now();
        robot.home(0).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(robot.homed(0));

        robot.move_absolute(0, 2000.0, MOTION).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        let homing = {
            let robot = Arc::clone(&robot);
            tokio::spawn(async move { robot.home(0).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        robot.emergency_stop_all().await.unwrap();
        let err = homing.await.unwrap().unwrap_err();
        assert!(matches!(err, DeviceError::DeviceFault { code: HOMING_ABORTED_FAULT, .. }));
        assert!(!robot.servo_enabled(0));
    }

    #[tokio::test(start_paused = true)]
    async fn vanishing_velocity_moves_forever() {
        let robot = SimRobot::new("robot", Duration::ZERO);
        robot.connect().await.unwrap();
        robot.servo_on(0).await.unwrap();
        let crawl = MotionProfile {
            velocity_um_s: 1e-300,
            ..MOTION
        };
        robot.move_absolute(0, 1_000.0, crawl).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert!(robot.in_motion(0));
        assert!(robot.position(0) < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_home_errors_come_first() {
        let robot = SimRobot::new("robot", Duration::ZERO);
        robot.connect().await.unwrap();
        robot.servo_on(0).await.unwrap();
        robot.fail_next_home([DeviceError::timeout("home", 60_000)]);
        assert!(matches!(robot.home(0).await, Err(DeviceError::Timeout { .. })));
        robot.home(0).await.unwrap();
        assert!(robot.homed(0));
    }

    #[tokio::test(start_paused = true)]
    async fn power_ramps_to_setpoint() {
        let psu = SimPower::new("power", Duration::from_millis(200), 0.8);
        psu.connect().await.unwrap();
        psu.apply(24.0, 2.0).await.unwrap();
        assert_eq!(psu.measure_voltage().await.unwrap(), 0.0);
        psu.output_on().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!((psu.measure_voltage().await.unwrap() - 12.0).abs() < 1e-6);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!((psu.measure_voltage().await.unwrap() - 24.0).abs() < 1e-6);
        assert_eq!(psu.measure_current().await.unwrap(), 0.8);
        psu.output_off().await.unwrap();
        assert!(!psu.output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn mcu_tracks_and_oscillates() {
        let mcu = SimMcu::new("mcu", ThermalModel::Track {
            settle: Duration::from_secs(1),
        });
        mcu.connect().await.unwrap();
        mcu.set_temperature(45.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((mcu.read_temperature().await.unwrap() - 35.0).abs() < 1e-6);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mcu.read_temperature().await.unwrap(), 45.0);

        let osc = SimMcu::new("mcu", ThermalModel::Oscillate {
            amplitude_c: 1.0,
            period: Duration::from_secs(1),
        });
        osc.connect().await.unwrap();
        osc.set_temperature(40.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!((osc.read_temperature().await.unwrap() - 41.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn loadcell_streams_script_and_fires_trigger() {
        let notify = Arc::new(Notify::new());
        let script: ForceScript = Arc::new(|cycle: u32, sample: u64| f64::from(cycle) * 100.0 + sample as f64);
        let cell = SimLoadcell::new("loadcell", script, 150.0).with_trigger(1, 2, Arc::clone(&notify));
        cell.connect().await.unwrap();

        cell.zero().await.unwrap();
        let first: Vec<f64> = cell
            .stream_force(100)
            .take(3)
            .map(|r| r.unwrap().force_n)
            .collect()
            .await;
        assert_eq!(first, vec![0.0, 1.0, 2.0]);

        cell.zero().await.unwrap();
        let second: Vec<ForceReading> = cell
            .stream_force(100)
            .take(3)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(second[2].force_n, 102.0);
        assert!(!second[2].saturated);
        tokio::time::timeout(Duration::from_millis(1), notify.notified())
            .await
            .unwrap();
        assert_eq!(cell.zero_count(), 2);
    }

    #[tokio::test]
    async fn loadcell_saturates_at_capacity() {
        let cell = SimLoadcell::new("loadcell", Arc::new(|_: u32, _: u64| 900.0), 500.0);
        cell.connect().await.unwrap();
        let reading = cell.read_force().await.unwrap();
        assert_eq!(reading.force_n, 500.0);
        assert!(reading.saturated);
    }

    #[tokio::test]
    async fn digital_io_records_writes() {
        let io = SimDigitalIo::new("digital_io");
        io.connect().await.unwrap();
        io.set_input(3, true);
        assert!(io.read_input(3).await.unwrap());
        assert!(!io.read_input(4).await.unwrap());
        io.write_output(1, true).await.unwrap();
        io.write_output(1, false).await.unwrap();
        assert_eq!(io.output_writes(), vec![(1, true), (1, false)]);
        assert!(!io.output(1));
    }
}
