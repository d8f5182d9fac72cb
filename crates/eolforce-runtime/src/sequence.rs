//! [`EolSequence`] – the state machine of one EOL force test.
//!
//! ```text
//! PREPARE → POWER_UP → THERMAL → HOME → CYCLE(0..n) → EVALUATE → COOLDOWN → REPORT → TERMINAL_OK
//!     └──────────┴──────────┴───────┴──────┴──────────────────────┴──→ ABORT → TERMINAL_FAIL
//! ```
//!
//! Every state maps its failures to a transition; nothing propagates across
//! states.  The sequence checks the cancel signal, queued device faults and
//! the safety inputs at every suspension point: between states, after every
//! sample and while any device call is in flight.
//!
//! ABORT always runs the same safe-park order: stop motion through the
//! safety lane, switch the supply off through the safety lane, release the
//! force stream, abandon every device call still in flight, then disable
//! the servos.  The partially collected cycle is kept (marked incomplete)
//! when it holds samples.  The record is written in both terminal paths; a
//! write failure is logged and never changes the verdict.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eolforce_hal::power::OVERCURRENT_FAULT;
use eolforce_hal::{
    DeviceSession, ForceReading, HardwareFacade, LoadcellService, McuService, MotionProfile,
    PowerService, RobotService,
};
use eolforce_kernel::{Evaluation, Evaluator, InterlockMonitor, InterlockTrip};
use eolforce_memory::RecordSink;
use eolforce_middleware::ProgressBus;
use eolforce_types::profile::{SETTLE_COOLDOWN, SETTLE_POWER_ON, SETTLE_STROKE, SETTLE_THERMAL};
use eolforce_types::{
    CycleResult, DeviceError, DeviceKind, DutIdentity, MeasurementError, Phase, Profile,
    ProgressEvent, Readiness, Sample, StationConfig, TestRecord, Verdict,
};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use crate::cancel::{CancelReason, CancelSignal};
use crate::clock::TestClock;
use crate::lamp::StationLamp;
use crate::retry::ProtocolRetry;

/// Poll period of the supply output during POWER_UP.
const POWER_POLL: Duration = Duration::from_millis(20);
/// Safety-input poll period while a device call is in flight.
const INTERLOCK_POLL: Duration = Duration::from_millis(50);
/// Upper bound of one homing run.
pub const HOME_TIMEOUT: Duration = Duration::from_secs(60);

type ForceStream = BoxStream<'static, Result<ForceReading, DeviceError>>;

// ─────────────────────────────────────────────────────────────────────────────
// Abort
// ─────────────────────────────────────────────────────────────────────────────

/// Why a test leaves the nominal path.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub verdict: Verdict,
    pub cause: String,
    pub detail: Option<String>,
}

impl Abort {
    pub fn error(cause: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Error,
            cause: cause.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        Self {
            verdict: Verdict::Aborted,
            cause: reason.cause().to_string(),
            detail: None,
        }
    }

    fn interlock(trip: InterlockTrip) -> Self {
        Self::error("interlock", trip.to_string())
    }

    fn unconfigured(kind: DeviceKind) -> Self {
        Self::error("device_unconfigured", format!("no {} in the station", kind.as_str()))
    }

    fn measurement(err: MeasurementError) -> Self {
        let cause = match err {
            MeasurementError::PositionOutOfLimits { .. } => "position_out_of_limits",
            _ => "measurement_invalid",
        };
        Self::error(cause, err.to_string())
    }

    /// Map a failed device operation.  [`DeviceError::Cancelled`] is
    /// resolved by the caller against the cancel signal.
    pub fn device(op: &str, err: &DeviceError) -> Self {
        let cause = match err {
            DeviceError::NotConnected => "device_disconnected",
            DeviceError::Timeout { .. } => "device_timeout",
            DeviceError::ProtocolError(_) => "protocol_error",
            DeviceError::DeviceFault { .. } => "device_fault",
            DeviceError::OutOfRange(_) => "out_of_range",
            DeviceError::Cancelled => "cancelled",
        };
        Self::error(cause, format!("{op}: {err}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Preemption
// ─────────────────────────────────────────────────────────────────────────────

/// Cancel signal plus safety inputs: the two sources that may cut a state
/// short at any suspension point.
struct Preemption {
    facade: Arc<HardwareFacade>,
    cancel: CancelSignal,
    interlock: InterlockMonitor,
}

impl Preemption {
    fn check_cancel(&self) -> Result<(), Abort> {
        match self.cancel.reason() {
            Some(reason) => Err(Abort::cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Map a failed device call.  A call torn while the cancel signal is
    /// raised aborts with the signal's reason; one torn without it means the
    /// session dropped the call on its own.
    fn torn(&self, op: &str, err: DeviceError) -> Abort {
        match (err, self.cancel.reason()) {
            (DeviceError::Cancelled, Some(reason)) => Abort::cancelled(reason),
            (DeviceError::Cancelled, None) => {
                Abort::error("device_fault", format!("{op}: call dropped by the device session"))
            }
            (err, _) => Abort::device(op, &err),
        }
    }

    /// Sample every configured safety input once.
    async fn read_interlock(&self) -> Result<Option<InterlockTrip>, Abort> {
        if self.interlock.is_empty() {
            return Ok(None);
        }
        let Some(dio) = self.facade.digital_io() else {
            return Err(Abort::error(
                "interlock_unavailable",
                "safety inputs configured without a digital I/O module",
            ));
        };
        let mut levels = BTreeMap::new();
        for bit in self.interlock.bits() {
            let level = dio.read_input(bit).await.map_err(|err| {
                Abort::error("interlock_unavailable", format!("read_input({bit}): {err}"))
            })?;
            levels.insert(bit, level);
        }
        Ok(self.interlock.check(&levels))
    }

    async fn watch_interlock(&self) -> Abort {
        if self.interlock.is_empty() {
            return std::future::pending().await;
        }
        loop {
            tokio::time::sleep(INTERLOCK_POLL).await;
            match self.read_interlock().await {
                Ok(None) => {}
                Ok(Some(trip)) => return Abort::interlock(trip),
                Err(abort) => return abort,
            }
        }
    }

    /// Drive `op` to completion unless a cancel or an interlock comes
    /// first.  The outer error is the preemption, the inner one the
    /// device's.
    async fn attempt<T, Fut>(&self, op: Fut) -> Result<Result<T, DeviceError>, Abort>
    where
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        tokio::select! {
            biased;
            reason = self.cancel.cancelled() => Err(Abort::cancelled(reason)),
            abort = self.watch_interlock() => Err(abort),
            result = op => Ok(result),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), Abort> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            reason = self.cancel.cancelled() => Err(Abort::cancelled(reason)),
            abort = self.watch_interlock() => Err(abort),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EolSequence
// ─────────────────────────────────────────────────────────────────────────────

/// One test run, from PREPARE to a terminal state.
///
/// Build one per test and consume it with [`run`](Self::run).
pub struct EolSequence<'a> {
    facade: Arc<HardwareFacade>,
    config: &'a StationConfig,
    profile: Profile,
    bus: ProgressBus,
    sink: &'a dyn RecordSink,
    guard: Preemption,
    evaluator: Evaluator,
    lamp: StationLamp,
    retry: ProtocolRetry,
    clock: TestClock,
    record: TestRecord,
    phase: Phase,
    open_cycle: Option<CycleResult>,
    stream: Option<ForceStream>,
}

impl<'a> EolSequence<'a> {
    /// The record is created here; its start time is the clock origin.
    pub fn new(
        facade: Arc<HardwareFacade>,
        config: &'a StationConfig,
        bus: ProgressBus,
        sink: &'a dyn RecordSink,
        cancel: CancelSignal,
        profile: Profile,
        dut: DutIdentity,
    ) -> Self {
        let clock = TestClock::start();
        let record = TestRecord::new(dut, profile.clone(), clock.started_at());
        let lamp = StationLamp::new(facade.digital_io().cloned(), config.tower_lamp.clone());
        let guard = Preemption {
            facade: Arc::clone(&facade),
            cancel,
            interlock: InterlockMonitor::new(config.safety_inputs.clone()),
        };
        Self {
            facade,
            config,
            profile,
            bus,
            sink,
            guard,
            evaluator: Evaluator::standard(),
            lamp,
            retry: ProtocolRetry::new(),
            clock,
            record,
            phase: Phase::Prepare,
            open_cycle: None,
            stream: None,
        }
    }

    /// Replace the standard predicate set.
    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Drive the test to a terminal state and return the finished record.
    pub async fn run(mut self) -> TestRecord {
        let span = info_span!(
            "eol_test",
            test_id = %self.record.id,
            serial = %self.record.dut.serial_number,
            profile = %self.profile.name,
        );
        async move {
            info!(cycles = self.profile.cycle_count, "test started");
            match self.execute().await {
                Ok(evaluation) => self.report(evaluation).await,
                Err(abort) => self.abort(abort).await,
            }
            self.record
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> Result<Evaluation, Abort> {
        self.prepare().await?;
        self.power_up().await?;
        self.thermal().await?;
        self.home().await?;
        self.enter(Phase::Cycle);
        for index in 0..self.profile.cycle_count {
            self.cycle(index).await?;
        }
        let evaluation = self.evaluate();
        self.cooldown().await?;
        Ok(evaluation)
    }

    // ── Plumbing ────────────────────────────────────────────────────────────

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.retry.reset();
        info!(%phase, "phase");
        self.bus.publish(ProgressEvent::Phase { phase });
    }

    /// Cancel, queued faults and safety inputs, in that order.
    async fn checkpoint(&mut self) -> Result<(), Abort> {
        self.guard.check_cancel()?;
        self.collect_faults()?;
        match self.guard.read_interlock().await? {
            Some(trip) => Err(Abort::interlock(trip)),
            None => Ok(()),
        }
    }

    /// Move queued device faults into the record; a fault of a critical
    /// device aborts.
    fn collect_faults(&mut self) -> Result<(), Abort> {
        let faults = self.facade.drain_faults();
        if faults.is_empty() {
            return Ok(());
        }
        let fatal = faults
            .iter()
            .find(|f| self.facade.is_critical(f.kind))
            .map(|f| format!("{}: fault {}: {}", f.device, f.code, f.message));
        self.record.faults.extend(faults);
        match fatal {
            Some(detail) => Err(Abort::error("device_fault", detail)),
            None => Ok(()),
        }
    }

    /// Run a device operation with preemption, retrying one transient error
    /// per state.
    async fn call<T, F, Fut>(&mut self, op: &'static str, mut f: F) -> Result<T, Abort>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        loop {
            match self.guard.attempt(f()).await? {
                Ok(value) => return Ok(value),
                Err(err) if self.retry.allow(&err) => {
                    warn!(op, error = %err, phase = %self.phase, "transient device error, retrying once");
                }
                Err(err) => return Err(self.guard.torn(op, err)),
            }
        }
    }

    fn robot(&self) -> Result<Arc<DeviceSession<dyn RobotService>>, Abort> {
        self.facade
            .robot()
            .cloned()
            .ok_or_else(|| Abort::unconfigured(DeviceKind::Robot))
    }

    fn power(&self) -> Result<Arc<DeviceSession<dyn PowerService>>, Abort> {
        self.facade
            .power()
            .cloned()
            .ok_or_else(|| Abort::unconfigured(DeviceKind::Power))
    }

    fn mcu(&self) -> Result<Arc<DeviceSession<dyn McuService>>, Abort> {
        self.facade
            .mcu()
            .cloned()
            .ok_or_else(|| Abort::unconfigured(DeviceKind::Mcu))
    }

    fn loadcell(&self) -> Result<Arc<DeviceSession<dyn LoadcellService>>, Abort> {
        self.facade
            .loadcell()
            .cloned()
            .ok_or_else(|| Abort::unconfigured(DeviceKind::Loadcell))
    }

    fn motion(&self, velocity_um_s: f64) -> MotionProfile {
        MotionProfile {
            velocity_um_s,
            accel_um_s2: self.profile.acceleration_um_s2,
            decel_um_s2: self.profile.deceleration_um_s2,
        }
    }

    // ── States ──────────────────────────────────────────────────────────────

    #[instrument(name = "prepare", skip_all)]
    async fn prepare(&mut self) -> Result<(), Abort> {
        self.enter(Phase::Prepare);
        self.profile
            .validate(&self.config.limits)
            .map_err(|err| Abort::error("profile_invalid", err.to_string()))?;
        debug!(estimated = ?self.profile.estimated_duration(), "profile accepted");

        if self.facade.readiness() != Readiness::Ready && self.config.auto_connect {
            info!("station not ready, connecting");
            let report = tokio::select! {
                biased;
                reason = self.guard.cancel.cancelled() => return Err(Abort::cancelled(reason)),
                report = self.facade.connect_all() => report,
            };
            debug!(faulted = ?report.faulted, "connect finished");
        }
        let status = self.facade.snapshot_status();
        if status.readiness() != Readiness::Ready {
            return Err(Abort::error(
                "not_ready",
                format!("unavailable: {}", status.unavailable_critical().join(", ")),
            ));
        }
        self.facade.activate_all();
        self.lamp.running().await;
        self.checkpoint().await
    }

    #[instrument(name = "power_up", skip_all)]
    async fn power_up(&mut self) -> Result<(), Abort> {
        self.enter(Phase::PowerUp);
        let robot = self.robot()?;
        let power = self.power()?;
        for axis in self.profile.axes.clone() {
            self.call("servo_on", || robot.servo_on(axis)).await?;
        }

        let (voltage, limit) = (self.profile.voltage_setpoint, self.profile.current_limit);
        self.call("apply", || power.apply(voltage, limit)).await?;
        self.call("output_on", || power.output_on()).await?;

        let timeout = Duration::from_millis(self.profile.power_up_timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            self.checkpoint().await?;
            let measured = self.call("measure_voltage", || power.measure_voltage()).await?;
            if (measured - voltage).abs() <= self.profile.voltage_band {
                debug!(measured, "supply output in band");
                break;
            }
            if Instant::now() >= deadline {
                return Err(Abort::error(
                    "power_up_timeout",
                    format!("output at {measured:.3} V, setpoint {voltage:.3} V after {timeout:?}"),
                ));
            }
            self.guard.pause(POWER_POLL).await?;
        }

        match self.guard.attempt(power.fail_on_overcurrent(limit)).await? {
            Ok(()) => {}
            Err(DeviceError::DeviceFault {
                code: OVERCURRENT_FAULT,
                message,
            }) => return Err(Abort::error("overcurrent", message)),
            Err(err) => return Err(self.guard.torn("fail_on_overcurrent", err)),
        }
        self.guard.pause(self.profile.settle(SETTLE_POWER_ON)).await?;
        info!(voltage, "power up complete");
        Ok(())
    }

    #[instrument(name = "thermal", skip_all)]
    async fn thermal(&mut self) -> Result<(), Abort> {
        self.enter(Phase::Thermal);
        let mcu = self.mcu()?;
        if let Some(pct) = self.profile.fan_speed_pct {
            self.call("set_fan_speed", || mcu.set_fan_speed(pct)).await?;
        }
        let target = f64::from(self.profile.temperature_setpoint);
        self.call("set_temperature", || mcu.set_temperature(target)).await?;

        let band = self.profile.temperature_band;
        let dwell = self.profile.settle(SETTLE_THERMAL);
        let timeout = Duration::from_millis(
            self.profile
                .thermal_timeout_ms
                .unwrap_or(self.config.stable_timeout_ms),
        );
        match self
            .guard
            .attempt(mcu.wait_until_stable(band, dwell, timeout))
            .await?
        {
            Ok(()) => {}
            Err(DeviceError::Timeout { .. }) => {
                return Err(Abort::error(
                    "thermal_timeout",
                    format!("not within ±{band} °C of {target} °C for {dwell:?} within {timeout:?}"),
                ));
            }
            Err(err) => return Err(self.guard.torn("wait_until_stable", err)),
        }
        info!(target, "temperature stable");
        self.checkpoint().await
    }

    #[instrument(name = "home", skip_all)]
    async fn home(&mut self) -> Result<(), Abort> {
        self.enter(Phase::Home);
        let robot = self.robot()?;
        let tolerance = self.profile.home_tolerance_um;
        for axis in self.profile.axes.clone() {
            self.checkpoint().await?;
            let homed = loop {
                match self.guard.attempt(robot.home(axis, HOME_TIMEOUT)).await? {
                    Err(err) if self.retry.allow(&err) => {
                        warn!(axis, error = %err, "homing failed, retrying once");
                    }
                    result => break result,
                }
            };
            match homed {
                Ok(()) => {}
                Err(DeviceError::Timeout { .. }) => {
                    return Err(Abort::error(
                        "home_timeout",
                        format!("axis {axis} not homed within {HOME_TIMEOUT:?}"),
                    ));
                }
                Err(err) => return Err(self.guard.torn("home", err)),
            }
            let position = self.call("read_position", || robot.read_position(axis)).await?;
            if position.abs() > tolerance {
                return Err(Abort::error(
                    "home_position",
                    format!("axis {axis} at {position:.1} µm after homing, tolerance {tolerance} µm"),
                ));
            }
            debug!(axis, position, "axis homed");
        }
        Ok(())
    }

    #[instrument(name = "cycle", skip(self))]
    async fn cycle(&mut self, index: u32) -> Result<(), Abort> {
        self.retry.reset();
        self.bus.publish(ProgressEvent::Cycle {
            index,
            total: self.profile.cycle_count,
        });
        let robot = self.robot()?;
        let mcu = self.mcu()?;
        let loadcell = self.loadcell()?;
        self.checkpoint().await?;

        self.call("zero", || loadcell.zero()).await?;
        let stream = loadcell
            .stream_force(self.profile.sample_rate_hz)
            .map_err(|err| self.guard.torn("stream_force", err))?;
        self.stream = Some(stream);
        self.open_cycle = Some(CycleResult::open(
            index,
            self.clock.wall_now(),
            self.profile.sample_period(),
        ));
        let stall = self.profile.sample_period() * 2 + loadcell.call_timeout();

        let axis = self.profile.stroke_axis();
        let strokes: Vec<(f64, f64)> = self
            .profile
            .stroke_plan
            .iter()
            .copied()
            .zip(self.profile.velocity_plan.iter().copied())
            .collect();
        for (stroke, (target, velocity)) in strokes.into_iter().enumerate() {
            let temp_c = self.call("read_temperature", || mcu.read_temperature()).await?;
            let motion = self.motion(velocity);
            self.call("move_absolute", || robot.move_absolute(axis, target, motion))
                .await?;
            trace!(stroke, target, velocity, "stroke started");
            self.collect_stroke(&robot, axis, target, temp_c, stall).await?;
        }

        self.stream = None;
        let Some(mut cycle) = self.open_cycle.take() else {
            return Err(Abort::error("measurement_invalid", format!("cycle {index} was not open")));
        };
        cycle
            .close(self.clock.wall_now(), &self.profile.tolerance)
            .map_err(Abort::measurement)?;
        info!(
            cycle = index,
            samples = cycle.samples().len(),
            peak_force = cycle.peak_force,
            mean_force = cycle.mean_force,
            within_tolerance = cycle.within_tolerance,
            degraded = cycle.degraded,
            "cycle closed"
        );
        self.record.push_cycle(cycle).map_err(Abort::measurement)
    }

    /// Sample until the axis stopped and the stroke settle time elapsed.
    async fn collect_stroke(
        &mut self,
        robot: &Arc<DeviceSession<dyn RobotService>>,
        axis: u8,
        target: f64,
        temp_c: f64,
        stall: Duration,
    ) -> Result<(), Abort> {
        let settle = self.profile.settle(SETTLE_STROKE);
        let threshold = self.profile.tolerance.overrange_threshold();
        let mut settled_at: Option<Instant> = None;
        loop {
            let reading = self.next_reading(stall).await?;
            let position = self.call("read_position", || robot.read_position(axis)).await?;
            let moving = self.call("is_in_motion", || robot.is_in_motion(axis)).await?;
            let sample = self.append_sample(target, position, reading, temp_c)?;
            if sample.force_n > threshold {
                return Err(Abort::error(
                    "force_overrange",
                    format!(
                        "{:.3} N exceeds {threshold:.3} N at t = {} ns",
                        sample.force_n, sample.t_ns
                    ),
                ));
            }
            self.checkpoint().await?;
            if !moving {
                let now = Instant::now();
                if now >= *settled_at.get_or_insert(now + settle) {
                    return Ok(());
                }
            }
        }
    }

    async fn next_reading(&mut self, stall: Duration) -> Result<ForceReading, Abort> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Abort::error("measurement_invalid", "no force stream is open"));
        };
        let next = tokio::select! {
            biased;
            reason = self.guard.cancel.cancelled() => return Err(Abort::cancelled(reason)),
            next = tokio::time::timeout(stall, stream.next()) => next,
        };
        match next {
            Ok(Some(Ok(reading))) => Ok(reading),
            Ok(Some(Err(err))) => Err(self.guard.torn("stream_force", err)),
            Ok(None) => Err(Abort::error("device_fault", "force stream ended")),
            Err(_) => Err(Abort::device(
                "stream_force",
                &DeviceError::timeout("stream_force", u64::try_from(stall.as_millis()).unwrap_or(u64::MAX)),
            )),
        }
    }

    fn append_sample(
        &mut self,
        cmd_pos_um: f64,
        act_pos_um: f64,
        reading: ForceReading,
        temp_c: f64,
    ) -> Result<Sample, Abort> {
        let threshold = self.profile.tolerance.overrange_threshold();
        let mut t_ns = self.clock.elapsed_ns();
        let Some(cycle) = self.open_cycle.as_mut() else {
            return Err(Abort::error("measurement_invalid", "sample outside a cycle"));
        };
        if let Some(last) = cycle.last_sample() {
            t_ns = t_ns.max(last.t_ns + 1);
        }
        let sample = Sample::new(
            t_ns,
            cmd_pos_um,
            act_pos_um,
            reading.force_n,
            temp_c,
            &self.config.limits,
        )
        .map_err(Abort::measurement)?;
        let sample = sample.with_over_range(reading.saturated || sample.force_n > threshold);
        cycle.append(sample).map_err(Abort::measurement)?;
        self.bus.publish_sample(&sample);
        trace!(t_ns, force_n = sample.force_n, pos_um = act_pos_um, "sample");
        Ok(sample)
    }

    fn evaluate(&mut self) -> Evaluation {
        self.enter(Phase::Evaluate);
        debug!(rules = ?self.evaluator.rule_names(), "evaluating");
        let evaluation = self
            .evaluator
            .evaluate(self.record.cycles(), &self.profile.tolerance);
        info!(
            verdict = %evaluation.verdict,
            cause = %evaluation.cause,
            detail = ?evaluation.detail,
            "evaluation"
        );
        evaluation
    }

    #[instrument(name = "cooldown", skip_all)]
    async fn cooldown(&mut self) -> Result<(), Abort> {
        self.enter(Phase::Cooldown);
        let power = self.power()?;
        let robot = self.robot()?;
        self.call("output_off", || power.output_off()).await?;
        self.guard.pause(self.profile.settle(SETTLE_COOLDOWN)).await?;
        for axis in self.profile.axes.clone() {
            self.call("servo_off", || robot.servo_off(axis)).await?;
        }
        if let Some(standby) = self.profile.standby_temperature_c {
            let mcu = self.mcu()?;
            let standby = f64::from(standby);
            self.call("set_temperature", || mcu.set_temperature(standby))
                .await?;
        }
        Ok(())
    }

    // ── Terminal paths ──────────────────────────────────────────────────────

    async fn report(&mut self, evaluation: Evaluation) {
        self.enter(Phase::Report);
        self.record.faults.extend(self.facade.drain_faults());
        self.record
            .finalize(evaluation.verdict, evaluation.cause, self.clock.wall_now());
        self.persist().await;
        self.finish(Phase::TerminalOk).await;
    }

    async fn abort(&mut self, abort: Abort) {
        let from = self.phase;
        self.enter(Phase::Abort);
        warn!(%from, cause = %abort.cause, detail = ?abort.detail, "aborting test");
        self.safe_park().await;

        if let Some(mut cycle) = self.open_cycle.take() {
            if cycle.samples().is_empty() {
                debug!(cycle = cycle.cycle_index, "dropping interrupted cycle without samples");
            } else {
                let kept = cycle
                    .close_incomplete(self.clock.wall_now(), &self.profile.tolerance)
                    .and_then(|()| self.record.push_cycle(cycle));
                if let Err(err) = kept {
                    warn!(error = %err, "interrupted cycle could not be kept");
                }
            }
        }
        self.record.faults.extend(self.facade.drain_faults());
        self.record
            .finalize(abort.verdict, abort.cause, self.clock.wall_now());
        self.persist().await;
        self.finish(Phase::TerminalFail).await;
    }

    /// Stop, power off, release the stream, preempt every session, disable
    /// servos.  Every step runs even when an earlier one failed.
    async fn safe_park(&mut self) {
        let axes = self.profile.axes.clone();
        let decel = self.profile.deceleration_um_s2;
        let robot = self.facade.robot().cloned();
        if let Some(robot) = &robot {
            for &axis in &axes {
                if let Err(err) = robot.stop_now(axis, decel).await {
                    warn!(axis, error = %err, "motion stop failed");
                }
            }
        }
        if let Some(power) = self.facade.power() {
            if let Err(err) = power.output_off_now().await {
                error!(error = %err, "supply output off failed");
            }
        }
        if self.stream.take().is_some() {
            debug!("force stream released");
        }
        self.facade.preempt_all();
        if let Some(robot) = &robot {
            for &axis in &axes {
                if let Err(err) = robot.servo_off(axis).await {
                    warn!(axis, error = %err, "servo off failed");
                }
            }
        }
    }

    async fn persist(&mut self) {
        match self.sink.write(&self.record).await {
            Ok(receipt) => debug!(path = ?receipt.path, "record handed to sink"),
            Err(err) => error!(error = %err, verdict = %self.record.verdict, "record write failed"),
        }
    }

    async fn finish(&mut self, terminal: Phase) {
        self.bus.publish(ProgressEvent::Verdict {
            verdict: self.record.verdict,
            cause: self.record.cause.clone(),
        });
        self.lamp.verdict(self.record.verdict).await;
        self.phase = terminal;
        self.bus.publish(ProgressEvent::Phase { phase: terminal });
        info!(
            verdict = %self.record.verdict,
            cause = %self.record.cause,
            cycles = self.record.cycles().len(),
            elapsed = ?self.clock.elapsed(),
            "test finished"
        );
    }
}
