//! End-to-end runs of the supervisor against a simulated station.

use std::sync::Arc;
use std::time::Duration;

use eolforce_hal::SimStation;
use eolforce_hal::sim::ThermalModel;
use eolforce_memory::{JsonRecordWriter, MemorySink, RecordArchive, read_record};
use eolforce_runtime::Supervisor;
use eolforce_types::{DutIdentity, Phase, Profile, ProgressEvent, SafetyInput, StationConfig, Verdict};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

fn dut() -> DutIdentity {
    DutIdentity::new("SN-24-00017", "PN-4410-B", "op-7", "")
}

fn supervisor(station: &SimStation, sink: &MemorySink) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        Arc::clone(&station.facade),
        station.config.clone(),
        Arc::new(sink.clone()),
    ))
}

/// Run `action` once the supervisor publishes `phase`.
fn on_phase<F>(sup: &Supervisor, phase: Phase, action: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let mut events = sup.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event == (ProgressEvent::Phase { phase }) {
                action();
                return;
            }
        }
    })
}

fn assert_parked(station: &SimStation) {
    assert!(!station.facade.any_active());
    assert!(!station.robot.servo_enabled(0));
    assert!(!station.robot.in_motion(0));
    assert!(!station.power.output_enabled());
}

#[tokio::test(start_paused = true)]
async fn nominal_run_passes() {
    let station = SimStation::builder().constant_force(20.0).build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);
    let mut events = sup.subscribe();

    let record = sup.run(Profile::default(), dut()).await.unwrap();

    assert_eq!(record.verdict, Verdict::Pass, "cause: {}", record.cause);
    assert_eq!(record.cause, "");
    assert_eq!(record.cycles().len(), 3);
    for (index, cycle) in record.cycles().iter().enumerate() {
        assert_eq!(cycle.cycle_index as usize, index);
        assert!(cycle.complete);
        assert!(cycle.within_tolerance);
        let max = cycle.samples().iter().map(|s| s.act_pos_um).fold(f64::MIN, f64::max);
        let min = cycle.samples().iter().map(|s| s.act_pos_um).fold(f64::MAX, f64::min);
        assert!(max >= 999.0, "cycle {index} reached {max} µm");
        assert!(min <= 1.0, "cycle {index} returned to {min} µm");
    }
    assert!(record.samples().all(|s| s.force_n == 20.0 && !s.over_range));
    assert!(record.faults.is_empty());
    assert_parked(&station);
    assert_eq!(sink.last().unwrap(), record);

    let mut control = Vec::new();
    while let Some(event) = events.try_recv_control() {
        control.push(event);
    }
    assert_eq!(control.first(), Some(&ProgressEvent::Phase { phase: Phase::Prepare }));
    assert_eq!(
        control.last(),
        Some(&ProgressEvent::Phase {
            phase: Phase::TerminalOk
        })
    );
    assert!(control.contains(&ProgressEvent::Verdict {
        verdict: Verdict::Pass,
        cause: String::new()
    }));
    assert_eq!(sup.progress().percent, 100.0);
}

#[tokio::test(start_paused = true)]
async fn force_overrange_truncates_the_cycle() {
    let station = SimStation::builder()
        .force_script(Arc::new(|cycle: u32, sample: u64| {
            if cycle == 1 && sample == 9 { 70.0 } else { 20.0 }
        }))
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);

    let record = sup.run(Profile::default(), dut()).await.unwrap();

    assert_eq!(record.verdict, Verdict::Error);
    assert_eq!(record.cause, "force_overrange");
    assert_eq!(record.cycles().len(), 2);
    assert!(record.cycles()[0].complete);
    let truncated = &record.cycles()[1];
    assert!(!truncated.complete);
    assert_eq!(truncated.samples().len(), 10);
    let last = truncated.last_sample().unwrap();
    assert!(last.over_range);
    assert_eq!(last.force_n, 70.0);
    assert_parked(&station);
}

#[tokio::test(start_paused = true)]
async fn oscillating_temperature_times_out() {
    let station = SimStation::builder()
        .thermal(ThermalModel::Oscillate {
            amplitude_c: 1.0,
            period: Duration::from_secs(1),
        })
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);
    let profile = Profile {
        thermal_timeout_ms: Some(2_000),
        ..Profile::default()
    };

    let record = sup.run(profile, dut()).await.unwrap();

    assert_eq!(record.verdict, Verdict::Error);
    assert_eq!(record.cause, "thermal_timeout");
    assert!(record.cycles().is_empty());
    assert_parked(&station);
    assert_eq!(sink.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_mid_cycle_parks_the_station() {
    let trigger = Arc::new(Notify::new());
    let station = SimStation::builder()
        .notify_at(0, 50, Arc::clone(&trigger))
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);

    let estop = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move {
            trigger.notified().await;
            sup.emergency_stop().await
        }
    });
    let record = sup.run(Profile::default(), dut()).await.unwrap();
    let report = estop.await.unwrap();

    assert!(report.within_budget(), "took {:?}", report.elapsed);
    assert!(report.motion_stopped);
    assert!(report.power_off);
    assert_eq!(sup.last_emergency_stop(), Some(report));
    assert!(station.robot.estop_count() >= 1);

    assert_eq!(record.verdict, Verdict::Aborted);
    assert_eq!(record.cause, "emergency_stop");
    assert_eq!(record.cycles().len(), 1);
    assert!(!record.cycles()[0].complete);
    assert!(record.cycles()[0].samples().len() >= 50);
    assert_parked(&station);
    assert_eq!(sink.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn door_opened_during_power_up_trips_the_interlock() {
    let config = StationConfig {
        safety_inputs: vec![SafetyInput {
            label: "door".into(),
            bit: 3,
            active_high: true,
        }],
        ..StationConfig::default()
    };
    let station = SimStation::builder()
        .config(config)
        .power_ramp(Duration::from_secs(2))
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);
    let dio = station.dio.clone().unwrap();
    let door = on_phase(&sup, Phase::PowerUp, move || dio.set_input(3, true));

    let record = sup.run(Profile::default(), dut()).await.unwrap();
    door.await.unwrap();

    assert_eq!(record.verdict, Verdict::Error);
    assert_eq!(record.cause, "interlock");
    assert!(record.cycles().is_empty());
    assert_parked(&station);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_homing_aborts_and_disconnects() {
    let station = SimStation::builder()
        .homing_time(Duration::from_secs(3))
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);
    let canceller = on_phase(&sup, Phase::Home, {
        let sup = Arc::clone(&sup);
        move || {
            assert!(sup.cancel());
        }
    });

    let record = sup.run(Profile::default(), dut()).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(record.verdict, Verdict::Aborted);
    assert_eq!(record.cause, "cancelled");
    assert!(record.cycles().is_empty());
    assert_parked(&station);
    assert!(!station.power.link().is_connected());
    assert!(!station.robot.link().is_connected());
    assert!(!station.mcu.link().is_connected());
    assert!(!station.loadcell.link().is_connected());
    assert!(!sup.is_running());

    // The station accepts the next test right away.
    let next = sup.run(Profile::default(), dut()).await.unwrap();
    assert_eq!(next.verdict, Verdict::Pass, "cause: {}", next.cause);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_cycle_keeps_the_partial_cycle() {
    let trigger = Arc::new(Notify::new());
    let station = SimStation::builder()
        .notify_at(0, 30, Arc::clone(&trigger))
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);
    let canceller = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move {
            trigger.notified().await;
            assert!(sup.cancel());
        }
    });

    let record = sup.run(Profile::default(), dut()).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(record.verdict, Verdict::Aborted);
    assert_eq!(record.cause, "cancelled");
    assert_eq!(record.cycles().len(), 1);
    let partial = &record.cycles()[0];
    assert!(!partial.complete);
    assert!(partial.samples().len() >= 30);
    assert_parked(&station);
    assert_eq!(sink.records().len(), 1);
    assert_eq!(sup.last_emergency_stop(), None);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_thermal_leaves_the_station_ready() {
    let station = SimStation::builder()
        .thermal(ThermalModel::Track {
            settle: Duration::from_secs(4),
        })
        .build();
    let sink = MemorySink::new();
    let sup = supervisor(&station, &sink);
    let canceller = tokio::spawn({
        let sup = Arc::clone(&sup);
        let mut events = sup.subscribe();
        async move {
            while let Some(event) = events.recv().await {
                if event == (ProgressEvent::Phase { phase: Phase::Thermal }) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(sup.cancel());
        }
    });

    let started = Instant::now();
    let record = sup.run(Profile::default(), dut()).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(record.verdict, Verdict::Aborted);
    assert_eq!(record.cause, "cancelled");
    assert!(record.cycles().is_empty());
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert!(!station.mcu.link().is_connected());
    assert_parked(&station);

    let next = sup.run(Profile::default(), dut()).await.unwrap();
    assert_eq!(next.verdict, Verdict::Pass, "cause: {}", next.cause);
}

#[tokio::test(start_paused = true)]
async fn archived_record_reads_back_identically() {
    let dir = tempfile::tempdir().unwrap();
    let station = SimStation::builder().build();
    let archive = Arc::new(RecordArchive::new(JsonRecordWriter::new(dir.path())));
    let sup = Supervisor::new(Arc::clone(&station.facade), station.config.clone(), archive);
    let profile = Profile {
        cycle_count: 1,
        ..Profile::default()
    };

    let record = sup.run(profile, dut()).await.unwrap();

    let path = dir.path().join(record.file_name());
    assert_eq!(read_record(&path).unwrap(), record);
}
