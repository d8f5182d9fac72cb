//! `eolforce-cli` – EOL Force-Test Launcher
//!
//! Runs one end-of-line force test on a simulated station:
//!
//! 1. Loads the station configuration and the test profile from TOML,
//!    applying `EOLFORCE_*` environment overrides.
//! 2. Builds the station, the record archive (JSON files plus the optional
//!    SQLite history index) and the supervisor.
//! 3. Intercepts **Ctrl-C** and turns it into an emergency stop.
//! 4. Prints a summary and exits with the verdict's code
//!    (0 PASS, 2 FAIL, 3 ABORTED, 4 ERROR, 64 usage).

mod config;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use colored::{ColoredString, Colorize};
use eolforce_hal::SimStation;
use eolforce_memory::{HistoryStore, JsonRecordWriter, RecordArchive};
use eolforce_middleware::encode_event;
use eolforce_runtime::{Supervisor, TelemetryOptions, init_tracing};
use eolforce_types::{DutIdentity, EXIT_USAGE, EolError, ProgressEvent, StationConfig, TestRecord, Verdict};
use tokio::task::JoinHandle;
use tracing::warn;

/// EOL force test – one DUT, one profile, one verdict
#[derive(Parser, Debug)]
#[command(name = "eolforce")]
#[command(version)]
#[command(about = "End-of-line force test on a simulated station")]
struct Args {
    /// Station configuration TOML.  Defaults apply when omitted.
    #[arg(long, value_name = "FILE")]
    station: Option<PathBuf>,

    /// Test profile TOML.  The reference profile applies when omitted.
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// DUT serial number.
    #[arg(long)]
    serial: String,

    /// DUT part number.
    #[arg(long)]
    part: String,

    /// Operator id.
    #[arg(long)]
    operator: String,

    /// Constant force reported by the simulated load cell (N).
    #[arg(long, default_value_t = 20.0)]
    force: f64,

    /// Print progress events as JSON lines on stdout.
    #[arg(long)]
    json_events: bool,

    /// Print yield statistics from the history index after the test.
    #[arg(long)]
    history: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    let station_cfg = match config::load_station(args.station.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            process::exit(EXIT_USAGE);
        }
    };

    // The span exporter must exist before the runtime that emits spans.
    let telemetry = init_tracing(&station_cfg.station_id, &TelemetryOptions::from_env());
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {e}", "Runtime error".red());
            process::exit(Verdict::Error.exit_code());
        }
    };
    let code = runtime.block_on(run(&args, station_cfg));
    drop(runtime);
    drop(telemetry);
    process::exit(code);
}

async fn run(args: &Args, station_cfg: StationConfig) -> i32 {
    let profile = match config::load_profile(args.profile.as_deref()) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("{}: {e}", "Profile error".red());
            return EXIT_USAGE;
        }
    };

    let station = SimStation::builder()
        .config(station_cfg.clone())
        .constant_force(args.force)
        .build();

    let history = station_cfg.history_db.as_ref().and_then(|path| match HistoryStore::open(path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "history index unavailable");
            None
        }
    });
    let mut archive = RecordArchive::new(JsonRecordWriter::new(&station_cfg.record_dir));
    if let Some(history) = &history {
        archive = archive.with_history(Arc::clone(history));
    }

    let sup = Arc::new(Supervisor::new(
        Arc::clone(&station.facade),
        station_cfg.clone(),
        Arc::new(archive),
    ));
    install_ctrlc(&sup);

    let printer = args.json_events.then(|| spawn_event_printer(&sup));
    let dut = DutIdentity::new(&args.serial, &args.part, &args.operator, "");

    println!(
        "  {} {} on {} with profile {}",
        "Testing".bold(),
        args.serial.bold(),
        station_cfg.station_id,
        profile.name.bold()
    );
    let outcome = sup.run(profile, dut).await;

    match outcome {
        Ok(record) => {
            if let Some(printer) = printer {
                let _ = printer.await;
            }
            print_summary(&record);
            if args.history {
                print_history(history.as_deref());
            }
            record.verdict.exit_code()
        }
        Err(e) => {
            if let Some(printer) = printer {
                printer.abort();
            }
            eprintln!("{}: {e}", "Test not started".red().bold());
            match e {
                EolError::ProfileInvalid(_) | EolError::DutInvalid(_) => EXIT_USAGE,
                EolError::DeviceUnconfigured(_) | EolError::Busy => Verdict::Error.exit_code(),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ctrl-C
// ─────────────────────────────────────────────────────────────────────────────

fn install_ctrlc(sup: &Arc<Supervisor>) {
    let handle = tokio::runtime::Handle::current();
    let sup = Arc::clone(sup);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – emergency stop".yellow().bold());
        let sup = Arc::clone(&sup);
        handle.spawn(async move {
            let report = sup.emergency_stop().await;
            if report.motion_stopped && report.power_off {
                eprintln!("{}", format!("  ✓ Station parked in {:?}", report.elapsed).green());
            } else {
                eprintln!("{}", format!("  ✗ Emergency stop incomplete: {:?}", report.errors).red().bold());
            }
        });
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not trigger an emergency stop");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// Print every event of the test as one JSON line; ends after the terminal
/// phase.
fn spawn_event_printer(sup: &Supervisor) -> JoinHandle<()> {
    let mut events = sup.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match encode_event(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "progress event not encodable"),
            }
            if matches!(event, ProgressEvent::Phase { phase } if phase.is_terminal()) {
                break;
            }
        }
    })
}

fn paint(verdict: Verdict) -> ColoredString {
    match verdict {
        Verdict::Pass => verdict.as_str().green().bold(),
        Verdict::Fail => verdict.as_str().red().bold(),
        Verdict::Aborted => verdict.as_str().yellow().bold(),
        Verdict::Error => verdict.as_str().magenta().bold(),
    }
}

fn print_summary(record: &TestRecord) {
    println!();
    println!("  Verdict   {}", paint(record.verdict));
    if !record.cause.is_empty() {
        println!("  Cause     {}", record.cause);
    }
    println!("  Test id   {}", record.id.to_string().dimmed());
    println!(
        "  DUT       {} / {}  (operator {})",
        record.dut.serial_number, record.dut.part_number, record.operator
    );
    let duration = record.ended_at - record.started_at;
    println!("  Duration  {:.1} s", duration.num_milliseconds() as f64 / 1000.0);
    for cycle in record.cycles() {
        let mark = if cycle.within_tolerance {
            "✓".green()
        } else {
            "✗".red()
        };
        let note = if cycle.complete { "" } else { "  (incomplete)" };
        println!(
            "    {mark} cycle {}: {} samples, peak {:.2} N, mean {:.2} N{note}",
            cycle.cycle_index,
            cycle.samples().len(),
            cycle.peak_force,
            cycle.mean_force
        );
    }
    for fault in &record.faults {
        println!(
            "    {} {} 0x{:02X}: {}",
            "fault".red(),
            fault.device,
            fault.code,
            fault.message
        );
    }
}

fn print_history(history: Option<&HistoryStore>) {
    let Some(history) = history else {
        println!("  {}", "No history database configured.".dimmed());
        return;
    };
    match history.yield_stats() {
        Ok(stats) => println!(
            "  History   {} tests, {} pass / {} fail / {} aborted / {} error, pass rate {:.1} %",
            stats.total,
            stats.pass,
            stats.fail,
            stats.aborted,
            stats.error,
            stats.pass_rate() * 100.0
        ),
        Err(e) => warn!(error = %e, "yield statistics unavailable"),
    }
}
