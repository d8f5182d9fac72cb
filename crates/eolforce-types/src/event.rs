//! Phases of the EOL sequence and the progress events published while it
//! runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{Sample, Verdict};

/// States of the EOL sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    PowerUp,
    Thermal,
    Home,
    Cycle,
    Evaluate,
    Cooldown,
    Report,
    Abort,
    TerminalOk,
    TerminalFail,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::PowerUp => "power_up",
            Phase::Thermal => "thermal",
            Phase::Home => "home",
            Phase::Cycle => "cycle",
            Phase::Evaluate => "evaluate",
            Phase::Cooldown => "cooldown",
            Phase::Report => "report",
            Phase::Abort => "abort",
            Phase::TerminalOk => "terminal_ok",
            Phase::TerminalFail => "terminal_fail",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::TerminalOk | Phase::TerminalFail)
    }

    /// Coarse progress of the phases that do not depend on the cycle count.
    fn base_percent(self) -> f64 {
        match self {
            Phase::Prepare => 0.0,
            Phase::PowerUp => 2.0,
            Phase::Thermal => 5.0,
            Phase::Home => 8.0,
            Phase::Cycle => 10.0,
            Phase::Evaluate => 90.0,
            Phase::Cooldown => 93.0,
            Phase::Report => 97.0,
            Phase::Abort | Phase::TerminalOk | Phase::TerminalFail => 100.0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message on the observer stream.
///
/// Phase, cycle and verdict events are delivered to every subscriber;
/// sample events are latest-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Phase { phase: Phase },
    Cycle { index: u32, total: u32 },
    Sample { t_ns: u64, force_n: f64, pos_um: f64 },
    Verdict { verdict: Verdict, cause: String },
}

impl ProgressEvent {
    pub fn sample(sample: &Sample) -> Self {
        ProgressEvent::Sample {
            t_ns: sample.t_ns,
            force_n: sample.force_n,
            pos_um: sample.act_pos_um,
        }
    }

    /// `true` for events that must never be dropped.
    pub fn is_control(&self) -> bool {
        !matches!(self, ProgressEvent::Sample { .. })
    }
}

/// Latest aggregated progress: `{phase, cycle_index, percent, last_sample}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub cycle_index: Option<u32>,
    pub percent: f64,
    pub last_sample: Option<Sample>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Prepare,
            cycle_index: None,
            percent: 0.0,
            last_sample: None,
        }
    }
}

impl ProgressSnapshot {
    pub fn record_sample(&mut self, sample: &Sample) {
        self.last_sample = Some(*sample);
    }

    /// Fold one control event into the snapshot.
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Phase { phase } => {
                self.phase = *phase;
                if *phase != Phase::Cycle {
                    self.percent = self.percent.max(phase.base_percent());
                }
            }
            ProgressEvent::Cycle { index, total } => {
                self.cycle_index = Some(*index);
                let span = Phase::Evaluate.base_percent() - Phase::Cycle.base_percent();
                let done = f64::from(*index) / f64::from((*total).max(1));
                self.percent = Phase::Cycle.base_percent() + span * done;
            }
            // Carries no temperature; the bus records the full sample.
            ProgressEvent::Sample { .. } => {}
            ProgressEvent::Verdict { .. } => self.percent = 100.0,
        }
    }
}
