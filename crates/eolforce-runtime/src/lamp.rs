//! [`StationLamp`] – tower lamp and buzzer on the digital I/O module.
//!
//! Yellow while a test runs, green on PASS, red otherwise; the buzzer is
//! pulsed on every non-passing verdict.  Lamp failures are logged and never
//! affect the test.

use std::sync::Arc;
use std::time::Duration;

use eolforce_hal::{DeviceSession, DigitalIoService};
use eolforce_types::{TowerLamp, Verdict};
use tracing::{debug, warn};

pub struct StationLamp {
    dio: Option<Arc<DeviceSession<dyn DigitalIoService>>>,
    bits: TowerLamp,
}

impl StationLamp {
    pub fn new(dio: Option<Arc<DeviceSession<dyn DigitalIoService>>>, bits: TowerLamp) -> Self {
        Self { dio, bits }
    }

    fn configured(&self) -> bool {
        self.bits.green.is_some()
            || self.bits.yellow.is_some()
            || self.bits.red.is_some()
            || self.bits.buzzer.is_some()
    }

    pub async fn running(&self) {
        self.show(false, true, false).await;
    }

    pub async fn verdict(&self, verdict: Verdict) {
        let pass = verdict == Verdict::Pass;
        self.show(pass, false, !pass).await;
        if pass {
            return;
        }
        let (Some(dio), Some(bit)) = (&self.dio, self.bits.buzzer) else {
            return;
        };
        let pulse = Duration::from_millis(self.bits.buzzer_ms);
        if let Err(err) = dio.pulse_output(bit, pulse).await {
            warn!(bit, error = %err, "buzzer pulse failed");
        }
    }

    async fn show(&self, green: bool, yellow: bool, red: bool) {
        if !self.configured() {
            return;
        }
        let Some(dio) = &self.dio else {
            debug!("tower lamp configured without a digital I/O module");
            return;
        };
        for (bit, level) in [
            (self.bits.green, green),
            (self.bits.yellow, yellow),
            (self.bits.red, red),
        ] {
            let Some(bit) = bit else { continue };
            if let Err(err) = dio.write_output(bit, level).await {
                warn!(bit, level, error = %err, "tower lamp write failed");
            }
        }
    }
}
