//! [`McuService`] – microcontroller driving the DUT heater and fan.

use std::time::Duration;

use async_trait::async_trait;
use eolforce_types::DeviceError;
use tokio::time::Instant;

use crate::device::Device;

/// Poll period of the default [`McuService::wait_until_stable`].
pub const STABLE_POLL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait McuService: Device {
    async fn set_temperature(&self, target_c: f64) -> Result<(), DeviceError>;

    /// Setpoint last commanded with [`set_temperature`](Self::set_temperature).
    async fn read_setpoint(&self) -> Result<f64, DeviceError>;

    async fn read_temperature(&self) -> Result<f64, DeviceError>;

    async fn set_fan_speed(&self, pct: u8) -> Result<(), DeviceError>;

    /// Wait until the temperature stayed within `±band_c` of the setpoint for
    /// `dwell` without interruption.
    ///
    /// The default implementation polls every [`STABLE_POLL`].
    ///
    /// # Errors
    ///
    /// [`DeviceError::Timeout`] when `timeout` elapses first.
    async fn wait_until_stable(
        &self,
        band_c: f64,
        dwell: Duration,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let target = self.read_setpoint().await?;
        let started = Instant::now();
        let mut in_band_since: Option<Instant> = None;
        loop {
            let now = Instant::now();
            let temp = self.read_temperature().await?;
            if (temp - target).abs() <= band_c {
                let since = *in_band_since.get_or_insert(now);
                if now.duration_since(since) >= dwell {
                    return Ok(());
                }
            } else {
                in_band_since = None;
            }
            if now.duration_since(started) >= timeout {
                return Err(DeviceError::timeout(
                    "wait_until_stable",
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ));
            }
            tokio::time::sleep(STABLE_POLL).await;
        }
    }
}
