//! [`DigitalIoService`] – discrete inputs (door switch, e-stop button) and
//! outputs (tower lamp, buzzer).

use std::time::Duration;

use async_trait::async_trait;
use eolforce_types::DeviceError;

use crate::device::Device;

#[async_trait]
pub trait DigitalIoService: Device {
    async fn read_input(&self, bit: u16) -> Result<bool, DeviceError>;

    async fn write_output(&self, bit: u16, level: bool) -> Result<(), DeviceError>;

    /// Drive `bit` high for `duration`, then low.
    async fn pulse_output(&self, bit: u16, duration: Duration) -> Result<(), DeviceError> {
        self.write_output(bit, true).await?;
        tokio::time::sleep(duration).await;
        self.write_output(bit, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIo {
        writes: Mutex<Vec<(u16, bool)>>,
    }

    #[async_trait]
    impl Device for RecordingIo {
        fn name(&self) -> &str {
            "recording_io"
        }
        async fn connect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl DigitalIoService for RecordingIo {
        async fn read_input(&self, _bit: u16) -> Result<bool, DeviceError> {
            Ok(false)
        }
        async fn write_output(&self, bit: u16, level: bool) -> Result<(), DeviceError> {
            self.writes.lock().unwrap().push((bit, level));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_writes_high_then_low() {
        let io = RecordingIo::default();
        let started = tokio::time::Instant::now();
        io.pulse_output(4, Duration::from_millis(250)).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert_eq!(*io.writes.lock().unwrap(), vec![(4, true), (4, false)]);
    }
}
