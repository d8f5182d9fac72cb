//! [`LoadcellService`] – force transducer.

use async_trait::async_trait;
use eolforce_types::DeviceError;
use futures_util::stream::BoxStream;

use crate::device::Device;

/// One force reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceReading {
    /// Device time since the stream (or the zero) started, in ns.
    pub t_ns: u64,
    pub force_n: f64,
    /// The amplifier reports saturation; `force_n` is clipped.
    pub saturated: bool,
}

#[async_trait]
pub trait LoadcellService: Device {
    /// Tare the cell.
    async fn zero(&self) -> Result<(), DeviceError>;

    async fn read_force(&self) -> Result<ForceReading, DeviceError>;

    /// Lazy stream of readings at `rate_hz`.  The stream ends when it is
    /// dropped or after the first error item.
    fn stream_force(&self, rate_hz: u32) -> BoxStream<'static, Result<ForceReading, DeviceError>>;
}
