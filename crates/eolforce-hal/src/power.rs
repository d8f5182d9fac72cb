//! [`PowerService`] – programmable DC supply feeding the DUT.

use async_trait::async_trait;
use eolforce_types::DeviceError;

use crate::device::Device;

/// Fault code reported by [`PowerService::fail_on_overcurrent`].
pub const OVERCURRENT_FAULT: u32 = 0x0C;

#[async_trait]
pub trait PowerService: Device {
    /// Program the voltage setpoint and the current limit.
    async fn apply(&self, voltage: f64, current_limit: f64) -> Result<(), DeviceError>;

    async fn output_on(&self) -> Result<(), DeviceError>;

    async fn output_off(&self) -> Result<(), DeviceError>;

    async fn is_output_on(&self) -> Result<bool, DeviceError>;

    async fn measure_voltage(&self) -> Result<f64, DeviceError>;

    async fn measure_current(&self) -> Result<f64, DeviceError>;

    /// Fail with [`OVERCURRENT_FAULT`] when the measured current exceeds
    /// `current_limit`.
    async fn fail_on_overcurrent(&self, current_limit: f64) -> Result<(), DeviceError> {
        let current = self.measure_current().await?;
        if current > current_limit {
            return Err(DeviceError::fault(
                OVERCURRENT_FAULT,
                format!("output current {current:.3} A exceeds limit {current_limit:.3} A"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockSupply {
        current: Mutex<f64>,
    }

    #[async_trait]
    impl Device for MockSupply {
        fn name(&self) -> &str {
            "mock_psu"
        }
        async fn connect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl PowerService for MockSupply {
        async fn apply(&self, _v: f64, _i: f64) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn output_on(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn output_off(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn is_output_on(&self) -> Result<bool, DeviceError> {
            Ok(false)
        }
        async fn measure_voltage(&self) -> Result<f64, DeviceError> {
            Ok(0.0)
        }
        async fn measure_current(&self) -> Result<f64, DeviceError> {
            Ok(*self.current.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn overcurrent_predicate() {
        let psu = MockSupply {
            current: Mutex::new(1.5),
        };
        assert!(psu.fail_on_overcurrent(2.0).await.is_ok());

        *psu.current.lock().unwrap() = 2.5;
        match psu.fail_on_overcurrent(2.0).await {
            Err(DeviceError::DeviceFault { code, .. }) => assert_eq!(code, OVERCURRENT_FAULT),
            other => panic!("expected overcurrent fault, got {other:?}"),
        }
    }
}
