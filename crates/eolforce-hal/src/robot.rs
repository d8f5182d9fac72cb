//! [`RobotService`] – multi-axis motion controller.
//!
//! Motion contract: [`home`](RobotService::home) returns once the axis is
//! homed; [`move_absolute`](RobotService::move_absolute) and
//! [`move_relative`](RobotService::move_relative) *start* a motion and
//! return.  Callers poll [`is_in_motion`](RobotService::is_in_motion) to
//! learn when it completed.  Positions are in µm.

use async_trait::async_trait;
use eolforce_types::DeviceError;

use crate::device::Device;

/// Velocity and ramps of one commanded motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionProfile {
    pub velocity_um_s: f64,
    pub accel_um_s2: f64,
    pub decel_um_s2: f64,
}

#[async_trait]
pub trait RobotService: Device {
    async fn home(&self, axis: u8) -> Result<(), DeviceError>;

    async fn move_absolute(
        &self,
        axis: u8,
        position_um: f64,
        motion: MotionProfile,
    ) -> Result<(), DeviceError>;

    async fn move_relative(
        &self,
        axis: u8,
        distance_um: f64,
        motion: MotionProfile,
    ) -> Result<(), DeviceError>;

    /// Controlled stop of one axis.
    async fn stop(&self, axis: u8, decel_um_s2: f64) -> Result<(), DeviceError>;

    /// Immediate stop of every axis.
    async fn emergency_stop_all(&self) -> Result<(), DeviceError>;

    async fn read_position(&self, axis: u8) -> Result<f64, DeviceError>;

    /// Active alarm code of the axis, if any.
    async fn read_alarm(&self, axis: u8) -> Result<Option<u32>, DeviceError>;

    async fn servo_on(&self, axis: u8) -> Result<(), DeviceError>;

    async fn servo_off(&self, axis: u8) -> Result<(), DeviceError>;

    async fn is_in_motion(&self, axis: u8) -> Result<bool, DeviceError>;

    async fn is_servo_on(&self, axis: u8) -> Result<bool, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Single-axis mock that jumps straight to its target.
    struct MockRobot {
        position: Mutex<f64>,
        servo: Mutex<bool>,
    }

    #[async_trait]
    impl Device for MockRobot {
        fn name(&self) -> &str {
            "mock_robot"
        }
        async fn connect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl RobotService for MockRobot {
        async fn home(&self, _axis: u8) -> Result<(), DeviceError> {
            *self.position.lock().unwrap() = 0.0;
            Ok(())
        }
        async fn move_absolute(&self, _axis: u8, p: f64, _m: MotionProfile) -> Result<(), DeviceError> {
            if !*self.servo.lock().unwrap() {
                return Err(DeviceError::fault(0x21, "servo off"));
            }
            *self.position.lock().unwrap() = p;
            Ok(())
        }
        async fn move_relative(&self, axis: u8, d: f64, m: MotionProfile) -> Result<(), DeviceError> {
            let target = *self.position.lock().unwrap() + d;
            self.move_absolute(axis, target, m).await
        }
        async fn stop(&self, _axis: u8, _decel: f64) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn emergency_stop_all(&self) -> Result<(), DeviceError> {
            *self.servo.lock().unwrap() = false;
            Ok(())
        }
        async fn read_position(&self, _axis: u8) -> Result<f64, DeviceError> {
            Ok(*self.position.lock().unwrap())
        }
        async fn read_alarm(&self, _axis: u8) -> Result<Option<u32>, DeviceError> {
            Ok(None)
        }
        async fn servo_on(&self, _axis: u8) -> Result<(), DeviceError> {
            *self.servo.lock().unwrap() = true;
            Ok(())
        }
        async fn servo_off(&self, _axis: u8) -> Result<(), DeviceError> {
            *self.servo.lock().unwrap() = false;
            Ok(())
        }
        async fn is_in_motion(&self, _axis: u8) -> Result<bool, DeviceError> {
            Ok(false)
        }
        async fn is_servo_on(&self, _axis: u8) -> Result<bool, DeviceError> {
            Ok(*self.servo.lock().unwrap())
        }
    }

    const SLOW: MotionProfile = MotionProfile {
        velocity_um_s: 100.0,
        accel_um_s2: 1000.0,
        decel_um_s2: 1000.0,
    };

    #[tokio::test]
    async fn relative_move_builds_on_absolute() {
        let robot = MockRobot {
            position: Mutex::new(0.0),
            servo: Mutex::new(false),
        };
        assert!(robot.move_absolute(0, 10.0, SLOW).await.is_err());
        robot.servo_on(0).await.unwrap();
        robot.move_absolute(0, 10.0, SLOW).await.unwrap();
        robot.move_relative(0, -4.0, SLOW).await.unwrap();
        assert_eq!(robot.read_position(0).await.unwrap(), 6.0);

        robot.emergency_stop_all().await.unwrap();
        assert!(!robot.is_servo_on(0).await.unwrap());
    }
}
