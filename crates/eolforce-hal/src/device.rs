//! Base [`Device`] contract shared by every device class.
//!
//! A driver owns its transport.  The session layer only ever talks to this
//! trait (and to the class-specific capability trait built on top of it), so
//! a vendor driver can be swapped for a simulated one without touching the
//! engine.

use async_trait::async_trait;
use eolforce_types::DeviceError;
use tokio::sync::mpsc;

/// Capacity of a driver's asynchronous event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Asynchronous notification raised by a driver (alarm, limit switch,
/// interrupt).  The owning session turns it into a fault entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub code: u32,
    pub message: String,
}

impl DeviceEvent {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Lifecycle every device supports, independent of its class.
///
/// Methods take `&self`; drivers use interior mutability for their state.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable identifier, e.g. `"robot"` or `"psu_1"`.
    fn name(&self) -> &str;

    /// Open the transport.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Push static configuration after connecting.
    async fn configure(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Close the transport.  Must tolerate being called on a half-open link.
    async fn disconnect(&self) -> Result<(), DeviceError>;

    /// Non-destructive alarm check.  `Some` when the device reports an alarm.
    async fn probe(&self) -> Result<Option<DeviceEvent>, DeviceError> {
        Ok(None)
    }

    /// Hand over the driver's event channel.  Returns `None` for drivers
    /// without asynchronous notifications or once the receiver was taken.
    fn take_events(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockDevice {
        open: AtomicBool,
    }

    #[async_trait]
    impl Device for MockDevice {
        fn name(&self) -> &str {
            "mock"
        }

        async fn connect(&self) -> Result<(), DeviceError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), DeviceError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_methods_are_inert() {
        let dev = MockDevice {
            open: AtomicBool::new(false),
        };
        dev.connect().await.unwrap();
        assert!(dev.open.load(Ordering::SeqCst));
        assert!(dev.configure().await.is_ok());
        assert_eq!(dev.probe().await.unwrap(), None);
        assert!(dev.take_events().is_none());
        dev.disconnect().await.unwrap();
        assert!(!dev.open.load(Ordering::SeqCst));
    }
}
