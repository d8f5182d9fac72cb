//! [`ProtocolRetry`] – per-state budget for transient device errors.
//!
//! A transient error (timeout or protocol error) is retried once inside the
//! state that hit it; the second transient error in the same state is fatal.
//! The engine resets the budget on every state transition and at the start
//! of every cycle.
//!
//! ```rust
//! use eolforce_runtime::retry::ProtocolRetry;
//! use eolforce_types::DeviceError;
//!
//! let mut retry = ProtocolRetry::new();
//! let crc = DeviceError::ProtocolError("bad crc".into());
//! assert!(retry.allow(&crc));
//! assert!(!retry.allow(&crc)); // second occurrence escalates
//! retry.reset();
//! assert!(retry.allow(&crc));
//! ```

use eolforce_types::DeviceError;

#[derive(Debug, Default)]
pub struct ProtocolRetry {
    used: bool,
}

impl ProtocolRetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when `err` may be retried: it is transient and the budget of
    /// the current state is unused.  Consumes the budget.
    pub fn allow(&mut self, err: &DeviceError) -> bool {
        if !err.is_transient() || self.used {
            return false;
        }
        self.used = true;
        true
    }

    pub fn reset(&mut self) {
        self.used = false;
    }
}
