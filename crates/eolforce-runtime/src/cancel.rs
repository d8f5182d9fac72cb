//! [`CancelSignal`] – two-tier cancellation of the running test.
//!
//! A soft [`CancelReason::Cancelled`] is observed at the next suspension
//! point.  [`CancelReason::EmergencyStop`] is raised by the supervisor right
//! before it drives the facade's safety lane; it overrides a pending soft
//! cancel, never the other way round.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelReason {
    Cancelled,
    EmergencyStop,
}

impl CancelReason {
    /// Record cause for a test aborted for this reason.
    pub fn cause(self) -> &'static str {
        match self {
            CancelReason::Cancelled => "cancelled",
            CancelReason::EmergencyStop => "emergency_stop",
        }
    }
}

/// Shared cancellation flag.  Clones observe the same signal.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise `reason`.  Returns `false` when an equal or stronger reason was
    /// already pending.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|pending| match *pending {
            Some(current) if current >= reason => false,
            _ => {
                *pending = Some(reason);
                true
            }
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Clear the signal before a new test.
    pub fn reset(&self) {
        self.tx.send_replace(None);
    }

    /// Resolve once a reason is pending.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        let reason = rx.wait_for(Option::is_some).await.ok().and_then(|r| *r);
        match reason {
            Some(reason) => reason,
            // The sender lives in `self`; it cannot close while we wait.
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emergency_stop_overrides_soft_cancel() {
        let signal = CancelSignal::new();
        assert!(signal.cancel(CancelReason::Cancelled));
        assert!(signal.cancel(CancelReason::EmergencyStop));
        assert!(!signal.cancel(CancelReason::Cancelled));
        assert_eq!(signal.reason(), Some(CancelReason::EmergencyStop));
        assert_eq!(signal.reason().map(CancelReason::cause), Some("emergency_stop"));
    }

    #[test]
    fn reset_clears_the_reason() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Cancelled);
        signal.reset();
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_a_reason_raised_earlier() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Cancelled);
        assert_eq!(signal.cancelled().await, CancelReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wakes_a_waiting_task() {
        let signal = CancelSignal::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        signal.cancel(CancelReason::EmergencyStop);
        assert_eq!(waiter.await.unwrap(), CancelReason::EmergencyStop);
    }
}
