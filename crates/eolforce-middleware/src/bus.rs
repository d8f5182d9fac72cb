//! In-process progress stream with two delivery classes.
//!
//! | Lane      | Events                 | Delivery                          |
//! |-----------|------------------------|-----------------------------------|
//! | control   | phase, cycle, verdict  | every subscriber, in order, never dropped |
//! | telemetry | sample                 | latest wins; slow subscribers skip |
//!
//! Publishing never blocks: control events go through one unbounded channel
//! per subscriber, samples through a [`watch`] cell.

use std::sync::{Arc, Mutex, PoisonError};

use eolforce_types::{ProgressEvent, ProgressSnapshot, Sample};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

struct Inner {
    control: Mutex<Vec<mpsc::UnboundedSender<ProgressEvent>>>,
    samples: watch::Sender<Option<Sample>>,
    snapshot: watch::Sender<ProgressSnapshot>,
}

/// Shared progress bus.  Clones share the same channels.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<Inner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        let (samples, _) = watch::channel(None);
        let (snapshot, _) = watch::channel(ProgressSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                control: Mutex::new(Vec::new()),
                samples,
                snapshot,
            }),
        }
    }

    /// A subscriber sees every control event published after this call and
    /// the most recent sample.
    pub fn subscribe(&self) -> ProgressSubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        let mut samples = self.inner.samples.subscribe();
        let _ = samples.borrow_and_update();
        ProgressSubscriber {
            control: rx,
            samples,
            samples_open: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Publish a phase, cycle or verdict event to every subscriber.
    pub fn publish(&self, event: ProgressEvent) {
        if !event.is_control() {
            trace!("sample events go through publish_sample");
            return;
        }
        self.inner.snapshot.send_modify(|s| s.apply(&event));
        let mut subscribers = self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(?event, subscribers = subscribers.len(), "progress event");
    }

    /// Publish a sample on the latest-wins lane.
    pub fn publish_sample(&self, sample: &Sample) {
        self.inner.snapshot.send_modify(|s| s.record_sample(sample));
        self.inner.samples.send_replace(Some(*sample));
    }

    /// Latest aggregated progress.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Start a new test: reset the snapshot and the sample cell.
    pub fn reset(&self) {
        self.inner.snapshot.send_replace(ProgressSnapshot::default());
        self.inner.samples.send_replace(None);
    }
}

/// Receiving end of a [`ProgressBus`].
pub struct ProgressSubscriber {
    control: mpsc::UnboundedReceiver<ProgressEvent>,
    samples: watch::Receiver<Option<Sample>>,
    samples_open: bool,
}

impl ProgressSubscriber {
    /// Next event, control events first.  `None` once the bus is gone and
    /// every control event has been drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            if !self.samples_open {
                return self.control.recv().await;
            }
            tokio::select! {
                biased;
                event = self.control.recv() => return event,
                changed = self.samples.changed() => match changed {
                    Ok(()) => {
                        if let Some(sample) = *self.samples.borrow_and_update() {
                            return Some(ProgressEvent::sample(&sample));
                        }
                    }
                    Err(_) => self.samples_open = false,
                },
            }
        }
    }

    /// Next control event without waiting, if one is queued.
    pub fn try_recv_control(&mut self) -> Option<ProgressEvent> {
        self.control.try_recv().ok()
    }

    /// The most recent sample, if any was published.
    pub fn latest_sample(&self) -> Option<Sample> {
        *self.samples.borrow()
    }
}

/// One event as a JSON object on a single line.
pub fn encode_event(event: &ProgressEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eolforce_types::{Phase, StationLimits, Verdict};

    fn sample(t_ns: u64, force_n: f64) -> Sample {
        Sample::new(t_ns, 0.0, 100.0, force_n, 25.0, &StationLimits::default()).unwrap()
    }

    #[tokio::test]
    async fn control_events_reach_every_subscriber_in_order() {
        let bus = ProgressBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(ProgressEvent::Phase { phase: Phase::PowerUp });
        bus.publish(ProgressEvent::Cycle { index: 0, total: 3 });
        bus.publish(ProgressEvent::Verdict {
            verdict: Verdict::Pass,
            cause: String::new(),
        });

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(ProgressEvent::Phase { phase: Phase::PowerUp }));
            assert_eq!(sub.recv().await, Some(ProgressEvent::Cycle { index: 0, total: 3 }));
            assert!(matches!(sub.recv().await, Some(ProgressEvent::Verdict { .. })));
        }
    }

    #[tokio::test]
    async fn samples_are_latest_wins() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe();
        for i in 1..=100 {
            bus.publish_sample(&sample(i * 10, 20.0 + i as f64 / 100.0));
        }
        match sub.recv().await {
            Some(ProgressEvent::Sample { t_ns, .. }) => assert_eq!(t_ns, 1_000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sub.try_recv_control().is_none());
    }

    #[tokio::test]
    async fn control_lane_is_drained_before_samples() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe();
        bus.publish_sample(&sample(10, 20.0));
        bus.publish(ProgressEvent::Phase { phase: Phase::Cycle });
        assert_eq!(sub.recv().await, Some(ProgressEvent::Phase { phase: Phase::Cycle }));
        assert!(matches!(sub.recv().await, Some(ProgressEvent::Sample { t_ns: 10, .. })));
    }

    #[tokio::test]
    async fn dropped_bus_ends_the_stream_after_queued_events() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe();
        bus.publish(ProgressEvent::Phase { phase: Phase::Report });
        drop(bus);
        assert_eq!(sub.recv().await, Some(ProgressEvent::Phase { phase: Phase::Report }));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        drop(sub);
        bus.publish(ProgressEvent::Phase { phase: Phase::Home });
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn snapshot_tracks_phase_cycle_and_sample() {
        let bus = ProgressBus::new();
        bus.publish(ProgressEvent::Phase { phase: Phase::Cycle });
        bus.publish(ProgressEvent::Cycle { index: 1, total: 2 });
        bus.publish_sample(&sample(42, 21.5));
        let snap = bus.snapshot();
        assert_eq!(snap.phase, Phase::Cycle);
        assert_eq!(snap.cycle_index, Some(1));
        assert_eq!(snap.last_sample.unwrap().t_ns, 42);
        assert!(snap.percent > 0.0 && snap.percent < 100.0);

        bus.reset();
        assert_eq!(bus.snapshot(), ProgressSnapshot::default());
    }

    #[test]
    fn events_encode_as_tagged_json() {
        let line = encode_event(&ProgressEvent::Phase { phase: Phase::Thermal }).unwrap();
        assert_eq!(line, r#"{"type":"phase","phase":"thermal"}"#);
    }
}
