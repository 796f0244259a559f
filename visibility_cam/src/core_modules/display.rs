// THEORY:
// The display surface is whatever renders the live view: a dashboard, a terminal
// status line, a test. The engine does not know which. It publishes one
// `DisplayUpdate` per processed frame on a broadcast bus and forgets about it.
//
// Broadcast semantics are what we want here: any number of consumers, each sees
// every update it keeps up with, and a slow consumer lags (skipping to the newest
// updates) instead of stalling a camera. With no consumer at all, publishing is a
// no-op.
//
// Warnings that a human should see (recording failures, region alerts) travel on
// a second channel as `DisplayNotice`s.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core_modules::estimator::VisibilityReading;
use crate::core_modules::event_log::Warning;
use crate::core_modules::event_state::EventState;
use crate::core_modules::frame::Frame;

#[derive(Debug, Clone)]
pub struct DisplayUpdate {
    pub camera_id: Arc<str>,
    pub frame: Arc<Frame>,
    pub reading: VisibilityReading,
    pub state: EventState,
    pub recording: bool,
}

pub type DisplayNotice = Warning;

#[derive(Clone)]
pub struct DisplayBus {
    updates_tx: broadcast::Sender<DisplayUpdate>,
    notices_tx: broadcast::Sender<DisplayNotice>,
}

impl DisplayBus {
    pub fn new(capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        let (notices_tx, _) = broadcast::channel(capacity.max(1));
        DisplayBus { updates_tx, notices_tx }
    }

    pub fn publish(&self, update: DisplayUpdate) {
        // Err only means nobody is listening.
        let _ = self.updates_tx.send(update);
    }

    pub fn notify(&self, notice: DisplayNotice) {
        let _ = self.notices_tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<DisplayNotice> {
        self.notices_tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.updates_tx.receiver_count()
    }
}

impl Default for DisplayBus {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::estimator::SubMetrics;
    use crate::core_modules::event_log::WarningKind;
    use crate::core_modules::event_state::VisibilityStatus;
    use chrono::Utc;
    use tokio::sync::broadcast::error::RecvError;

    fn update(score: f64) -> DisplayUpdate {
        let now = Utc::now();
        DisplayUpdate {
            camera_id: Arc::from("lobby"),
            frame: Arc::new(Frame::uniform(2, 2, [0, 0, 0], now)),
            reading: VisibilityReading {
                camera_id: "lobby".into(),
                timestamp: now,
                score,
                metrics: SubMetrics::default(),
                status: VisibilityStatus::Good,
                regions: None,
            },
            state: EventState::default(),
            recording: false,
        }
    }

    #[test]
    fn publishing_without_consumers_is_harmless() {
        let bus = DisplayBus::new(2);
        bus.publish(update(0.5));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_lags_instead_of_blocking() {
        let bus = DisplayBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(update(i as f64 / 10.0));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().reading.score, 0.3);
        assert_eq!(rx.recv().await.unwrap().reading.score, 0.4);
    }

    #[tokio::test]
    async fn notices_reach_subscribers() {
        let bus = DisplayBus::default();
        let mut rx = bus.subscribe_notices();
        bus.notify(Warning::now("lobby", WarningKind::EncoderStartFailure, "codec missing"));
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, WarningKind::EncoderStartFailure);
    }
}
