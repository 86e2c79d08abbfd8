//! Ephemeral pub/sub for turn progress frames.
//!
//! One broadcast channel per in-flight turn. Best-effort by design: the
//! turn store is the durable record, so a dropped frame only costs a
//! subscriber some latency (the stream endpoint replays from the store
//! on reconnect).

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use fl_domain::frame::Frame;

const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<Frame>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a turn's frames, creating the channel if needed.
    /// Must be called BEFORE reading persisted steps so no frame can
    /// fall between replay and live delivery.
    pub fn subscribe(&self, turn_id: Uuid) -> broadcast::Receiver<Frame> {
        let mut channels = self.channels.write();
        let tx = channels
            .entry(turn_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        tx.subscribe()
    }

    /// Publish a frame to all current subscribers (no-op without any).
    pub fn publish(&self, turn_id: Uuid, frame: Frame) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(&turn_id) {
            let _ = tx.send(frame);
        }
    }

    /// Drop the channel after the terminal frame; late subscribers fall
    /// back to store replay.
    pub fn cleanup(&self, turn_id: Uuid) {
        self.channels.write().remove(&turn_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_frames_in_order() {
        let bus = EventBus::new();
        let turn = Uuid::new_v4();
        let mut rx = bus.subscribe(turn);

        bus.publish(turn, Frame::Status { sequence: 1, content: "Queued".into() });
        bus.publish(turn, Frame::Status { sequence: 2, content: "Starting analysis".into() });

        assert_eq!(rx.recv().await.unwrap().sequence(), Some(1));
        assert_eq!(rx.recv().await.unwrap().sequence(), Some(2));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(Uuid::new_v4(), Frame::Error { message: "x".into() });
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_closes_subscribers() {
        let bus = EventBus::new();
        let turn = Uuid::new_v4();
        let mut rx = bus.subscribe(turn);

        bus.cleanup(turn);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn channels_are_isolated_per_turn() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = bus.subscribe(a);
        let _rx_b = bus.subscribe(b);

        bus.publish(b, Frame::Status { sequence: 1, content: "b".into() });
        bus.publish(a, Frame::Status { sequence: 1, content: "a".into() });

        match rx_a.recv().await.unwrap() {
            Frame::Status { content, .. } => assert_eq!(content, "a"),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
