//! Bounded per-connection queue and emit throttle

use crate::error::{RelayError, Result};
use crate::lifecycle::OutboundFrame;
use crate::models::StreamKind;
use crate::observability::RelayMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::warn;

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Queue was full; the frame was discarded
    Dropped,
}

/// Producer half of a connection's queue
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<OutboundFrame>,
    kind: StreamKind,
    dropped: Arc<AtomicU64>,
    metrics: RelayMetrics,
}

/// Create a queue holding at most `capacity` frames
pub fn bounded(capacity: usize, kind: StreamKind) -> (QueueSender, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = QueueSender {
        tx,
        kind,
        dropped: Arc::new(AtomicU64::new(0)),
        metrics: RelayMetrics::new(),
    };
    (sender, rx)
}

impl QueueSender {
    /// Enqueue without waiting. A full queue drops `frame` (drop-newest);
    /// only a closed queue is an error.
    pub fn offer(&self, frame: OutboundFrame) -> Result<Pushed> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(Pushed::Queued),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.inc_frames_dropped(self.kind);
                warn!(
                    stream = %self.kind,
                    dropped_total = dropped,
                    "Viewer queue full, dropping frame"
                );
                Ok(Pushed::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::QueueClosed),
        }
    }

    /// Enqueue, waiting for room
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| RelayError::QueueClosed)
    }

    /// Frames dropped so far on this queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Read-only view of the drop count that does not keep the queue open
    pub fn drop_counter(&self) -> DropCounter {
        DropCounter(Arc::clone(&self.dropped))
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[derive(Debug, Clone)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Enforces a minimum spacing between emitted results
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// True if a result may be emitted at `now`; records the emission
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok};

    fn text(i: usize) -> OutboundFrame {
        OutboundFrame::Text(i.to_string())
    }

    #[test]
    fn test_offer_never_exceeds_capacity() {
        let (queue, mut rx) = bounded(100, StreamKind::Stats);

        // No consumer is reading; every offer must return immediately.
        let mut queued = 0;
        let mut dropped = 0;
        for i in 0..500 {
            match queue.offer(text(i)).unwrap() {
                Pushed::Queued => queued += 1,
                Pushed::Dropped => dropped += 1,
            }
        }

        assert_eq!(queued, 100);
        assert_eq!(dropped, 400);
        assert_eq!(queue.dropped(), 400);
        assert_eq!(queue.drop_counter().get(), 400);
        assert_eq!(queue.capacity(), 100);

        // Oldest frames are kept, in order.
        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(frame);
        }
        assert_eq!(received.len(), 100);
        assert_eq!(received.first(), Some(&text(0)));
        assert_eq!(received.last(), Some(&text(99)));
    }

    #[test]
    fn test_offer_after_consumer_gone() {
        let (queue, rx) = bounded(1, StreamKind::Events);
        drop(rx);
        assert!(matches!(queue.offer(text(0)), Err(RelayError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_send_waits_for_room() {
        let (queue, mut rx) = bounded(1, StreamKind::Logs);
        queue.send(text(1)).await.unwrap();

        let mut send = tokio_test::task::spawn(queue.send(text(2)));
        assert_pending!(send.poll());

        assert_eq!(rx.recv().await, Some(text(1)));
        assert!(send.is_woken());
        assert_ready_ok!(send.poll());
        drop(send);

        assert_eq!(rx.recv().await, Some(text(2)));
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_throttle_spacing() {
        let mut throttle = Throttle::new(Duration::from_secs(1));
        let start = Instant::now();

        assert!(throttle.admit(start));
        assert!(!throttle.admit(start + Duration::from_millis(400)));
        assert!(!throttle.admit(start + Duration::from_millis(999)));
        assert!(throttle.admit(start + Duration::from_secs(1)));
        assert!(!throttle.admit(start + Duration::from_millis(1500)));
        assert!(throttle.admit(start + Duration::from_millis(2100)));
    }

    #[test]
    fn test_zero_interval_admits_everything() {
        let mut throttle = Throttle::new(Duration::ZERO);
        let now = Instant::now();
        assert!(throttle.admit(now));
        assert!(throttle.admit(now));
    }
}
