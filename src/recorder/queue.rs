//! Bounded frame queue
//!
//! Single producer (capture loop), single consumer (writer). The producer
//! never blocks: a full queue drops the frame and counts it.

use crate::capture::frame::Frame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Producer half
pub struct FrameSender {
    tx: Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half
pub struct FrameReceiver {
    rx: Receiver<Frame>,
}

/// Create a queue holding at most `capacity` frames
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        FrameSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        FrameReceiver { rx },
    )
}

/// Outcome of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; frame discarded
    Dropped,
    /// Consumer gone
    Closed,
}

impl FrameSender {
    pub fn offer(&self, frame: Frame) -> Offer {
        match self.tx.try_send(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }
}

/// Result of waiting for the next frame
pub enum Next {
    Frame(Frame),
    /// Nothing arrived within the wait
    Idle,
    /// Producer gone and queue empty
    Finished,
}

impl FrameReceiver {
    pub fn next(&self, wait: Duration) -> Next {
        match self.rx.recv_timeout(wait) {
            Ok(frame) => Next::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Finished,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (tx, rx) = frame_queue(4);

        let started = Instant::now();
        let outcomes: Vec<Offer> = (0..100)
            .map(|seq| tx.offer(Frame::solid(seq, 2, 2, [0, 0, 0])))
            .collect();
        assert!(started.elapsed() < Duration::from_millis(500));

        assert_eq!(outcomes.iter().filter(|o| **o == Offer::Queued).count(), 4);
        assert_eq!(tx.dropped(), 96);
        assert_eq!(tx.len(), 4);
        assert_eq!(tx.capacity(), 4);

        // FIFO: the first four survive
        for expected in 0..4 {
            match rx.next(Duration::from_millis(10)) {
                Next::Frame(frame) => assert_eq!(frame.seq, expected),
                _ => panic!("expected a frame"),
            }
        }
        assert!(matches!(rx.next(Duration::from_millis(10)), Next::Idle));
    }

    #[test]
    fn test_receiver_finishes_after_sender_drop() {
        let (tx, rx) = frame_queue(2);
        tx.offer(Frame::solid(0, 2, 2, [0, 0, 0]));
        drop(tx);

        assert!(matches!(rx.next(Duration::from_millis(10)), Next::Frame(_)));
        assert!(matches!(rx.next(Duration::from_millis(10)), Next::Finished));
    }

    #[test]
    fn test_closed_queue_reports_closed() {
        let (tx, rx) = frame_queue(2);
        drop(rx);
        assert_eq!(tx.offer(Frame::solid(0, 2, 2, [0, 0, 0])), Offer::Closed);
    }
}
