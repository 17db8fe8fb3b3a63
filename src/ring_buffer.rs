//! Bounded SPSC handoff between the sniffer thread and its consumers
//! (transform engine, disk writer).
//!
//! Each stage is wired with its own bounded `crossbeam_channel`: capacity
//! bounds memory, and a full channel is backpressure rather than silent data
//! loss.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::warn;

/// One read's worth of raw frames from the sniffer plus the timestamp
/// (microseconds) the adapter reported for it, or `None` to mark a gap (the
/// sniffer produced nothing before its retry deadline). The timestamp must
/// travel with the bytes rather than being reconstructed downstream: it is
/// the hardware (or read-completion wall-clock) stamp the index regression
/// fits against, not the time the transform thread happens to dequeue it.
pub type Frame = Option<(Vec<u8>, u64)>;

pub struct RingBuffer {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        RingBuffer { tx, rx }
    }

    pub fn sender(&self) -> Sender<Frame> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<Frame> {
        self.rx.clone()
    }

    /// Non-blocking depth read, used to populate the writer's
    /// `write_backlog` field.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Pushes `frame` onto `tx` without blocking. A full channel means the
/// consumer has fallen behind; the frame is dropped and reported rather than
/// stalling the sniffer thread.
pub fn try_push(tx: &Sender<Frame>, frame: Frame) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("ring buffer full, dropping a frame");
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn push_and_receive_round_trips() {
        let rb = RingBuffer::new(4);
        let tx = rb.sender();
        assert!(try_push(&tx, Some((vec![1, 2, 3], 1000))));
        assert_eq!(rb.len(), 1);
        let rx = rb.receiver();
        assert_eq!(rx.recv().unwrap(), Some((vec![1, 2, 3], 1000)));
    }

    #[test]
    fn overflow_is_reported_not_blocked() {
        let rb = RingBuffer::new(1);
        let tx = rb.sender();
        assert!(try_push(&tx, Some((vec![0], 1000))));
        assert!(!try_push(&tx, Some((vec![1], 1001))));
        assert_eq!(rb.len(), 1);
    }

    #[test]
    fn gap_is_represented_as_none() {
        let rb = RingBuffer::new(1);
        let tx = rb.sender();
        assert!(try_push(&tx, None));
        let rx = rb.receiver();
        assert_eq!(rx.recv().unwrap(), None);
    }
}
