//! Latest-frame slot shared between the capture loop and every client stream
//!
//! Unlike a queue, the slot only ever holds the most recent frame. Publishing
//! swaps in a new `Arc<SharedFrame>` and bumps the sequence number in one step,
//! so readers always see a complete frame. Waiters are woken through a
//! `tokio::sync::watch` channel, which wakes every receiver on each publish.
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::Instant;

/// One published JPEG frame
#[derive(Debug)]
pub struct SharedFrame {
    pub jpeg: Bytes,
    pub sequence: u64,
    pub captured_at: SystemTime,
}

#[derive(Debug, Default)]
struct SlotState {
    frame: Option<Arc<SharedFrame>>,
    sequence: u64,
    active: bool,
}

/// Result of [`FrameSlot::wait_for_next`]
#[derive(Debug)]
pub enum WaitOutcome {
    /// Latest frame, newer than the caller's cursor
    Frame(Arc<SharedFrame>),
    /// Nothing newer arrived in time
    Timeout,
    /// Streaming is no longer active
    Inactive,
}

pub struct FrameSlot {
    tx: watch::Sender<SlotState>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SlotState::default());
        Self { tx }
    }

    /// Replace the current frame. Returns the new sequence number.
    pub fn publish(&self, jpeg: Bytes, captured_at: SystemTime) -> u64 {
        let mut sequence = 0;
        self.tx.send_modify(|state| {
            state.sequence += 1;
            sequence = state.sequence;
            state.frame = Some(Arc::new(SharedFrame {
                jpeg,
                sequence,
                captured_at,
            }));
        });
        sequence
    }

    /// Snapshot of the latest frame, if any has been published since the last clear
    pub fn read(&self) -> Option<Arc<SharedFrame>> {
        self.tx.borrow().frame.clone()
    }

    /// Sequence number of the most recent publish
    pub fn sequence(&self) -> u64 {
        self.tx.borrow().sequence
    }

    pub fn is_active(&self) -> bool {
        self.tx.borrow().active
    }

    /// Flip the streaming-active flag, waking all waiters on change.
    pub fn set_active(&self, active: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.active != active;
            state.active = active;
            changed
        });
    }

    /// Drop the stale frame before a new capture run. The sequence keeps
    /// counting so a cursor from an earlier run never aliases a new frame.
    pub fn clear(&self) {
        self.tx.send_if_modified(|state| state.frame.take().is_some());
    }

    /// Wait until a frame newer than `after_sequence` is published, the slot
    /// turns inactive, or `timeout` elapses.
    pub async fn wait_for_next(&self, after_sequence: u64, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut rx = self.tx.subscribe();

        loop {
            {
                let state = rx.borrow_and_update();
                if !state.active {
                    return WaitOutcome::Inactive;
                }
                if let Some(frame) = &state.frame {
                    if frame.sequence > after_sequence {
                        return WaitOutcome::Frame(Arc::clone(frame));
                    }
                }
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return WaitOutcome::Inactive,
                Err(_) => return WaitOutcome::Timeout,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn active_slot() -> Arc<FrameSlot> {
        let slot = Arc::new(FrameSlot::new());
        slot.set_active(true);
        slot
    }

    #[test]
    fn test_read_before_publish() {
        let slot = FrameSlot::new();
        assert!(slot.read().is_none());
        assert_eq!(slot.sequence(), 0);
        assert!(!slot.is_active());
    }

    #[test]
    fn test_publish_increments_sequence() {
        let slot = FrameSlot::new();
        let s1 = slot.publish(Bytes::from_static(b"one"), SystemTime::now());
        let s2 = slot.publish(Bytes::from_static(b"two"), SystemTime::now());

        assert_eq!(s1, 1);
        assert_eq!(s2, 2);

        let frame = slot.read().unwrap();
        assert_eq!(frame.sequence, 2);
        assert_eq!(&frame.jpeg[..], b"two");
    }

    #[test]
    fn test_clear_keeps_sequence_counting() {
        let slot = FrameSlot::new();
        slot.publish(Bytes::from_static(b"old"), SystemTime::now());
        slot.clear();

        assert!(slot.read().is_none());
        assert_eq!(slot.publish(Bytes::from_static(b"new"), SystemTime::now()), 2);
    }

    #[tokio::test]
    async fn test_wait_returns_newer_frame_immediately() {
        let slot = active_slot();
        slot.publish(Bytes::from_static(b"a"), SystemTime::now());

        match slot.wait_for_next(0, Duration::from_secs(5)).await {
            WaitOutcome::Frame(frame) => assert_eq!(frame.sequence, 1),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_publish() {
        let slot = active_slot();
        let mut wait = tokio_test::task::spawn(slot.wait_for_next(0, Duration::from_secs(60)));
        tokio_test::assert_pending!(wait.poll());

        slot.publish(Bytes::from_static(b"a"), SystemTime::now());
        assert!(wait.is_woken());

        match tokio_test::assert_ready!(wait.poll()) {
            WaitOutcome::Frame(frame) => assert_eq!(frame.sequence, 1),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_without_new_frame() {
        let slot = active_slot();
        slot.publish(Bytes::from_static(b"a"), SystemTime::now());

        let started = Instant::now();
        let outcome = slot.wait_for_next(1, Duration::from_millis(50)).await;
        assert!(matches!(outcome, WaitOutcome::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_returns_inactive() {
        let slot = Arc::new(FrameSlot::new());
        let outcome = slot.wait_for_next(0, Duration::from_secs(5)).await;
        assert!(matches!(outcome, WaitOutcome::Inactive));
    }

    #[tokio::test]
    async fn test_deactivation_wakes_waiters() {
        let slot = active_slot();
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.wait_for_next(0, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.set_active(false);

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Inactive));
    }

    #[tokio::test]
    async fn test_publish_wakes_all_waiters() {
        let slot = active_slot();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let slot = Arc::clone(&slot);
                tokio::spawn(async move { slot.wait_for_next(0, Duration::from_secs(10)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.publish(Bytes::from_static(b"frame"), SystemTime::now());

        for waiter in waiters {
            let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("every waiter should wake")
                .unwrap();
            match outcome {
                WaitOutcome::Frame(frame) => assert_eq!(frame.sequence, 1),
                other => panic!("expected frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_reader_skips_to_latest() {
        let slot = active_slot();
        for i in 0..10u8 {
            slot.publish(Bytes::from(vec![i]), SystemTime::now());
        }

        match slot.wait_for_next(3, Duration::from_secs(1)).await {
            WaitOutcome::Frame(frame) => {
                assert_eq!(frame.sequence, 10);
                assert_eq!(&frame.jpeg[..], &[9]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_readers_see_complete_frames() {
        let slot = active_slot();

        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for i in 1..=500u64 {
                    // Payload encodes its own sequence so readers can check it
                    let payload = Bytes::from(i.to_be_bytes().repeat(64));
                    slot.publish(payload, SystemTime::now());
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2_000 {
                        if let Some(frame) = slot.read() {
                            assert_eq!(frame.jpeg.len(), 8 * 64);
                            assert_eq!(&frame.jpeg[..8], &frame.sequence.to_be_bytes());
                            assert!(frame.sequence >= last);
                            last = frame.sequence;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(slot.sequence(), 500);
    }
}
