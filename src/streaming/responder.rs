//! Per-client MJPEG responder
//!
//! Each `/video_feed` connection owns one [`ClientSession`]. The session only
//! keeps its own read cursor into the frame slot, so a slow client skips
//! frames instead of holding anyone else back.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::frame_slot::{FrameSlot, SharedFrame, WaitOutcome};
use super::stats::CaptureStats;

/// Multipart boundary marker
pub const BOUNDARY: &str = "frame";

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// One multipart body part carrying a complete JPEG
pub fn encode_part(frame: &SharedFrame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.jpeg.len()
    );

    let mut part = BytesMut::with_capacity(header.len() + frame.jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Streaming was not running when the client connected
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("camera not available")]
pub struct StreamUnavailable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientDisconnected,
    StreamStopped,
}

pub struct ClientSession {
    id: u64,
    last_sequence: u64,
    frames_sent: u64,
    slot: Arc<FrameSlot>,
    stats: Arc<CaptureStats>,
    end: SessionEnd,
}

impl ClientSession {
    /// Register a new client. Fails straight away if streaming is not active.
    pub fn open(slot: Arc<FrameSlot>, stats: Arc<CaptureStats>) -> Result<Self, StreamUnavailable> {
        if !slot.is_active() {
            debug!("Rejecting client, streaming inactive");
            return Err(StreamUnavailable);
        }

        let id = stats.client_connected();
        info!(client = id, active = stats.active_clients(), "Client connected");

        Ok(Self {
            id,
            last_sequence: 0,
            frames_sent: 0,
            slot,
            stats,
            end: SessionEnd::ClientDisconnected,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Next frame newer than the last one handed out, or `None` once
    /// streaming stops. Quiet periods produce nothing.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<Arc<SharedFrame>> {
        loop {
            match self.slot.wait_for_next(self.last_sequence, wait).await {
                WaitOutcome::Frame(frame) => {
                    self.last_sequence = frame.sequence;
                    self.frames_sent += 1;
                    return Some(frame);
                }
                WaitOutcome::Timeout => continue,
                WaitOutcome::Inactive => {
                    self.end = SessionEnd::StreamStopped;
                    return None;
                }
            }
        }
    }

    pub async fn next_part(&mut self, wait: Duration) -> Option<Bytes> {
        self.next_frame(wait).await.map(|frame| encode_part(&frame))
    }

    /// Turn the session into a response body stream. The stream only pulls a
    /// frame when the transport asks for more data.
    pub fn into_stream(self, wait: Duration) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        stream::unfold(self, move |mut session| async move {
            session
                .next_part(wait)
                .await
                .map(|part| (Ok(part), session))
        })
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.stats.client_disconnected();
        match self.end {
            SessionEnd::ClientDisconnected => debug!(
                client = self.id,
                frames = self.frames_sent,
                "Client disconnected"
            ),
            SessionEnd::StreamStopped => info!(
                client = self.id,
                frames = self.frames_sent,
                "Stream stopped, closing client"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::SystemTime;

    fn active() -> (Arc<FrameSlot>, Arc<CaptureStats>) {
        let slot = Arc::new(FrameSlot::new());
        slot.set_active(true);
        (slot, Arc::new(CaptureStats::new()))
    }

    #[test]
    fn test_encode_part_layout() {
        let frame = SharedFrame {
            jpeg: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            sequence: 7,
            captured_at: SystemTime::now(),
        };

        let part = encode_part(&frame);
        let mut expected =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");

        assert_eq!(&part[..], &expected[..]);
        assert_eq!(content_type(), "multipart/x-mixed-replace; boundary=frame");
    }

    #[test]
    fn test_open_rejected_when_inactive() {
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(CaptureStats::new());

        assert!(matches!(
            ClientSession::open(slot, Arc::clone(&stats)),
            Err(StreamUnavailable)
        ));
        assert_eq!(stats.snapshot().clients_served, 0);
    }

    #[test]
    fn test_client_count_follows_sessions() {
        let (slot, stats) = active();
        let a = ClientSession::open(Arc::clone(&slot), Arc::clone(&stats)).unwrap();
        let b = ClientSession::open(Arc::clone(&slot), Arc::clone(&stats)).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(stats.active_clients(), 2);

        drop(a);
        assert_eq!(stats.active_clients(), 1);
        drop(b);
        assert_eq!(stats.active_clients(), 0);
    }

    #[tokio::test]
    async fn test_never_repeats_a_frame() {
        let (slot, stats) = active();
        slot.publish(Bytes::from_static(b"one"), SystemTime::now());

        let mut session = ClientSession::open(Arc::clone(&slot), stats).unwrap();
        let first = session.next_frame(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.sequence, 1);

        let publisher = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                slot.publish(Bytes::from_static(b"two"), SystemTime::now());
            })
        };

        // Several quiet timeouts pass before the next frame shows up
        let second = session.next_frame(Duration::from_millis(30)).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(session.last_sequence(), 2);
        assert_eq!(session.frames_sent(), 2);
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ends_when_streaming_stops() {
        let (slot, stats) = active();
        slot.publish(Bytes::from_static(b"one"), SystemTime::now());

        let session = ClientSession::open(Arc::clone(&slot), Arc::clone(&stats)).unwrap();
        let mut body = Box::pin(session.into_stream(Duration::from_millis(50)));

        let part = body.next().await.unwrap().unwrap();
        assert!(part.starts_with(b"--frame\r\n"));

        slot.set_active(false);
        let end = tokio::time::timeout(Duration::from_secs(1), body.next())
            .await
            .expect("stream should end promptly");
        assert!(end.is_none());

        drop(body);
        assert_eq!(stats.active_clients(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_are_independent() {
        let (slot, stats) = active();
        const FRAMES: u64 = 20;

        let mut clients = Vec::new();
        for i in 0..5 {
            let mut session = ClientSession::open(Arc::clone(&slot), Arc::clone(&stats)).unwrap();
            let slow = i == 0;
            clients.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(frame) = session.next_frame(Duration::from_millis(200)).await {
                    seen.push(frame.sequence);
                    if slow {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
                (slow, seen)
            }));
        }

        // 10 fps producer
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        for _ in 0..FRAMES {
            ticker.tick().await;
            slot.publish(Bytes::from_static(b"jpeg"), SystemTime::now());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        slot.set_active(false);

        let mut fast_counts = Vec::new();
        let mut slow_count = 0;
        for client in clients {
            let (slow, seen) = client.await.unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", seen);
            assert!(seen.len() as u64 <= FRAMES);
            if slow {
                slow_count = seen.len();
            } else {
                fast_counts.push(seen.len());
            }
        }

        for count in &fast_counts {
            assert!(*count as u64 >= FRAMES - 2, "fast client starved: {}", count);
        }
        assert!(slow_count < fast_counts[0]);
        assert_eq!(stats.active_clients(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sessions_follow_capture_loop_independently() {
        use crate::streaming::capture_loop::tests::{capture_loop, ScriptedOpener};

        // 10 fps
        let capture = capture_loop(ScriptedOpener::frames(), 10, 5);
        {
            let capture = Arc::clone(&capture);
            tokio::task::spawn_blocking(move || capture.start())
                .await
                .unwrap()
                .unwrap();
        }

        let mut clients = Vec::new();
        for i in 0..5 {
            let mut session =
                ClientSession::open(Arc::clone(capture.slot()), Arc::clone(capture.stats())).unwrap();
            let slow = i == 0;
            clients.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(frame) = session.next_frame(Duration::from_millis(200)).await {
                    seen.push(frame.sequence);
                    if slow {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
                (slow, seen, session.last_sequence())
            }));
        }
        let opened_at = capture.slot().sequence();

        tokio::time::sleep(Duration::from_secs(2)).await;
        {
            let capture = Arc::clone(&capture);
            tokio::task::spawn_blocking(move || capture.stop()).await.unwrap();
        }
        let last_published = capture.slot().sequence();
        assert!(last_published >= opened_at + 10, "capture stalled at {}", last_published);

        let mut fast_counts = Vec::new();
        let mut slow_count = 0;
        for client in clients {
            let (slow, seen, last_sequence) = client.await.unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", seen);
            assert!(seen.iter().all(|&s| s <= last_published));
            assert_eq!(Some(&last_sequence), seen.last());
            if slow {
                slow_count = seen.len();
            } else {
                fast_counts.push(seen.len() as u64);
            }
        }

        for count in &fast_counts {
            assert!(
                *count + 2 >= last_published - opened_at,
                "fast client starved: {} of {}",
                count,
                last_published - opened_at
            );
        }
        assert!((slow_count as u64) < fast_counts[0]);
        assert_eq!(capture.stats().active_clients(), 0);
    }
}
