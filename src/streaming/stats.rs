//! Capture and streaming statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the capture loop and the client streams
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_published: AtomicU64,
    read_failures: AtomicU64,
    bytes_published: AtomicU64,
    active_clients: AtomicU64,
    clients_served: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, bytes: usize) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers a new client and returns its id
    pub fn client_connected(&self) -> u64 {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
        self.clients_served.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_clients(&self) -> u64 {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            active_clients: self.active_clients.load(Ordering::Relaxed),
            clients_served: self.clients_served.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames encoded and published into the frame slot
    pub frames_published: u64,

    /// Failed reads or encodes (timeouts, empty frames, corrupt data)
    pub read_failures: u64,

    /// Total JPEG bytes published
    pub bytes_published: u64,

    /// Currently open `/video_feed` connections
    pub active_clients: u64,

    /// `/video_feed` connections accepted since start
    pub clients_served: u64,
}

impl StatsSnapshot {
    /// Calculates frame rate based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_published.saturating_sub(previous.frames_published);
        frames_delta as f64 / elapsed_secs
    }

    /// Calculates bitrate in kbps based on delta
    pub fn calculate_bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_published.saturating_sub(previous.bytes_published);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }
}
