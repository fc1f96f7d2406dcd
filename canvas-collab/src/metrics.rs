//! Rolling latency, connection quality bands and traffic counters.
//!
//! Traffic counters are atomics so the transport tasks never take a lock on
//! the hot path; readers take a [`TrafficSnapshot`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection quality derived from the rolling average batch latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl ConnectionQuality {
    /// Bands: <100 ms excellent, <250 ms good, <500 ms poor, else critical.
    pub fn from_latency(latency: Duration) -> Self {
        match latency.as_millis() {
            0..=99 => ConnectionQuality::Excellent,
            100..=249 => ConnectionQuality::Good,
            250..=499 => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }

    /// Share of the baseline batch size producers should stay under.
    pub fn batch_factor(&self) -> f64 {
        match self {
            ConnectionQuality::Excellent => 1.0,
            ConnectionQuality::Good => 0.75,
            ConnectionQuality::Poor => 0.5,
            ConnectionQuality::Critical => 0.2,
        }
    }
}

/// Fixed-size window of latency samples.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    /// Excellent until the first sample arrives.
    pub fn quality(&self) -> ConnectionQuality {
        self.average()
            .map(ConnectionQuality::from_latency)
            .unwrap_or(ConnectionQuality::Excellent)
    }

    pub fn recommended_batch_size(&self, baseline: usize) -> usize {
        ((baseline as f64 * self.quality().batch_factor()).round() as usize).max(1)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Messages and bytes moved by a transport.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Everything the monitoring surface reports for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub traffic: TrafficSnapshot,
    /// Rolling average batch processing latency.
    pub average_latency_ms: Option<f64>,
    /// Most recent heartbeat round trip.
    pub round_trip_ms: Option<f64>,
    pub quality: ConnectionQuality,
    pub recommended_batch_size: usize,
}

pub(crate) fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
