//! Confirmed-byte bookkeeping for one resumable session.

use serde::Serialize;

/// Tracks how many bytes the backend has acknowledged.
///
/// `confirmed` never decreases and never exceeds `total`. It only moves on a
/// backend acknowledgment, so after an interruption the next chunk starts
/// exactly at `confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressTracker {
    total: u64,
    confirmed: u64,
}

/// Snapshot handed to progress consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub bytes_confirmed: u64,
    pub total_size: u64,
    pub percentage: f64,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            confirmed: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn is_complete(&self) -> bool {
        self.confirmed >= self.total
    }

    /// Record an acknowledgment. Stale (lower) values are ignored; returns
    /// whether the confirmed offset moved.
    pub fn acknowledge(&mut self, confirmed: u64) -> bool {
        let confirmed = confirmed.min(self.total);
        if confirmed > self.confirmed {
            self.confirmed = confirmed;
            true
        } else {
            false
        }
    }

    /// Mark every byte confirmed, used when the backend reports completion.
    pub fn complete(&mut self) {
        self.confirmed = self.total;
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.confirmed as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Next `[start, end)` range to transmit, or `None` when nothing remains.
    pub fn next_range(&self, chunk_size: u64) -> Option<(u64, u64)> {
        if self.is_complete() || chunk_size == 0 {
            return None;
        }
        let start = self.confirmed;
        let end = start.saturating_add(chunk_size).min(self.total);
        Some((start, end))
    }

    pub fn snapshot(&self) -> ProgressEvent {
        ProgressEvent {
            bytes_confirmed: self.confirmed,
            total_size: self.total,
            percentage: self.percentage(),
        }
    }
}
