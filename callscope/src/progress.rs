//! Best-effort progress reporting for long-running phases.
//!
//! Decompressing kernel symbols, symbolizing every stack and fetching debug
//! info all report `(fraction, message)` pairs. Reports are fire-and-forget:
//! a slow consumer simply misses intermediate updates.

use crossbeam_channel::{bounded, Receiver, Sender};

/// Sink for progress updates.
pub trait Progress: Send + Sync {
    /// Report `fraction` (0.0..=1.0) of the current phase as complete.
    fn report(&self, fraction: f64, message: &str);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _fraction: f64, _message: &str) {}
}

/// A single progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub fraction: f64,
    pub message: String,
}

/// Forwards reports over a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: Sender<ProgressUpdate>,
}

impl Progress for ChannelProgress {
    fn report(&self, fraction: f64, message: &str) {
        // Coalesce under pressure rather than stall a symbolization worker
        let _ = self.tx.try_send(ProgressUpdate {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.to_string(),
        });
    }
}

/// Create a channel-backed progress sink and the receiver that drains it.
#[must_use]
pub fn channel(capacity: usize) -> (ChannelProgress, Receiver<ProgressUpdate>) {
    let (tx, rx) = bounded(capacity.max(1));
    (ChannelProgress { tx }, rx)
}
