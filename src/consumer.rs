//! Snapshot types and the consumer interface.
//!
//! Defines the read-only view of a session the controller hands out on
//! every tick, and the callback trait a presentation layer implements
//! to receive it.

use log::debug;
use serde::Serialize;

/// A point-in-time view of a running or finished session.
///
/// Snapshots are copies: the consumer never holds a reference into the
/// controller's working state. `seq` increases with every state update,
/// so a consumer can discard anything older than the latest view it has
/// already rendered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Snapshot {
    /// Download throughput in bits per second.
    pub download_bps: f64,
    /// Upload throughput in bits per second.
    pub upload_bps: f64,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Latency variation in milliseconds.
    pub jitter_ms: f64,
    /// Whether the session is still polling.
    pub running: bool,
    /// Whether the session has reached its final state.
    pub finished: bool,
    /// Monotonic update counter for this session.
    pub seq: u64,
}

/// Callback interface for per-tick snapshot delivery.
///
/// Implementations must be non-blocking; the poll loop calls them
/// inline between ticks.
pub trait SnapshotConsumer: Send + Sync {
    /// Called after every state update, including the final one.
    fn on_snapshot(&self, snapshot: Snapshot);
}

/// Consumer that narrates snapshots to the log. Useful for headless
/// runs and as the default when no richer presentation is attached.
pub struct LogConsumer;

impl SnapshotConsumer for LogConsumer {
    fn on_snapshot(&self, snapshot: Snapshot) {
        debug!(
            "snapshot {}: down={:.0} bps up={:.0} bps latency={:.1} ms jitter={:.1} ms running={} finished={}",
            snapshot.seq,
            snapshot.download_bps,
            snapshot.upload_bps,
            snapshot.latency_ms,
            snapshot.jitter_ms,
            snapshot.running,
            snapshot.finished
        );
    }
}

/// Consumer that drops every snapshot.
pub struct NullConsumer;

impl SnapshotConsumer for NullConsumer {
    fn on_snapshot(&self, _snapshot: Snapshot) {}
}
