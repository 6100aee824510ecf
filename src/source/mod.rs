//! Measurement sources.
//!
//! A source owns the actual network probing and exposes a continuously
//! readable aggregate; the sampling controller only ever polls that
//! aggregate and watches the running flag. Both engines implement the
//! same contract, so the controller never needs to know whether its
//! numbers converge gradually or arrive in a single jump.

use crate::errors::SpeedTestError;
use serde::Serialize;
use tokio::sync::watch;

pub mod multiprobe;
pub mod streaming;

/// One observation of the connection: throughput in bits per second,
/// round-trip figures in milliseconds.
///
/// Immutable once read; a polled copy belongs to the tick that read it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Sample {
    /// Download throughput in bits per second.
    pub download_bps: f64,
    /// Upload throughput in bits per second.
    pub upload_bps: f64,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Latency variation in milliseconds.
    pub jitter_ms: f64,
}

/// Contract between an engine and the sampling controller.
///
/// `start` must flip the running flag to true synchronously before any
/// probing begins, and the engine flips it back to false when it decides
/// it is done. `sample` must be non-blocking: the engine maintains its
/// aggregate internally and the controller reads it on every tick.
pub trait MeasurementSource: Send + Sync {
    /// Begin measuring. Idempotent; repeated calls do not restart a run.
    fn start(&self);

    /// Read the current aggregate. Non-blocking.
    fn sample(&self) -> Sample;

    /// Subscribe to the engine's running flag.
    fn running(&self) -> watch::Receiver<bool>;

    /// Consume the error that ended the run, if the run failed.
    fn take_error(&self) -> Option<SpeedTestError> {
        None
    }
}
