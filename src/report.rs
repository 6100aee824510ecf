//! Result data structures for speed test output.
//!
//! The final snapshot of a session, stamped and formatted for display.
//! Implements Serialize for JSON output.

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::consumer::Snapshot;
use crate::controller::SessionOutcome;
use crate::format::{format_bits_per_second, format_headline};

/// Complete results from one measurement session.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    /// Timestamp when the session finished.
    pub timestamp: DateTime<Utc>,
    /// How the session reached its final state.
    pub outcome: &'static str,
    /// Download throughput in bits per second.
    pub download_bps: f64,
    /// Upload throughput in bits per second.
    pub upload_bps: f64,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Latency variation in milliseconds.
    pub jitter_ms: f64,
    /// Download speed, human-scaled.
    pub download_display: String,
    /// Upload speed, human-scaled.
    pub upload_display: String,
}

impl TestReport {
    /// Build a report from a session's final snapshot.
    pub fn new(snapshot: &Snapshot, outcome: SessionOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome: outcome.label(),
            download_bps: snapshot.download_bps,
            upload_bps: snapshot.upload_bps,
            latency_ms: snapshot.latency_ms,
            jitter_ms: snapshot.jitter_ms,
            download_display: format_bits_per_second(
                snapshot.download_bps,
                false,
            ),
            upload_display: format_bits_per_second(snapshot.upload_bps, false),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Print the report for a terminal.
    pub fn print(&self) {
        let headline = format_headline(self.download_bps / 1_000_000.0);
        if !headline.value.is_empty() {
            println!(
                "{} {}",
                headline.value.bold().bright_cyan(),
                headline.unit.bright_cyan()
            );
        }

        println!(
            "{} {}",
            "Download:".bold().white(),
            self.download_display.bright_cyan()
        );
        println!(
            "{} {}",
            "Upload:".bold().white(),
            self.upload_display.bright_cyan()
        );
        println!(
            "{} {}",
            "Latency:".bold().white(),
            format!("{:.1} ms", self.latency_ms).bright_blue()
        );
        println!(
            "{} {}",
            "Jitter:".bold().white(),
            format!("{:.1} ms", self.jitter_ms).bright_blue()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_snapshot() -> Snapshot {
        Snapshot {
            download_bps: 94_500_000.0,
            upload_bps: 20_100_000.0,
            latency_ms: 14.2,
            jitter_ms: 1.8,
            running: false,
            finished: true,
            seq: 42,
        }
    }

    #[test]
    fn test_report_formats_speeds() {
        let report =
            TestReport::new(&finished_snapshot(), SessionOutcome::Stabilized);

        assert_eq!(report.download_display, "94.50 Mbps");
        assert_eq!(report.upload_display, "20.10 Mbps");
        assert_eq!(report.outcome, "stabilized");
    }

    #[test]
    fn test_report_serializes() {
        let report = TestReport::new(
            &finished_snapshot(),
            SessionOutcome::SourceStopped,
        );

        let json = report.to_json().unwrap();
        assert!(json.contains("\"download_bps\": 94500000.0"));
        assert!(json.contains("\"outcome\": \"engine-stopped\""));
        assert!(json.contains("\"download_display\": \"94.50 Mbps\""));
    }
}
