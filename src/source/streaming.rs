//! Streaming measurement engine.
//!
//! Runs phased measurements against Cloudflare's speed test endpoints
//! and republishes the aggregate after every individual measurement, so
//! a polling observer sees numbers that converge gradually: latency
//! first, then download speed over growing block sizes, then upload.
//!
//! Aggregation follows the usual methodology: median latency, mean
//! absolute consecutive difference for jitter, 90th percentile for
//! bandwidth. Individual measurements are retried with backoff; a phase
//! only fails the run when every one of its measurements failed (and
//! upload, as everywhere else, degrades to 0 instead of failing).

use crate::errors::SpeedTestError;
use crate::retry::{retry_async, RetryConfig, RetryResult};
use crate::source::{MeasurementSource, Sample};
use crate::stats::{mean_abs_difference, median, percentile};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

static BASE_URL: &str = "https://speed.cloudflare.com";

/// A data block configuration for bandwidth phases.
///
/// Defines the size and number of measurements for a specific transfer
/// size in the download or upload sequence.
#[derive(Debug, Clone)]
pub struct DataBlock {
    /// Size of the data block in bytes
    pub bytes: u64,
    /// Number of measurements to perform at this size
    pub count: usize,
}

impl DataBlock {
    /// Create a new data block configuration.
    pub const fn new(bytes: u64, count: usize) -> Self {
        Self { bytes, count }
    }
}

/// Configuration for the streaming engine.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Base URL of the measurement endpoints.
    pub base_url: String,

    /// Number of packets for the latency phase.
    /// Default: 10
    pub latency_packets: usize,

    /// Block sizes and counts for the download phase.
    /// Default: 100KB(5), 1MB(4), 10MB(3)
    pub download_blocks: Vec<DataBlock>,

    /// Block sizes and counts for the upload phase.
    /// Default: 100KB(4), 1MB(3)
    pub upload_blocks: Vec<DataBlock>,

    /// Percentile used for the running bandwidth aggregate.
    /// Default: 0.9 (90th percentile)
    pub bandwidth_percentile: f64,

    /// Retry configuration for failed measurements.
    pub retry: RetryConfig,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            latency_packets: 10,
            download_blocks: vec![
                DataBlock::new(100_000, 5),
                DataBlock::new(1_000_000, 4),
                DataBlock::new(10_000_000, 3),
            ],
            upload_blocks: vec![
                DataBlock::new(100_000, 4),
                DataBlock::new(1_000_000, 3),
            ],
            bandwidth_percentile: 0.9,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// The streaming engine.
///
/// Cheap to clone; clones share the same run state.
#[derive(Clone)]
pub struct StreamingSource {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    config: StreamingConfig,
    client: reqwest::Client,
    aggregate: Mutex<Sample>,
    error: Mutex<Option<SpeedTestError>>,
    running_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl StreamingSource {
    /// Create a new engine from the given configuration.
    pub fn new(config: StreamingConfig) -> Result<Self, SpeedTestError> {
        Url::parse(&config.base_url).map_err(|e| {
            SpeedTestError::source_unavailable(format!(
                "invalid base URL {}: {}",
                config.base_url, e
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                SpeedTestError::source_unavailable(format!(
                    "failed to build HTTP client: {}",
                    e
                ))
            })?;

        let (running_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(StreamInner {
                config,
                client,
                aggregate: Mutex::new(Sample::default()),
                error: Mutex::new(None),
                running_tx,
                started: AtomicBool::new(false),
            }),
        })
    }
}

impl MeasurementSource for StreamingSource {
    fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // send_replace: the flag must flip even before anyone subscribes.
        self.inner.running_tx.send_replace(true);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = inner.run().await {
                error!("streaming run failed: {}", err);
                *inner.error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(err);
            }

            inner.running_tx.send_replace(false);
        });
    }

    fn sample(&self) -> Sample {
        *self.inner.aggregate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> watch::Receiver<bool> {
        self.inner.running_tx.subscribe()
    }

    fn take_error(&self) -> Option<SpeedTestError> {
        self.inner.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl StreamInner {
    /// Run the full phase sequence, publishing after every measurement.
    async fn run(&self) -> Result<(), SpeedTestError> {
        info!("starting streaming measurement sequence");

        self.run_latency_phase().await?;
        self.run_download_phase().await?;
        self.run_upload_phase().await;

        let sample =
            *self.aggregate.lock().unwrap_or_else(PoisonError::into_inner);
        info!(
            "streaming run complete: down={:.0} bps up={:.0} bps latency={:.1} ms jitter={:.1} ms",
            sample.download_bps,
            sample.upload_bps,
            sample.latency_ms,
            sample.jitter_ms
        );

        Ok(())
    }

    async fn run_latency_phase(&self) -> Result<(), SpeedTestError> {
        let packets = self.config.latency_packets;
        let mut latencies = Vec::with_capacity(packets);

        for i in 0..packets {
            let operation = format!("latency packet {}/{}", i + 1, packets);
            let result = retry_async(&self.config.retry, &operation, || {
                self.timed_download(0)
            })
            .await;

            match result {
                RetryResult::Success((_, elapsed)) => {
                    latencies.push(elapsed.as_secs_f64() * 1000.0);
                    self.publish(|sample| {
                        if let Some(ms) = median(&latencies) {
                            sample.latency_ms = ms;
                        }
                        sample.jitter_ms = mean_abs_difference(&latencies);
                    });
                }
                RetryResult::Failed { last_error, attempts } => {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation, attempts, last_error
                    );
                }
            }
        }

        if latencies.is_empty() {
            return Err(SpeedTestError::probe(format!(
                "all {} latency packets failed",
                packets
            )));
        }

        Ok(())
    }

    async fn run_download_phase(&self) -> Result<(), SpeedTestError> {
        let mut speeds: Vec<f64> = Vec::new();

        for block in &self.config.download_blocks {
            for i in 0..block.count {
                let operation = format!(
                    "download {}B {}/{}",
                    block.bytes,
                    i + 1,
                    block.count
                );
                let result =
                    retry_async(&self.config.retry, &operation, || {
                        self.timed_download(block.bytes)
                    })
                    .await;

                match result {
                    RetryResult::Success((bytes, elapsed)) => {
                        let seconds = elapsed.as_secs_f64().max(1e-9);
                        let bps = bytes as f64 * 8.0 / seconds;
                        debug!("{}: {:.0} bps", operation, bps);
                        speeds.push(bps);

                        let aggregate = percentile(
                            &speeds,
                            self.config.bandwidth_percentile,
                        )
                        .unwrap_or(0.0);
                        self.publish(|sample| {
                            sample.download_bps = aggregate;
                        });
                    }
                    RetryResult::Failed { last_error, attempts } => {
                        warn!(
                            "{} failed after {} attempts: {}",
                            operation, attempts, last_error
                        );
                    }
                }
            }
        }

        if speeds.is_empty() {
            return Err(SpeedTestError::probe(
                "no download measurement succeeded",
            ));
        }

        Ok(())
    }

    async fn run_upload_phase(&self) {
        let mut speeds: Vec<f64> = Vec::new();

        for block in &self.config.upload_blocks {
            for i in 0..block.count {
                let operation = format!(
                    "upload {}B {}/{}",
                    block.bytes,
                    i + 1,
                    block.count
                );
                let result =
                    retry_async(&self.config.retry, &operation, || {
                        self.timed_upload(block.bytes)
                    })
                    .await;

                match result {
                    RetryResult::Success(elapsed) => {
                        let seconds = elapsed.as_secs_f64().max(1e-9);
                        let bps = block.bytes as f64 * 8.0 / seconds;
                        debug!("{}: {:.0} bps", operation, bps);
                        speeds.push(bps);

                        let aggregate = percentile(
                            &speeds,
                            self.config.bandwidth_percentile,
                        )
                        .unwrap_or(0.0);
                        self.publish(|sample| {
                            sample.upload_bps = aggregate;
                        });
                    }
                    RetryResult::Failed { last_error, attempts } => {
                        warn!(
                            "{} failed after {} attempts: {}",
                            operation, attempts, last_error
                        );
                    }
                }
            }
        }

        if speeds.is_empty() {
            warn!("no upload measurement succeeded; upload stays 0");
        }
    }

    /// GET `bytes` from the download endpoint, returning the payload
    /// length and elapsed wall-clock time.
    async fn timed_download(
        &self,
        bytes: u64,
    ) -> Result<(usize, Duration), SpeedTestError> {
        let url = format!("{}/__down?bytes={}", self.config.base_url, bytes);

        let started = Instant::now();
        let response =
            self.client.get(&url).send().await?.error_for_status()?;
        let body = response.bytes().await?;

        Ok((body.len(), started.elapsed()))
    }

    /// POST `bytes` of payload to the upload endpoint, returning elapsed
    /// wall-clock time to full response completion.
    async fn timed_upload(
        &self,
        bytes: u64,
    ) -> Result<Duration, SpeedTestError> {
        let url = format!("{}/__up", self.config.base_url);
        let payload = vec![b'0'; bytes as usize];

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        let _ = response.bytes().await?;

        Ok(started.elapsed())
    }

    /// Mutate and republish the aggregate in one lock acquisition.
    fn publish(&self, update: impl FnOnce(&mut Sample)) {
        let mut sample =
            self.aggregate.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_config_default() {
        let config = StreamingConfig::default();
        assert_eq!(config.latency_packets, 10);
        assert_eq!(config.download_blocks.len(), 3);
        assert_eq!(config.upload_blocks.len(), 2);
        assert!((config.bandwidth_percentile - 0.9).abs() < 0.001);
    }

    #[test]
    fn test_data_block_new() {
        let block = DataBlock::new(100_000, 10);
        assert_eq!(block.bytes, 100_000);
        assert_eq!(block.count, 10);
    }

    #[test]
    fn test_invalid_base_url_is_source_unavailable() {
        let mut config = StreamingConfig::default();
        config.base_url = "definitely not a url".to_string();

        let err = StreamingSource::new(config).err().unwrap();
        assert_eq!(err.kind, ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn test_sample_starts_zeroed_and_not_running() {
        let source = StreamingSource::new(StreamingConfig::default()).unwrap();
        assert_eq!(source.sample(), Sample::default());
        assert!(!*source.running().borrow());
    }
}
