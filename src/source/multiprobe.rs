//! Multi-probe measurement engine.
//!
//! Produces the same `{download, upload, latency, jitter}` aggregate as
//! the streaming engine, but from four sequential one-shot probes
//! against public endpoints. There is no intermediate state: the
//! aggregate stays zeroed until the whole run completes, then jumps to
//! its final values.
//!
//! Probe failure rules differ per metric. A download that exhausts both
//! the ranked-URL catalog and the reference-file fallback fails the run,
//! as does a latency probe that misses both endpoints. A failed upload
//! only degrades that metric to 0, since some networks block outbound
//! test traffic and the rest of the run is still meaningful. Jitter
//! needs at least 2 of its 5 pings; below that it reports 0.

use crate::errors::SpeedTestError;
use crate::source::{MeasurementSource, Sample};
use crate::stats::std_dev_population;
use futures::future::try_join_all;
use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

/// Ranked download target catalog, CDN-exposed.
static CATALOG_URL: &str = "https://api.fast.com/netflix/speedtest/v2?https=true&token=YXNkZmFzZGxmbnNkYWZoYXNkZmhrYWxm&urlCount=5";

/// Same catalog trimmed to one entry; small enough to time a round trip.
static LATENCY_URL: &str = "https://api.fast.com/netflix/speedtest/v2?https=true&token=YXNkZmFzZGxmbnNkYWZoYXNkZmhrYWxm&urlCount=1";

/// Fixed-size reference file on a secondary host.
static FALLBACK_FILE_URL: &str = "https://proof.ovh.net/files/10Mb.dat";

/// Reflecting endpoint accepting arbitrary POST bodies.
static ECHO_UPLOAD_URL: &str = "https://httpbin.org/post";

/// Reflecting endpoint for timed GETs.
static ECHO_PING_URL: &str = "https://httpbin.org/get";

/// Configuration for the multi-probe engine.
#[derive(Debug, Clone)]
pub struct MultiProbeConfig {
    /// Endpoint returning the ranked download URL list (JSON).
    pub catalog_url: String,
    /// Small endpoint timed for the latency probe.
    pub latency_url: String,
    /// Reference file fetched when the catalog is unreachable.
    pub fallback_file_url: String,
    /// Endpoint the upload payload is POSTed to.
    pub echo_upload_url: String,
    /// Endpoint pinged for jitter (and as the latency fallback).
    pub echo_ping_url: String,
    /// How many catalog URLs to fetch concurrently.
    /// Default: 3
    pub parallel_fetches: usize,
    /// Upload payload size in bytes.
    /// Default: 1 MiB
    pub upload_bytes: usize,
    /// Number of sequential pings for the jitter probe.
    /// Default: 5
    pub jitter_pings: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for MultiProbeConfig {
    fn default() -> Self {
        Self {
            catalog_url: CATALOG_URL.to_string(),
            latency_url: LATENCY_URL.to_string(),
            fallback_file_url: FALLBACK_FILE_URL.to_string(),
            echo_upload_url: ECHO_UPLOAD_URL.to_string(),
            echo_ping_url: ECHO_PING_URL.to_string(),
            parallel_fetches: 3,
            upload_bytes: 1024 * 1024,
            jitter_pings: 5,
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadTarget {
    url: String,
}

/// The multi-probe engine.
///
/// Cheap to clone; clones share the same run state.
#[derive(Clone)]
pub struct MultiProbeSource {
    inner: Arc<ProbeInner>,
}

struct ProbeInner {
    config: MultiProbeConfig,
    client: reqwest::Client,
    aggregate: Mutex<Sample>,
    error: Mutex<Option<SpeedTestError>>,
    running_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl MultiProbeSource {
    /// Create a new engine from the given configuration.
    ///
    /// Fails with `SourceUnavailable` if an endpoint URL does not parse
    /// or the HTTP client cannot be constructed.
    pub fn new(config: MultiProbeConfig) -> Result<Self, SpeedTestError> {
        for endpoint in [
            &config.catalog_url,
            &config.latency_url,
            &config.fallback_file_url,
            &config.echo_upload_url,
            &config.echo_ping_url,
        ] {
            Url::parse(endpoint).map_err(|e| {
                SpeedTestError::source_unavailable(format!(
                    "invalid endpoint {}: {}",
                    endpoint, e
                ))
            })?;
        }

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
            inner: Arc::new(ProbeInner {
                config,
                client,
                aggregate: Mutex::new(Sample::default()),
                error: Mutex::new(None),
                running_tx,
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Run all four probes to completion and return the finished sample.
    ///
    /// This is the direct one-shot API; driving the engine through a
    /// sampling controller uses `start` instead.
    pub async fn run_probes(&self) -> Result<Sample, SpeedTestError> {
        self.inner.run_probes().await
    }
}

impl MeasurementSource for MultiProbeSource {
    fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // send_replace: the flag must flip even before anyone subscribes.
        self.inner.running_tx.send_replace(true);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.run_probes().await {
                Ok(sample) => {
                    *inner
                        .aggregate
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = sample;
                    info!(
                        "probe run complete: down={:.0} bps up={:.0} bps latency={:.1} ms jitter={:.1} ms",
                        sample.download_bps,
                        sample.upload_bps,
                        sample.latency_ms,
                        sample.jitter_ms
                    );
                }
                Err(err) => {
                    error!("probe run failed: {}", err);
                    *inner.error.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(err);
                }
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

impl ProbeInner {
    async fn run_probes(&self) -> Result<Sample, SpeedTestError> {
        let download_bps = self.probe_download().await?;
        let upload_bps = self.probe_upload().await;
        let latency_ms = self.probe_latency().await?;
        let jitter_ms = self.probe_jitter().await;

        Ok(Sample { download_bps, upload_bps, latency_ms, jitter_ms })
    }

    /// Download speed as the mean over up to `parallel_fetches` ranked
    /// URLs, falling back to a single reference-file fetch.
    async fn probe_download(&self) -> Result<f64, SpeedTestError> {
        match self.probe_download_catalog().await {
            Ok(speed) => Ok(speed),
            Err(err) => {
                warn!(
                    "ranked download probe failed ({}); trying reference file",
                    err
                );

                match self.timed_fetch(&self.config.fallback_file_url).await {
                    Ok(speed) => Ok(speed),
                    Err(fallback_err) => {
                        warn!(
                            "reference file download also failed: {}",
                            fallback_err
                        );
                        Err(SpeedTestError::probe(format!(
                            "no download probe succeeded: {}",
                            err
                        )))
                    }
                }
            }
        }
    }

    async fn probe_download_catalog(&self) -> Result<f64, SpeedTestError> {
        let targets: Vec<DownloadTarget> = self
            .client
            .get(&self.config.catalog_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if targets.is_empty() {
            return Err(SpeedTestError::probe("catalog returned no targets"));
        }

        debug!("catalog returned {} download targets", targets.len());

        let fetches = targets
            .iter()
            .take(self.config.parallel_fetches)
            .map(|target| self.timed_fetch(&target.url));

        let speeds = try_join_all(fetches).await?;

        Ok(speeds.iter().sum::<f64>() / speeds.len() as f64)
    }

    /// Fetch a URL to completion and return bits per second.
    async fn timed_fetch(&self, url: &str) -> Result<f64, SpeedTestError> {
        let started = Instant::now();
        let response =
            self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        let seconds = started.elapsed().as_secs_f64().max(1e-9);

        let bits = body.len() as f64 * 8.0;
        let speed = bits / seconds;

        debug!(
            "fetched {} bytes in {:.3}s ({:.0} bps) from {}",
            body.len(),
            seconds,
            speed,
            url
        );

        Ok(speed)
    }

    /// Upload speed from one POSTed payload; any failure degrades to 0.
    async fn probe_upload(&self) -> f64 {
        match self.timed_upload().await {
            Ok(speed) => speed,
            Err(err) => {
                warn!("upload probe failed ({}); recording 0", err);
                0.0
            }
        }
    }

    async fn timed_upload(&self) -> Result<f64, SpeedTestError> {
        let payload = vec![0u8; self.config.upload_bytes];
        let bits = payload.len() as f64 * 8.0;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.config.echo_upload_url)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(payload)
            .send()
            .await?
            .error_for_status()?;

        // The clock stops only once the echoed response is fully read.
        let _ = response.bytes().await?;
        let seconds = started.elapsed().as_secs_f64().max(1e-9);

        Ok(bits / seconds)
    }

    /// Round-trip latency in milliseconds; one fallback attempt, then
    /// the failure propagates.
    async fn probe_latency(&self) -> Result<f64, SpeedTestError> {
        match self.timed_ping(&self.config.latency_url).await {
            Ok(ms) => Ok(ms),
            Err(err) => {
                warn!(
                    "latency probe failed ({}); trying fallback endpoint",
                    err
                );

                self.timed_ping(&self.config.echo_ping_url).await.map_err(
                    |fallback_err| {
                        warn!("fallback latency probe failed: {}", fallback_err);
                        SpeedTestError::probe(format!(
                            "latency probe exhausted both endpoints: {}",
                            err
                        ))
                    },
                )
            }
        }
    }

    /// Jitter as the population standard deviation over sequential
    /// pings. Failed pings are skipped, not retried; fewer than 2
    /// surviving samples yields 0.
    async fn probe_jitter(&self) -> f64 {
        let mut round_trips = Vec::with_capacity(self.config.jitter_pings);

        for i in 0..self.config.jitter_pings {
            match self.timed_ping(&self.config.echo_ping_url).await {
                Ok(ms) => round_trips.push(ms),
                Err(err) => {
                    warn!(
                        "jitter ping {}/{} failed: {}",
                        i + 1,
                        self.config.jitter_pings,
                        err
                    );
                }
            }
        }

        if round_trips.len() < 2 {
            return 0.0;
        }

        std_dev_population(&round_trips)
    }

    /// One cache-bypassing GET, timed to the response head.
    async fn timed_ping(&self, url: &str) -> Result<f64, SpeedTestError> {
        let started = Instant::now();
        self.client
            .get(url)
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .send()
            .await?
            .error_for_status()?;

        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }
}
