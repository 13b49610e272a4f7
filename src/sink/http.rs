use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SenderConfig;
use crate::export::health::HealthMetrics;
use crate::point::Point;

/// Batching HTTP sender for the OpenTSDB `/api/put` endpoint.
///
/// Accumulates points into batches of at most `batch_size` and delivers each
/// batch inline with bounded exponential backoff. While a delivery is in
/// progress the pipeline is not drained, so a slow endpoint pushes back on
/// producers through the bounded channel.
pub struct HttpSender {
    client: reqwest::Client,
    url: String,
    cfg: SenderConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl HttpSender {
    pub fn new(url: impl Into<String>, cfg: SenderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            cfg,
            health: None,
        })
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    /// Accumulator loop. Flushes when the batch is full, on every flush
    /// interval tick with a partial batch, and once more on shutdown.
    pub async fn run(self, mut rx: mpsc::Receiver<Point>, cancel: CancellationToken) -> Result<()> {
        if self.cfg.batch_size == 0 {
            bail!("sender batch_size must be positive");
        }

        tracing::info!(
            url = %self.url,
            batch_size = self.cfg.batch_size,
            compression = %self.cfg.compression,
            "HTTP sender started",
        );

        let batch_size = self.cfg.batch_size;
        let mut batch: Vec<Point> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(self.cfg.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain queue and flush remaining items.
                    while let Ok(point) = rx.try_recv() {
                        batch.push(point);
                        if batch.len() >= batch_size {
                            let items = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                            self.deliver(items, &cancel).await;
                        }
                    }
                    if !batch.is_empty() {
                        self.deliver(std::mem::take(&mut batch), &cancel).await;
                    }
                    tracing::info!("HTTP sender stopped");
                    return Ok(());
                }

                item = rx.recv() => {
                    match item {
                        Some(point) => {
                            batch.push(point);

                            // Drain more items without blocking.
                            while batch.len() < batch_size {
                                match rx.try_recv() {
                                    Ok(point) => batch.push(point),
                                    Err(_) => break,
                                }
                            }

                            if batch.len() >= batch_size {
                                let items = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                                self.deliver(items, &cancel).await;
                            }
                        }
                        None => {
                            if !batch.is_empty() {
                                self.deliver(std::mem::take(&mut batch), &cancel).await;
                            }
                            tracing::info!("pipeline closed, HTTP sender stopped");
                            return Ok(());
                        }
                    }
                }

                _ = interval.tick() => {
                    if let Some(health) = &self.health {
                        health.pipeline_depth.set(rx.len() as f64);
                    }
                    if !batch.is_empty() {
                        let items = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        self.deliver(items, &cancel).await;
                    }
                }
            }
        }
    }

    /// Delivers one batch, retrying with exponential backoff. After the last
    /// attempt the batch is dropped. Cancellation ends the retry wait early.
    async fn deliver(&self, points: Vec<Point>, cancel: &CancellationToken) {
        let n = points.len();

        let body = match encode_batch(&points, &self.cfg.compression) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(points = n, error = %e, "encoding batch failed, dropping");
                if let Some(health) = &self.health {
                    health.batches_dropped.inc();
                }
                return;
            }
        };

        let mut backoff = self.cfg.initial_backoff;
        let mut attempt = 0u32;

        let err = loop {
            attempt += 1;
            let e = match self.send(body.clone()).await {
                Ok(()) => {
                    tracing::debug!(points = n, attempt, "delivered batch");
                    if let Some(health) = &self.health {
                        health.batches_sent.inc();
                        health.points_sent.inc_by(n as f64);
                        health.batch_size.observe(n as f64);
                    }
                    return;
                }
                Err(e) => e,
            };

            if attempt >= self.cfg.max_attempts {
                break e;
            }

            tracing::warn!(attempt, backoff = ?backoff, error = %e, "delivery failed, retrying");
            if let Some(health) = &self.health {
                health.send_retries.inc();
            }

            tokio::select! {
                _ = cancel.cancelled() => break e,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2).min(self.cfg.max_backoff);
        };

        tracing::error!(points = n, attempts = attempt, error = %err, "dropping batch after failed delivery");
        if let Some(health) = &self.health {
            health.batches_dropped.inc();
        }
    }

    /// One PUT of an encoded batch.
    async fn send(&self, body: Vec<u8>) -> Result<()> {
        let mut request = self
            .client
            .put(&self.url)
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        // Add custom headers.
        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.context("sending batch")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("endpoint unexpected status: {status}");
        }

        Ok(())
    }
}

/// Serializes points to the wire JSON array and compresses it.
pub fn encode_batch(points: &[Point], compression: &str) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(points).context("serializing batch to JSON")?;
    compress(&json, compression).context("compressing batch")
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
