use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MetadataEntry, MetadataRecord};
use crate::export::health::HealthMetrics;

/// Where staged metadata goes.
pub enum MetadataTarget {
    /// PUT a JSON array of entries to the metadata endpoint.
    Http {
        client: reqwest::Client,
        url: String,
        headers: HashMap<String, String>,
    },
    /// Log entries at debug level (local sink mode).
    Log,
}

/// Background task that ships staged metadata records.
///
/// Delivery is best effort: a failed request is logged and counted and its
/// records are discarded.
pub struct MetadataReporter {
    target: MetadataTarget,
    flush_interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl MetadataReporter {
    pub fn new(target: MetadataTarget, flush_interval: Duration) -> Self {
        Self {
            target,
            flush_interval,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn spawn(
        self,
        rx: mpsc::Receiver<MetadataRecord>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(rx, cancel))
    }

    /// Drains the staging queue every flush interval until cancelled or
    /// until every store handle is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<MetadataRecord>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let (pending, _) = drain(&mut rx);
                    self.flush(pending).await;
                    return;
                }

                _ = interval.tick() => {
                    let (pending, closed) = drain(&mut rx);
                    self.flush(pending).await;
                    if closed {
                        tracing::debug!("metadata queue closed, reporter exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn flush(&self, records: Vec<MetadataRecord>) {
        if records.is_empty() {
            return;
        }

        let entries: Vec<MetadataEntry> = records.iter().flat_map(MetadataRecord::entries).collect();

        match &self.target {
            MetadataTarget::Log => {
                for e in &entries {
                    tracing::debug!(
                        metric = %e.metric,
                        tags = %e.tags,
                        name = e.name,
                        value = %e.value,
                        "metadata",
                    );
                }
            }
            MetadataTarget::Http {
                client,
                url,
                headers,
            } => {
                if let Err(e) = send_metadata(client, url, headers, &entries).await {
                    tracing::warn!(error = %e, entries = entries.len(), "metadata delivery failed");
                    if let Some(health) = &self.health {
                        health.metadata_errors.inc();
                    }
                    return;
                }
            }
        }

        if let Some(health) = &self.health {
            health.metadata_sent.inc_by(entries.len() as f64);
        }
    }
}

/// Takes everything currently queued. The flag is set once all senders
/// are gone and the queue is empty.
fn drain(rx: &mut mpsc::Receiver<MetadataRecord>) -> (Vec<MetadataRecord>, bool) {
    let mut pending = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(record) => pending.push(record),
            Err(TryRecvError::Empty) => return (pending, false),
            Err(TryRecvError::Disconnected) => return (pending, true),
        }
    }
}

async fn send_metadata(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    entries: &[MetadataEntry],
) -> Result<()> {
    let body = serde_json::to_vec(entries).context("serializing metadata")?;

    let mut request = client
        .put(url)
        .header("Content-Type", "application/json")
        .body(body);

    for (k, v) in headers {
        request = request.header(k.as_str(), v.as_str());
    }

    let resp = request.send().await.context("sending metadata request")?;

    let status = resp.status();
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("metadata endpoint unexpected status: {status}");
    }

    tracing::debug!(entries = entries.len(), "sent metadata");

    Ok(())
}
