use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::point::Point;

/// Output encoding of the local sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFormat {
    /// `metric timestamp value k=v ...`
    Line,
    /// One wire JSON object per line.
    Json,
}

/// Writes every point synchronously, one per line, with no batching.
pub struct LocalSink {
    out: Box<dyn Write + Send>,
    format: LocalFormat,
    health: Option<Arc<HealthMetrics>>,
}

impl LocalSink {
    pub fn new(out: Box<dyn Write + Send>, format: LocalFormat) -> Self {
        Self {
            out,
            format,
            health: None,
        }
    }

    pub fn stdout(format: LocalFormat) -> Self {
        Self::new(Box::new(std::io::stdout()), format)
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn name(&self) -> &str {
        "local"
    }

    pub fn write_point(&mut self, point: &Point) -> Result<()> {
        match self.format {
            LocalFormat::Line => writeln!(self.out, "{point}").context("writing point")?,
            LocalFormat::Json => {
                serde_json::to_writer(&mut self.out, point).context("encoding point")?;
                self.out.write_all(b"\n").context("writing point")?;
            }
        }
        self.out.flush().context("flushing output")
    }

    fn write_logged(&mut self, point: &Point) {
        if let Err(e) = self.write_point(point) {
            tracing::warn!(metric = point.metric(), error = %e, "local sink write failed");
            if let Some(health) = &self.health {
                health.sink_write_errors.inc();
            }
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Point>, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(point) = rx.try_recv() {
                        self.write_logged(&point);
                    }
                    return Ok(());
                }

                item = rx.recv() => match item {
                    Some(point) => self.write_logged(&point),
                    None => return Ok(()),
                },
            }
        }
    }
}
