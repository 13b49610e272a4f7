//! Pipeline consumers.
//!
//! Exactly one sink drains the pipeline: the remote [`HttpSender`] or the
//! local [`LocalSink`].

mod http;
mod local;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::point::Point;

pub use http::{encode_batch, HttpSender};
pub use local::{LocalFormat, LocalSink};

/// Sink dispatches pipeline points to the remote endpoint or a local writer.
///
/// Uses enum dispatch rather than trait objects so the consumer loop stays a
/// plain `async fn`.
pub enum Sink {
    Http(HttpSender),
    Local(LocalSink),
}

impl Sink {
    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Http(s) => s.name(),
            Self::Local(s) => s.name(),
        }
    }

    /// Drains `rx` until it closes or `cancel` fires, then flushes.
    pub async fn run(self, rx: mpsc::Receiver<Point>, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Http(s) => s.run(rx, cancel).await,
            Self::Local(s) => s.run(rx, cancel).await,
        }
    }

    pub fn spawn(self, rx: mpsc::Receiver<Point>, cancel: CancellationToken) -> JoinHandle<()> {
        let name = self.name().to_string();
        tokio::spawn(async move {
            if let Err(e) = self.run(rx, cancel).await {
                tracing::error!(sink = %name, error = %e, "sink stopped with error");
            }
        })
    }
}
