//! Resident memory ceiling.
//!
//! A sender that cannot keep up makes producers back up and memory grow.
//! The watchdog checks RSS on a fixed period and reports a [`Fatal`]
//! condition once it exceeds the ceiling; the binary exits on it so an
//! external supervisor can restart the agent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::export::health::HealthMetrics;

/// Process-ending conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    #[error("resident memory {rss_bytes} bytes exceeds ceiling of {limit_bytes} bytes")]
    MemoryCeilingExceeded { rss_bytes: u64, limit_bytes: u64 },
}

impl Fatal {
    /// Process exit code for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MemoryCeilingExceeded { .. } => 3,
        }
    }
}

/// Source of the current resident set size.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Result<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`.
pub struct ProcStatusProbe {
    path: PathBuf,
}

impl Default for ProcStatusProbe {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/self/status"),
        }
    }
}

impl MemoryProbe for ProcStatusProbe {
    fn resident_bytes(&self) -> Result<u64> {
        let status = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_vm_rss(&status).context("VmRSS not found")
    }
}

/// Extracts `VmRSS` in bytes from a `/proc/<pid>/status` body.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmRSS:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

pub struct Watchdog {
    probe: Arc<dyn MemoryProbe>,
    max_rss_bytes: u64,
    check_interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl Watchdog {
    pub fn new(probe: Arc<dyn MemoryProbe>, cfg: &WatchdogConfig) -> Self {
        Self {
            probe,
            max_rss_bytes: cfg.max_rss_bytes,
            check_interval: cfg.check_interval,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// One check. Probe failures are logged and treated as healthy.
    pub fn check(&self) -> Option<Fatal> {
        let rss = match self.probe.resident_bytes() {
            Ok(rss) => rss,
            Err(e) => {
                tracing::warn!(error = %e, "reading resident memory failed");
                return None;
            }
        };

        if let Some(health) = &self.health {
            health.resident_memory_bytes.set(rss as f64);
        }

        if self.max_rss_bytes > 0 && rss > self.max_rss_bytes {
            return Some(Fatal::MemoryCeilingExceeded {
                rss_bytes: rss,
                limit_bytes: self.max_rss_bytes,
            });
        }

        tracing::trace!(rss, "resident memory within ceiling");
        None
    }

    /// Checks every interval, starting one interval from now. Resolves with
    /// the fatal condition, or `None` on cancellation.
    pub async fn run(self, cancel: CancellationToken) -> Option<Fatal> {
        let start = tokio::time::Instant::now() + self.check_interval;
        let mut interval = tokio::time::interval_at(start, self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = interval.tick() => {
                    if let Some(fatal) = self.check() {
                        tracing::error!(error = %fatal, "memory ceiling exceeded");
                        return Some(fatal);
                    }
                }
            }
        }
    }

    /// Spawns the check loop. Returns `None` when the ceiling is disabled.
    pub fn spawn(self, cancel: CancellationToken) -> Option<JoinHandle<Option<Fatal>>> {
        if self.max_rss_bytes == 0 {
            tracing::info!("memory watchdog disabled");
            return None;
        }

        tracing::info!(
            max_rss_bytes = self.max_rss_bytes,
            check_interval = ?self.check_interval,
            "memory watchdog started",
        );
        Some(tokio::spawn(self.run(cancel)))
    }
}
