//! Per-collector scheduling.
//!
//! Each selected collector gets its own task. The task runs `init` once,
//! then invokes `collect` immediately and on every tick of a fixed-rate
//! timer. A collector never runs concurrently with itself: ticks that come
//! due while an invocation is still running are dropped, not queued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::collector::Collector;
use crate::export::health::HealthMetrics;
use crate::point::{Emitter, Point};

/// Runs a fixed set of collectors and forwards their points to the pipeline.
pub struct Scheduler {
    collectors: Vec<Arc<dyn Collector>>,
    emitter: Emitter,
    default_cadence: Duration,
    tx: mpsc::Sender<Point>,
    health: Option<Arc<HealthMetrics>>,
}

impl Scheduler {
    pub fn new(
        collectors: Vec<Arc<dyn Collector>>,
        emitter: Emitter,
        default_cadence: Duration,
        tx: mpsc::Sender<Point>,
    ) -> Self {
        Self {
            collectors,
            emitter,
            default_cadence,
            tx,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Spawns one task per collector. Tasks end when `cancel` fires, when
    /// the pipeline closes, or right away if the collector's init fails.
    pub fn start(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            collectors = self.collectors.len(),
            default_cadence = ?self.default_cadence,
            "starting scheduler",
        );

        self.collectors
            .into_iter()
            .map(|collector| {
                let task = CollectorTask {
                    cadence: collector.cadence().unwrap_or(self.default_cadence),
                    name: collector.name().to_string(),
                    collector,
                    emitter: self.emitter.clone(),
                    tx: self.tx.clone(),
                    health: self.health.clone(),
                };
                tokio::spawn(task.run(cancel.clone()))
            })
            .collect()
    }
}

struct CollectorTask {
    name: String,
    cadence: Duration,
    collector: Arc<dyn Collector>,
    emitter: Emitter,
    tx: mpsc::Sender<Point>,
    health: Option<Arc<HealthMetrics>>,
}

impl CollectorTask {
    async fn run(self, cancel: CancellationToken) {
        if let Err(e) = self.init().await {
            tracing::error!(collector = %self.name, error = %e, "collector init failed, disabling");
            if let Some(health) = &self.health {
                health.collector_init_failures.inc();
            }
            return;
        }

        if let Some(health) = &self.health {
            health.collectors_running.inc();
        }

        self.schedule(cancel).await;

        if let Some(health) = &self.health {
            health.collectors_running.dec();
        }
    }

    async fn init(&self) -> Result<()> {
        if self.cadence.is_zero() {
            bail!("zero cadence");
        }

        let collector = Arc::clone(&self.collector);
        tokio::task::spawn_blocking(move || collector.init())
            .await
            .context("collector init panicked")?
    }

    async fn schedule(&self, cancel: CancellationToken) {
        tracing::debug!(collector = %self.name, cadence = ?self.cadence, "collector scheduled");

        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_deadline: Option<Instant> = None;
        let mut busy_until: Option<Instant> = None;

        loop {
            let deadline = tokio::select! {
                _ = cancel.cancelled() => return,
                deadline = interval.tick() => deadline,
            };

            // Deadlines the timer jumped over while we were busy.
            let mut skipped = last_deadline
                .map(|prev| missed_between(prev, deadline, self.cadence))
                .unwrap_or(0);
            last_deadline = Some(deadline);

            // A deadline that fell during the previous invocation is stale.
            let stale = busy_until.is_some_and(|finished| deadline < finished);
            if stale {
                skipped += 1;
            }

            if skipped > 0 {
                tracing::debug!(collector = %self.name, skipped, "collector overran its cadence");
                if let Some(health) = &self.health {
                    health
                        .collector_ticks_skipped
                        .with_label_values(&[&self.name])
                        .inc_by(skipped as f64);
                }
            }
            if stale {
                continue;
            }

            let started = Instant::now();
            let result = self.invoke().await;
            let finished = Instant::now();
            busy_until = Some(finished);

            if let Some(health) = &self.health {
                health
                    .collector_invocations
                    .with_label_values(&[&self.name])
                    .inc();
                health
                    .collector_duration
                    .with_label_values(&[&self.name])
                    .observe((finished - started).as_secs_f64());
            }

            let points = match result {
                Ok(points) => points,
                Err(e) => {
                    tracing::warn!(collector = %self.name, error = %e, "collector invocation failed");
                    if let Some(health) = &self.health {
                        health
                            .collector_errors
                            .with_label_values(&[&self.name])
                            .inc();
                    }
                    continue;
                }
            };

            if !self.forward(points, &cancel).await {
                return;
            }
        }
    }

    /// Runs one `collect` on the blocking pool. Panics surface as errors.
    async fn invoke(&self) -> Result<Vec<Point>> {
        let collector = Arc::clone(&self.collector);
        let emitter = self.emitter.clone();
        let batch = tokio::task::spawn_blocking(move || collector.collect(&emitter))
            .await
            .context("collector panicked")??;
        Ok(batch.into_points())
    }

    /// Sends points in order. Returns false once the pipeline is closed or
    /// the agent is shutting down.
    async fn forward(&self, points: Vec<Point>, cancel: &CancellationToken) -> bool {
        let n = points.len();
        for point in points {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                sent = self.tx.send(point) => {
                    if sent.is_err() {
                        tracing::debug!(collector = %self.name, "pipeline closed, stopping collector");
                        return false;
                    }
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .points_emitted
                .with_label_values(&[&self.name])
                .inc_by(n as f64);
        }
        true
    }
}

/// Number of whole periods strictly between two tick deadlines.
fn missed_between(prev: Instant, next: Instant, period: Duration) -> u64 {
    let period = period.as_nanos().max(1);
    let gap = next.saturating_duration_since(prev).as_nanos();
    let periods = (gap + period / 2) / period;
    periods.saturating_sub(1) as u64
}
