use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{program, FakeCollector, Registry};
use crate::config::{api_url, Config};
use crate::export::health::HealthMetrics;
use crate::host;
use crate::metadata::{MetadataReporter, MetadataStore, MetadataTarget};
use crate::point::{Emitter, Point, RateType, Unit};
use crate::scheduler::Scheduler;
use crate::sink::{HttpSender, LocalFormat, LocalSink, Sink};
use crate::watchdog::{Fatal, MemoryProbe, ProcStatusProbe, Watchdog};

/// How long `stop` waits for tasks to finish before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const PUT_PATH: &str = "api/put";
const METADATA_PATH: &str = "api/metadata/put";

/// Metric reporting the agent build once per remote session.
pub const VERSION_METRIC: &str = "version";

/// Agent orchestrates all components: scheduler, sink, metadata reporter,
/// watchdog and the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    hostname: String,
    output: Option<Box<dyn Write + Send>>,
    probe: Arc<dyn MemoryProbe>,
    version_date: i64,
    collectors: Vec<JoinHandle<()>>,
    sink: Option<JoinHandle<()>>,
    metadata: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<Option<Fatal>>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            hostname: host::hostname(),
            output: None,
            probe: Arc::new(ProcStatusProbe::default()),
            version_date: 0,
            collectors: Vec::new(),
            sink: None,
            metadata: None,
            watchdog: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Sends local-mode output to `out` instead of stdout.
    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.output = Some(out);
        self
    }

    /// Replaces the detected machine hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Build date (YYYYMMDDHHMMSS) sent as the `version` metric on startup
    /// in remote mode. 0 disables it.
    pub fn with_version_date(mut self, date: i64) -> Self {
        self.version_date = date;
        self
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Registers the built-in collectors enabled by the configuration.
    pub fn build_registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();

        if self.cfg.collectors.fake > 0 {
            registry.register(FakeCollector::new(self.cfg.collectors.fake))?;
        }

        #[cfg(target_os = "linux")]
        if self.cfg.collectors.system {
            registry.register(crate::collector::SystemCollector::new())?;
        }

        if let Some(dir) = &self.cfg.collectors.program_dir {
            for c in program::discover(dir, self.cfg.collectors.program_timeout)? {
                let path = c.path().display().to_string();
                if let Err(e) = registry.register(c) {
                    warn!(program = %path, error = %e, "skipping program collector");
                }
            }
        }

        Ok(registry)
    }

    /// Start all components. Collectors are selected from `registry` with
    /// the configured filter.
    pub async fn start(&mut self, registry: Registry) -> Result<()> {
        // 0. Start health metrics server.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let remote = if self.cfg.local_mode() {
            None
        } else {
            self.cfg.endpoint_url()?
        };

        let defaults = host::default_tags(&self.hostname, self.cfg.full_hostname, &self.cfg.tags)
            .context("building default tags")?;
        info!(tags = %defaults, "default tags");

        let mut emitter = Emitter::new(defaults).with_health(Arc::clone(&self.health));

        // 1. Metadata reporter.
        if self.cfg.metadata.enabled {
            let (store, rx) =
                MetadataStore::with_health(self.cfg.metadata.queue_size, Some(Arc::clone(&self.health)));
            emitter = emitter.with_metadata(store);

            let target = match &remote {
                Some(base) => MetadataTarget::Http {
                    client: reqwest::Client::builder()
                        .timeout(self.cfg.sender.request_timeout)
                        .build()
                        .context("building metadata HTTP client")?,
                    url: api_url(base, METADATA_PATH),
                    headers: self.cfg.sender.headers.clone(),
                },
                None => MetadataTarget::Log,
            };

            let reporter = MetadataReporter::new(target, self.cfg.metadata.flush_interval)
                .with_health(Arc::clone(&self.health));
            self.metadata = Some(reporter.spawn(rx, self.cancel.child_token()));
        }

        // 2. Sink.
        let (tx, rx) = mpsc::channel::<Point>(self.cfg.sender.queue_size);
        let sink = match &remote {
            Some(base) => Sink::Http(
                HttpSender::new(api_url(base, PUT_PATH), self.cfg.sender.clone())?
                    .with_health(Arc::clone(&self.health)),
            ),
            None => {
                let format = if self.cfg.local.json {
                    LocalFormat::Json
                } else {
                    LocalFormat::Line
                };
                let sink = match self.output.take() {
                    Some(out) => LocalSink::new(out, format),
                    None => LocalSink::stdout(format),
                };
                Sink::Local(sink.with_health(Arc::clone(&self.health)))
            }
        };
        info!(sink = sink.name(), "sink started");
        self.sink = Some(sink.spawn(rx, self.cancel.child_token()));

        if remote.is_some() && self.version_date > 0 {
            let mut batch = emitter.batch();
            batch.add(
                VERSION_METRIC,
                self.version_date,
                &[],
                RateType::Gauge,
                Unit::None,
                "Build date of the running scout agent.",
            );
            for point in batch.into_points() {
                if tx.try_send(point).is_err() {
                    warn!("pipeline full, dropping version point");
                }
            }
        }

        // 3. Watchdog. The local sink cannot build a backlog.
        if remote.is_some() {
            self.watchdog = Watchdog::new(Arc::clone(&self.probe), &self.cfg.watchdog)
                .with_health(Arc::clone(&self.health))
                .spawn(self.cancel.child_token());
        }

        // 4. Collectors.
        let selected = registry.select(&self.cfg.collectors.filter);
        if selected.is_empty() {
            warn!(filter = %self.cfg.collectors.filter, "no collectors selected");
        }
        self.collectors = Scheduler::new(selected, emitter, self.cfg.cadence(), tx)
            .with_health(Arc::clone(&self.health))
            .start(self.cancel.child_token());

        info!("agent fully started");

        Ok(())
    }

    /// Resolves when the watchdog reports a fatal condition. Never resolves
    /// when the watchdog is not running.
    pub async fn fatal(&mut self) -> Option<Fatal> {
        let Some(handle) = self.watchdog.as_mut() else {
            return std::future::pending().await;
        };

        let result = handle.await;
        self.watchdog = None;

        match result {
            Ok(fatal) => fatal,
            Err(e) => {
                warn!(error = %e, "watchdog task failed");
                None
            }
        }
    }

    /// Gracefully stop all components. The sink makes a final flush.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

        let handles = self
            .collectors
            .drain(..)
            .chain(self.sink.take())
            .chain(self.metadata.take());
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("task did not stop within the shutdown grace period");
            }
        }

        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }

        // Stop health metrics server.
        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }
}
