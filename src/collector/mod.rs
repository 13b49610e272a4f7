//! Metric producers and the startup registry.
//!
//! Every source of points implements [`Collector`]. Collectors are
//! registered on a [`Registry`] during startup; the registry is then consumed
//! into the list of collectors the scheduler runs.

mod fake;
mod interval;
pub mod program;
#[cfg(target_os = "linux")]
pub mod system;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::point::{Emitter, SampleBatch};

pub use fake::FakeCollector;
pub use interval::IntervalCollector;
pub use program::ProgramCollector;
#[cfg(target_os = "linux")]
pub use system::SystemCollector;

/// A named producer of sample batches, invoked on a fixed cadence.
///
/// `init` and `collect` run on the blocking thread pool, so implementations
/// may block on I/O freely.
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    /// Invocation period. `None` uses the process-wide default.
    fn cadence(&self) -> Option<Duration> {
        None
    }

    /// One-time setup. A failure disables the collector for this run.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Produces this cycle's points. On error nothing from the cycle is
    /// forwarded.
    fn collect(&self, emitter: &Emitter) -> Result<SampleBatch>;
}

/// Append-only set of collectors populated at startup.
#[derive(Default)]
pub struct Registry {
    collectors: Vec<Arc<dyn Collector>>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collector. Names must be unique.
    pub fn register<C: Collector + 'static>(&mut self, collector: C) -> Result<()> {
        self.register_arc(Arc::new(collector))
    }

    pub fn register_arc(&mut self, collector: Arc<dyn Collector>) -> Result<()> {
        let name = collector.name().to_string();
        if name.is_empty() {
            bail!("collector name must not be empty");
        }
        if collector.cadence().is_some_and(|c| c.is_zero()) {
            bail!("collector {name:?} has a zero cadence");
        }
        if !self.names.insert(name.clone()) {
            bail!("collector {name:?} registered twice");
        }
        self.collectors.push(collector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Names of the collectors `filter` would select.
    pub fn search(&self, filter: &str) -> Vec<&str> {
        self.collectors
            .iter()
            .map(|c| c.name())
            .filter(|name| name.contains(filter))
            .collect()
    }

    /// Consumes the registry, keeping collectors whose name contains
    /// `filter`. An empty filter keeps everything.
    pub fn select(self, filter: &str) -> Vec<Arc<dyn Collector>> {
        self.collectors
            .into_iter()
            .filter(|c| c.name().contains(filter))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> IntervalCollector {
        IntervalCollector::new(name, |emitter: &Emitter| Ok(emitter.batch()))
    }

    #[test]
    fn test_register_rejects_duplicate_name() {
        let mut registry = Registry::new();
        registry.register(noop("cpu")).expect("first");
        let err = registry.register(noop("cpu")).expect_err("duplicate");
        assert!(err.to_string().contains("registered twice"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_zero_cadence() {
        let mut registry = Registry::new();
        let err = registry
            .register(noop("spin").with_cadence(Duration::ZERO))
            .expect_err("zero cadence");
        assert!(err.to_string().contains("zero cadence"));
        assert!(registry.is_empty());

        let err = registry
            .register(FakeCollector::new(1).with_cadence(Duration::ZERO))
            .expect_err("zero cadence");
        assert!(err.to_string().contains("\"fake\""));
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let mut registry = Registry::new();
        assert!(registry.register(noop("")).is_err());
    }

    #[test]
    fn test_search_and_select() {
        let mut registry = Registry::new();
        for name in ["os.cpu", "os.mem", "net.ping", "program.backup"] {
            registry.register(noop(name)).expect("register");
        }

        assert_eq!(registry.names(), vec!["os.cpu", "os.mem", "net.ping", "program.backup"]);
        assert_eq!(registry.search("os."), vec!["os.cpu", "os.mem"]);
        assert_eq!(registry.search("").len(), 4);
        assert!(registry.search("nothing").is_empty());

        let selected = registry.select("ping");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "net.ping");
    }

    #[test]
    fn test_empty_filter_selects_all() {
        let mut registry = Registry::new();
        registry.register(noop("a")).expect("register");
        registry.register(noop("b")).expect("register");
        assert_eq!(registry.select("").len(), 2);
    }
}
