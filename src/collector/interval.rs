use std::time::Duration;

use anyhow::Result;

use super::Collector;
use crate::point::{Emitter, SampleBatch};

type CollectFn = dyn Fn(&Emitter) -> Result<SampleBatch> + Send + Sync;
type InitFn = dyn Fn() -> Result<()> + Send + Sync;

/// Collector backed by a plain function.
pub struct IntervalCollector {
    name: String,
    cadence: Option<Duration>,
    init: Option<Box<InitFn>>,
    collect: Box<CollectFn>,
}

impl IntervalCollector {
    pub fn new<F>(name: impl Into<String>, collect: F) -> Self
    where
        F: Fn(&Emitter) -> Result<SampleBatch> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            cadence: None,
            init: None,
            collect: Box::new(collect),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = Some(cadence);
        self
    }

    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }
}

impl Collector for IntervalCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn cadence(&self) -> Option<Duration> {
        self.cadence
    }

    fn init(&self) -> Result<()> {
        match &self.init {
            Some(init) => init(),
            None => Ok(()),
        }
    }

    fn collect(&self, emitter: &Emitter) -> Result<SampleBatch> {
        (self.collect)(emitter)
    }
}
