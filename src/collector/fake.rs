use std::time::Duration;

use anyhow::Result;

use super::Collector;
use crate::point::{Emitter, RateType, SampleBatch, Unit};

/// Synthetic load generator: `count` points on `test.fake` per tick.
pub struct FakeCollector {
    count: usize,
    cadence: Duration,
}

impl FakeCollector {
    pub const METRIC: &'static str = "test.fake";

    pub fn new(count: usize) -> Self {
        Self {
            count,
            cadence: Duration::from_secs(1),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }
}

impl Collector for FakeCollector {
    fn name(&self) -> &str {
        "fake"
    }

    fn cadence(&self) -> Option<Duration> {
        Some(self.cadence)
    }

    fn collect(&self, emitter: &Emitter) -> Result<SampleBatch> {
        let mut batch = emitter.batch();
        for i in 0..self.count {
            let idx = i.to_string();
            batch.add(
                Self::METRIC,
                i,
                &[("i", idx.as_str())],
                RateType::Gauge,
                Unit::None,
                "",
            );
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{Tagset, Value};

    #[test]
    fn test_fake_emits_indexed_points() {
        let batch = FakeCollector::new(3)
            .collect(&Emitter::new(Tagset::new()))
            .expect("collect");

        let points = batch.points();
        assert_eq!(points.len(), 3);
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.metric(), "test.fake");
            assert_eq!(p.value(), Value::Int(i as i64));
            assert_eq!(p.tags().get("i"), Some(i.to_string().as_str()));
        }
    }
}
