use std::sync::Arc;

use super::{Point, PointError, RateType, Tagset, Unit, Value};
use crate::export::health::HealthMetrics;
use crate::metadata::MetadataStore;

/// Default tag identifying the local machine.
pub const HOST_TAG: &str = "host";

/// Shared point construction context handed to every collector invocation.
///
/// Holds the process-wide default tags and the optional metadata
/// deduplicator. Cloning is cheap.
#[derive(Clone, Default)]
pub struct Emitter {
    defaults: Arc<Tagset>,
    metadata: Option<Arc<MetadataStore>>,
    health: Option<Arc<HealthMetrics>>,
}

impl Emitter {
    pub fn new(defaults: Tagset) -> Self {
        Self {
            defaults: Arc::new(defaults),
            metadata: None,
            health: None,
        }
    }

    /// Stages metadata for first-seen series into `store`.
    pub fn with_metadata(mut self, store: Arc<MetadataStore>) -> Self {
        self.metadata = Some(store);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn defaults(&self) -> &Tagset {
        &self.defaults
    }

    /// Starts an empty sample batch for one invocation.
    pub fn batch(&self) -> SampleBatch {
        SampleBatch {
            emitter: self.clone(),
            points: Vec::new(),
        }
    }

    /// Merges caller tags over the defaults.
    ///
    /// Caller values win on key collisions. An empty `host` value drops the
    /// host tag so the sample is not attributed to the local machine.
    fn merge(&self, tags: &[(&str, &str)]) -> Result<Tagset, PointError> {
        let caller = Tagset::from_pairs(tags.iter().copied())?;
        let mut merged = Tagset::clone(&self.defaults);

        for (k, v) in &caller {
            if k == HOST_TAG && v.is_empty() {
                merged.remove(HOST_TAG);
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }

        Ok(merged)
    }
}

/// Ordered points produced by one collector invocation.
pub struct SampleBatch {
    emitter: Emitter,
    points: Vec<Point>,
}

impl SampleBatch {
    /// Appends a point stamped with the current time.
    ///
    /// Invalid points are logged and skipped; the batch stays usable.
    pub fn add(
        &mut self,
        metric: &str,
        value: impl Into<Value>,
        tags: &[(&str, &str)],
        rate: RateType,
        unit: Unit,
        description: &str,
    ) {
        let ts = chrono::Utc::now().timestamp();
        self.add_at(metric, value, tags, rate, unit, description, ts);
    }

    /// Like [`SampleBatch::add`] with an explicit timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn add_at(
        &mut self,
        metric: &str,
        value: impl Into<Value>,
        tags: &[(&str, &str)],
        rate: RateType,
        unit: Unit,
        description: &str,
        timestamp: i64,
    ) {
        if let Err(e) = self.try_add_at(metric, value, tags, rate, unit, description, timestamp) {
            tracing::warn!(metric, error = %e, "dropping invalid point");
            if let Some(health) = &self.emitter.health {
                health.points_rejected.inc();
            }
        }
    }

    /// Appends a point stamped with the current time, returning validation errors.
    pub fn try_add(
        &mut self,
        metric: &str,
        value: impl Into<Value>,
        tags: &[(&str, &str)],
        rate: RateType,
        unit: Unit,
        description: &str,
    ) -> Result<(), PointError> {
        let ts = chrono::Utc::now().timestamp();
        self.try_add_at(metric, value, tags, rate, unit, description, ts)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn try_add_at(
        &mut self,
        metric: &str,
        value: impl Into<Value>,
        tags: &[(&str, &str)],
        rate: RateType,
        unit: Unit,
        description: &str,
        timestamp: i64,
    ) -> Result<(), PointError> {
        let tags = self.emitter.merge(tags)?;
        let point =
            Point::new(metric, value.into(), tags, timestamp)?.with_metadata(rate, unit, description);

        if let Some(store) = &self.emitter.metadata {
            store.record(
                point.metric(),
                point.tags(),
                point.rate(),
                point.unit(),
                point.description(),
            );
        }

        self.points.push(point);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }
}
