//! First-write-wins metadata deduplication.
//!
//! Every distinct (metric, tagset) series has its rate type, unit and
//! description reported at most once per process lifetime. Records are
//! staged into a bounded queue and shipped by [`MetadataReporter`].

mod reporter;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::export::health::HealthMetrics;
use crate::point::{RateType, Tagset, Unit};

pub use reporter::{MetadataReporter, MetadataTarget};

/// Descriptive facets of one series, captured on first observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub metric: String,
    pub tags: Tagset,
    pub rate: RateType,
    pub unit: Unit,
    pub description: String,
}

/// One facet in the metadata wire format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataEntry {
    pub metric: String,
    pub tags: Tagset,
    pub name: &'static str,
    pub value: String,
}

impl MetadataRecord {
    /// Expands the record into wire entries. A `none` unit and an empty
    /// description are omitted.
    pub fn entries(&self) -> Vec<MetadataEntry> {
        let entry = |name: &'static str, value: &str| MetadataEntry {
            metric: self.metric.clone(),
            tags: self.tags.clone(),
            name,
            value: value.to_string(),
        };

        let mut entries = vec![entry("rate", self.rate.as_str())];
        if !self.unit.is_none() {
            entries.push(entry("unit", self.unit.as_str()));
        }
        if !self.description.is_empty() {
            entries.push(entry("desc", &self.description));
        }
        entries
    }
}

/// Set of series whose metadata has already been staged.
pub struct MetadataStore {
    seen: Mutex<HashSet<String>>,
    tx: mpsc::Sender<MetadataRecord>,
    health: Option<Arc<HealthMetrics>>,
}

impl MetadataStore {
    /// Creates a store and the receiving end of its staging queue.
    pub fn new(queue_size: usize) -> (Arc<Self>, mpsc::Receiver<MetadataRecord>) {
        Self::with_health(queue_size, None)
    }

    pub fn with_health(
        queue_size: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> (Arc<Self>, mpsc::Receiver<MetadataRecord>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let store = Self {
            seen: Mutex::new(HashSet::new()),
            tx,
            health,
        };
        (Arc::new(store), rx)
    }

    /// Records an observation. Returns true only the first time the
    /// series is seen, in which case its metadata is staged.
    pub fn record(
        &self,
        metric: &str,
        tags: &Tagset,
        rate: RateType,
        unit: &Unit,
        description: &str,
    ) -> bool {
        let key = format!("{metric}{tags}");
        if !self.seen.lock().insert(key) {
            return false;
        }

        let record = MetadataRecord {
            metric: metric.to_string(),
            tags: tags.clone(),
            rate,
            unit: unit.clone(),
            description: description.to_string(),
        };

        match self.tx.try_send(record) {
            Ok(()) => {
                if let Some(health) = &self.health {
                    health.metadata_staged.inc();
                }
            }
            Err(e) => {
                tracing::warn!(metric, error = %e, "metadata queue unavailable, dropping record");
                if let Some(health) = &self.health {
                    health.metadata_dropped.inc();
                }
            }
        }

        true
    }

    /// Number of distinct series observed so far.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tagset {
        Tagset::from_pairs(pairs.iter().copied()).expect("unique")
    }

    #[test]
    fn test_record_first_observation_once() {
        let (store, mut rx) = MetadataStore::new(8);
        let t = tags(&[("host", "a")]);

        assert!(store.record("os.cpu", &t, RateType::Counter, &Unit::Percent, "cpu"));
        assert!(!store.record("os.cpu", &t, RateType::Counter, &Unit::Percent, "cpu"));
        assert!(!store.record("os.cpu", &t, RateType::Gauge, &Unit::Bytes, "changed"));

        let staged = rx.try_recv().expect("staged");
        assert_eq!(staged.rate, RateType::Counter);
        assert_eq!(staged.description, "cpu");
        assert!(rx.try_recv().is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_tagsets_are_distinct_series() {
        let (store, _rx) = MetadataStore::new(8);
        assert!(store.record("m", &tags(&[("a", "1")]), RateType::Gauge, &Unit::None, ""));
        assert!(store.record("m", &tags(&[("a", "2")]), RateType::Gauge, &Unit::None, ""));
        assert!(store.record("m2", &tags(&[("a", "1")]), RateType::Gauge, &Unit::None, ""));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_full_queue_drops_but_still_marks_seen() {
        let (store, mut rx) = MetadataStore::new(1);
        assert!(store.record("a", &Tagset::new(), RateType::Gauge, &Unit::None, ""));
        assert!(store.record("b", &Tagset::new(), RateType::Gauge, &Unit::None, ""));
        assert!(!store.record("b", &Tagset::new(), RateType::Gauge, &Unit::None, ""));

        assert_eq!(rx.try_recv().expect("first").metric, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_record_reports_once() {
        let (store, _rx) = MetadataStore::new(64);
        let t = tags(&[("host", "a")]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let t = t.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| store.record("m", &t, RateType::Gauge, &Unit::None, ""))
                        .count()
                })
            })
            .collect();

        let firsts: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .sum();
        assert_eq!(firsts, 1);
    }

    #[test]
    fn test_entries_skip_empty_facets() {
        let record = MetadataRecord {
            metric: "m".into(),
            tags: tags(&[("host", "a")]),
            rate: RateType::Gauge,
            unit: Unit::None,
            description: String::new(),
        };
        let entries = record.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "rate");
        assert_eq!(entries[0].value, "gauge");

        let record = MetadataRecord {
            unit: Unit::Bytes,
            description: "free memory".into(),
            ..record
        };
        let names: Vec<&str> = record.entries().iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["rate", "unit", "desc"]);
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = MetadataEntry {
            metric: "m".into(),
            tags: tags(&[("host", "a")]),
            name: "unit",
            value: "bytes".into(),
        };
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"metric": "m", "tags": {"host": "a"}, "name": "unit", "value": "bytes"})
        );
    }
}
