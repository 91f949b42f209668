//! Metric streams and the registry that owns them.
//!
//! Every observation is kept in an append-only vector guarded by a per-stream lock.
//! Writers never block each other across streams, and queries take the same lock
//! briefly to replay matching observations into a fresh [`Snapshot`], so a query always
//! sees a consistent prefix of the stream.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use crate::{
    aggregate::Snapshot,
    error::{Error, Result},
    metric::{MetricKind, Observation, TagSet, builtin},
};

/// Append-only recording surface for a single named metric.
#[derive(Debug)]
pub struct MetricStream {
    name: String,
    kind: MetricKind,
    observations: Mutex<Vec<Observation>>,
}

impl MetricStream {
    fn new(name: String, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            observations: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of observations appended so far.
    pub fn len(&self) -> usize {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, observation: Observation) {
        // A poisoned lock still holds a valid vector: pushes are the only mutation.
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observation);
    }

    /// Aggregate all observations whose tags match `filter`.
    pub fn snapshot(&self, filter: &TagSet) -> Snapshot {
        let observations = self
            .observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = Snapshot::empty(self.kind);
        observations
            .iter()
            .filter(|o| o.tags.matches(filter))
            .for_each(|o| snapshot.consume(o.value));
        snapshot
    }

    /// A copy of the full observation log.
    pub fn observations(&self) -> Vec<Observation> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Owns every [`MetricStream`] of a run, keyed by metric name.
///
/// A name is bound to the kind it was first declared or recorded with; recording it
/// again with another kind is rejected.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    streams: RwLock<HashMap<String, Arc<MetricStream>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in metric already declared.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (name, kind) in builtin::ALL {
            // Fresh registry: declaring cannot conflict.
            let _ = registry.declare(name, kind);
        }
        registry
    }

    /// Create an empty stream for `name` if absent.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricStream>> {
        self.stream_for(name, kind)
    }

    /// Append one observation, creating the stream lazily on first use.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64, tags: TagSet) -> Result<()> {
        let stream = self.stream_for(name, kind)?;
        stream.append(Observation::new(name, kind, value, tags));
        Ok(())
    }

    /// Aggregate of every observation of `name` matching `filter`, or `None` if the
    /// metric was never declared nor recorded.
    pub fn query(&self, name: &str, filter: &TagSet) -> Option<Snapshot> {
        self.stream(name).map(|s| s.snapshot(filter))
    }

    pub fn stream(&self, name: &str) -> Option<Arc<MetricStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.stream(name).map(|s| s.kind())
    }

    /// Metric names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// A write-only handle that stamps `tags` on everything it records.
    pub fn recorder(self: &Arc<Self>, tags: TagSet) -> Recorder {
        Recorder {
            registry: Arc::clone(self),
            tags,
        }
    }

    fn stream_for(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricStream>> {
        // built-in names keep their kind even before the built-in stream exists
        if let Some((_, builtin)) = builtin::ALL.iter().find(|(b, _)| *b == name) {
            if *builtin != kind {
                return Err(Error::KindMismatch {
                    name: name.to_owned(),
                    existing: *builtin,
                    requested: kind,
                });
            }
        }
        if let Some(stream) = self.stream(name) {
            return check_kind(stream, kind);
        }

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let stream = streams
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MetricStream::new(name.to_owned(), kind)))
            .clone();
        check_kind(stream, kind)
    }
}

fn check_kind(stream: Arc<MetricStream>, requested: MetricKind) -> Result<Arc<MetricStream>> {
    if stream.kind() == requested {
        Ok(stream)
    } else {
        Err(Error::KindMismatch {
            name: stream.name().to_owned(),
            existing: stream.kind(),
            requested,
        })
    }
}

/// Write-only view into a [`MetricsRegistry`].
///
/// Executors hand one of these to each iteration, pre-loaded with the scenario's
/// tag-set, so every observation carries the scenario identity.
#[derive(Clone, Debug)]
pub struct Recorder {
    registry: Arc<MetricsRegistry>,
    tags: TagSet,
}

impl Recorder {
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn record(&self, name: &str, kind: MetricKind, value: f64) -> Result<()> {
        self.registry.record(name, kind, value, self.tags.clone())
    }

    /// Record with `extra` tags layered over the recorder's own.
    pub fn record_tagged(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        extra: &TagSet,
    ) -> Result<()> {
        self.registry
            .record(name, kind, value, self.tags.merged(extra))
    }

    /// Record a built-in metric. Built-in names cannot be declared with another kind, so
    /// an error here means the registry itself is broken; it is logged and skipped.
    pub(crate) fn record_builtin(&self, name: &str, kind: MetricKind, value: f64, extra: &TagSet) {
        if let Err(e) = self.record_tagged(name, kind, value, extra) {
            tracing::warn!("Dropping observation: {e}");
        }
    }

    /// A recorder with `extra` tags merged into this one's.
    pub fn with_tags(&self, extra: &TagSet) -> Recorder {
        Recorder {
            registry: Arc::clone(&self.registry),
            tags: self.tags.merged(extra),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Snapshot;

    fn smoke() -> TagSet {
        TagSet::new().with("scenario", "smoke")
    }

    #[test]
    fn record_creates_stream_lazily() {
        let registry = MetricsRegistry::new();
        assert!(registry.query("custom", &TagSet::new()).is_none());

        registry
            .record("custom", MetricKind::Counter, 2.0, smoke())
            .unwrap();
        registry
            .record("custom", MetricKind::Counter, 3.0, smoke())
            .unwrap();

        match registry.query("custom", &TagSet::new()).unwrap() {
            Snapshot::Counter(c) => {
                assert_eq!(c.sum, 5.0);
                assert_eq!(c.samples, 2);
            }
            other => panic!("unexpected snapshot {other:?}"),
        }
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let registry = MetricsRegistry::new();
        registry
            .record("latency", MetricKind::Trend, 1.0, TagSet::new())
            .unwrap();
        let err = registry
            .record("latency", MetricKind::Rate, 1.0, TagSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::KindMismatch {
                existing: MetricKind::Trend,
                requested: MetricKind::Rate,
                ..
            }
        ));
        assert_eq!(registry.stream("latency").unwrap().len(), 1);
    }

    #[test]
    fn builtin_names_keep_their_kind() {
        // no built-in streams yet: the name alone fixes the kind
        let registry = MetricsRegistry::new();
        let err = registry
            .declare(builtin::CHECKS, MetricKind::Counter)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::KindMismatch {
                existing: MetricKind::Rate,
                requested: MetricKind::Counter,
                ..
            }
        ));
        assert!(registry.stream(builtin::CHECKS).is_none());
        assert!(
            registry
                .record(builtin::HTTP_REQ_DURATION, MetricKind::Counter, 1.0, smoke())
                .is_err()
        );

        // the built-in recorder path still lands
        let registry = Arc::new(registry);
        let recorder = registry.recorder(smoke());
        recorder.record_builtin(builtin::CHECKS, MetricKind::Rate, 1.0, &TagSet::new());
        assert_eq!(registry.stream(builtin::CHECKS).unwrap().len(), 1);
        registry.declare(builtin::CHECKS, MetricKind::Rate).unwrap();
    }

    #[test]
    fn query_filters_by_tags() {
        let registry = MetricsRegistry::new();
        let load = TagSet::new().with("scenario", "load");
        for v in [100.0, 200.0] {
            registry
                .record("http_req_duration", MetricKind::Trend, v, smoke())
                .unwrap();
        }
        registry
            .record("http_req_duration", MetricKind::Trend, 5000.0, load.clone())
            .unwrap();

        let Some(Snapshot::Trend(t)) = registry.query("http_req_duration", &smoke()) else {
            panic!("expected trend");
        };
        assert_eq!(t.max(), Some(200.0));

        let Some(Snapshot::Trend(t)) = registry.query("http_req_duration", &load) else {
            panic!("expected trend");
        };
        assert_eq!(t.values, vec![5000.0]);

        let all = registry
            .query("http_req_duration", &TagSet::new())
            .unwrap();
        assert_eq!(all.samples(), 3);
    }

    #[test]
    fn builtins_are_declared_empty() {
        let registry = MetricsRegistry::with_builtins();
        assert_eq!(registry.kind_of(builtin::HTTP_REQ_FAILED), Some(MetricKind::Rate));
        assert!(registry.query(builtin::CHECKS, &TagSet::new()).unwrap().is_empty());
    }

    #[test]
    fn recorder_stamps_its_tags() {
        let registry = Arc::new(MetricsRegistry::new());
        let recorder = registry.recorder(smoke()).with_tags(&TagSet::new().with("group", "api"));
        recorder
            .record_tagged(
                "checks",
                MetricKind::Rate,
                1.0,
                &TagSet::new().with("check", "status 200"),
            )
            .unwrap();

        let obs = registry.stream("checks").unwrap().observations();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].tags.get("scenario"), Some("smoke"));
        assert_eq!(obs[0].tags.get("group"), Some("api"));
        assert_eq!(obs[0].tags.get("check"), Some("status 200"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let registry = Arc::new(MetricsRegistry::new());
        let writers = 16;
        let per_writer = 500;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let recorder = registry.recorder(TagSet::new().with("writer", w.to_string()));
                tokio::spawn(async move {
                    for i in 0..per_writer {
                        recorder
                            .record("samples", MetricKind::Trend, i as f64)
                            .unwrap();
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        let stream = registry.stream("samples").unwrap();
        assert_eq!(stream.len(), writers * per_writer);

        // each writer's own observations keep program order
        let obs = stream.observations();
        for w in 0..writers {
            let mine: Vec<f64> = obs
                .iter()
                .filter(|o| o.tags.get("writer") == Some(w.to_string().as_str()))
                .map(|o| o.value)
                .collect();
            let expected: Vec<f64> = (0..per_writer).map(|i| i as f64).collect();
            assert_eq!(mine, expected);
        }
    }
}
