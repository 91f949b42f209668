use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// The three metric kinds a stream can hold.
///
/// - `Counter`: monotonic sum of numeric samples.
/// - `Rate`: fraction of samples that are non-zero (true).
/// - `Trend`: distribution of numeric samples, queried for avg/min/max/percentiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        })
    }
}

/// An ordered mapping from tag key to value.
///
/// Tag filtering is exact-match set inclusion: a tag-set matches a filter when every
/// key/value pair of the filter is present in it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a new tag-set with `other` layered on top; `other` wins on conflicts.
    pub fn merged(&self, other: &TagSet) -> TagSet {
        let mut tags = self.clone();
        tags.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags
    }

    /// `true` if every pair of `filter` is present in `self`.
    pub fn matches(&self, filter: &TagSet) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|own| own == v))
    }
}

impl Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An immutable point-in-time sample of a metric.
///
/// Once appended to a stream it is never mutated or removed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub metric: String,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: TagSet,
    pub timestamp: SystemTime,
}

impl Observation {
    pub fn new(metric: impl Into<String>, kind: MetricKind, value: f64, tags: TagSet) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            tags,
            timestamp: SystemTime::now(),
        }
    }
}

/// Names of the metrics the engine records on its own.
pub mod builtin {
    use super::MetricKind;

    pub const HTTP_REQS: &str = "http_reqs";
    /// Request duration in milliseconds
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const ITERATIONS: &str = "iterations";
    /// Iteration duration in milliseconds
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const CHECKS: &str = "checks";
    /// Active VU count, sampled by the executors
    pub const VUS: &str = "vus";

    pub const ALL: [(&str, MetricKind); 9] = [
        (HTTP_REQS, MetricKind::Counter),
        (HTTP_REQ_DURATION, MetricKind::Trend),
        (HTTP_REQ_FAILED, MetricKind::Rate),
        (DATA_RECEIVED, MetricKind::Counter),
        (ITERATIONS, MetricKind::Counter),
        (ITERATION_DURATION, MetricKind::Trend),
        (ITERATION_FAILED, MetricKind::Rate),
        (CHECKS, MetricKind::Rate),
        (VUS, MetricKind::Trend),
    ];
}

/// Well-known tag keys.
pub mod tag {
    pub const SCENARIO: &str = "scenario";
    pub const METHOD: &str = "method";
    pub const STATUS: &str = "status";
    pub const URL: &str = "url";
    pub const NAME: &str = "name";
    pub const CHECK: &str = "check";
    pub const GROUP: &str = "group";
}
