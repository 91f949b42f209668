use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::metric::MetricKind;

/// The `Aggregate` trait defines how raw metric samples are folded into an
/// intermediate, mergeable representation.
///
/// The registry keeps every [`crate::metric::Observation`] it receives, and queries
/// replay the matching ones into a fresh aggregate. Aggregates therefore only need to
/// be cheap to update and to merge; they are never retracted.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: per-stream views are merged in
///   arbitrary order when a tag filter spans several tag-sets.
/// - Each aggregate serves exactly one [`MetricKind`], exposed as [`Aggregate::KIND`].
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric kind this aggregate summarizes.
    const KIND: MetricKind;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple samples into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each sample.
    fn aggregate(&mut self, values: &[f64]) {
        values.iter().for_each(|v| self.consume(*v));
    }

    /// Incorporate a single sample into the aggregate.
    fn consume(&mut self, value: f64);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);

    /// Number of samples consumed so far.
    fn samples(&self) -> u64;
}

/// Monotonic sum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterAggregate {
    pub sum: f64,
    pub samples: u64,
}

impl Aggregate for CounterAggregate {
    const KIND: MetricKind = MetricKind::Counter;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.sum += value;
        self.samples += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.samples += other.samples;
    }

    fn samples(&self) -> u64 {
        self.samples
    }
}

/// Fraction of non-zero samples.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateAggregate {
    pub trues: u64,
    pub total: u64,
}

impl RateAggregate {
    /// `trues / total`, or `None` before the first sample.
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.trues as f64 / self.total as f64)
    }
}

impl Aggregate for RateAggregate {
    const KIND: MetricKind = MetricKind::Rate;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.total += 1;
        if value != 0.0 {
            self.trues += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }

    fn samples(&self) -> u64 {
        self.total
    }
}

/// Distribution of samples.
///
/// Keeps every raw sample so percentiles are exact. Memory grows linearly with the
/// sample count, which is fine for single-process runs; an approximate sketch would be
/// the replacement if that ever stops holding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendAggregate {
    pub values: Vec<f64>,
    pub sum: f64,
}

impl TrendAggregate {
    pub fn avg(&self) -> Option<f64> {
        (!self.values.is_empty()).then(|| self.sum / self.values.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().min_by(f64::total_cmp)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().max_by(f64::total_cmp)
    }

    pub fn med(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Percentile `p` in `[0, 100]`, linearly interpolated between closest ranks.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        percentile_of_sorted(&sorted, p)
    }

    /// Several percentiles with a single sort.
    pub fn percentiles(&self, ps: &[f64]) -> Vec<Option<f64>> {
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        ps.iter().map(|p| percentile_of_sorted(&sorted, *p)).collect()
    }
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

impl Aggregate for TrendAggregate {
    const KIND: MetricKind = MetricKind::Trend;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.values.push(value);
        self.sum += value;
    }

    fn merge(&mut self, mut other: Self) {
        self.values.append(&mut other.values);
        self.sum += other.sum;
    }

    fn samples(&self) -> u64 {
        self.values.len() as u64
    }
}

/// A kind-tagged aggregate, as returned by registry queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Snapshot {
    Counter(CounterAggregate),
    Rate(RateAggregate),
    Trend(TrendAggregate),
}

impl Snapshot {
    /// An empty snapshot of the given kind.
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Snapshot::Counter(CounterAggregate::new()),
            MetricKind::Rate => Snapshot::Rate(RateAggregate::new()),
            MetricKind::Trend => Snapshot::Trend(TrendAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Snapshot::Counter(_) => CounterAggregate::KIND,
            Snapshot::Rate(_) => RateAggregate::KIND,
            Snapshot::Trend(_) => TrendAggregate::KIND,
        }
    }

    pub fn consume(&mut self, value: f64) {
        match self {
            Snapshot::Counter(a) => a.consume(value),
            Snapshot::Rate(a) => a.consume(value),
            Snapshot::Trend(a) => a.consume(value),
        }
    }

    pub fn samples(&self) -> u64 {
        match self {
            Snapshot::Counter(a) => a.samples(),
            Snapshot::Rate(a) => a.samples(),
            Snapshot::Trend(a) => a.samples(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counts_non_zero_as_true() {
        let mut agg = RateAggregate::new();
        assert_eq!(agg.rate(), None);
        agg.aggregate(&[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(agg.rate(), Some(0.5));
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let mut agg = TrendAggregate::new();
        agg.aggregate(&[40.0, 10.0, 30.0, 20.0]);

        assert_eq!(agg.percentile(0.0), Some(10.0));
        assert_eq!(agg.percentile(100.0), Some(40.0));
        assert_eq!(agg.med(), Some(25.0));
        assert_eq!(agg.avg(), Some(25.0));
        assert_eq!(agg.min(), Some(10.0));
        assert_eq!(agg.max(), Some(40.0));
    }

    #[test]
    fn percentile_of_empty_and_single() {
        let mut agg = TrendAggregate::new();
        assert_eq!(agg.percentile(95.0), None);
        assert_eq!(agg.avg(), None);
        agg.consume(7.0);
        assert_eq!(agg.percentile(95.0), Some(7.0));
    }

    #[test]
    fn p95_ignores_a_small_slow_tail() {
        let mut agg = TrendAggregate::new();
        agg.aggregate(&[900.0; 96]);
        agg.aggregate(&[1200.0; 4]);
        assert!(agg.percentile(95.0).unwrap() < 1000.0);

        let mut agg = TrendAggregate::new();
        agg.aggregate(&[900.0; 90]);
        agg.aggregate(&[1200.0; 10]);
        assert!(agg.percentile(95.0).unwrap() >= 1200.0);
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = CounterAggregate::new();
        a.aggregate(&[1.0, 2.0]);
        let mut b = CounterAggregate::new();
        b.consume(3.0);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.sum, 6.0);
        assert_eq!(ab.samples, 3);
    }

    #[test]
    fn snapshot_dispatches_by_kind() {
        let mut snap = Snapshot::empty(MetricKind::Rate);
        snap.consume(1.0);
        snap.consume(0.0);
        assert_eq!(snap.kind(), MetricKind::Rate);
        assert_eq!(snap.samples(), 2);
        assert!(matches!(snap, Snapshot::Rate(ref r) if r.rate() == Some(0.5)));
    }
}
