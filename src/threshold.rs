//! Pass/fail conditions over aggregated metrics.
//!
//! A threshold binds a [`Condition`] such as `p(95) < 1000` to a metric, optionally
//! scoped by a tag filter (`http_req_duration{scenario:smoke}`). Evaluation is a pure
//! read of the registry's current state: it can run mid-run as often as needed and
//! is repeated once more at finalization.
//!
//! Grammar of a condition:
//!
//! ```text
//! condition   = aggregation comparison number
//! aggregation = "count" | "rate" | "avg" | "min" | "max" | "med" | "p(" number ")"
//! comparison  = "<" | "<=" | ">" | ">=" | "==" | "!="
//! ```

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::Snapshot,
    error::{Error, Result},
    metric::{MetricKind, TagSet},
    registry::MetricsRegistry,
};

/// Which aggregate value a condition compares.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregation {
    /// Whether this aggregation is defined for a metric of `kind`.
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Count => true,
            Aggregation::Rate => kind == MetricKind::Rate,
            _ => kind == MetricKind::Trend,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Count => f.write_str("count"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "count" => Ok(Aggregation::Count),
            "rate" => Ok(Aggregation::Rate),
            "avg" => Ok(Aggregation::Avg),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "med" => Ok(Aggregation::Med),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{other}`"))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{inner}`"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Ok(Aggregation::Percentile(p))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// `aggregation comparison bound`, e.g. `rate < 0.05`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.aggregation, self.comparison, self.bound)
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let split = trimmed
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| Error::threshold(expr, "missing comparison operator"))?;
        let (lhs, rest) = trimmed.split_at(split);

        let (comparison, rhs) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .into_iter()
        .find_map(|(sym, cmp)| rest.strip_prefix(sym).map(|rhs| (cmp, rhs)))
        .ok_or_else(|| Error::threshold(expr, "invalid comparison operator"))?;

        let aggregation = lhs
            .trim()
            .parse::<Aggregation>()
            .map_err(|reason| Error::threshold(expr, reason))?;
        let bound: f64 = rhs
            .trim()
            .parse()
            .map_err(|_| Error::threshold(expr, format!("invalid bound `{}`", rhs.trim())))?;
        if !bound.is_finite() {
            return Err(Error::threshold(expr, "bound must be finite"));
        }

        Ok(Condition {
            aggregation,
            comparison,
            bound,
        })
    }
}

/// Outcome of evaluating one threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    /// No data to decide on. Reported as a failure, but kept apart from
    /// "failed its bound".
    Indeterminate,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Indeterminate => "no data",
        })
    }
}

/// A condition bound to a metric and an optional tag filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub filter: TagSet,
    pub condition: Condition,
    /// Stop the whole run as soon as a mid-run evaluation fails.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn new(metric: impl Into<String>, condition: Condition) -> Self {
        Self {
            metric: metric.into(),
            filter: TagSet::new(),
            condition,
            abort_on_fail: false,
        }
    }

    /// Parse a threshold from its key (`metric` or `metric{tag:value,...}`) and a
    /// condition expression.
    pub fn parse(key: &str, expr: &str) -> Result<Self> {
        let (metric, filter) = parse_key(key)?;
        Ok(Self {
            metric,
            filter,
            condition: expr.parse()?,
            abort_on_fail: false,
        })
    }

    pub fn with_filter(mut self, filter: TagSet) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    /// `metric` or `metric{k:v,...}`.
    pub fn key(&self) -> String {
        if self.filter.is_empty() {
            self.metric.clone()
        } else {
            format!("{}{}", self.metric, self.filter)
        }
    }

    /// Reject conditions that can never apply to a metric of `kind`.
    pub fn validate(&self, kind: MetricKind) -> Result<()> {
        if self.condition.aggregation.applies_to(kind) {
            Ok(())
        } else {
            Err(Error::threshold(
                self.condition.to_string(),
                format!(
                    "`{}` does not apply to {} metric `{}`",
                    self.condition.aggregation, kind, self.metric
                ),
            ))
        }
    }

    /// Decide the verdict for an aggregate. `None` means the metric does not exist yet
    /// and is treated as an empty stream.
    pub fn check(&self, snapshot: Option<&Snapshot>) -> (Verdict, Option<f64>) {
        let empty = snapshot.is_none_or(Snapshot::is_empty);
        let observed = match snapshot {
            Some(s) => measure(s, self.condition.aggregation),
            None if self.condition.aggregation == Aggregation::Count => Some(0.0),
            None => None,
        };

        let verdict = match observed {
            Some(v) if self.condition.comparison.holds(v, self.condition.bound) => Verdict::Pass,
            // the predicate needs at least one sample to hold
            _ if empty => Verdict::Indeterminate,
            // samples exist but the aggregation does not apply to their kind
            _ => Verdict::Fail,
        };
        (verdict, observed)
    }

    /// Evaluate against the registry's current state. Side-effect free.
    pub fn evaluate(&self, registry: &MetricsRegistry) -> ThresholdResult {
        let snapshot = registry.query(&self.metric, &self.filter);
        let (verdict, observed) = self.check(snapshot.as_ref());
        ThresholdResult {
            metric: self.key(),
            condition: self.condition.to_string(),
            verdict,
            observed,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

fn measure(snapshot: &Snapshot, aggregation: Aggregation) -> Option<f64> {
    match (snapshot, aggregation) {
        (Snapshot::Counter(c), Aggregation::Count) => Some(c.sum),
        (s, Aggregation::Count) => Some(s.samples() as f64),
        (Snapshot::Rate(r), Aggregation::Rate) => r.rate(),
        (Snapshot::Trend(t), Aggregation::Avg) => t.avg(),
        (Snapshot::Trend(t), Aggregation::Min) => t.min(),
        (Snapshot::Trend(t), Aggregation::Max) => t.max(),
        (Snapshot::Trend(t), Aggregation::Med) => t.med(),
        (Snapshot::Trend(t), Aggregation::Percentile(p)) => t.percentile(p),
        _ => None,
    }
}

fn parse_key(key: &str) -> Result<(String, TagSet)> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        if key.is_empty() {
            return Err(Error::threshold(key, "empty metric name"));
        }
        return Ok((key.to_owned(), TagSet::new()));
    };

    let metric = key[..open].trim();
    if metric.is_empty() {
        return Err(Error::threshold(key, "empty metric name"));
    }
    let body = key[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| Error::threshold(key, "unterminated tag filter"))?;

    let mut filter = TagSet::new();
    for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| Error::threshold(key, format!("tag filter `{pair}` is not key:value")))?;
        filter.insert(k.trim(), v.trim());
    }
    Ok((metric.to_owned(), filter))
}

/// Result of one threshold evaluation, as reported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub condition: String,
    pub verdict: Verdict,
    pub observed: Option<f64>,
    pub abort_on_fail: bool,
}

/// Evaluates a fixed set of thresholds against a shared, read-only registry.
#[derive(Clone, Debug)]
pub struct ThresholdEvaluator {
    registry: Arc<MetricsRegistry>,
    thresholds: Vec<Threshold>,
}

impl ThresholdEvaluator {
    /// Validates every threshold whose metric kind is already known.
    pub fn new(registry: Arc<MetricsRegistry>, thresholds: Vec<Threshold>) -> Result<Self> {
        for threshold in &thresholds {
            if let Some(kind) = registry.kind_of(&threshold.metric) {
                threshold.validate(kind)?;
            }
        }
        Ok(Self {
            registry,
            thresholds,
        })
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn evaluate_all(&self) -> Vec<ThresholdResult> {
        self.thresholds
            .iter()
            .map(|t| t.evaluate(&self.registry))
            .collect()
    }

    /// The first abort-on-fail threshold currently failing its bound, if any.
    pub fn abort_reason(&self) -> Option<ThresholdResult> {
        self.thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .map(|t| t.evaluate(&self.registry))
            .find(|r| r.verdict == Verdict::Fail)
    }
}

/// Logical AND of all verdicts; indeterminate counts as failed.
pub fn all_passed(results: &[ThresholdResult]) -> bool {
    results.iter().all(|r| r.verdict.is_pass())
}
