//! Run results and the reporters that present them.
//!
//! A [`RunResult`] is the processed form of a finished run: threshold verdicts plus a
//! [`ScenarioSummary`] per scenario. It is plain data (no I/O) created once at
//! finalization. A [`Reporter`] consumes it and performs side effects, such as printing
//! a human summary or emitting JSON.
use std::{
    fmt::{self, Display},
    process::ExitCode,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    aggregate::{Snapshot, TrendAggregate},
    error::Result,
    executor::ScenarioOutcome,
    metric::{TagSet, builtin, tag},
    registry::MetricsRegistry,
    scenario::Scenario,
    threshold::{ThresholdResult, Verdict},
};

/// Exit status of a run whose thresholds failed.
pub const THRESHOLDS_FAILED_EXIT: u8 = 99;

/// Distribution summary of a trend, in the trend's unit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
}

impl TrendStats {
    pub fn from_trend(trend: &TrendAggregate) -> Option<Self> {
        let [med, p90, p95] = trend.percentiles(&[50.0, 90.0, 95.0])[..] else {
            return None;
        };
        Some(Self {
            avg: trend.avg()?,
            min: trend.min()?,
            med: med?,
            max: trend.max()?,
            p90: p90?,
            p95: p95?,
        })
    }
}

impl Display for TrendStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2}",
            self.avg, self.min, self.med, self.max, self.p90, self.p95
        )
    }
}

/// Per-scenario figures, read from the registry through the scenario tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub executor: String,
    pub iterations: u64,
    pub failed_iterations: u64,
    pub requests: u64,
    /// Fraction of failed requests; `None` when no request was sent.
    pub failure_rate: Option<f64>,
    pub checks_passed: u64,
    pub checks_failed: u64,
    /// `http_req_duration` in milliseconds.
    pub duration: Option<TrendStats>,
    pub elapsed: Duration,
    pub peak_vus: u64,
}

impl ScenarioSummary {
    pub(crate) fn collect(
        scenario: &Scenario,
        outcome: &ScenarioOutcome,
        registry: &MetricsRegistry,
    ) -> Self {
        let filter = TagSet::new().with(tag::SCENARIO, scenario.name.as_str());

        let requests = match registry.query(builtin::HTTP_REQS, &filter) {
            Some(Snapshot::Counter(c)) => c.sum as u64,
            _ => 0,
        };
        let failure_rate = match registry.query(builtin::HTTP_REQ_FAILED, &filter) {
            Some(Snapshot::Rate(r)) => r.rate(),
            _ => None,
        };
        let (checks_passed, checks_failed) = match registry.query(builtin::CHECKS, &filter) {
            Some(Snapshot::Rate(r)) => (r.trues, r.total - r.trues),
            _ => (0, 0),
        };
        let duration = match registry.query(builtin::HTTP_REQ_DURATION, &filter) {
            Some(Snapshot::Trend(t)) => TrendStats::from_trend(&t),
            _ => None,
        };

        Self {
            name: scenario.name.clone(),
            executor: scenario.executor.kind().to_owned(),
            iterations: outcome.iterations,
            failed_iterations: outcome.failed_iterations,
            requests,
            failure_rate,
            checks_passed,
            checks_failed,
            duration,
            elapsed: outcome.elapsed,
            peak_vus: outcome.peak_vus,
        }
    }
}

/// The immutable outcome of a finalized run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Logical AND of every threshold verdict; `indeterminate` counts as failed.
    pub passed: bool,
    /// An abort-on-fail threshold stopped the run early.
    pub aborted: bool,
    /// A global stop (operator or abort) ended the scenarios before their natural end.
    pub stopped: bool,
    pub thresholds: Vec<ThresholdResult>,
    pub scenarios: Vec<ScenarioSummary>,
    pub setup_data: Value,
    pub duration: Duration,
}

impl RunResult {
    /// `0` on pass, `99` when thresholds failed.
    pub fn exit_status(&self) -> u8 {
        if self.passed { 0 } else { THRESHOLDS_FAILED_EXIT }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.verdict.is_pass())
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioSummary> {
        self.scenarios.iter().find(|s| s.name == name)
    }
}

impl Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "thresholds:")?;
        if self.thresholds.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for t in &self.thresholds {
            let mark = match t.verdict {
                Verdict::Pass => '✓',
                Verdict::Fail => '✗',
                Verdict::Indeterminate => '?',
            };
            let observed = t
                .observed
                .map_or_else(|| "-".to_owned(), |v| format!("{v:.4}"));
            writeln!(
                f,
                "  {mark} {} '{}' {} (observed {observed})",
                t.metric, t.condition, t.verdict
            )?;
        }

        writeln!(f, "scenarios:")?;
        for s in &self.scenarios {
            writeln!(
                f,
                "  {} [{}] iterations={} failed={} vus_max={} elapsed={:.1?}",
                s.name, s.executor, s.iterations, s.failed_iterations, s.peak_vus, s.elapsed
            )?;
            let failure = s
                .failure_rate
                .map_or_else(|| "-".to_owned(), |r| format!("{:.2}%", r * 100.0));
            writeln!(
                f,
                "    http_reqs={} failed={failure} checks={}/{}",
                s.requests,
                s.checks_passed,
                s.checks_passed + s.checks_failed
            )?;
            if let Some(d) = &s.duration {
                writeln!(f, "    http_req_duration {d}")?;
            }
        }

        let verdict = match (self.passed, self.aborted) {
            (true, _) => "PASSED",
            (false, true) => "ABORTED (threshold crossed)",
            (false, false) => "FAILED",
        };
        write!(f, "run {verdict} in {:.1?}", self.duration)
    }
}

/// A [`Reporter`] consumes a [`RunResult`] and performs side effects: displaying it,
/// sending it to a service, or persisting it somewhere.
#[async_trait]
pub trait Reporter {
    async fn report(&self, result: &RunResult) -> Result<()>;
}

/// Prints the human-readable summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, result: &RunResult) -> Result<()> {
        println!("{result}");
        Ok(())
    }
}

/// Prints the result as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonReporter {
    pub pretty: bool,
}

impl JsonReporter {
    pub fn render(&self, result: &RunResult) -> Result<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(result)?
        } else {
            serde_json::to_string(result)?
        };
        Ok(json)
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn report(&self, result: &RunResult) -> Result<()> {
        println!("{}", self.render(result)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        executor::SharedIterations,
        metric::MetricKind,
        scenario::{IterationContext, ScenarioBody},
    };

    fn scenario(name: &str) -> Scenario {
        let body: Arc<dyn ScenarioBody> = Arc::new(|_ctx: IterationContext| async { anyhow::Ok(()) });
        Scenario::builder()
            .name(name)
            .executor(SharedIterations::builder().build())
            .body(body)
            .build()
    }

    fn record(registry: &MetricsRegistry, scenario: &str, metric: &str, kind: MetricKind, value: f64) {
        registry
            .record(metric, kind, value, TagSet::new().with(tag::SCENARIO, scenario))
            .unwrap();
    }

    fn result(passed: bool, thresholds: Vec<ThresholdResult>) -> RunResult {
        RunResult {
            passed,
            aborted: false,
            stopped: false,
            thresholds,
            scenarios: vec![],
            setup_data: Value::Null,
            duration: Duration::from_secs(3),
        }
    }

    #[test]
    fn summary_is_scoped_to_its_scenario() {
        let registry = MetricsRegistry::with_builtins();
        for (i, ms) in [100.0, 200.0, 300.0, 400.0].into_iter().enumerate() {
            record(&registry, "smoke", builtin::HTTP_REQS, MetricKind::Counter, 1.0);
            record(&registry, "smoke", builtin::HTTP_REQ_DURATION, MetricKind::Trend, ms);
            let failed = if i == 0 { 1.0 } else { 0.0 };
            record(&registry, "smoke", builtin::HTTP_REQ_FAILED, MetricKind::Rate, failed);
            record(&registry, "smoke", builtin::CHECKS, MetricKind::Rate, 1.0 - failed);
        }
        record(&registry, "load", builtin::HTTP_REQS, MetricKind::Counter, 1.0);
        record(&registry, "load", builtin::HTTP_REQ_DURATION, MetricKind::Trend, 9000.0);

        let outcome = ScenarioOutcome {
            iterations: 4,
            failed_iterations: 0,
            elapsed: Duration::from_secs(2),
            peak_vus: 2,
        };
        let summary = ScenarioSummary::collect(&scenario("smoke"), &outcome, &registry);

        assert_eq!(summary.executor, "shared-iterations");
        assert_eq!(summary.requests, 4);
        assert_eq!(summary.failure_rate, Some(0.25));
        assert_eq!((summary.checks_passed, summary.checks_failed), (3, 1));
        let d = summary.duration.unwrap();
        assert_eq!(d.max, 400.0);
        assert_eq!(d.avg, 250.0);
        assert_eq!(d.med, 250.0);
    }

    #[test]
    fn empty_scenario_has_no_rates() {
        let registry = MetricsRegistry::with_builtins();
        let summary =
            ScenarioSummary::collect(&scenario("idle"), &ScenarioOutcome::default(), &registry);
        assert_eq!(summary.requests, 0);
        assert_eq!(summary.failure_rate, None);
        assert_eq!(summary.duration, None);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(result(true, vec![]).exit_status(), 0);
        assert_eq!(result(false, vec![]).exit_status(), 99);
    }

    #[test]
    fn summary_explains_no_data_apart_from_failure() {
        let thresholds = vec![
            ThresholdResult {
                metric: "http_req_failed".into(),
                condition: "rate < 0.05".into(),
                verdict: Verdict::Fail,
                observed: Some(0.06),
                abort_on_fail: false,
            },
            ThresholdResult {
                metric: "http_reqs".into(),
                condition: "count > 0".into(),
                verdict: Verdict::Indeterminate,
                observed: Some(0.0),
                abort_on_fail: false,
            },
        ];
        let result = result(false, thresholds);
        let text = result.to_string();

        assert!(text.contains("✗ http_req_failed 'rate < 0.05' fail"), "{text}");
        assert!(text.contains("? http_reqs 'count > 0' no data"), "{text}");
        assert!(text.ends_with("run FAILED in 3.0s"), "{text}");
        assert_eq!(result.failed_thresholds().count(), 2);
    }

    #[test]
    fn json_rendering() {
        let json = JsonReporter::default().render(&result(true, vec![])).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["passed"], Value::Bool(true));
        assert!(value["thresholds"].as_array().unwrap().is_empty());
    }
}
