use std::{
    fmt,
    future::Future,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    executor::{ExecutionContext, Executor, RampingVus, ScenarioOutcome, SharedIterations},
    http::{self, Request, Response, Transport},
    metric::{MetricKind, TagSet, builtin, tag},
    registry::Recorder,
};

/// A timed segment of a ramping policy: reach `target` VUs by the end of `duration`.
///
/// A zero `duration` jumps to `target` immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// The scheduling policy of a scenario.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutorConfig {
    SharedIterations(SharedIterations),
    RampingVus(RampingVus),
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ExecutorConfig::SharedIterations(e) => e.validate(),
            ExecutorConfig::RampingVus(e) => e.validate(),
        }
    }

    /// The `executor` name used in declarative options.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorConfig::SharedIterations(_) => "shared-iterations",
            ExecutorConfig::RampingVus(_) => "ramping-vus",
        }
    }
}

impl From<SharedIterations> for ExecutorConfig {
    fn from(value: SharedIterations) -> Self {
        ExecutorConfig::SharedIterations(value)
    }
}

impl From<RampingVus> for ExecutorConfig {
    fn from(value: RampingVus) -> Self {
        ExecutorConfig::RampingVus(value)
    }
}

/// The user-supplied iteration logic shared by every VU of a scenario.
///
/// Implemented for any `Fn(IterationContext) -> Future<Output = anyhow::Result<()>>`.
/// An `Err` (or a panic) fails that single iteration only.
pub trait ScenarioBody: Send + Sync + 'static {
    fn call(&self, ctx: IterationContext) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> ScenarioBody for F
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, ctx: IterationContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(ctx))
    }
}

/// One traffic scenario. Immutable once the run starts.
#[derive(Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub executor: ExecutorConfig,
    /// Merged into every metric recorded within this scenario.
    #[builder(default)]
    pub tags: TagSet,
    /// Offset from the start of the run before this scenario begins.
    #[builder(default)]
    pub start_time: Duration,
    /// Base seed for the per-VU random generators; random when unset.
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
    pub body: Arc<dyn ScenarioBody>,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("executor", &self.executor)
            .field("tags", &self.tags)
            .field("start_time", &self.start_time)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl Scenario {
    /// The scenario identity stamped on its metrics: `scenario=<name>` plus its tags.
    pub fn identity_tags(&self) -> TagSet {
        TagSet::new()
            .with(tag::SCENARIO, self.name.as_str())
            .merged(&self.tags)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("scenario name must not be empty".into()));
        }
        self.executor
            .validate()
            .map_err(|e| Error::Config(format!("scenario `{}`: {e}", self.name)))
    }

    /// Wait for `start_time`, then drive the executor to completion.
    pub async fn run(&self, mut ctx: ExecutionContext) -> Result<ScenarioOutcome> {
        if !self.start_time.is_zero() {
            tracing::info!("Scenario {} starts in {:?}", self.name, self.start_time);
            if ctx.stop_signal(None).sleep(self.start_time).await {
                tracing::info!("Scenario {} stopped before starting", self.name);
                return Ok(ScenarioOutcome::default());
            }
        }

        ctx.set_seed(self.seed.unwrap_or_else(rand::random));
        match &self.executor {
            ExecutorConfig::SharedIterations(e) => e.exec(self, ctx).await,
            ExecutorConfig::RampingVus(e) => e.exec(self, ctx).await,
        }
    }
}

/// Everything a scenario body can see and do during one iteration.
///
/// Passed by value; clones share the recorder and the think-time request of the
/// iteration they were made from.
#[derive(Clone, Debug)]
pub struct IterationContext {
    pub(crate) scenario: Arc<str>,
    pub(crate) vu: u64,
    pub(crate) iteration: u64,
    pub(crate) recorder: Recorder,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) request_timeout: Duration,
    pub(crate) setup: Arc<Value>,
    pub(crate) think_time: Arc<AtomicU64>,
    pub(crate) rng: StdRng,
}

impl IterationContext {
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// 1-based id of the virtual user, unique within the scenario.
    pub fn vu(&self) -> u64 {
        self.vu
    }

    /// 0-based iteration number. Scenario-wide for shared iterations, per VU for ramping.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn tags(&self) -> &TagSet {
        self.recorder.tags()
    }

    /// The payload returned by the setup hook.
    pub fn setup_data(&self) -> &Value {
        &self.setup
    }

    pub async fn request(&self, request: Request) -> Response {
        http::send_recorded(&self.transport, self.request_timeout, &self.recorder, request).await
    }

    pub async fn get(&self, url: impl Into<String>) -> Response {
        self.request(Request::get(url)).await
    }

    /// Record a named boolean check into `checks` and return it.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        let value = if passed { 1.0 } else { 0.0 };
        self.recorder.record_builtin(
            builtin::CHECKS,
            MetricKind::Rate,
            value,
            &TagSet::new().with(tag::CHECK, name),
        );
        passed
    }

    /// Record a sample of a custom metric.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64) -> Result<()> {
        self.recorder.record(name, kind, value)
    }

    /// A context whose metrics carry `group=<name>`.
    pub fn group(&self, name: &str) -> IterationContext {
        self.with_tags(&TagSet::new().with(tag::GROUP, name))
    }

    pub fn with_tags(&self, tags: &TagSet) -> IterationContext {
        let mut ctx = self.clone();
        ctx.recorder = self.recorder.with_tags(tags);
        ctx
    }

    /// Ask the executor to pause this VU for `duration` after the iteration.
    pub fn think(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.think_time.store(nanos, Ordering::Relaxed);
    }

    /// A duration drawn uniformly from `range` using this VU's generator.
    pub fn jitter(&mut self, range: Range<Duration>) -> Duration {
        if range.is_empty() {
            return range.start;
        }
        let lo = u64::try_from(range.start.as_nanos()).unwrap_or(u64::MAX);
        let hi = u64::try_from(range.end.as_nanos()).unwrap_or(u64::MAX);
        if lo >= hi {
            return range.start;
        }
        Duration::from_nanos(self.rng.gen_range(lo..hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn ScenarioBody> {
        Arc::new(|_ctx: IterationContext| async { anyhow::Ok(()) })
    }

    #[test]
    fn identity_tags_include_the_name() {
        let scenario = Scenario::builder()
            .name("smoke")
            .executor(SharedIterations::builder().build())
            .tags(TagSet::new().with("env", "ci"))
            .body(noop())
            .build();

        let tags = scenario.identity_tags();
        assert_eq!(tags.get("scenario"), Some("smoke"));
        assert_eq!(tags.get("env"), Some("ci"));
    }

    #[test]
    fn validation_names_the_scenario() {
        let scenario = Scenario::builder()
            .name("load")
            .executor(RampingVus::builder().stages(vec![]).build())
            .body(noop())
            .build();

        let err = scenario.validate().unwrap_err().to_string();
        assert!(err.contains("load"), "{err}");

        let unnamed = Scenario::builder()
            .name(" ")
            .executor(SharedIterations::builder().build())
            .body(noop())
            .build();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn executor_kind_names() {
        let shared: ExecutorConfig = SharedIterations::builder().build().into();
        let ramping: ExecutorConfig = RampingVus::builder()
            .stages(vec![Stage::new(Duration::from_secs(1), 1)])
            .build()
            .into();
        assert_eq!(shared.kind(), "shared-iterations");
        assert_eq!(ramping.kind(), "ramping-vus");
    }
}
