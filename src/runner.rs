//! Run Controller: owns one run from setup to the final verdict.
//!
//! ```text
//! Idle → SettingUp → Running → TearingDown → Finalized
//! ```
//!
//! - `SettingUp` invokes [`Hooks::setup`] once. A failure is fatal: no scenario starts
//!   and [`Runner::run`] returns [`Error::Setup`].
//! - `Running` starts every scenario concurrently and waits for all of them. A global
//!   stop (from a [`StopHandle`] or an abort-on-fail threshold) makes every executor
//!   stop scheduling new iterations and drain the ones in flight.
//! - `TearingDown` invokes [`Hooks::teardown`] once with the setup payload. Failures
//!   are logged and never change the verdict.
//! - `Finalized` evaluates every threshold and assembles the [`RunResult`].
use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{FutureExt, future::join_all};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::watch::{self, Receiver, Sender},
    time::{Instant, MissedTickBehavior, interval},
};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    executor::{ExecutionContext, ScenarioOutcome},
    http::{ReqwestTransport, Transport},
    registry::MetricsRegistry,
    report::{RunResult, ScenarioSummary},
    scenario::Scenario,
    threshold::{Threshold, ThresholdEvaluator, ThresholdResult, all_passed},
};

/// Lifecycle of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    SettingUp,
    Running,
    TearingDown,
    Finalized,
}

/// Setup and teardown callbacks. Both default to no-ops.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Runs once before any scenario. The payload is shared read-only with every
    /// iteration and handed to [`Hooks::teardown`].
    async fn setup(&self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    /// Runs once after every scenario finished.
    async fn teardown(&self, _data: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Requests a graceful global stop of a run. Cloneable; usable before or during the run.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("Stop requested.");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Runs a set of scenarios against shared thresholds and hooks.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use loadgate::{Runner, Scenario, Threshold, executor::SharedIterations, scenario::IterationContext};
/// # async fn demo() -> loadgate::Result<()> {
/// let result = Runner::builder()
///     .scenarios(vec![
///         Scenario::builder()
///             .name("smoke")
///             .executor(SharedIterations::builder().vus(2).iterations(5).build())
///             .body(Arc::new(|ctx: IterationContext| async move {
///                 let res = ctx.get("http://localhost:3000/").await;
///                 ctx.check("status is 200", res.status == 200);
///                 anyhow::Ok(())
///             }))
///             .build(),
///     ])
///     .thresholds(vec![Threshold::parse("http_req_failed", "rate < 0.05")?])
///     .build()
///     .run()
///     .await?;
/// std::process::exit(result.exit_status().into());
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Runner {
    scenarios: Vec<Scenario>,
    #[builder(default)]
    thresholds: Vec<Threshold>,
    #[builder(default = Arc::new(NoHooks))]
    hooks: Arc<dyn Hooks>,
    #[builder(default = Arc::new(ReqwestTransport::default()))]
    transport: Arc<dyn Transport>,
    /// Upper bound on a single request; an expired request is recorded as failed.
    #[builder(default = Duration::from_secs(60))]
    request_timeout: Duration,
    /// How often abort-on-fail thresholds are checked while running.
    #[builder(default = Duration::from_secs(2))]
    threshold_interval: Duration,
    /// Pre-populated with the built-in metrics; declare custom metrics on it to have
    /// their thresholds validated up front.
    #[builder(default = Arc::new(MetricsRegistry::with_builtins()))]
    registry: Arc<MetricsRegistry>,
    #[builder(default = Arc::new(watch::channel(false).0), setter(skip))]
    stop_tx: Arc<Sender<bool>>,
    #[builder(default = watch::channel(RunState::Idle).0, setter(skip))]
    state_tx: Sender<RunState>,
}

impl Runner {
    pub fn registry(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> Receiver<RunState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: RunState) {
        tracing::info!("Run state: {state:?}");
        self.state_tx.send_replace(state);
    }

    fn validate(&self) -> Result<()> {
        if self.scenarios.is_empty() {
            return Err(Error::Config("at least one scenario is required".into()));
        }
        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !names.insert(scenario.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate scenario name `{}`",
                    scenario.name
                )));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be positive".into()));
        }
        if self.threshold_interval.is_zero() {
            return Err(Error::Config("threshold interval must be positive".into()));
        }
        Ok(())
    }

    /// Drive the run to completion.
    ///
    /// Returns `Err` only for invalid configuration or a failed setup. Failed
    /// thresholds are reported through [`RunResult::passed`].
    pub async fn run(self) -> Result<RunResult> {
        self.validate()?;
        let evaluator = ThresholdEvaluator::new(Arc::clone(&self.registry), self.thresholds.clone())?;
        let started = Instant::now();

        self.set_state(RunState::SettingUp);
        let setup = match self.setup().await {
            Ok(data) => Arc::new(data),
            Err(e) => {
                tracing::error!("Setup failed, no scenario will run: {e:#}");
                self.set_state(RunState::Finalized);
                return Err(Error::Setup(e));
            }
        };

        self.set_state(RunState::Running);
        let (outcomes, abort) = self.run_scenarios(&evaluator, &setup).await;
        let stopped = *self.stop_tx.borrow();

        self.set_state(RunState::TearingDown);
        self.teardown(&setup).await;

        let thresholds = evaluator.evaluate_all();
        let passed = all_passed(&thresholds);
        let scenarios = self
            .scenarios
            .iter()
            .zip(&outcomes)
            .map(|(scenario, outcome)| ScenarioSummary::collect(scenario, outcome, &self.registry))
            .collect();
        let result = RunResult {
            passed,
            aborted: abort.is_some(),
            stopped,
            thresholds,
            scenarios,
            setup_data: Value::clone(&setup),
            duration: started.elapsed(),
        };

        self.set_state(RunState::Finalized);
        if result.passed {
            tracing::info!("Run passed in {:?}", result.duration);
        } else {
            tracing::info!(
                "Run failed: {} threshold(s) not met",
                result.failed_thresholds().count()
            );
        }
        Ok(result)
    }

    async fn setup(&self) -> anyhow::Result<Value> {
        tracing::info!("Running setup...");
        match AssertUnwindSafe(self.hooks.setup()).catch_unwind().await {
            Ok(res) => res,
            Err(_) => Err(anyhow::anyhow!("setup panicked")),
        }
    }

    async fn teardown(&self, data: &Value) {
        tracing::info!("Running teardown...");
        match AssertUnwindSafe(self.hooks.teardown(data)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Teardown failed: {e:#}"),
            Err(_) => tracing::warn!("Teardown panicked"),
        }
    }

    /// Run every scenario concurrently while watching abort-on-fail thresholds.
    async fn run_scenarios(
        &self,
        evaluator: &ThresholdEvaluator,
        setup: &Arc<Value>,
    ) -> (Vec<ScenarioOutcome>, Option<ThresholdResult>) {
        let shutdown = self.stop_tx.subscribe();
        let runs = self.scenarios.iter().map(|scenario| {
            let ctx = ExecutionContext::new(
                scenario,
                &self.registry,
                Arc::clone(&self.transport),
                shutdown.clone(),
            )
            .with_request_timeout(self.request_timeout)
            .with_setup(Arc::clone(setup));
            async move {
                match scenario.run(ctx).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("Scenario {} failed to run: {e}", scenario.name);
                        ScenarioOutcome::default()
                    }
                }
            }
        });
        let all = join_all(runs);
        tokio::pin!(all);

        tokio::select! {
            outcomes = &mut all => (outcomes, None),
            reason = self.watch_thresholds(evaluator) => {
                tracing::warn!(
                    "Threshold {} '{}' crossed (observed {:?}), stopping the run",
                    reason.metric,
                    reason.condition,
                    reason.observed
                );
                self.stop_tx.send_replace(true);
                (all.await, Some(reason))
            }
        }
    }

    /// Resolves with the first failing abort-on-fail threshold; never resolves if
    /// there is none.
    async fn watch_thresholds(&self, evaluator: &ThresholdEvaluator) -> ThresholdResult {
        if !evaluator.thresholds().iter().any(|t| t.abort_on_fail) {
            return std::future::pending().await;
        }
        let mut ticker = interval(self.threshold_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(reason) = evaluator.abort_reason() {
                return reason;
            }
        }
    }
}
