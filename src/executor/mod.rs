//! Executor: scheduling of virtual users for one scenario
//!
//! The `Executor` trait is the runtime hook that drives a [`Scenario`]. Two executors
//! are provided:
//!
//! - [`SharedIterations`]: a fixed pool of VUs shares a fixed number of iterations.
//!   Each VU claims iterations from an atomic counter until none remain or the
//!   scenario's `max_duration` elapses.
//! - [`RampingVus`]: a governor task grows and shrinks the pool of looping VUs
//!   following a list of [`Stage`]s, recomputing the target on every `tick`.
//!
//! # High-level flow
//! 1. The run controller builds an [`ExecutionContext`] per scenario: a scenario-tagged
//!    recorder, the HTTP transport, the setup payload and the global shutdown receiver.
//! 2. The executor spawns worker tasks. Each worker owns a [`VirtualUser`] that
//!    repeatedly:
//!    - checks its stop conditions (global shutdown, its own stop flag, the deadline),
//!    - invokes the scenario body with a fresh [`IterationContext`],
//!    - records `iterations`, `iteration_duration` and `iteration_failed`,
//!    - sleeps for the think time the body asked for, waking early on stop,
//!    - yields to the scheduler, so a body that never awaits cannot starve the runtime.
//! 3. When the policy is done, the executor joins every worker and merges their
//!    [`VuStats`] into a [`ScenarioOutcome`].
//!
//! # Isolation & cancellation
//! - An iteration that returns `Err` or panics is recorded as failed; the VU carries on.
//! - Stop requests are only observed between iterations and during think time, so an
//!   iteration is never cancelled halfway through the body.
//!
//! [`IterationContext`]: crate::scenario::IterationContext
//! [`Stage`]: crate::scenario::Stage
pub mod ramping;
pub mod shared_iterations;

pub use ramping::RampingVus;
pub use shared_iterations::SharedIterations;

use std::{
    future::{Future, pending},
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::join_all};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::watch::Receiver,
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};

use crate::{
    error::Result,
    http::Transport,
    metric::{MetricKind, TagSet, builtin},
    registry::{MetricsRegistry, Recorder},
    scenario::{IterationContext, Scenario, ScenarioBody},
};

/// The runtime hook that executes a [`Scenario`].
pub trait Executor
where
    Self: Send + Sync + Sized,
{
    /// Execute the scenario to its natural end (or until the global stop) and
    /// return what its VUs did.
    fn exec(
        &self,
        scenario: &Scenario,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<ScenarioOutcome>> + Send;
}

/// Shared, read-only state for every worker of one scenario.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub(crate) scenario: Arc<str>,
    pub(crate) recorder: Recorder,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) request_timeout: Duration,
    pub(crate) setup: Arc<Value>,
    pub(crate) shutdown: Receiver<bool>,
    pub(crate) seed: u64,
}

impl ExecutionContext {
    pub fn new(
        scenario: &Scenario,
        registry: &Arc<MetricsRegistry>,
        transport: Arc<dyn Transport>,
        shutdown: Receiver<bool>,
    ) -> Self {
        Self {
            scenario: Arc::from(scenario.name.as_str()),
            recorder: registry.recorder(scenario.identity_tags()),
            transport,
            request_timeout: Duration::from_secs(60),
            setup: Arc::new(Value::Null),
            shutdown,
            seed: scenario.seed.unwrap_or_default(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_setup(mut self, setup: Arc<Value>) -> Self {
        self.setup = setup;
        self
    }

    pub(crate) fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// A stop signal combining the global shutdown with optional VU-level conditions.
    pub(crate) fn stop_signal(&self, deadline: Option<Instant>) -> StopSignal {
        StopSignal {
            shutdown: self.shutdown.clone(),
            vu: None,
            deadline,
        }
    }

    pub(crate) fn sample_vus(&self, active: usize) {
        self.recorder
            .record_builtin(builtin::VUS, MetricKind::Trend, active as f64, &TagSet::new());
    }
}

/// Everything that can tell a VU to stop looping.
#[derive(Debug)]
pub(crate) struct StopSignal {
    shutdown: Receiver<bool>,
    vu: Option<Receiver<bool>>,
    deadline: Option<Instant>,
}

impl StopSignal {
    pub(crate) fn with_vu(mut self, vu: Receiver<bool>) -> Self {
        self.vu = Some(vu);
        self
    }

    pub(crate) fn is_set(&self) -> bool {
        self.halted() || self.vu.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Global shutdown or deadline, ignoring the VU's own flag.
    pub(crate) fn halted(&self) -> bool {
        *self.shutdown.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once any stop condition is met.
    pub(crate) async fn wait(&mut self) {
        let Self {
            shutdown,
            vu,
            deadline,
        } = self;

        let vu_stop = async move {
            match vu {
                Some(rx) => raised(rx).await,
                None => pending().await,
            }
        };
        let timed_out = async move {
            match deadline {
                Some(d) => sleep_until(*d).await,
                None => pending().await,
            }
        };

        tokio::select! {
            _ = raised(shutdown) => {}
            _ = vu_stop => {}
            _ = timed_out => {}
        }
    }

    /// Sleep for `duration` unless a stop arrives first. Returns `true` if stopped.
    pub(crate) async fn sleep(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_set();
        }
        tokio::select! {
            _ = sleep(duration) => self.is_set(),
            _ = self.wait() => true,
        }
    }
}

/// Waits for the flag to turn `true`. A dropped sender never fires.
async fn raised(rx: &mut Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        pending::<()>().await;
    }
}

/// Per-VU counters, merged into the scenario outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VuStats {
    pub iterations: u64,
    pub failed_iterations: u64,
}

impl VuStats {
    pub fn merge(&mut self, other: VuStats) {
        self.iterations += other.iterations;
        self.failed_iterations += other.failed_iterations;
    }
}

/// What one scenario executor did.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub iterations: u64,
    pub failed_iterations: u64,
    pub elapsed: Duration,
    pub peak_vus: u64,
}

impl ScenarioOutcome {
    pub(crate) fn from_workers(stats: Vec<VuStats>, elapsed: Duration, peak_vus: u64) -> Self {
        let mut total = VuStats::default();
        stats.into_iter().for_each(|s| total.merge(s));
        Self {
            iterations: total.iterations,
            failed_iterations: total.failed_iterations,
            elapsed,
            peak_vus,
        }
    }
}

/// A logical execution unit bound to one scenario.
///
/// Owns nothing beyond its counters and its private random generator.
#[derive(Debug)]
pub struct VirtualUser {
    id: u64,
    rng: StdRng,
    stats: VuStats,
}

impl VirtualUser {
    pub(crate) fn new(id: u64, scenario_seed: u64) -> Self {
        let seed = scenario_seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self {
            id,
            rng: StdRng::seed_from_u64(seed),
            stats: VuStats::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> VuStats {
        self.stats
    }

    /// Run the body once. Returns the think time the body asked for.
    pub(crate) async fn iterate(
        &mut self,
        body: &Arc<dyn ScenarioBody>,
        ctx: &ExecutionContext,
        iteration: u64,
    ) -> Duration {
        let think_time = Arc::new(AtomicU64::new(0));
        let iteration_ctx = IterationContext {
            scenario: Arc::clone(&ctx.scenario),
            vu: self.id,
            iteration,
            recorder: ctx.recorder.clone(),
            transport: Arc::clone(&ctx.transport),
            request_timeout: ctx.request_timeout,
            setup: Arc::clone(&ctx.setup),
            think_time: Arc::clone(&think_time),
            rng: StdRng::seed_from_u64(self.rng.next_u64()),
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(async { body.call(iteration_ctx).await })
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::warn!(
                    "Scenario {} VU {} iteration {iteration} failed: {e:#}",
                    ctx.scenario,
                    self.id
                );
                true
            }
            Err(_) => {
                tracing::error!(
                    "Scenario {} VU {} iteration {iteration} panicked",
                    ctx.scenario,
                    self.id
                );
                true
            }
        };

        let none = TagSet::new();
        ctx.recorder
            .record_builtin(builtin::ITERATIONS, MetricKind::Counter, 1.0, &none);
        ctx.recorder.record_builtin(
            builtin::ITERATION_DURATION,
            MetricKind::Trend,
            elapsed.as_secs_f64() * 1000.0,
            &none,
        );
        ctx.recorder.record_builtin(
            builtin::ITERATION_FAILED,
            MetricKind::Rate,
            if failed { 1.0 } else { 0.0 },
            &none,
        );

        self.stats.iterations += 1;
        if failed {
            self.stats.failed_iterations += 1;
        }
        // a body with no pending await never hands control back otherwise
        tokio::task::yield_now().await;
        Duration::from_nanos(think_time.load(Ordering::Relaxed))
    }
}

/// Join worker tasks. A panicked worker contributes empty stats instead of
/// taking the whole scenario down.
pub(crate) async fn join_workers(scenario: &str, handles: Vec<JoinHandle<VuStats>>) -> Vec<VuStats> {
    join_all(handles)
        .await
        .into_iter()
        .map(|res| match res {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!("Worker of scenario {scenario} panicked with error: {e}");
                VuStats::default()
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        aggregate::Snapshot,
        http::tests::StubTransport,
        scenario::Scenario,
    };
    use tokio::sync::watch;

    pub(crate) fn context(
        scenario: &Scenario,
        registry: &Arc<MetricsRegistry>,
    ) -> (ExecutionContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let transport = Arc::new(StubTransport {
            status: 200,
            delay: Duration::from_millis(10),
        });
        (ExecutionContext::new(scenario, registry, transport, rx), tx)
    }

    fn scenario(body: Arc<dyn ScenarioBody>) -> Scenario {
        Scenario::builder()
            .name("unit")
            .executor(SharedIterations::builder().build())
            .seed(7)
            .body(body)
            .build()
    }

    #[tokio::test]
    async fn failed_and_panicking_iterations_are_isolated() {
        let body: Arc<dyn ScenarioBody> = Arc::new(|ctx: IterationContext| async move {
            match ctx.iteration() {
                0 => anyhow::bail!("boom"),
                1 => panic!("kaboom"),
                _ => anyhow::Ok(()),
            }
        });
        let scenario = scenario(body.clone());
        let registry = Arc::new(MetricsRegistry::with_builtins());
        let (ctx, _tx) = context(&scenario, &registry);

        let mut vu = VirtualUser::new(1, 7);
        for i in 0..3 {
            vu.iterate(&body, &ctx, i).await;
        }

        assert_eq!(
            vu.stats(),
            VuStats {
                iterations: 3,
                failed_iterations: 2
            }
        );
        let Some(Snapshot::Rate(failed)) = registry.query(builtin::ITERATION_FAILED, &TagSet::new())
        else {
            panic!("expected rate");
        };
        assert_eq!((failed.trues, failed.total), (2, 3));
        let obs = registry.stream(builtin::ITERATIONS).unwrap().observations();
        assert!(obs.iter().all(|o| o.tags.get("scenario") == Some("unit")));
    }

    #[tokio::test]
    async fn think_time_is_reported_back() {
        let body: Arc<dyn ScenarioBody> = Arc::new(|ctx: IterationContext| async move {
            ctx.think(Duration::from_millis(500));
            anyhow::Ok(())
        });
        let scenario = scenario(body.clone());
        let registry = Arc::new(MetricsRegistry::new());
        let (ctx, _tx) = context(&scenario, &registry);

        let think = VirtualUser::new(1, 0).iterate(&body, &ctx, 0).await;
        assert_eq!(think, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn vu_generators_are_seeded_per_vu() {
        let mut a = VirtualUser::new(1, 42);
        let mut b = VirtualUser::new(1, 42);
        let mut c = VirtualUser::new(2, 42);
        let (x, y, z) = (a.rng.next_u64(), b.rng.next_u64(), c.rng.next_u64());
        assert_eq!(x, y);
        assert_ne!(x, z);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_cuts_sleep_short() {
        let (tx, rx) = watch::channel(false);
        let mut signal = StopSignal {
            shutdown: rx,
            vu: None,
            deadline: None,
        };

        let start = Instant::now();
        let stopper = tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
            tx
        });
        assert!(signal.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(stopper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_and_vu_flag_stop_too() {
        let (_tx, rx) = watch::channel(false);
        let mut signal = StopSignal {
            shutdown: rx.clone(),
            vu: None,
            deadline: Some(Instant::now() + Duration::from_secs(3)),
        };
        assert!(!signal.is_set());
        assert!(signal.sleep(Duration::from_secs(10)).await);
        assert!(signal.is_set());

        let (vu_tx, vu_rx) = watch::channel(false);
        let mut signal = StopSignal {
            shutdown: rx,
            vu: None,
            deadline: None,
        }
        .with_vu(vu_rx);
        assert!(!signal.sleep(Duration::from_millis(10)).await);
        vu_tx.send_replace(true);
        assert!(signal.is_set());
    }
}
