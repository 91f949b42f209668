//! A fixed pool of VUs sharing a fixed number of iterations.
//!
//! Remaining iterations live in an `AtomicU64`. A VU claims one with a
//! compare-and-decrement before each body invocation, so the body runs exactly
//! `iterations` times in total no matter how many VUs race for them. The scenario
//! ends when the counter is exhausted or `max_duration` elapses, whichever comes
//! first; hitting `max_duration` is a normal stop.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{ExecutionContext, Executor, ScenarioOutcome, VirtualUser, join_workers};
use crate::{
    error::{Error, Result},
    scenario::Scenario,
};

#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct SharedIterations {
    /// Number of concurrent VUs.
    #[builder(default = 1)]
    pub vus: u64,
    /// Total number of body invocations across all VUs.
    #[builder(default = 1)]
    pub iterations: u64,
    /// Hard cap on the scenario's duration.
    #[builder(default = Duration::from_secs(600))]
    pub max_duration: Duration,
}

impl SharedIterations {
    pub fn validate(&self) -> Result<()> {
        if self.vus == 0 {
            return Err(Error::Config("shared-iterations needs at least one VU".into()));
        }
        if self.iterations == 0 {
            return Err(Error::Config(
                "shared-iterations needs at least one iteration".into(),
            ));
        }
        if self.max_duration.is_zero() {
            return Err(Error::Config("maxDuration must be positive".into()));
        }
        Ok(())
    }
}

/// Claim one iteration. Returns its 0-based index, or `None` once exhausted.
pub(crate) fn claim(remaining: &AtomicU64, total: u64) -> Option<u64> {
    remaining
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .ok()
        .map(|before| total - before)
}

impl Executor for SharedIterations {
    async fn exec(&self, scenario: &Scenario, ctx: ExecutionContext) -> Result<ScenarioOutcome> {
        self.validate()?;

        let start = Instant::now();
        let deadline = start + self.max_duration;
        let remaining = Arc::new(AtomicU64::new(self.iterations));
        // More VUs than iterations would only spawn idle workers.
        let workers = self.vus.min(self.iterations);

        tracing::info!(
            "Running scenario {}: {} iterations shared by {workers} VUs (max {:?})",
            scenario.name,
            self.iterations,
            self.max_duration
        );
        ctx.sample_vus(workers as usize);

        let handles = (1..=workers)
            .map(|id| {
                let ctx = ctx.clone();
                let body = Arc::clone(&scenario.body);
                let remaining = Arc::clone(&remaining);
                let total = self.iterations;

                tokio::spawn(async move {
                    let mut vu = VirtualUser::new(id, ctx.seed);
                    let mut stop = ctx.stop_signal(Some(deadline));
                    tracing::debug!("VU {id} of {} started.", ctx.scenario);

                    while !stop.is_set() {
                        let Some(iteration) = claim(&remaining, total) else {
                            break;
                        };
                        let think = vu.iterate(&body, &ctx, iteration).await;
                        if stop.sleep(think).await {
                            break;
                        }
                    }

                    tracing::debug!("VU {id} of {} shutting down.", ctx.scenario);
                    vu.stats()
                })
            })
            .collect();

        let stats = join_workers(&scenario.name, handles).await;
        ctx.sample_vus(0);

        let elapsed = start.elapsed();
        if Instant::now() >= deadline && remaining.load(Ordering::Acquire) > 0 {
            tracing::info!(
                "Scenario {} reached maxDuration with {} iterations left",
                scenario.name,
                remaining.load(Ordering::Acquire)
            );
        }
        tracing::info!("Done running scenario: {}!", scenario.name);
        Ok(ScenarioOutcome::from_workers(stats, elapsed, workers))
    }
}
