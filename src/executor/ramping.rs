//! The `RampingVus` executor: a VU pool resized over time by a list of [`Stage`]s.
//!
//! A governor loop walks the stages. Within a stage it recomputes the target VU count
//! on every `tick` by linear interpolation from the count the stage started with
//! toward `stage.target`:
//!
//! ```text
//! t      = min(elapsed / duration, 1)
//! target = round(from + (to - from) * t)
//! ```
//!
//! Scaling up first revives VUs that were told to stop but have not exited yet, then
//! spawns new ones. A VU either gets revived or commits to exiting, never both, so a
//! revived VU always keeps looping. Scaling down raises the stop flag of the most recently started
//! VUs; they finish their current iteration and exit (graceful drain, never a
//! mid-body cancellation). Since new VUs are only spawned once no draining VU is left
//! to revive, the number of live VUs never exceeds the largest target reached so far.
//!
//! When the last stage ends every remaining VU is drained and joined.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::watch::{self, Sender},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, Executor, ScenarioOutcome, VirtualUser, VuStats, join_workers};
use crate::{
    error::{Error, Result},
    scenario::{Scenario, ScenarioBody, Stage},
};
use internals::*;

/// Executor that ramps the number of looping VUs through `stages`.
///
/// - `start_vus`: VUs running when the first stage begins.
/// - `tick`: how often the target is recomputed. Smaller ticks follow the ramp more
///   closely at the cost of more wakeups.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct RampingVus {
    #[builder(default = 1)]
    pub start_vus: u64,
    /// The sequence of ramp stages to execute.
    pub stages: Vec<Stage>,
    #[builder(default = Duration::from_secs(1))]
    pub tick: Duration,
}

impl RampingVus {
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Config("ramping-vus needs at least one stage".into()));
        }
        if self.tick.is_zero() {
            return Err(Error::Config("ramping-vus tick must be positive".into()));
        }
        Ok(())
    }

    /// Highest VU count this policy can reach.
    pub fn max_vus(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_vus))
            .max()
            .unwrap_or(self.start_vus)
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

impl Executor for RampingVus {
    async fn exec(&self, scenario: &Scenario, ctx: ExecutionContext) -> Result<ScenarioOutcome> {
        self.validate()?;

        let start = Instant::now();
        let mut shutdown = ctx.stop_signal(None);
        let mut pool = VuPool::new(Arc::clone(&scenario.body), ctx);

        tracing::info!(
            "Running scenario {}: ramping {} stages from {} VUs over {:?}",
            scenario.name,
            self.stages.len(),
            self.start_vus,
            self.total_duration()
        );
        pool.scale_to(self.start_vus).await;

        let mut current = self.start_vus;
        let n = self.stages.len();
        'stages: for (i, stage) in self.stages.iter().enumerate() {
            tracing::info!("Scenario {}: starting stage {}/{n}", scenario.name, i + 1);
            let from = current;
            let stage_start = Instant::now();
            let stage_end = stage_start + stage.duration;
            let mut next_tick = stage_start;

            loop {
                let elapsed = Instant::now().duration_since(stage_start);
                if elapsed >= stage.duration {
                    break;
                }
                pool.scale_to(calc_target_vus(elapsed, stage.duration, from, stage.target))
                    .await;

                next_tick += self.tick;
                tokio::select! {
                    _ = sleep_until(next_tick.min(stage_end)) => {}
                    _ = shutdown.wait() => {
                        tracing::info!("Scenario {} received shutdown signal.", scenario.name);
                        break 'stages;
                    }
                }
            }
            // Land exactly on the stage target so the next stage starts from it.
            pool.scale_to(stage.target).await;
            current = stage.target;
            tracing::info!("Scenario {}: finished stage {}/{n}", scenario.name, i + 1);
        }

        tracing::info!("Draining VUs of scenario {}...", scenario.name);
        let (stats, peak) = pool.drain().await;
        tracing::info!("Done running scenario: {}!", scenario.name);
        Ok(ScenarioOutcome::from_workers(stats, start.elapsed(), peak))
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components for the `RampingVus` executor.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// Pure function giving the VU target at `elapsed` into a stage ramping from
    /// `from` to `to` over `stage_duration`.
    pub fn calc_target_vus(elapsed: Duration, stage_duration: Duration, from: u64, to: u64) -> u64 {
        if stage_duration.is_zero() {
            return to;
        }
        // Interpolation factor [0.0..1.0]
        let t = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
        let target = from as f64 + (to as f64 - from as f64) * t;
        target.round().max(0.0) as u64
    }

    const RUNNING: u8 = 0;
    const STOPPING: u8 = 1;
    const EXITED: u8 = 2;

    /// Lifecycle of one pooled VU, shared between the pool and the VU task.
    /// `Stopping` leads to either `Running` (revived) or `Exited`, whichever swaps first.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct VuLife(Arc<AtomicU8>);

    impl VuLife {
        fn swap(&self, from: u8, to: u8) -> bool {
            self.0
                .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        }

        pub(crate) fn is_running(&self) -> bool {
            self.0.load(Ordering::Acquire) == RUNNING
        }

        pub(crate) fn is_stopping(&self) -> bool {
            self.0.load(Ordering::Acquire) == STOPPING
        }

        pub(crate) fn is_exited(&self) -> bool {
            self.0.load(Ordering::Acquire) == EXITED
        }

        pub(crate) fn stop(&self) -> bool {
            self.swap(RUNNING, STOPPING)
        }

        pub(crate) fn revive(&self) -> bool {
            self.swap(STOPPING, RUNNING)
        }

        /// Called by the VU between iterations; succeeds only if it was told to stop
        /// and nobody revived it since.
        pub(crate) fn try_exit(&self) -> bool {
            self.swap(STOPPING, EXITED)
        }

        fn exit(&self) {
            self.0.store(EXITED, Ordering::Release);
        }
    }

    pub(crate) struct VuHandle {
        life: VuLife,
        /// Wakes the VU from its think time.
        stop: Sender<bool>,
        join: JoinHandle<VuStats>,
    }

    impl VuHandle {
        fn halt(&self) {
            if self.life.stop() {
                self.stop.send_replace(true);
            }
        }

        fn revive(&self) -> bool {
            if self.life.revive() {
                self.stop.send_replace(false);
                true
            } else {
                false
            }
        }
    }

    /// The live VUs of one ramping scenario.
    pub(crate) struct VuPool {
        body: Arc<dyn ScenarioBody>,
        ctx: ExecutionContext,
        handles: Vec<VuHandle>,
        finished: Vec<VuStats>,
        next_id: u64,
        peak: u64,
    }

    impl VuPool {
        pub(crate) fn new(body: Arc<dyn ScenarioBody>, ctx: ExecutionContext) -> Self {
            Self {
                body,
                ctx,
                handles: Vec::new(),
                finished: Vec::new(),
                next_id: 1,
                peak: 0,
            }
        }

        /// VUs that are looping and not asked to stop.
        pub(crate) fn running(&self) -> u64 {
            self.handles.iter().filter(|h| h.life.is_running()).count() as u64
        }

        /// Live VUs, including those draining.
        pub(crate) fn alive(&self) -> u64 {
            self.handles.iter().filter(|h| !h.life.is_exited()).count() as u64
        }

        pub(crate) async fn scale_to(&mut self, target: u64) {
            self.reap().await;
            let mut running = self.running();

            if target > running {
                for handle in self.handles.iter().filter(|h| h.life.is_stopping()) {
                    if running >= target {
                        break;
                    }
                    // lost the race against the VU's own exit: replace it below
                    if handle.revive() {
                        running += 1;
                    }
                }
                while running < target {
                    self.spawn();
                    running += 1;
                }
            } else if target < running {
                let excess = (running - target) as usize;
                for handle in self
                    .handles
                    .iter()
                    .rev()
                    .filter(|h| h.life.is_running())
                    .take(excess)
                {
                    handle.halt();
                }
            }

            self.peak = self.peak.max(self.alive());
            self.ctx.sample_vus(self.alive() as usize);
        }

        fn spawn(&mut self) {
            let id = self.next_id;
            self.next_id += 1;

            let (stop, stop_rx) = watch::channel(false);
            let life = VuLife::default();
            let ctx = self.ctx.clone();
            let body = Arc::clone(&self.body);
            let join = tokio::spawn({
                let life = life.clone();
                async move {
                    let mut vu = VirtualUser::new(id, ctx.seed);
                    let mut stop = ctx.stop_signal(None).with_vu(stop_rx);
                    tracing::debug!("VU {id} of {} started.", ctx.scenario);

                    let mut iteration = 0;
                    while !stop.halted() && !life.try_exit() {
                        let think = vu.iterate(&body, &ctx, iteration).await;
                        iteration += 1;
                        stop.sleep(think).await;
                    }
                    life.exit();

                    tracing::debug!("VU {id} of {} shutting down.", ctx.scenario);
                    vu.stats()
                }
            });
            self.handles.push(VuHandle { life, stop, join });
        }

        /// Collect VUs that already exited.
        async fn reap(&mut self) {
            let (done, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
                .into_iter()
                .partition(|h| h.join.is_finished());
            self.handles = alive;
            if !done.is_empty() {
                let joins = done.into_iter().map(|h| h.join).collect();
                let stats = join_workers(&self.ctx.scenario, joins).await;
                self.finished.extend(stats);
            }
        }

        /// Stop every VU, wait for in-flight iterations, and return all stats and
        /// the peak number of live VUs.
        pub(crate) async fn drain(mut self) -> (Vec<VuStats>, u64) {
            for handle in &self.handles {
                handle.halt();
            }
            let joins = std::mem::take(&mut self.handles)
                .into_iter()
                .map(|h| h.join)
                .collect();
            let stats = join_workers(&self.ctx.scenario, joins).await;
            self.finished.extend(stats);
            self.ctx.sample_vus(0);
            (self.finished, self.peak)
        }
    }
}
