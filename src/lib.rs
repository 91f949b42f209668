//! Loadgate: scenario-driven load generation with pass/fail thresholds.
//!
//! A run replays a user-supplied async body from many concurrent virtual users (VUs),
//! records what happens into tagged metric streams, and decides at the end whether the
//! system under test met its thresholds. The process exit code carries that verdict, so
//! a run can gate a CI pipeline.
//!
//! # Architecture
//!
//! - [`Scenario`]: a name, a tag-set, an executor policy and the body every VU replays.
//! - [`Executor`]: the scheduling policy. [`SharedIterations`] spreads a fixed number of
//!   iterations over a fixed pool of VUs; [`RampingVus`] grows and shrinks the pool
//!   through timed stages.
//! - [`MetricsRegistry`]: append-only, concurrent-safe metric streams of `Counter`,
//!   `Rate` and `Trend` observations, queried with exact-match tag filters.
//! - [`Threshold`]: a condition such as `p(95) < 1000` on a metric, evaluated to
//!   `pass`, `fail` or `indeterminate` (no data).
//! - [`Runner`]: the run controller. It runs setup, every scenario concurrently,
//!   teardown, and finally evaluates the thresholds into a [`RunResult`].
//! - [`Reporter`]: presents a [`RunResult`] (stdout summary, JSON).
//!
//! Scenarios can also be declared in the k6 options shape with [`config::Options`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{process::ExitCode, sync::Arc, time::Duration};
//!
//! use loadgate::{
//!     Reporter, Runner, Scenario, Threshold,
//!     executor::SharedIterations,
//!     report::StdoutReporter,
//!     scenario::IterationContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> loadgate::Result<ExitCode> {
//!     let smoke = Scenario::builder()
//!         .name("smoke")
//!         .executor(
//!             SharedIterations::builder()
//!                 .vus(2)
//!                 .iterations(5)
//!                 .max_duration(Duration::from_secs(60))
//!                 .build(),
//!         )
//!         .body(Arc::new(|ctx: IterationContext| async move {
//!             let res = ctx.get("http://localhost:3000/health").await;
//!             ctx.check("status is 200", res.status == 200);
//!             ctx.think(Duration::from_secs(1));
//!             anyhow::Ok(())
//!         }))
//!         .build();
//!
//!     let result = Runner::builder()
//!         .scenarios(vec![smoke])
//!         .thresholds(vec![
//!             Threshold::parse("http_req_duration", "p(95) < 1000")?,
//!             Threshold::parse("http_req_failed", "rate < 0.05")?,
//!         ])
//!         .build()
//!         .run()
//!         .await?;
//!
//!     StdoutReporter.report(&result).await?;
//!     Ok(result.exit_code())
//! }
//! ```
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) functions such as the VU
//!   interpolation used by [`RampingVus`]
//!
//! # Where to start
//!
//! - Read the docs for [`Scenario`], [`Runner`] and [`Threshold`].
//! - See `demos/http.rs` for a multi-scenario run against a real HTTP service.

/// Metric aggregates
pub mod aggregate;
/// Declarative k6-style options
pub mod config;
pub mod error;
/// Orchestrators that define how VUs are scheduled
pub mod executor;
/// HTTP capability handed to scenario bodies
pub mod http;
/// Metric kinds, tags and observations
pub mod metric;
/// Metric streams and the registry that owns them
pub mod registry;
/// Run results and reporters
pub mod report;
/// The run controller that glues everything together
pub mod runner;
pub mod scenario;
/// Threshold grammar and evaluation
pub mod threshold;

pub use aggregate::{Aggregate, Snapshot};
pub use error::{Error, Result};
pub use executor::{Executor, RampingVus, SharedIterations};
pub use http::{Request, Response, Transport};
pub use metric::{MetricKind, TagSet};
pub use registry::MetricsRegistry;
pub use report::{Reporter, RunResult};
pub use runner::{Hooks, RunState, Runner, StopHandle};
pub use scenario::{IterationContext, Scenario, Stage};
pub use threshold::{Threshold, Verdict};
