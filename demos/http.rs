//! Smoke, load and stress scenarios against one HTTP API.
//!
//! ```sh
//! BASE_URL=http://localhost:5000 RUST_LOG=info cargo run --example http
//! ```
//!
//! Exits with `0` when every threshold passes, `99` when one fails and `1` when the
//! run could not start.
use std::{process::ExitCode, sync::Arc, time::Duration, time::SystemTime};

use async_trait::async_trait;
use loadgate::{
    Hooks, MetricKind, MetricsRegistry, Reporter, Runner,
    config::Options,
    report::StdoutReporter,
    scenario::{IterationContext, ScenarioBody},
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

const OPTIONS: &str = r#"{
    "thresholds": {
        "http_req_duration{scenario:smoke}": ["p(95) < 1000"],
        "http_req_duration{scenario:load}": ["p(95) < 2000"],
        "http_req_failed": ["rate < 0.05"],
        "checks_succeeded": ["count > 0"]
    },
    "scenarios": {
        "smoke": {
            "executor": "shared-iterations",
            "vus": 2,
            "iterations": 5,
            "maxDuration": "1m"
        },
        "load": {
            "executor": "ramping-vus",
            "stages": [
                { "duration": "30s", "target": 10 },
                { "duration": "1m", "target": 10 },
                { "duration": "20s", "target": 0 }
            ]
        },
        "stress": {
            "executor": "ramping-vus",
            "startVUs": 0,
            "stages": [
                { "duration": "30s", "target": 20 },
                { "duration": "1m", "target": 20 },
                { "duration": "30s", "target": 40 },
                { "duration": "30s", "target": 0 }
            ]
        }
    }
}"#;

const REQUEST_DURATION: &str = "http_req_duration_custom";
const REQUEST_FAILED: &str = "http_req_failed_custom";
const CHECKS_SUCCEEDED: &str = "checks_succeeded";

struct Lifecycle;

#[async_trait]
impl Hooks for Lifecycle {
    async fn setup(&self) -> anyhow::Result<Value> {
        tracing::info!("Preparing the test environment...");
        let started = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
        Ok(json!({ "startTime": started }))
    }

    async fn teardown(&self, data: &Value) -> anyhow::Result<()> {
        tracing::info!("Test started at: {}", data["startTime"]);
        tracing::info!("Cleaning up the test environment...");
        Ok(())
    }
}

fn body(base_url: String) -> Arc<dyn ScenarioBody> {
    let url = format!("{base_url}/swagger/v1/swagger.json");
    Arc::new(move |ctx: IterationContext| {
        let url = url.clone();
        async move {
            let ctx = ctx.group("API Health and Simple Requests");
            let res = ctx.get(url).await;

            let available = ctx.check("status is 200", res.status == 200);
            let fast = ctx.check("response under 3s", res.duration < Duration::from_secs(3));
            if available && fast {
                ctx.record(CHECKS_SUCCEEDED, MetricKind::Counter, 1.0)?;
            }

            let ms = res.duration.as_secs_f64() * 1000.0;
            ctx.record(REQUEST_DURATION, MetricKind::Trend, ms)?;
            let failed = if res.status != 200 { 1.0 } else { 0.0 };
            ctx.record(REQUEST_FAILED, MetricKind::Rate, failed)?;

            ctx.think(Duration::from_millis(500));
            anyhow::Ok(())
        }
    })
}

async fn run() -> loadgate::Result<ExitCode> {
    let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:5000".into());

    let registry = Arc::new(MetricsRegistry::with_builtins());
    registry.declare(REQUEST_DURATION, MetricKind::Trend)?;
    registry.declare(REQUEST_FAILED, MetricKind::Rate)?;
    registry.declare(CHECKS_SUCCEEDED, MetricKind::Counter)?;

    let (scenarios, thresholds) = Options::from_json(OPTIONS)?.build(body(base_url))?;
    let runner = Runner::builder()
        .scenarios(scenarios)
        .thresholds(thresholds)
        .hooks(Arc::new(Lifecycle))
        .registry(registry)
        .build();

    let stop = runner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let result = runner.run().await?;
    StdoutReporter.report(&result).await?;
    Ok(result.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
