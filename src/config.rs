//! Declarative run options in the k6 `options` shape.
//!
//! ```json
//! {
//!   "scenarios": {
//!     "smoke": { "executor": "shared-iterations", "vus": 2, "iterations": 5, "maxDuration": "1m" },
//!     "load": {
//!       "executor": "ramping-vus",
//!       "startVUs": 0,
//!       "stages": [{ "duration": "30s", "target": 10 }, { "duration": "1m", "target": 10 }]
//!     }
//!   },
//!   "thresholds": {
//!     "http_req_duration": ["p(95) < 1000"],
//!     "http_req_failed": [{ "threshold": "rate < 0.05", "abortOnFail": true }]
//!   }
//! }
//! ```
//!
//! Durations are human strings (`"30s"`, `"1m30s"`) or integer seconds.
use std::{collections::BTreeMap, fmt, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    executor::{RampingVus, SharedIterations},
    metric::TagSet,
    scenario::{ExecutorConfig, Scenario, ScenarioBody, Stage},
    threshold::Threshold,
};

/// Top-level options document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Scenarios by name. Built in name order.
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioOptions>,

    /// Threshold conditions by metric key (`metric` or `metric{tag:value,...}`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdList>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOptions {
    #[serde(flatten)]
    pub executor: ExecutorOptions,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<HumanDuration>,

    /// Base seed of the per-VU generators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Executor kind: shared-iterations | ramping-vus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorOptions {
    SharedIterations(SharedIterationsOptions),
    RampingVus(RampingVusOptions),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedIterationsOptions {
    #[serde(default = "default_vus")]
    pub vus: u64,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration: HumanDuration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampingVusOptions {
    #[serde(rename = "startVUs", default = "default_vus")]
    pub start_vus: u64,
    pub stages: Vec<StageOptions>,
    /// How often the VU target is recomputed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<HumanDuration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOptions {
    pub duration: HumanDuration,
    pub target: u64,
}

fn default_vus() -> u64 {
    1
}

fn default_iterations() -> u64 {
    1
}

fn default_max_duration() -> HumanDuration {
    HumanDuration(Duration::from_secs(600))
}

/// One or many threshold entries for a metric key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdList {
    One(ThresholdOption),
    Many(Vec<ThresholdOption>),
}

impl ThresholdList {
    fn entries(&self) -> &[ThresholdOption] {
        match self {
            ThresholdList::One(one) => std::slice::from_ref(one),
            ThresholdList::Many(many) => many,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdOption {
    Expr(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

/// A `Duration` read from `"1m30s"` style strings or integer seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn into_inner(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string (e.g. 30s, 1m30s) or integer seconds")
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(HumanDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|secs| HumanDuration(Duration::from_secs(secs)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                // humantime rejects a bare "0"
                if v.trim() == "0" {
                    return Ok(HumanDuration(Duration::ZERO));
                }
                humantime::parse_duration(v.trim())
                    .map(HumanDuration)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(V)
    }
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Turn the options into scenarios sharing `body` and parsed thresholds.
    pub fn build(&self, body: Arc<dyn ScenarioBody>) -> Result<(Vec<Scenario>, Vec<Threshold>)> {
        if self.scenarios.is_empty() {
            return Err(Error::Config("options define no scenarios".into()));
        }

        let scenarios = self
            .scenarios
            .iter()
            .map(|(name, options)| options.build(name, Arc::clone(&body)))
            .collect::<Result<Vec<_>>>()?;

        let mut thresholds = Vec::new();
        for (key, list) in &self.thresholds {
            for entry in list.entries() {
                let threshold = match entry {
                    ThresholdOption::Expr(expr) => Threshold::parse(key, expr)?,
                    ThresholdOption::Detailed {
                        threshold,
                        abort_on_fail,
                    } => Threshold::parse(key, threshold)?.with_abort_on_fail(*abort_on_fail),
                };
                thresholds.push(threshold);
            }
        }

        Ok((scenarios, thresholds))
    }
}

impl ScenarioOptions {
    fn build(&self, name: &str, body: Arc<dyn ScenarioBody>) -> Result<Scenario> {
        let executor: ExecutorConfig = match &self.executor {
            ExecutorOptions::SharedIterations(o) => SharedIterations::builder()
                .vus(o.vus)
                .iterations(o.iterations)
                .max_duration(o.max_duration.into_inner())
                .build()
                .into(),
            ExecutorOptions::RampingVus(o) => {
                let stages = o
                    .stages
                    .iter()
                    .map(|s| Stage::new(s.duration.into_inner(), s.target))
                    .collect();
                let tick = o.tick.map_or(Duration::from_secs(1), HumanDuration::into_inner);
                RampingVus::builder()
                    .start_vus(o.start_vus)
                    .stages(stages)
                    .tick(tick)
                    .build()
                    .into()
            }
        };

        let scenario = Scenario {
            name: name.to_string(),
            executor,
            tags: self.tags.iter().collect::<TagSet>(),
            start_time: self.start_time.unwrap_or_default().into_inner(),
            seed: self.seed,
            body,
        };
        scenario.validate()?;
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scenario::IterationContext,
        threshold::{Aggregation, Comparison},
    };

    const OPTIONS: &str = r#"{
        "scenarios": {
            "smoke": {
                "executor": "shared-iterations",
                "vus": 2,
                "iterations": 5,
                "maxDuration": "1m"
            },
            "load": {
                "executor": "ramping-vus",
                "startVUs": 0,
                "startTime": "1m",
                "stages": [
                    { "duration": "30s", "target": 10 },
                    { "duration": "1m", "target": 10 },
                    { "duration": 30, "target": 0 }
                ],
                "tags": { "kind": "load" }
            }
        },
        "thresholds": {
            "http_req_duration": ["p(95) < 1000"],
            "http_req_failed": [{ "threshold": "rate < 0.05", "abortOnFail": true }],
            "checks": "rate > 0.95",
            "http_req_duration{scenario:smoke}": ["avg < 200", "max < 2000"]
        }
    }"#;

    fn noop() -> Arc<dyn ScenarioBody> {
        Arc::new(|_ctx: IterationContext| async { anyhow::Ok(()) })
    }

    #[test]
    fn parses_the_k6_shape() {
        let options = Options::from_json(OPTIONS).unwrap();

        let ScenarioOptions {
            executor: ExecutorOptions::SharedIterations(smoke),
            ..
        } = &options.scenarios["smoke"]
        else {
            panic!("smoke should be shared-iterations");
        };
        assert_eq!(smoke.vus, 2);
        assert_eq!(smoke.iterations, 5);
        assert_eq!(smoke.max_duration.into_inner(), Duration::from_secs(60));

        let load = &options.scenarios["load"];
        let ExecutorOptions::RampingVus(ramp) = &load.executor else {
            panic!("load should be ramping-vus");
        };
        assert_eq!(ramp.start_vus, 0);
        assert_eq!(ramp.stages[2].duration.into_inner(), Duration::from_secs(30));
        assert_eq!(load.start_time, Some(HumanDuration(Duration::from_secs(60))));
    }

    #[test]
    fn builds_scenarios_and_thresholds() {
        let (scenarios, thresholds) = Options::from_json(OPTIONS).unwrap().build(noop()).unwrap();

        let names: Vec<_> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["load", "smoke"]);
        assert_eq!(scenarios[0].tags.get("kind"), Some("load"));
        assert_eq!(scenarios[0].start_time, Duration::from_secs(60));
        assert_eq!(scenarios[0].executor.kind(), "ramping-vus");

        assert_eq!(thresholds.len(), 5);
        let failed = thresholds
            .iter()
            .find(|t| t.metric == "http_req_failed")
            .unwrap();
        assert!(failed.abort_on_fail);
        assert_eq!(failed.condition.aggregation, Aggregation::Rate);
        assert_eq!(failed.condition.comparison, Comparison::Lt);

        let scoped: Vec<_> = thresholds
            .iter()
            .filter(|t| t.filter.get("scenario") == Some("smoke"))
            .collect();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|t| t.metric == "http_req_duration"));
    }

    #[test]
    fn defaults_apply() {
        let options = Options::from_json(
            r#"{ "scenarios": {
                "a": { "executor": "shared-iterations" },
                "b": { "executor": "ramping-vus", "stages": [{ "duration": "10s", "target": 3 }] }
            } }"#,
        )
        .unwrap();
        let (scenarios, thresholds) = options.build(noop()).unwrap();
        assert!(thresholds.is_empty());

        let ExecutorConfig::SharedIterations(shared) = &scenarios[0].executor else {
            panic!("expected shared-iterations");
        };
        assert_eq!((shared.vus, shared.iterations), (1, 1));
        assert_eq!(shared.max_duration, Duration::from_secs(600));

        let ExecutorConfig::RampingVus(ramping) = &scenarios[1].executor else {
            panic!("expected ramping-vus");
        };
        assert_eq!(ramping.start_vus, 1);
        assert_eq!(ramping.tick, Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(matches!(
            Options::from_json(r#"{ "scenarios": { "x": { "executor": "constant-arrival-rate" } } }"#),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            Options::from_json(
                r#"{ "scenarios": { "x": { "executor": "shared-iterations", "maxDuration": "soon" } } }"#
            ),
            Err(Error::Json(_))
        ));

        let empty_stages = Options::from_json(
            r#"{ "scenarios": { "x": { "executor": "ramping-vus", "stages": [] } } }"#,
        )
        .unwrap();
        assert!(matches!(empty_stages.build(noop()), Err(Error::Config(_))));

        let bad_threshold = Options::from_json(
            r#"{ "scenarios": { "x": { "executor": "shared-iterations" } },
                 "thresholds": { "checks": ["rate ~ 1"] } }"#,
        )
        .unwrap();
        assert!(matches!(
            bad_threshold.build(noop()),
            Err(Error::Threshold { .. })
        ));

        assert!(matches!(Options::default().build(noop()), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            Options::load("/nonexistent/loadgate-options.json"),
            Err(Error::Io(_))
        ));
    }
}
