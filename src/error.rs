use thiserror::Error;

use crate::metric::MetricKind;

/// Errors surfaced by the engine.
///
/// Iteration-level failures (a body returning `Err`, a failed check, a non-2xx
/// response) never show up here: they are converted into observations. Only
/// configuration problems and a failing setup hook stop a run.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid scenario or runner configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A threshold expression that does not parse or does not apply to its metric
    #[error("invalid threshold `{expr}`: {reason}")]
    Threshold { expr: String, reason: String },

    /// A metric was recorded with a kind other than the one it was created with
    #[error("metric `{name}` is a {existing}, cannot record it as a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    /// The setup hook failed; the run is aborted before any scenario starts
    #[error("setup failed: {0:#}")]
    Setup(anyhow::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn threshold(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Threshold {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}
