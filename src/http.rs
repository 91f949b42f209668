//! The HTTP capability handed to scenario bodies.
//!
//! Connection handling is delegated to a [`Transport`]; this module only times the
//! call, bounds it with a timeout, and turns the outcome into built-in observations.
//! Transport errors and timeouts come back as a [`Response`] with status `0`, so a
//! body can still run its checks against it.

use std::{borrow::Cow, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

pub use reqwest::Method;

use crate::{
    metric::{MetricKind, TagSet, builtin, tag},
    registry::Recorder,
};

/// A request to send. `name` groups URLs with dynamic parts under one tag value.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub name: Option<String>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            name: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// What a [`Transport`] hands back on success.
#[derive(Clone, Debug, Default)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Black-box request execution: pooling, TLS and DNS live behind this trait.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn execute(&self, request: &Request) -> anyhow::Result<RawResponse>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &Request) -> anyhow::Result<RawResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(RawResponse { status, body })
    }
}

/// The outcome of one request as seen by the scenario body.
#[derive(Clone, Debug, Default)]
pub struct Response {
    /// HTTP status, `0` when no response was received.
    pub status: u16,
    pub duration: Duration,
    pub body: Vec<u8>,
    /// Transport error or timeout description.
    pub error: Option<String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Send `request` through `transport`, waiting at most `timeout`, and record
/// `http_reqs`, `http_req_duration`, `http_req_failed` and `data_received`.
pub(crate) async fn send_recorded(
    transport: &Arc<dyn Transport>,
    timeout: Duration,
    recorder: &Recorder,
    request: Request,
) -> Response {
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, transport.execute(&request)).await;
    let duration = start.elapsed();

    let response = match outcome {
        Ok(Ok(raw)) => Response {
            status: raw.status,
            duration,
            body: raw.body,
            error: None,
        },
        Ok(Err(e)) => Response {
            duration,
            error: Some(format!("{e:#}")),
            ..Default::default()
        },
        Err(_) => Response {
            duration,
            error: Some(format!("request timed out after {timeout:?}")),
            ..Default::default()
        },
    };

    let name = request.name.as_deref().unwrap_or(&request.url);
    let tags = TagSet::new()
        .with(tag::METHOD, request.method.as_str())
        .with(tag::URL, request.url.as_str())
        .with(tag::NAME, name)
        .with(tag::STATUS, response.status.to_string());

    let failed = if response.is_success() { 0.0 } else { 1.0 };
    recorder.record_builtin(builtin::HTTP_REQS, MetricKind::Counter, 1.0, &tags);
    recorder.record_builtin(
        builtin::HTTP_REQ_DURATION,
        MetricKind::Trend,
        duration.as_secs_f64() * 1000.0,
        &tags,
    );
    recorder.record_builtin(builtin::HTTP_REQ_FAILED, MetricKind::Rate, failed, &tags);
    recorder.record_builtin(
        builtin::DATA_RECEIVED,
        MetricKind::Counter,
        response.body.len() as f64,
        &tags,
    );

    if let Some(error) = &response.error {
        tracing::debug!("{} {} failed: {error}", request.method, request.url);
    }
    response
}
