//! External object-detection integration.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use tracing::{debug, info};

use crate::config::InferenceConfig;
use crate::error::{Error, InferenceRequestSnafu, InferenceStatusSnafu};
use crate::imaging;

/// One bounding-box prediction from the inference service.
///
/// `x`/`y` are the box center; `width`/`height` the full extent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    // Absent predictions mean "nothing detected", not a protocol error.
    #[serde(default)]
    predictions: Vec<Detection>,
}

/// Narrow seam over the detection service so the pipeline can be tested
/// against stubs and the backing service swapped without touching it.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<Detection>, Error>;
}

/// HTTP client for a Roboflow-style serverless inference endpoint.
///
/// The image is posted in-memory as a base64 body; nothing is staged on disk.
pub struct InferenceClient {
    client: Client,
    api_url: String,
    api_key: String,
    model_id: String,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(InferenceRequestSnafu)?;
        info!(
            "inference client configured: url={}, model={}",
            config.api_url, config.model_id
        );
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_id: config.model_id.clone(),
        })
    }
}

#[async_trait]
impl Detector for InferenceClient {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<Detection>, Error> {
        let body = imaging::to_base64(jpeg);
        let response = self
            .client
            .post(format!("{}/{}", self.api_url, self.model_id))
            .query(&[("api_key", self.api_key.as_str())])
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .context(InferenceRequestSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            InferenceStatusSnafu {
                status: status.as_u16()
            }
        );

        let parsed: InferenceResponse = response.json().await.context(InferenceRequestSnafu)?;
        debug!("inference returned {} predictions", parsed.predictions.len());
        Ok(parsed.predictions)
    }
}
