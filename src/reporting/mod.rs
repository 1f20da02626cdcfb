//! Prompt construction, chat-completion integration and report cleanup.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::error::{Error, ReportRequestSnafu, ReportShapeSnafu, ReportStatusSnafu};
use crate::inference::Detection;

/// First line of every prompt.
pub const PROMPT_PREAMBLE: &str = "These are the detected dental conditions from X-ray:";
/// Closing instruction of every prompt.
pub const PROMPT_CLOSING: &str = "Please write a diagnostic report.";

// --- chat-completion wire shapes ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Narrow seam over the text-generation service, stubbed in tests.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, Error>;
}

/// Deterministic multi-line prompt: preamble, one line per detection,
/// closing instruction. An empty detection set yields preamble + closing only.
pub fn build_prompt(detections: &[Detection]) -> String {
    let mut prompt = format!("{}\n", PROMPT_PREAMBLE);
    for det in detections {
        prompt.push_str(&format!(
            "- {} at (x={}, y={}, w={}, h={})\n",
            det.class_name, det.x, det.y, det.width, det.height
        ));
    }
    prompt.push('\n');
    prompt.push_str(PROMPT_CLOSING);
    prompt
}

/// Strip trailing sign-off boilerplate from a generated report.
///
/// Lines are popped from the end while the last line starts with one of the
/// markers; the first non-matching tail line stops the scan, even if earlier
/// lines would match. Idempotent.
pub fn trim_sign_off(text: &str, markers: &[String]) -> String {
    let mut lines: Vec<&str> = text.trim().lines().collect();
    while let Some(last) = lines.last() {
        let last = last.trim();
        if markers.iter().any(|m| last.starts_with(m.as_str())) {
            lines.pop();
        } else {
            break;
        }
    }
    lines.join("\n")
}

/// Client for an OpenRouter-compatible chat-completion endpoint.
pub struct ChatClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl ChatClient {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(ReportRequestSnafu)?;
        info!(
            "chat client configured: url={}, model={}",
            config.api_url, config.model
        );
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }
}

#[async_trait]
impl ReportGenerator for ChatClient {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context(ReportRequestSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            ReportStatusSnafu {
                status: status.as_u16()
            }
        );

        let parsed: ChatResponse = response.json().await.context(ReportRequestSnafu)?;
        let report = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context(ReportShapeSnafu)?;
        debug!("report generated: {} chars", report.len());
        Ok(report)
    }
}
