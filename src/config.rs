use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use snafu::ResultExt;

use crate::error::{CreateUploadsDirSnafu, Error};

/// Environment variable holding the inference service API key.
pub const INFERENCE_API_KEY_VAR: &str = "INFERENCE_API_KEY";
/// Environment variable holding the chat-completion service API key.
pub const LLM_API_KEY_VAR: &str = "LLM_API_KEY";

/// System role sent with every report request.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a dental radiologist.";

/// Trailing lines starting with any of these markers are stripped from
/// generated reports. The set is the union of both marker lists found in
/// the field deployments; override with `--sign-off-marker`.
pub const DEFAULT_SIGN_OFF_MARKERS: &[&str] = &[
    "Sincerely",
    "Radiologist:",
    "[Your Name]",
    "Dental Radiologist",
    "Patient Name",
    "Date of Exam",
    "Dr",
];

#[derive(Debug, Parser)]
#[command(name = "dentarad", version, about = "Dental radiograph analysis backend")]
pub struct Cli {
    /// Socket address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Directory where uploaded files are stored (created if absent)
    #[arg(long, default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Maximum accepted upload size in bytes
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_upload_bytes: u64,

    /// Base URL of the object-detection inference service
    #[arg(long, default_value = "https://serverless.roboflow.com")]
    pub inference_url: String,

    /// Model identifier passed to the inference service
    #[arg(long, default_value = "adr/6")]
    pub inference_model: String,

    /// Base URL of the chat-completion service
    #[arg(long, default_value = "https://openrouter.ai/api/v1")]
    pub llm_url: String,

    /// Model name passed to the chat-completion service
    #[arg(long, default_value = "openai/gpt-3.5-turbo")]
    pub llm_model: String,

    /// System prompt for the chat-completion service
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,

    /// Timeout in seconds for each external API call
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Replace the default report sign-off markers (repeatable)
    #[arg(long = "sign-off-marker", value_name = "MARKER")]
    pub sign_off_markers: Vec<String>,
}

/// Inference service endpoint configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub api_url: String,
    pub api_key: String,
    pub model_id: String,
}

/// Chat-completion service endpoint configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
}

/// Resolved runtime configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub uploads_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub inference: InferenceConfig,
    pub llm: LlmConfig,
    pub request_timeout: Duration,
    pub sign_off_markers: Vec<String>,
}

impl Config {
    /// Resolve the CLI arguments against the environment.
    ///
    /// API keys are deployment secrets and are only read from the
    /// environment, never from flags. The uploads directory is created
    /// here so request handlers can assume it exists.
    pub fn from_cli(cli: Cli) -> Result<Self, Error> {
        let inference_key = require_env(INFERENCE_API_KEY_VAR)?;
        let llm_key = require_env(LLM_API_KEY_VAR)?;

        std::fs::create_dir_all(&cli.uploads_dir).context(CreateUploadsDirSnafu {
            path: cli.uploads_dir.display().to_string(),
        })?;

        let sign_off_markers = if cli.sign_off_markers.is_empty() {
            default_sign_off_markers()
        } else {
            cli.sign_off_markers
        };

        Ok(Config {
            bind: cli.bind,
            uploads_dir: cli.uploads_dir,
            max_upload_bytes: cli.max_upload_bytes,
            inference: InferenceConfig {
                api_url: cli.inference_url.trim_end_matches('/').to_string(),
                api_key: inference_key,
                model_id: cli.inference_model,
            },
            llm: LlmConfig {
                api_url: cli.llm_url.trim_end_matches('/').to_string(),
                api_key: llm_key,
                model: cli.llm_model,
                system_prompt: cli.system_prompt,
            },
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            sign_off_markers,
        })
    }
}

/// The built-in marker list as owned strings.
pub fn default_sign_off_markers() -> Vec<String> {
    DEFAULT_SIGN_OFF_MARKERS
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn require_env(name: &str) -> Result<String, Error> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::MissingApiKey { name: name.into() }),
    }
}
