//! Dialog collaborator
//!
//! Natural-language understanding is an opaque capability: one turn in, a
//! structured reply (intent, entities, confidence, response text) out.

mod error;
mod openai;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use openai::ChatCompletionsDialog;
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "llama3-70b-8192";

/// Common interface for dialog backends
#[async_trait]
pub trait Dialog: Send + Sync {
    async fn process(&self, request: &DialogRequest) -> Result<DialogReply, LlmError>;

    fn model_id(&self) -> &str;
}

/// Dialog backend settings
#[derive(Debug, Clone, PartialEq)]
pub struct DialogConfig {
    /// No key means every turn gets the fixed unavailable reply
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.5,
            max_tokens: 512,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Build the dialog backend for `config`, wrapped for logging
pub fn dialog_from_config(
    config: &DialogConfig,
    system_prompt: String,
) -> Result<Arc<dyn Dialog>, LlmError> {
    let inner: Arc<dyn Dialog> = match config.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => Arc::new(ChatCompletionsDialog::new(config, key.to_string(), system_prompt)?),
        None => {
            tracing::warn!("No dialog API key configured, replies will report the service as unavailable");
            Arc::new(UnavailableDialog)
        }
    };
    Ok(Arc::new(LoggingDialog::new(inner)))
}

/// Stand-in used when no backend is configured. Its reply is persisted like
/// any other, so the conversation still records the exchange.
pub struct UnavailableDialog;

#[async_trait]
impl Dialog for UnavailableDialog {
    async fn process(&self, _request: &DialogRequest) -> Result<DialogReply, LlmError> {
        Ok(DialogReply::unavailable())
    }

    fn model_id(&self) -> &str {
        "unavailable"
    }
}

/// Logging wrapper for dialog backends
pub struct LoggingDialog {
    inner: Arc<dyn Dialog>,
    model_id: String,
}

impl LoggingDialog {
    pub fn new(inner: Arc<dyn Dialog>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl Dialog for LoggingDialog {
    async fn process(&self, request: &DialogRequest) -> Result<DialogReply, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.process(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(reply) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    history = request.history.len(),
                    intent = reply.intent.as_str(),
                    confidence = reply.confidence,
                    "Dialog request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "Dialog request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
