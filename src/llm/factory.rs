//! Model factory
//!
//! Maps a provider config onto a concrete dialect handle. The factory is
//! behind a small trait so orchestration tests can inject scripted models.

use super::chat::ChatCompletionModel;
use super::gemini::GeminiModel;
use super::responses::ResponsesModel;
use super::LanguageModel;
use crate::error::OrchestrationError;
use crate::models::{AiConfig, AiProvider};
use crate::Result;
use std::sync::Arc;
use tracing::debug;

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Builds a model handle from a provider config
pub trait ModelProvider: Send + Sync {
    fn create_model(&self, config: &AiConfig) -> Result<Arc<dyn LanguageModel>>;
}

pub struct ModelFactory;

impl ModelFactory {
    pub fn new() -> Self {
        ModelFactory
    }
}

impl Default for ModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for ModelFactory {
    fn create_model(&self, config: &AiConfig) -> Result<Arc<dyn LanguageModel>> {
        if config.api_key.is_empty() {
            return Err(OrchestrationError::Config(
                "api key not configured".to_string(),
            ));
        }
        if config.model_name.is_empty() {
            return Err(OrchestrationError::Config(
                "model name not configured".to_string(),
            ));
        }

        debug!(provider = %config.provider, model = %config.model_name, "creating model handle");

        match config.provider {
            AiProvider::OpenAi => {
                let base = normalize_base_url(&config.base_url);
                Ok(Arc::new(ChatCompletionModel::new(config, base)?))
            }
            AiProvider::Responses => {
                let base = normalize_base_url(&config.base_url);
                Ok(Arc::new(ResponsesModel::new(config, base)?))
            }
            AiProvider::Gemini => Ok(Arc::new(GeminiModel::new(config)?)),
        }
    }
}

/// Normalize an OpenAI-protocol base URL to end with `/v1`
pub fn normalize_base_url(raw: &str) -> String {
    let url = if raw.is_empty() {
        OPENAI_DEFAULT_BASE_URL
    } else {
        raw
    };
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}
