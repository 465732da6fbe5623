//! LLM provider abstraction
//!
//! A uniform send/stream interface over several vendor protocols. Every
//! model handle produces a consumer-pulled sequence of responses; for
//! streaming generation the sequence carries any number of partial
//! responses followed by exactly one final aggregated response with
//! `turn_complete` set. Dropping the sequence cancels the producer.

pub mod chat;
pub mod factory;
pub mod gemini;
pub mod mock;
pub mod responses;
pub mod vendor;

pub use factory::{ModelFactory, ModelProvider};
pub use mock::MockModel;

use crate::models::ThinkingLevel;
use crate::Result;
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;

/// Consumer-pulled response sequence; producing the next element may block
/// on network I/O.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<LlmResponse>> + Send>>;

/// Maximum accepted length of a single SSE line. A single tool call can
/// carry very large argument payloads; an oversized line surfaces as a
/// stream error rather than silent truncation.
pub(crate) const SSE_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// One piece of model content. Thought text is reasoning the model keeps
/// separate from its visible answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text { text: String, thought: bool },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: false,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: true,
        }
    }

    pub fn is_thought(&self) -> bool {
        matches!(self, Part::Text { thought: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Content {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Content {
            role: Role::Model,
            parts,
        }
    }

    /// Concatenated non-thought text
    pub fn visible_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text, thought: false } = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall(fc) => Some(fc),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    #[default]
    Unspecified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: Content,
    /// Incremental fragment; the final aggregate repeats the whole turn
    pub partial: bool,
    pub turn_complete: bool,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn partial_text(text: impl Into<String>) -> Self {
        LlmResponse {
            content: Content::model(vec![Part::text(text)]),
            partial: true,
            turn_complete: false,
            finish_reason: FinishReason::Unspecified,
            usage: None,
        }
    }

    pub fn partial_thought(text: impl Into<String>) -> Self {
        LlmResponse {
            content: Content::model(vec![Part::thought(text)]),
            partial: true,
            turn_complete: false,
            finish_reason: FinishReason::Unspecified,
            usage: None,
        }
    }

    /// Intermediate non-text event, e.g. tool responses fed back by the
    /// agent loop
    pub fn interim(content: Content) -> Self {
        LlmResponse {
            content,
            partial: false,
            turn_complete: false,
            finish_reason: FinishReason::Unspecified,
            usage: None,
        }
    }

    pub fn final_turn(content: Content) -> Self {
        LlmResponse {
            content,
            partial: false,
            turn_complete: true,
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }
}

/// Declaration of a callable function exposed to the model
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    pub system_instruction: Option<String>,
    pub tools: Vec<FunctionDecl>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub thinking: Option<ThinkingLevel>,
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub contents: Vec<Content>,
    pub config: GenerateConfig,
}

/// Uniform interface over vendor protocols.
///
/// Non-streaming: the sequence yields exactly one item. Streaming: partial
/// responses then one final response with `turn_complete`; an error at any
/// point terminates the sequence. Cancellation (dropping the stream) stops
/// the producer without an error.
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, request: LlmRequest, stream: bool) -> ResponseStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_text_skips_thought_and_calls() {
        let content = Content {
            role: Role::Model,
            parts: vec![
                Part::thought("考虑一下"),
                Part::text("结论是"),
                Part::FunctionCall(FunctionCall {
                    id: "c1".into(),
                    name: "get_kline_data".into(),
                    args: serde_json::json!({}),
                }),
                Part::text("买入"),
            ],
        };
        assert_eq!(content.visible_text(), "结论是买入");
        assert_eq!(content.function_calls().len(), 1);
    }
}
