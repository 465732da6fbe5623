//! Chat-completion dialect (OpenAI compatible)
//!
//! Converts requests into role-tagged message lists and merges streamed
//! chunks back into one coherent message: content deltas, reasoning
//! deltas, and indexed partial tool calls each take their own aggregation
//! path before final assembly.

use super::vendor::parse_vendor_tool_calls;
use super::{
    Content, FinishReason, FunctionCall, LanguageModel, LlmRequest, LlmResponse, Part, Role,
    ResponseStream, Usage, SSE_MAX_LINE_BYTES,
};
use crate::error::OrchestrationError;
use crate::models::{AiConfig, ThinkingLevel};
use crate::Result;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

const SSE_DATA_PREFIX: &str = "data: ";
const SSE_DONE_MARKER: &str = "[DONE]";

/// Model handle speaking the chat-completion protocol
#[derive(Clone)]
pub struct ChatCompletionModel {
    client: Client,
    api_key: String,
    /// Normalized to end with `/v1`
    base_url: String,
    model_name: String,
    no_system_role: bool,
    thinking: Option<ThinkingLevel>,
}

impl ChatCompletionModel {
    pub fn new(config: &AiConfig, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url,
            model_name: config.model_name.clone(),
            no_system_role: config.no_system_role,
            thinking: config.thinking_level,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request_body(&self, req: &LlmRequest, stream: bool) -> Result<Value> {
        let mut messages: Vec<Value> = Vec::new();

        if let Some(system) = &req.config.system_instruction {
            let role = if self.no_system_role { "user" } else { "system" };
            messages.push(json!({"role": role, "content": system}));
        }

        for content in &req.contents {
            messages.extend(self.convert_content(content)?);
        }

        let mut body = json!({
            "model": self.model_name,
            "messages": messages,
        });

        if !req.config.tools.is_empty() {
            let tools: Vec<Value> = req
                .config
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        if let Some(temperature) = req.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = req.config.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(level) = req.config.thinking.or(self.thinking) {
            body["reasoning_effort"] = json!(reasoning_effort(level));
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        Ok(body)
    }

    /// One content block may fan out into several messages: tool responses
    /// become their own `tool`-role messages ahead of the speaker's text.
    fn convert_content(&self, content: &Content) -> Result<Vec<Value>> {
        let mut messages = Vec::new();

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        for part in &content.parts {
            match part {
                Part::FunctionResponse(fr) => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": fr.id,
                        "content": serde_json::to_string(&fr.response)?,
                    }));
                }
                Part::Text { text: t, thought: true } => reasoning.push_str(t),
                Part::Text { text: t, thought: false } => text.push_str(t),
                Part::FunctionCall(fc) => {
                    tool_calls.push(json!({
                        "id": fc.id,
                        "type": "function",
                        "function": {
                            "name": fc.name,
                            "arguments": serde_json::to_string(&fc.args)?,
                        }
                    }));
                }
            }
        }

        if text.is_empty() && reasoning.is_empty() && tool_calls.is_empty() {
            return Ok(messages);
        }

        let mut msg = json!({"role": self.convert_role(content.role)});
        if !text.is_empty() {
            msg["content"] = json!(text);
        }
        if !reasoning.is_empty() {
            msg["reasoning_content"] = json!(reasoning);
        }
        if !tool_calls.is_empty() {
            msg["tool_calls"] = Value::Array(tool_calls);
        }
        messages.push(msg);

        Ok(messages)
    }

    fn convert_role(&self, role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Model => "assistant",
            Role::System => {
                if self.no_system_role {
                    "user"
                } else {
                    "system"
                }
            }
        }
    }

    async fn run_once(&self, req: LlmRequest, tx: &mpsc::Sender<Result<LlmResponse>>) {
        let result = self.request_once(&req).await;
        let _ = tx.send(result).await;
    }

    async fn request_once(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request_body(req, false)?;
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(OrchestrationError::Provider(format!(
                "chat completion HTTP {}: {}",
                status, detail
            )));
        }

        let api_resp: ChatCompletionResponse = resp.json().await?;
        convert_completion_response(api_resp)
    }

    async fn run_stream(&self, req: LlmRequest, tx: &mpsc::Sender<Result<LlmResponse>>) {
        let body = match self.build_request_body(&req, true) {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let resp = match self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let _ = tx
                .send(Err(OrchestrationError::Provider(format!(
                    "chat completion stream HTTP {}: {}",
                    status, detail
                ))))
                .await;
            return;
        }

        let reader = StreamReader::new(
            resp.bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(SSE_MAX_LINE_BYTES));

        let mut aggregator = ChatStreamAggregator::default();

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "chat completion stream interrupted");
                    let _ = tx
                        .send(Err(OrchestrationError::Provider(format!(
                            "stream read error: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };

            let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
                continue;
            };
            if data == SSE_DONE_MARKER {
                break;
            }

            let chunk: ChatChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "skipping malformed chat chunk");
                    continue;
                }
            };

            for event in aggregator.push(chunk) {
                if tx.send(Ok(event)).await.is_err() {
                    // Consumer walked away
                    return;
                }
            }
        }

        let _ = tx.send(Ok(aggregator.finish())).await;
    }
}

impl LanguageModel for ChatCompletionModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn generate(&self, request: LlmRequest, stream: bool) -> ResponseStream {
        let this = self.clone();
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            if stream {
                this.run_stream(request, &tx).await;
            } else {
                this.run_once(request, &tx).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

//
// ================= Stream Aggregation =================
//

#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    args: String,
}

/// Merges streamed chunks into one message. Tool-call fragments are keyed
/// by their index slot and emitted in ascending index order; reasoning
/// deltas end up as a thought part prepended to the final content.
#[derive(Default)]
pub(crate) struct ChatStreamAggregator {
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<i64, ToolCallBuilder>,
    finish_reason: FinishReason,
    usage: Option<Usage>,
}

impl ChatStreamAggregator {
    /// Consume one chunk, returning the partial events it produces
    pub(crate) fn push(&mut self, chunk: ChatChunk) -> Vec<LlmResponse> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reasoning) = choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                self.reasoning.push_str(&reasoning);
                events.push(LlmResponse::partial_thought(reasoning));
            }
        }

        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                self.text.push_str(&text);
                events.push(LlmResponse::partial_text(text));
            }
        }

        for tc in choice.delta.tool_calls {
            let builder = self.tool_calls.entry(tc.index.unwrap_or(0)).or_default();
            if let Some(id) = tc.id {
                if !id.is_empty() {
                    builder.id = id;
                }
            }
            if let Some(name) = tc.function.name {
                if !name.is_empty() {
                    builder.name = name;
                }
            }
            if let Some(args) = tc.function.arguments {
                builder.args.push_str(&args);
            }
        }

        if let Some(reason) = choice.finish_reason {
            if !reason.is_empty() {
                self.finish_reason = convert_finish_reason(&reason);
            }
        }

        events
    }

    /// Assemble the final aggregated response, lifting vendor sentinels
    pub(crate) fn finish(self) -> LlmResponse {
        let mut parts: Vec<Part> = Vec::new();

        if !self.text.is_empty() {
            let (vendor_calls, cleaned) = parse_vendor_tool_calls(&self.text);
            if !cleaned.is_empty() {
                parts.push(Part::text(cleaned));
            }
            for (i, vc) in vendor_calls.into_iter().enumerate() {
                parts.push(Part::FunctionCall(FunctionCall {
                    id: format!("vendor_call_{}", i),
                    name: vc.name,
                    args: vc.args,
                }));
            }
        }

        if !self.reasoning.is_empty() {
            parts.insert(0, Part::thought(self.reasoning));
        }

        for builder in self.tool_calls.into_values() {
            parts.push(Part::FunctionCall(FunctionCall {
                id: builder.id,
                name: builder.name,
                args: parse_json_args(&builder.args),
            }));
        }

        LlmResponse {
            content: Content::model(parts),
            partial: false,
            turn_complete: true,
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: Option<i64>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: ChunkFunction,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

fn convert_completion_response(resp: ChatCompletionResponse) -> Result<LlmResponse> {
    let Some(choice) = resp.choices.into_iter().next() else {
        return Err(OrchestrationError::ModelContent(
            "no choices in response".into(),
        ));
    };

    let mut parts: Vec<Part> = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content {
        if !reasoning.is_empty() {
            parts.push(Part::thought(reasoning));
        }
    }
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
    }
    for tc in choice.message.tool_calls {
        if tc.kind == "function" {
            parts.push(Part::FunctionCall(FunctionCall {
                id: tc.id,
                name: tc.function.name,
                args: parse_json_args(&tc.function.arguments),
            }));
        }
    }

    let usage = resp.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    Ok(LlmResponse {
        content: Content::model(parts),
        partial: false,
        turn_complete: true,
        finish_reason: convert_finish_reason(choice.finish_reason.as_deref().unwrap_or("")),
        usage,
    })
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" | "tool_calls" | "function_call" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "content_filter" => FinishReason::Safety,
        _ => FinishReason::Unspecified,
    }
}

pub(crate) fn parse_json_args(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
}

pub(crate) fn reasoning_effort(level: ThinkingLevel) -> &'static str {
    match level {
        ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => "medium",
        ThinkingLevel::High => "high",
    }
}
