//! Responses-SSE dialect (OpenAI Responses API)
//!
//! Bytes arrive as `event: <type>` / `data: <json>` line pairs. Text
//! deltas are forwarded as partial responses; function-call items are
//! reassembled per item id in insertion order, preferring the terminal
//! values carried by `response.output_item.done` over incremental ones.

use super::chat::{parse_json_args, reasoning_effort};
use super::vendor::parse_vendor_tool_calls;
use super::{
    Content, FinishReason, FunctionCall, LanguageModel, LlmRequest, LlmResponse, Part, Role,
    ResponseStream, Usage, SSE_MAX_LINE_BYTES,
};
use crate::error::OrchestrationError;
use crate::models::{AiConfig, ThinkingLevel};
use crate::Result;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Model handle speaking the Responses API protocol
#[derive(Clone)]
pub struct ResponsesModel {
    client: Client,
    api_key: String,
    /// Normalized to end with `/v1`; `/responses` is appended per request
    base_url: String,
    model_name: String,
    no_system_role: bool,
    thinking: Option<ThinkingLevel>,
}

impl ResponsesModel {
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
        format!("{}/responses", self.base_url)
    }

    fn build_request_body(&self, req: &LlmRequest, stream: bool) -> Result<Value> {
        let mut input: Vec<Value> = Vec::new();
        let mut body = json!({
            "model": self.model_name,
            "stream": stream,
        });

        if let Some(system) = &req.config.system_instruction {
            if self.no_system_role {
                input.push(json!({"role": "user", "content": system}));
            } else {
                body["instructions"] = json!(system);
            }
        }

        for content in &req.contents {
            convert_content_to_items(content, &mut input)?;
        }
        body["input"] = Value::Array(input);

        if !req.config.tools.is_empty() {
            // Responses API uses a flattened tool shape
            let tools: Vec<Value> = req
                .config
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        if let Some(temperature) = req.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = req.config.max_output_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }
        if let Some(level) = req.config.thinking.or(self.thinking) {
            body["reasoning"] = json!({"effort": reasoning_effort(level)});
        }

        Ok(body)
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
                "responses API HTTP {}: {}",
                status, detail
            )));
        }

        let api_resp: CreateResponseBody = resp.json().await?;
        Ok(convert_response_body(api_resp))
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
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
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
                    "responses API stream HTTP {}: {}",
                    status, detail
                ))))
                .await;
            return;
        }

        let reader = StreamReader::new(
            resp.bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(SSE_MAX_LINE_BYTES));
        process_sse_lines(lines, tx).await;
    }
}

impl LanguageModel for ResponsesModel {
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

fn convert_content_to_items(content: &Content, input: &mut Vec<Value>) -> Result<()> {
    let mut text = String::new();
    for part in &content.parts {
        match part {
            Part::Text { text: t, thought: false } => text.push_str(t),
            Part::Text { thought: true, .. } => {}
            Part::FunctionCall(fc) => {
                input.push(json!({
                    "type": "function_call",
                    "call_id": fc.id,
                    "name": fc.name,
                    "arguments": serde_json::to_string(&fc.args)?,
                }));
            }
            Part::FunctionResponse(fr) => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": fr.id,
                    "output": serde_json::to_string(&fr.response)?,
                }));
            }
        }
    }
    if !text.is_empty() {
        let role = match content.role {
            Role::Model => "assistant",
            Role::System => "system",
            Role::User => "user",
        };
        input.push(json!({"role": role, "content": text}));
    }
    Ok(())
}

//
// ================= SSE Reassembly =================
//

/// Aggregates one function-call output item across its add/delta/done events
#[derive(Default)]
struct ResponsesToolCallBuilder {
    call_id: String,
    name: String,
    args: String,
}

/// Drive the SSE line stream to completion, forwarding partial responses
/// and finally the aggregated turn. Split from the transport so tests can
/// feed byte buffers through the same path.
pub(crate) async fn process_sse_lines<S>(mut lines: S, tx: &mpsc::Sender<Result<LlmResponse>>)
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
{
    let mut text_content = String::new();
    let mut tool_calls: HashMap<String, ResponsesToolCallBuilder> = HashMap::new();
    // Insertion order of output items, for stable final assembly
    let mut tool_call_order: Vec<String> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut current_event = String::new();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "SSE stream read error");
                let _ = tx
                    .send(Err(OrchestrationError::Provider(format!(
                        "SSE stream read error: {}",
                        e
                    ))))
                    .await;
                return;
            }
        };

        if let Some(event_type) = line.strip_prefix("event: ") {
            current_event = event_type.to_string();
            continue;
        }
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.is_empty() {
            continue;
        }

        match current_event.as_str() {
            "response.output_text.delta" => match serde_json::from_str::<TextDeltaEvent>(data) {
                Ok(delta) => {
                    text_content.push_str(&delta.delta);
                    if tx.send(Ok(LlmResponse::partial_text(delta.delta))).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed text delta"),
            },
            "response.function_call_arguments.delta" => {
                match serde_json::from_str::<FuncArgsDeltaEvent>(data) {
                    Ok(delta) => {
                        if let Some(builder) = tool_calls.get_mut(&delta.item_id) {
                            builder.args.push_str(&delta.delta);
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping malformed arguments delta"),
                }
            }
            "response.output_item.added" => match serde_json::from_str::<OutputItemEvent>(data) {
                Ok(added) => {
                    if added.item.kind == "function_call" {
                        tool_calls.insert(
                            added.item.id.clone(),
                            ResponsesToolCallBuilder {
                                call_id: added.item.call_id,
                                name: added.item.name,
                                args: String::new(),
                            },
                        );
                        tool_call_order.push(added.item.id);
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed output item"),
            },
            "response.output_item.done" => match serde_json::from_str::<OutputItemEvent>(data) {
                Ok(done) => {
                    if done.item.kind == "function_call" {
                        match tool_calls.get_mut(&done.item.id) {
                            Some(builder) => {
                                // Terminal values win over incremental ones
                                builder.call_id = done.item.call_id;
                                builder.name = done.item.name;
                                if !done.item.arguments.is_empty() {
                                    builder.args = done.item.arguments;
                                }
                            }
                            None => {
                                tool_calls.insert(
                                    done.item.id.clone(),
                                    ResponsesToolCallBuilder {
                                        call_id: done.item.call_id,
                                        name: done.item.name,
                                        args: done.item.arguments,
                                    },
                                );
                                tool_call_order.push(done.item.id);
                            }
                        }
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed output item done"),
            },
            "response.completed" => match serde_json::from_str::<CompletedEvent>(data) {
                Ok(completed) => {
                    if let Some(u) = completed.response.usage {
                        usage = Some(Usage {
                            prompt_tokens: u.input_tokens,
                            completion_tokens: u.output_tokens,
                            total_tokens: u.total_tokens,
                        });
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed completed event"),
            },
            _ => {}
        }
        current_event.clear();
    }

    // Final aggregated turn, with vendor sentinels lifted from the text
    let mut parts: Vec<Part> = Vec::new();
    if !text_content.is_empty() {
        let (vendor_calls, cleaned) = parse_vendor_tool_calls(&text_content);
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
    for id in tool_call_order {
        if let Some(builder) = tool_calls.remove(&id) {
            parts.push(Part::FunctionCall(FunctionCall {
                id: builder.call_id,
                name: builder.name,
                args: parse_json_args(&builder.args),
            }));
        }
    }

    let _ = tx
        .send(Ok(LlmResponse {
            content: Content::model(parts),
            partial: false,
            turn_complete: true,
            finish_reason: FinishReason::Stop,
            usage,
        }))
        .await;
}

//
// ================= Wire Types =================
//

#[derive(Debug, Deserialize)]
struct TextDeltaEvent {
    #[serde(default)]
    delta: String,
}

#[derive(Debug, Deserialize)]
struct FuncArgsDeltaEvent {
    item_id: String,
    #[serde(default)]
    delta: String,
}

#[derive(Debug, Deserialize)]
struct OutputItemEvent {
    item: OutputItem,
}

#[derive(Debug, Default, Deserialize)]
struct OutputItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
    #[serde(default)]
    content: Vec<OutputItemContent>,
}

#[derive(Debug, Deserialize)]
struct OutputItemContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletedEvent {
    response: CompletedResponse,
}

#[derive(Debug, Default, Deserialize)]
struct CompletedResponse {
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct CreateResponseBody {
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

fn convert_response_body(resp: CreateResponseBody) -> LlmResponse {
    let mut parts: Vec<Part> = Vec::new();
    for item in resp.output {
        match item.kind.as_str() {
            "message" => {
                for c in item.content {
                    if !c.text.is_empty() {
                        parts.push(Part::text(c.text));
                    }
                }
            }
            "function_call" => {
                parts.push(Part::FunctionCall(FunctionCall {
                    id: item.call_id,
                    name: item.name,
                    args: parse_json_args(&item.arguments),
                }));
            }
            _ => {}
        }
    }

    let usage = resp.usage.map(|u| Usage {
        prompt_tokens: u.input_tokens,
        completion_tokens: u.output_tokens,
        total_tokens: u.total_tokens,
    });

    LlmResponse {
        content: Content::model(parts),
        partial: false,
        turn_complete: true,
        finish_reason: FinishReason::Stop,
        usage,
    }
}
