//! Native Gemini dialect
//!
//! Speaks `generateContent` / `streamGenerateContent?alt=sse` against the
//! Gemini API with a long-lived pooled client.

use super::{
    Content, FinishReason, FunctionCall, LanguageModel, LlmRequest, LlmResponse, Part, Role,
    ResponseStream, Usage, SSE_MAX_LINE_BYTES,
};
use crate::error::OrchestrationError;
use crate::models::AiConfig;
use crate::Result;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiModel {
    client: Client,
    api_key: String,
    base_url: String,
    model_name: String,
}

impl GeminiModel {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        let base_url = if config.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        };

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url,
            model_name: config.model_name.clone(),
        })
    }

    fn endpoint(&self, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, self.model_name, self.api_key
            )
        } else {
            format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, self.model_name, self.api_key
            )
        }
    }

    fn build_request_body(&self, req: &LlmRequest) -> Value {
        let contents: Vec<Value> = req.contents.iter().map(convert_content).collect();
        let mut body = json!({"contents": contents});

        if let Some(system) = &req.config.system_instruction {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        if !req.config.tools.is_empty() {
            let decls: Vec<Value> = req
                .config
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": decls}]);
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = req.config.temperature {
            generation_config.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = req.config.max_output_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        body
    }

    async fn run_once(&self, req: LlmRequest, tx: &mpsc::Sender<Result<LlmResponse>>) {
        let result = self.request_once(&req).await;
        let _ = tx.send(result).await;
    }

    async fn request_once(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request_body(req);
        let resp = self
            .client
            .post(self.endpoint(false))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(OrchestrationError::Provider(format!(
                "Gemini API HTTP {}: {}",
                status, detail
            )));
        }

        let api_resp: GeminiResponse = resp.json().await?;
        convert_gemini_response(api_resp, true)
    }

    async fn run_stream(&self, req: LlmRequest, tx: &mpsc::Sender<Result<LlmResponse>>) {
        let body = self.build_request_body(&req);
        let resp = match self
            .client
            .post(self.endpoint(true))
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
                    "Gemini API stream HTTP {}: {}",
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

        let mut text = String::new();
        let mut calls: Vec<FunctionCall> = Vec::new();
        let mut finish_reason = FinishReason::Stop;
        let mut usage: Option<Usage> = None;

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    let _ = tx
                        .send(Err(OrchestrationError::Provider(format!(
                            "stream read error: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let chunk: GeminiResponse = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "skipping malformed Gemini chunk");
                    continue;
                }
            };

            let Some(candidate) = chunk.candidates.into_iter().next() else {
                continue;
            };
            if let Some(reason) = candidate.finish_reason {
                finish_reason = convert_gemini_finish(&reason);
            }
            if let Some(u) = chunk.usage_metadata {
                usage = Some(u.into());
            }
            let Some(content) = candidate.content else {
                continue;
            };
            for part in content.parts {
                if let Some(t) = part.text {
                    if part.thought.unwrap_or(false) {
                        if tx.send(Ok(LlmResponse::partial_thought(t))).await.is_err() {
                            return;
                        }
                    } else if !t.is_empty() {
                        text.push_str(&t);
                        if tx.send(Ok(LlmResponse::partial_text(t))).await.is_err() {
                            return;
                        }
                    }
                }
                if let Some(fc) = part.function_call {
                    calls.push(FunctionCall {
                        id: format!("call_{}", calls.len()),
                        name: fc.name,
                        args: fc.args,
                    });
                }
            }
        }

        let mut parts: Vec<Part> = Vec::new();
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        parts.extend(calls.into_iter().map(Part::FunctionCall));

        let _ = tx
            .send(Ok(LlmResponse {
                content: Content::model(parts),
                partial: false,
                turn_complete: true,
                finish_reason,
                usage,
            }))
            .await;
    }
}

impl LanguageModel for GeminiModel {
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

fn convert_content(content: &Content) -> Value {
    let role = match content.role {
        Role::Model => "model",
        _ => "user",
    };
    let parts: Vec<Value> = content
        .parts
        .iter()
        .map(|part| match part {
            Part::Text { text, thought } => {
                if *thought {
                    json!({"text": text, "thought": true})
                } else {
                    json!({"text": text})
                }
            }
            Part::FunctionCall(fc) => {
                json!({"functionCall": {"name": fc.name, "args": fc.args}})
            }
            Part::FunctionResponse(fr) => {
                json!({"functionResponse": {"name": fr.name, "response": fr.response}})
            }
        })
        .collect();
    json!({"role": role, "parts": parts})
}

fn convert_gemini_response(resp: GeminiResponse, turn_complete: bool) -> Result<LlmResponse> {
    let usage = resp.usage_metadata.map(Into::into);
    let Some(candidate) = resp.candidates.into_iter().next() else {
        return Err(OrchestrationError::ModelContent(
            "no candidates in Gemini response".into(),
        ));
    };

    let mut parts: Vec<Part> = Vec::new();
    if let Some(content) = candidate.content {
        for (i, part) in content.parts.into_iter().enumerate() {
            if let Some(text) = part.text {
                if part.thought.unwrap_or(false) {
                    parts.push(Part::thought(text));
                } else {
                    parts.push(Part::text(text));
                }
            }
            if let Some(fc) = part.function_call {
                parts.push(Part::FunctionCall(FunctionCall {
                    id: format!("call_{}", i),
                    name: fc.name,
                    args: fc.args,
                }));
            }
        }
    }

    Ok(LlmResponse {
        content: Content::model(parts),
        partial: false,
        turn_complete,
        finish_reason: candidate
            .finish_reason
            .as_deref()
            .map(convert_gemini_finish)
            .unwrap_or(FinishReason::Stop),
        usage,
    })
}

fn convert_gemini_finish(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" => FinishReason::Safety,
        _ => FinishReason::Unspecified,
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
    #[serde(default)]
    total_token_count: i64,
}

impl From<GeminiUsage> for Usage {
    fn from(u: GeminiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_response_maps_parts() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "先想想", "thought": true},
                    {"text": "建议观望"},
                    {"functionCall": {"name": "get_kline_data", "args": {"code": "sh600519"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 4, "totalTokenCount": 7}
        }))
        .unwrap();
        let converted = convert_gemini_response(resp, true).unwrap();
        assert_eq!(converted.content.visible_text(), "建议观望");
        assert_eq!(converted.content.function_calls().len(), 1);
        assert_eq!(converted.finish_reason, FinishReason::Stop);
        assert_eq!(converted.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_request_body_shape() {
        let config = AiConfig {
            provider: crate::models::AiProvider::Gemini,
            model_name: "gemini-2.0-flash".into(),
            base_url: String::new(),
            api_key: "k".into(),
            no_system_role: false,
            thinking_level: None,
        };
        let model = GeminiModel::new(&config).unwrap();
        let req = LlmRequest {
            contents: vec![Content::user_text("今天能买吗")],
            config: crate::llm::GenerateConfig {
                system_instruction: Some("你是分析师".into()),
                temperature: Some(0.3),
                ..Default::default()
            },
        };
        let body = model.build_request_body(&req);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "你是分析师");
        assert_eq!(body["generationConfig"]["temperature"], 0.3);
    }
}
