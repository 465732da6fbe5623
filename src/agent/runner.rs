//! Agent run loop
//!
//! Drives one expert turn: stream the model, surface every event to the
//! caller, execute requested tool calls, feed results back, and iterate
//! until a turn completes without tool calls.

use crate::llm::{
    Content, FunctionDecl, GenerateConfig, LanguageModel, LlmRequest, LlmResponse, Part, Role,
    ResponseStream,
};
use crate::tools::Tool;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on model→tool→model iterations within one turn
const MAX_TOOL_ITERATIONS: usize = 8;

/// One-shot agent instance produced by the builder
pub struct BuiltAgent {
    pub name: String,
    pub model: Arc<dyn LanguageModel>,
    pub instruction: String,
    pub tools: Vec<Arc<dyn Tool>>,
}

/// Run the agent once. The returned stream carries every model event
/// (partials, aggregated turns) plus interim function-response events after
/// each tool execution. Dropping the stream stops the loop.
pub fn run_agent(agent: BuiltAgent, query: String, streaming: bool) -> ResponseStream {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        run_loop(agent, query, streaming, tx).await;
    });
    Box::pin(ReceiverStream::new(rx))
}

async fn run_loop(
    agent: BuiltAgent,
    query: String,
    streaming: bool,
    tx: mpsc::Sender<crate::Result<LlmResponse>>,
) {
    let session_id = format!("session-{}-{}", agent.name, Uuid::new_v4());
    debug!(session = %session_id, tools = agent.tools.len(), "agent run starting");

    let decls: Vec<FunctionDecl> = agent
        .tools
        .iter()
        .map(|t| FunctionDecl {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        })
        .collect();

    let mut contents = vec![Content::user_text(query)];

    for iteration in 0..MAX_TOOL_ITERATIONS {
        let request = LlmRequest {
            contents: contents.clone(),
            config: GenerateConfig {
                system_instruction: Some(agent.instruction.clone()),
                tools: decls.clone(),
                ..Default::default()
            },
        };

        let mut stream = agent.model.generate(request, streaming);
        let mut final_response: Option<LlmResponse> = None;

        while let Some(item) = stream.next().await {
            match item {
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                Ok(response) => {
                    if response.turn_complete {
                        final_response = Some(response.clone());
                    }
                    if tx.send(Ok(response)).await.is_err() {
                        // Consumer walked away; stop cleanly
                        return;
                    }
                }
            }
        }

        let Some(final_response) = final_response else {
            debug!(agent = %agent.name, "model stream ended without a final turn");
            return;
        };

        let calls: Vec<_> = final_response
            .content
            .function_calls()
            .into_iter()
            .cloned()
            .collect();
        if calls.is_empty() {
            return;
        }

        debug!(agent = %agent.name, iteration, calls = calls.len(), "executing tool calls");
        contents.push(final_response.content.clone());

        let mut response_parts = Vec::with_capacity(calls.len());
        for call in calls {
            let result = match agent.tools.iter().find(|t| t.name() == call.name) {
                Some(tool) => match tool.execute(call.args.clone()).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(agent = %agent.name, tool = %call.name, error = %e, "tool execution failed");
                        json!({"error": e.to_string()})
                    }
                },
                None => {
                    warn!(agent = %agent.name, tool = %call.name, "tool not registered");
                    json!({"error": format!("tool {} is not available", call.name)})
                }
            };
            response_parts.push(Part::FunctionResponse(crate::llm::FunctionResponse {
                id: call.id,
                name: call.name,
                response: result,
            }));
        }

        // Surface the tool results to the observer before the next round
        let interim = LlmResponse::interim(Content {
            role: Role::User,
            parts: response_parts.clone(),
        });
        if tx.send(Ok(interim)).await.is_err() {
            return;
        }
        contents.push(Content {
            role: Role::User,
            parts: response_parts,
        });
    }

    warn!(agent = %agent.name, "tool iteration cap reached");
}
