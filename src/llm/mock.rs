//! Scripted model for development and testing
//!
//! Keeps orchestration runnable without any network dependency. Turns are
//! consumed in FIFO order, one per `generate` call.

use super::{Content, LanguageModel, LlmRequest, LlmResponse, ResponseStream};
use crate::error::OrchestrationError;
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One scripted `generate` call
pub enum MockTurn {
    /// Stream the text as a handful of deltas, then the aggregated turn
    Reply(String),
    /// Fail with a transient provider error
    Fail(String),
    /// Sleep, then reply (for deadline tests)
    DelayedReply(Duration, String),
    /// Emit an explicit response sequence verbatim
    Events(Vec<LlmResponse>),
}

pub struct MockModel {
    script: Mutex<VecDeque<MockTurn>>,
    /// Record of every request, for assertions
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, turn: MockTurn) {
        self.script.lock().unwrap().push_back(turn);
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        self.push(MockTurn::Reply(text.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.push(MockTurn::Fail(message.into()));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Split a reply into small char-boundary deltas
    fn deltas(text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars.chunks(5).map(|c| c.iter().collect()).collect()
    }
}

impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        "mock-model"
    }

    fn generate(&self, request: LlmRequest, stream: bool) -> ResponseStream {
        self.requests.lock().unwrap().push(request);
        let turn = self.script.lock().unwrap().pop_front();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            match turn {
                None => {
                    let _ = tx
                        .send(Err(OrchestrationError::Provider(
                            "mock script exhausted".to_string(),
                        )))
                        .await;
                }
                Some(MockTurn::Fail(message)) => {
                    let _ = tx.send(Err(OrchestrationError::Provider(message))).await;
                }
                Some(MockTurn::Reply(text)) => {
                    emit_reply(&tx, &text, stream).await;
                }
                Some(MockTurn::DelayedReply(delay, text)) => {
                    tokio::time::sleep(delay).await;
                    emit_reply(&tx, &text, stream).await;
                }
                Some(MockTurn::Events(events)) => {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

async fn emit_reply(tx: &mpsc::Sender<Result<LlmResponse>>, text: &str, stream: bool) {
    if stream {
        for delta in MockModel::deltas(text) {
            if tx.send(Ok(LlmResponse::partial_text(delta))).await.is_err() {
                return;
            }
        }
    }
    let _ = tx
        .send(Ok(LlmResponse::final_turn(Content::model(vec![
            super::Part::text(text),
        ]))))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_streamed_reply_aggregates() {
        let model = MockModel::new();
        model.push_reply("基本面稳健，回调即是机会。");

        let mut stream = model.generate(LlmRequest::default(), true);
        let mut streamed = String::new();
        let mut final_text = String::new();
        while let Some(item) = stream.next().await {
            let resp = item.unwrap();
            if resp.partial {
                streamed.push_str(&resp.content.visible_text());
            } else if resp.turn_complete {
                final_text = resp.content.visible_text();
            }
        }
        assert_eq!(streamed, final_text);
        assert_eq!(model.request_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let model = MockModel::new();
        let mut stream = model.generate(LlmRequest::default(), false);
        let item = stream.next().await.unwrap();
        assert!(item.is_err());
    }
}
