//! Meeting request shape and event sinks
//!
//! Completed turns and fine-grained progress flow to observers through
//! bounded channels. Phase transitions are awaited so they are never
//! dropped; streaming token deltas are fire-and-forget and may be shed
//! under backpressure.

use crate::models::{AgentConfig, ChatResponse, ProgressEvent, Stock, StockPosition};
use tokio::sync::mpsc;
use tracing::debug;

/// One meeting request
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Cache key for interrupt state; empty disables interrupt caching
    pub stock_code: String,
    pub stock: Stock,
    /// Caller-fixed expert set (direct mode)
    pub agents: Vec<AgentConfig>,
    pub query: String,
    /// Quoted prior opinion (direct mode)
    pub reply_content: String,
    /// Full pool the planner selects from (smart mode)
    pub all_agents: Vec<AgentConfig>,
    pub position: Option<StockPosition>,
}

/// Delivers completed turns as they land
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<ChatResponse>,
}

impl ResponseSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatResponse>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, response: ChatResponse) {
        if self.tx.send(response).await.is_err() {
            debug!("response sink closed, observer gone");
        }
    }
}

/// Delivers progress beacons
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Phase transition: waits for channel room rather than dropping
    pub async fn phase(&self, event: ProgressEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("progress sink closed, observer gone");
        }
    }

    /// Streaming token delta: shed when the observer lags
    pub fn delta(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}
