//! Core data models shared across the meeting orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Subject =================
//

/// Basic quote snapshot for the subject under discussion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stock {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub change: f64,
    pub change_percent: f64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub pre_close: f64,
}

/// User position in the subject, used to derive market value and P/L lines
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockPosition {
    pub shares: i64,
    pub cost_price: f64,
}

/// Single K-line bar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KLineData {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// One side level of the order book
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookItem {
    pub price: f64,
    pub size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookItem>,
    pub asks: Vec<OrderBookItem>,
}

//
// ================= Expert Configuration =================
//

/// Stable identity and wiring of one expert persona.
/// Immutable for the duration of a meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    /// System-prompt template; a default preamble is derived from
    /// name and role when empty.
    #[serde(default)]
    pub instruction: String,
    /// Ordered built-in tool ids attached to this expert
    #[serde(default)]
    pub tools: Vec<String>,
    /// Ordered MCP server ids whose toolsets are attached
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-expert provider override, resolved through the service's
    /// config resolver when non-empty
    #[serde(default)]
    pub ai_config_id: String,
}

fn default_enabled() -> bool {
    true
}

//
// ================= Provider Configuration =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    /// Chat-completion protocol (OpenAI compatible)
    OpenAi,
    /// Native Gemini generateContent protocol
    Gemini,
    /// OpenAI Responses SSE protocol
    Responses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
}

/// One LLM endpoint the factory can build a model handle from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    pub provider: AiProvider,
    pub model_name: String,
    #[serde(default)]
    pub base_url: String,
    pub api_key: String,
    /// The endpoint rejects a `system` role; rewrite it as `user`
    #[serde(default)]
    pub no_system_role: bool,
    #[serde(default)]
    pub thinking_level: Option<ThinkingLevel>,
}

//
// ================= MCP Configuration =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transportType", rename_all = "lowercase")]
pub enum McpTransport {
    Sse { endpoint: String },
    Http { endpoint: String },
    Command { command: String, args: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: McpTransport,
    /// Only expose tools with these names; empty = all
    #[serde(default)]
    pub tool_filter: Vec<String>,
}

//
// ================= Meeting Wire Types =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Opening,
    Opinion,
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingMode {
    /// Moderator plans the roster; experts speak serially
    Smart,
    /// Caller fixed the roster; experts speak in parallel
    Direct,
}

/// Public record of one completed turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub round: i32,
    pub msg_type: MsgType,
    /// Non-empty on failure; the UI shows a retry affordance off this
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub meeting_mode: MeetingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    AgentStart,
    AgentDone,
    AgentError,
    ToolCall,
    ToolResult,
    Streaming,
    MeetingInterrupted,
}

/// Fine-grained progress beacon streamed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub agent_id: String,
    pub agent_name: String,
    /// Tool name, phase description, or error detail
    #[serde(default)]
    pub detail: String,
    /// Token delta for `streaming`; comma-joined remaining expert ids
    /// for `meeting_interrupted`
    #[serde(default)]
    pub content: String,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, agent_id: &str, agent_name: &str) -> Self {
        Self {
            kind,
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            detail: String::new(),
            content: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

/// One completed turn as seen by later speakers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionEntry {
    pub round: i32,
    pub agent_id: String,
    pub agent_name: String,
    pub role: String,
    pub content: String,
}

impl fmt::Display for AiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AiProvider::OpenAi => "openai",
            AiProvider::Gemini => "gemini",
            AiProvider::Responses => "responses",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_response_error_field_omitted_when_empty() {
        let resp = ChatResponse {
            agent_id: "bull".into(),
            agent_name: "多头".into(),
            role: "看多分析师".into(),
            content: "观点".into(),
            round: 1,
            msg_type: MsgType::Opinion,
            error: String::new(),
            meeting_mode: MeetingMode::Smart,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"msgType\":\"opinion\""));
        assert!(json.contains("\"meetingMode\":\"smart\""));
    }

    #[test]
    fn test_progress_event_wire_shape() {
        let ev = ProgressEvent::new(ProgressKind::ToolCall, "quant", "量化分析师")
            .with_detail("get_kline_data");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"tool_call\""));
        assert!(json.contains("\"agentId\":\"quant\""));
    }

    #[test]
    fn test_agent_config_defaults() {
        let cfg: AgentConfig =
            serde_json::from_str(r#"{"id":"bull","name":"多头","role":"看多分析师"}"#).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.tools.is_empty());
        assert!(cfg.ai_config_id.is_empty());
    }
}
