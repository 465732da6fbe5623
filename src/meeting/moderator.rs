//! Meeting moderator
//!
//! A distinguished agent that never produces opinions: it plans the
//! discussion (expert selection, topic, opening line) and condenses the
//! transcript into a closing summary. Plan output is strict JSON, but the
//! parser tolerates the many ways models wrap it.

use crate::llm::vendor::filter_vendor_markers;
use crate::llm::{Content, LanguageModel, LlmRequest};
use crate::error::OrchestrationError;
use crate::models::{AgentConfig, DiscussionEntry, Stock};
use crate::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Planning output: which experts speak, in what order, and the opening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeratorDecision {
    #[serde(default)]
    pub intent: String,
    pub selected: Vec<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub opening: String,
}

#[derive(Clone)]
pub struct Moderator {
    model: Arc<dyn LanguageModel>,
}

impl Moderator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Analyze the question and pick 1-3 experts from the pool
    pub async fn analyze(
        &self,
        stock: &Stock,
        query: &str,
        agents: &[AgentConfig],
    ) -> Result<ModeratorDecision> {
        let prompt = build_analyze_prompt(stock, query, agents);
        let content = self.generate(&prompt).await?;
        parse_decision(&content)
    }

    /// Condense the transcript into a closing conclusion
    pub async fn summarize(
        &self,
        stock: &Stock,
        query: &str,
        history: &[DiscussionEntry],
    ) -> Result<String> {
        let prompt = build_summarize_prompt(stock, query, history);
        self.generate(&prompt).await
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = LlmRequest {
            contents: vec![Content::user_text(prompt)],
            config: Default::default(),
        };
        let mut stream = self.model.generate(request, false);
        let mut result = String::new();
        while let Some(item) = stream.next().await {
            let response = item?;
            result.push_str(&response.content.visible_text());
        }
        Ok(filter_vendor_markers(&result))
    }
}

fn build_analyze_prompt(stock: &Stock, query: &str, agents: &[AgentConfig]) -> String {
    let mut prompt = String::from("你是「财经会议室」的小韭菜，负责组织专家讨论。\n\n");
    prompt.push_str("## 当前股票\n");
    prompt.push_str(&format!(
        "{} ({})，现价 {:.2}，涨跌幅 {:.2}%\n\n",
        stock.name, stock.symbol, stock.price, stock.change_percent
    ));
    prompt.push_str("## 老韭菜问题\n");
    prompt.push_str(query);
    prompt.push_str("\n\n## 可邀请的专家\n");
    for agent in agents {
        prompt.push_str(&format!("- {}（ID: {}）：{}\n", agent.name, agent.id, agent.role));
    }
    prompt.push_str("\n## 你的任务\n");
    prompt.push_str("1. 分析老韭菜问题的核心意图\n");
    prompt.push_str("2. 选择 1-3 位最相关的专家\n");
    prompt.push_str("3. 生成讨论议题和开场白\n\n");
    prompt.push_str("## 输出格式（仅输出JSON）\n");
    prompt.push_str(r#"{"intent":"意图","selected":["id1"],"topic":"议题","opening":"开场白"}"#);
    prompt
}

fn build_summarize_prompt(stock: &Stock, query: &str, history: &[DiscussionEntry]) -> String {
    let mut prompt = String::from("你是会议小韭菜，请总结讨论并给老韭菜结论。\n\n");
    prompt.push_str(&format!("## 股票：{} ({})\n\n", stock.name, stock.symbol));
    prompt.push_str("## 老韭菜问题\n");
    prompt.push_str(query);
    prompt.push_str("\n\n## 讨论记录\n");
    for entry in history {
        prompt.push_str(&format!(
            "【{}（{}）】\n{}\n\n",
            entry.agent_name, entry.role, entry.content
        ));
    }
    prompt.push_str("## 输出要求\n");
    prompt.push_str("1. 核心结论（直接回答老韭菜）\n");
    prompt.push_str("2. 各方观点摘要\n");
    prompt.push_str("3. 综合建议\n\n");
    prompt.push_str("控制在 300 字以内。");
    prompt
}

/// Parse the decision JSON, tolerating wrappers around it
pub fn parse_decision(content: &str) -> Result<ModeratorDecision> {
    let content = content.trim();

    let json_str = extract_json(content);
    if json_str.is_empty() {
        return Err(OrchestrationError::Parse(format!(
            "no JSON object in moderator reply: {}",
            truncate(content, 200)
        )));
    }

    let decision: ModeratorDecision = serde_json::from_str(&json_str).map_err(|e| {
        OrchestrationError::Parse(format!("{} in: {}", e, truncate(&json_str, 200)))
    })?;

    if decision.selected.is_empty() {
        return Err(OrchestrationError::Parse(
            "moderator selected no experts".to_string(),
        ));
    }

    Ok(decision)
}

/// Pull a JSON object out of free-form model text.
///
/// Tries, in order: the whole trimmed text, a ```json fence, a generic
/// fence, quote-aware brace matching, and finally the widest `{…}` slice.
fn extract_json(content: &str) -> String {
    let content = content.trim();
    if content.starts_with('{') && content.ends_with('}') {
        return content.to_string();
    }

    if let Some(idx) = content.find("```json") {
        let start = idx + 7;
        if let Some(end) = content[start..].find("```") {
            return content[start..start + end].trim().to_string();
        }
    }

    if let Some(idx) = content.find("```") {
        let mut start = idx + 3;
        // Skip a possible language tag
        if let Some(newline) = content[start..].find('\n') {
            start += newline + 1;
        }
        if let Some(end) = content[start..].find("```") {
            let extracted = content[start..start + end].trim();
            if extracted.starts_with('{') {
                return extracted.to_string();
            }
        }
    }

    let Some(start) = content.find('{') else {
        return String::new();
    };

    let bytes = content.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for i in start..bytes.len() {
        let c = bytes[i];
        if escape {
            escape = false;
            continue;
        }
        if c == b'\\' && in_string {
            escape = true;
            continue;
        }
        if c == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == b'{' {
            depth += 1;
        } else if c == b'}' {
            depth -= 1;
            if depth == 0 {
                return content[start..=i].to_string();
            }
        }
    }

    // Unbalanced braces: fall back to the widest slice
    if let Some(end) = content.rfind('}') {
        if end > start {
            return content[start..=end].to_string();
        }
    }

    String::new()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModel;

    fn pool() -> Vec<AgentConfig> {
        ["bull", "bear", "quant"]
            .iter()
            .map(|id| AgentConfig {
                id: id.to_string(),
                name: id.to_string(),
                role: "分析师".into(),
                instruction: String::new(),
                tools: vec![],
                mcp_servers: vec![],
                enabled: true,
                ai_config_id: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_parse_bare_json() {
        let decision = parse_decision(
            r#"{"intent":"买卖判断","selected":["bull","bear"],"topic":"今天买不买","opening":"两方观点讨论一下"}"#,
        )
        .unwrap();
        assert_eq!(decision.selected, vec!["bull", "bear"]);
        assert_eq!(decision.opening, "两方观点讨论一下");
    }

    #[test]
    fn test_parse_json_fence_with_preamble() {
        let raw = "Here's my plan:\n```json\n{\"selected\":[\"bull\"],\"opening\":\"ok\"}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.selected, vec!["bull"]);
        assert_eq!(decision.opening, "ok");
    }

    #[test]
    fn test_parse_generic_fence() {
        let raw = "```\n{\"selected\":[\"quant\"]}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.selected, vec!["quant"]);
    }

    #[test]
    fn test_brace_matching_respects_strings() {
        // The '}' inside the string value must not end the scan early
        let raw = "前置说明 {\"selected\":[\"bull\"],\"opening\":\"注意 } 这个符号\"} 后缀";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.opening, "注意 } 这个符号");
    }

    #[test]
    fn test_brace_matching_respects_escapes() {
        let raw = r#"说明 {"selected":["bull"],"opening":"引号 \" 和 } 混排"} 结束"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.opening, "引号 \" 和 } 混排");
    }

    #[test]
    fn test_empty_selection_rejected() {
        let err = parse_decision(r#"{"selected":[],"opening":"ok"}"#).unwrap_err();
        assert!(matches!(err, OrchestrationError::Parse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_no_json_rejected() {
        let err = parse_decision("我觉得大家都可以聊聊").unwrap_err();
        assert!(matches!(err, OrchestrationError::Parse(_)));
    }

    #[test]
    fn test_round_trip() {
        let decision = ModeratorDecision {
            intent: "判断买卖点".into(),
            selected: vec!["bull".into(), "bear".into(), "quant".into()],
            topic: "回调是否结束".into(),
            opening: "请各位依次发言".into(),
        };
        let serialized = serde_json::to_string(&decision).unwrap();
        let parsed = parse_decision(&serialized).unwrap();
        assert_eq!(parsed, decision);
    }

    #[tokio::test]
    async fn test_analyze_filters_vendor_markers() {
        use crate::llm::vendor::{TOOL_CALL_BEGIN, TOOL_CALL_END, TOOL_CALL_SEP};
        let model = MockModel::new();
        model.push_reply(format!(
            "{{\"selected\":[\"bull\"],\"opening\":\"开始\"}}{}x{}{{}}{}",
            TOOL_CALL_BEGIN, TOOL_CALL_SEP, TOOL_CALL_END
        ));
        let moderator = Moderator::new(model);
        let stock = Stock {
            symbol: "sh600519".into(),
            name: "贵州茅台".into(),
            price: 1700.0,
            change_percent: 1.2,
            ..Default::default()
        };
        let decision = moderator.analyze(&stock, "能买吗", &pool()).await.unwrap();
        assert_eq!(decision.selected, vec!["bull"]);
    }

    #[tokio::test]
    async fn test_summarize_returns_prose() {
        let model = MockModel::new();
        model.push_reply("结论：短线观望。多头看业绩，空头看估值。建议等回调。");
        let moderator = Moderator::new(model);
        let stock = Stock::default();
        let history = vec![DiscussionEntry {
            round: 1,
            agent_id: "bull".into(),
            agent_name: "多头".into(),
            role: "看多分析师".into(),
            content: "业绩超预期".into(),
        }];
        let summary = moderator.summarize(&stock, "能买吗", &history).await.unwrap();
        assert!(summary.contains("短线观望"));
    }
}
