//! Expert agent construction
//!
//! A stateless factory that turns an expert config plus the meeting context
//! into a one-shot agent instance: composed system prompt, attached tools,
//! model handle. The run loop lives in [`runner`].

pub mod runner;

pub use runner::{run_agent, BuiltAgent};

use crate::llm::LanguageModel;
use crate::mcp;
use crate::models::{AgentConfig, Stock, StockPosition};
use crate::tools::Registry;
use chrono::{Datelike, Local, Timelike, Weekday};
use std::sync::Arc;

/// Builds one-shot expert agents
pub struct ExpertAgentBuilder {
    model: Arc<dyn LanguageModel>,
    tool_registry: Option<Arc<Registry>>,
    mcp_manager: Option<Arc<mcp::Manager>>,
}

impl ExpertAgentBuilder {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            tool_registry: None,
            mcp_manager: None,
        }
    }

    pub fn with_tools(model: Arc<dyn LanguageModel>, registry: Arc<Registry>) -> Self {
        Self {
            model,
            tool_registry: Some(registry),
            mcp_manager: None,
        }
    }

    pub fn full(
        model: Arc<dyn LanguageModel>,
        registry: Arc<Registry>,
        mcp_manager: Arc<mcp::Manager>,
    ) -> Self {
        Self {
            model,
            tool_registry: Some(registry),
            mcp_manager: Some(mcp_manager),
        }
    }

    /// Build an agent for one turn. `context` carries the quoted opinion or
    /// the prior transcript; empty means a fresh question.
    pub async fn build(
        &self,
        config: &AgentConfig,
        stock: &Stock,
        query: &str,
        context: &str,
        position: Option<&StockPosition>,
    ) -> BuiltAgent {
        let tools_description = self.build_tools_description(config).await;
        let instruction = compose_instruction(
            config,
            stock,
            query,
            context,
            position,
            &tools_description,
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            current_market_phase(),
        );

        let mut tools = Vec::new();
        if let Some(registry) = &self.tool_registry {
            if !config.tools.is_empty() {
                tools.extend(registry.get_tools(&config.tools));
            }
        }
        if let Some(mcp_manager) = &self.mcp_manager {
            if !config.mcp_servers.is_empty() {
                tools.extend(mcp_manager.toolsets_by_ids(&config.mcp_servers).await);
            }
        }

        BuiltAgent {
            name: config.id.clone(),
            model: Arc::clone(&self.model),
            instruction,
            tools,
        }
    }

    async fn build_tools_description(&self, config: &AgentConfig) -> String {
        let mut descriptions = Vec::new();

        if let Some(registry) = &self.tool_registry {
            if !config.tools.is_empty() {
                for info in registry.tool_infos(&config.tools) {
                    descriptions.push(format!("- {}: {}", info.name, info.description));
                }
            }
        }

        if let Some(mcp_manager) = &self.mcp_manager {
            if !config.mcp_servers.is_empty() {
                for info in mcp_manager
                    .tool_infos_by_server_ids(&config.mcp_servers)
                    .await
                {
                    descriptions.push(format!(
                        "- {}: {} (来自 {})",
                        info.name, info.description, info.server_name
                    ));
                }
            }
        }

        if descriptions.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n可用工具:\n");
        for desc in descriptions {
            out.push_str(&desc);
            out.push('\n');
        }
        out
    }
}

/// Market phase from the local wall clock, A-share session hours
pub fn current_market_phase() -> &'static str {
    let now = Local::now();
    market_phase(now.weekday(), now.hour(), now.minute())
}

pub(crate) fn market_phase(weekday: Weekday, hour: u32, minute: u32) -> &'static str {
    if weekday == Weekday::Sat || weekday == Weekday::Sun {
        return "休市（周末）";
    }
    let minutes = hour * 60 + minute;
    if (9 * 60 + 30..=11 * 60 + 30).contains(&minutes) {
        "盘中（上午交易时段）"
    } else if (13 * 60..=15 * 60).contains(&minutes) {
        "盘中（下午交易时段）"
    } else if minutes < 9 * 60 + 30 {
        "盘前"
    } else if minutes > 15 * 60 {
        "盘后"
    } else {
        "午间休市"
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn compose_instruction(
    config: &AgentConfig,
    stock: &Stock,
    query: &str,
    context: &str,
    position: Option<&StockPosition>,
    tools_description: &str,
    time_str: String,
    market_status: &str,
) -> String {
    let base_instruction = if config.instruction.is_empty() {
        format!("你是一位{}，名字是{}。", config.role, config.name)
    } else {
        config.instruction.clone()
    };

    let mut prompt = format!(
        "{}\n{}\n当前时间: {}\n市场状态: {}\n\n股票: {} ({})\n当前价格: {:.2}\n涨跌幅: {:.2}%\n",
        base_instruction,
        tools_description,
        time_str,
        market_status,
        stock.symbol,
        stock.name,
        stock.price,
        stock.change_percent,
    );

    if let Some(position) = position {
        if position.shares > 0 {
            let market_value = position.shares as f64 * stock.price;
            let cost_amount = position.shares as f64 * position.cost_price;
            let profit_loss = market_value - cost_amount;
            let profit_percent = if cost_amount > 0.0 {
                profit_loss / cost_amount * 100.0
            } else {
                0.0
            };
            prompt.push_str(&format!(
                "\n用户持仓: {}股，成本价 {:.2}\n持仓市值: {:.2}，盈亏: {:.2} ({:.2}%)\n",
                position.shares, position.cost_price, market_value, profit_loss, profit_percent
            ));
        }
    }

    if !context.is_empty() {
        prompt.push_str(&format!(
            "--- 引用的观点 ---\n{}\n---\n\n小韭菜问题: {}\n\n请结合以上引用的观点，发表你的看法。可以赞同、补充或反驳。回复控制在150字以内。",
            context, query
        ));
    } else {
        prompt.push_str(&format!(
            "小韭菜问题: {}\n\n请用简洁专业的语言回答，控制在150字以内。",
            query
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModel;

    fn sample_stock() -> Stock {
        Stock {
            symbol: "sh600519".into(),
            name: "贵州茅台".into(),
            price: 1700.0,
            change_percent: 1.2,
            ..Default::default()
        }
    }

    fn sample_config() -> AgentConfig {
        AgentConfig {
            id: "bull".into(),
            name: "多头".into(),
            role: "看多分析师".into(),
            instruction: String::new(),
            tools: vec![],
            mcp_servers: vec![],
            enabled: true,
            ai_config_id: String::new(),
        }
    }

    #[test]
    fn test_market_phase_boundaries() {
        assert_eq!(market_phase(Weekday::Sat, 10, 0), "休市（周末）");
        assert_eq!(market_phase(Weekday::Mon, 9, 29), "盘前");
        assert_eq!(market_phase(Weekday::Mon, 9, 30), "盘中（上午交易时段）");
        assert_eq!(market_phase(Weekday::Mon, 11, 30), "盘中（上午交易时段）");
        assert_eq!(market_phase(Weekday::Mon, 12, 0), "午间休市");
        assert_eq!(market_phase(Weekday::Mon, 13, 0), "盘中（下午交易时段）");
        assert_eq!(market_phase(Weekday::Mon, 15, 1), "盘后");
    }

    #[test]
    fn test_instruction_includes_subject_and_length_cap() {
        let prompt = compose_instruction(
            &sample_config(),
            &sample_stock(),
            "今天可以买入吗?",
            "",
            None,
            "",
            "2026-08-02 10:00:00".into(),
            "盘中（上午交易时段）",
        );
        assert!(prompt.contains("你是一位看多分析师，名字是多头。"));
        assert!(prompt.contains("股票: sh600519 (贵州茅台)"));
        assert!(prompt.contains("当前价格: 1700.00"));
        assert!(prompt.contains("涨跌幅: 1.20%"));
        assert!(prompt.contains("150字以内"));
        assert!(!prompt.contains("用户持仓"));
    }

    #[test]
    fn test_instruction_derives_position_lines() {
        let position = StockPosition {
            shares: 100,
            cost_price: 1600.0,
        };
        let prompt = compose_instruction(
            &sample_config(),
            &sample_stock(),
            "要不要止盈?",
            "",
            Some(&position),
            "",
            "2026-08-02 10:00:00".into(),
            "盘前",
        );
        assert!(prompt.contains("用户持仓: 100股，成本价 1600.00"));
        assert!(prompt.contains("持仓市值: 170000.00，盈亏: 10000.00 (6.25%)"));
    }

    #[test]
    fn test_context_block_precedes_question() {
        let prompt = compose_instruction(
            &sample_config(),
            &sample_stock(),
            "怎么看?",
            "【前面专家的发言】\n- 空头：风险偏高\n",
            None,
            "",
            "2026-08-02 10:00:00".into(),
            "盘后",
        );
        let context_pos = prompt.find("--- 引用的观点 ---").unwrap();
        let question_pos = prompt.find("小韭菜问题: 怎么看?").unwrap();
        assert!(context_pos < question_pos);
    }

    #[tokio::test]
    async fn test_build_attaches_registered_tools() {
        use crate::tools::{Registry, Tool};
        use serde_json::{json, Value};

        struct NoopTool;
        #[async_trait::async_trait]
        impl Tool for NoopTool {
            fn name(&self) -> &str {
                "get_kline_data"
            }
            fn description(&self) -> &str {
                "K线"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _args: Value) -> crate::Result<Value> {
                Ok(json!({}))
            }
        }

        let mut registry = Registry::new();
        registry.register(Arc::new(NoopTool));
        let builder = ExpertAgentBuilder::with_tools(MockModel::new(), Arc::new(registry));

        let mut config = sample_config();
        config.tools = vec!["get_kline_data".into()];
        let agent = builder
            .build(&config, &sample_stock(), "问题", "", None)
            .await;
        assert_eq!(agent.tools.len(), 1);
        assert!(agent.instruction.contains("可用工具"));
        assert!(agent.instruction.contains("get_kline_data"));
    }
}
