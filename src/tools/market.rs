//! Market-data tools
//!
//! Thin tool wrappers over the market-data collaborator. Outputs are
//! formatted as compact text so the model sees a digestible snapshot
//! rather than raw series.

use super::Tool;
use crate::error::OrchestrationError;
use crate::models::{KLineData, OrderBook, Stock};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Interface boundary to the realtime market services
#[async_trait::async_trait]
pub trait MarketDataService: Send + Sync {
    async fn get_kline(&self, code: &str, period: &str, days: u32) -> Result<Vec<KLineData>>;
    async fn get_realtime(&self, codes: &[String]) -> Result<Vec<Stock>>;
    async fn get_order_book(&self, code: &str) -> Result<OrderBook>;
    async fn search_stocks(&self, keyword: &str, limit: u32) -> Result<Vec<Stock>>;
}

fn require_code(args: &Value) -> Result<String> {
    args.get("code")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| OrchestrationError::Tool("expected 'code' in arguments".to_string()))
}

pub struct KLineTool {
    service: Arc<dyn MarketDataService>,
}

impl KLineTool {
    pub fn new(service: Arc<dyn MarketDataService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Tool for KLineTool {
    fn name(&self) -> &str {
        "get_kline_data"
    }

    fn description(&self) -> &str {
        "获取股票K线数据，支持5分钟线、日线、周线、月线"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "股票代码，如 sh600519"},
                "period": {"type": "string", "description": "K线周期: 1m/1d/1w/1mo，默认1d"},
                "days": {"type": "integer", "description": "获取天数，默认30"}
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let code = require_code(&args)?;
        let period = args
            .get("period")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("1d");
        let days = args.get("days").and_then(|v| v.as_u64()).unwrap_or(30) as u32;

        debug!(code = %code, period = %period, days, "fetching klines");
        let klines = self.service.get_kline(&code, period, days).await?;

        // Only the last 10 bars, to keep the prompt lean
        let start = klines.len().saturating_sub(10);
        let mut text = String::new();
        for k in &klines[start..] {
            text.push_str(&format!(
                "{}: 开{:.2} 高{:.2} 低{:.2} 收{:.2} 量{}\n",
                k.time, k.open, k.high, k.low, k.close, k.volume
            ));
        }
        Ok(json!({"data": text}))
    }
}

pub struct RealtimeQuoteTool {
    service: Arc<dyn MarketDataService>,
}

impl RealtimeQuoteTool {
    pub fn new(service: Arc<dyn MarketDataService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Tool for RealtimeQuoteTool {
    fn name(&self) -> &str {
        "get_realtime_quote"
    }

    fn description(&self) -> &str {
        "获取股票实时行情（现价、涨跌幅、成交量）"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "股票代码，如 sh600519"}
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let code = require_code(&args)?;
        let stocks = self.service.get_realtime(&[code]).await?;
        let Some(stock) = stocks.first() else {
            return Ok(json!({"data": "未找到该股票的实时行情"}));
        };
        Ok(json!({"data": format!(
            "{} ({}) 现价 {:.2}，涨跌幅 {:.2}%，成交量 {}",
            stock.name, stock.symbol, stock.price, stock.change_percent, stock.volume
        )}))
    }
}

pub struct OrderBookTool {
    service: Arc<dyn MarketDataService>,
}

impl OrderBookTool {
    pub fn new(service: Arc<dyn MarketDataService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Tool for OrderBookTool {
    fn name(&self) -> &str {
        "get_order_book"
    }

    fn description(&self) -> &str {
        "获取股票五档盘口数据"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "股票代码"}
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let code = require_code(&args)?;
        let book = self.service.get_order_book(&code).await?;
        let mut text = String::from("卖盘:\n");
        for ask in book.asks.iter().rev() {
            text.push_str(&format!("  {:.2} x {}\n", ask.price, ask.size));
        }
        text.push_str("买盘:\n");
        for bid in &book.bids {
            text.push_str(&format!("  {:.2} x {}\n", bid.price, bid.size));
        }
        Ok(json!({"data": text}))
    }
}

pub struct StockSearchTool {
    service: Arc<dyn MarketDataService>,
}

impl StockSearchTool {
    pub fn new(service: Arc<dyn MarketDataService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Tool for StockSearchTool {
    fn name(&self) -> &str {
        "search_stocks"
    }

    fn description(&self) -> &str {
        "按关键词搜索股票（名称或代码）"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": {"type": "string", "description": "搜索关键词"},
                "limit": {"type": "integer", "description": "返回条数上限，默认10"}
            },
            "required": ["keyword"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let keyword = args
            .get("keyword")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OrchestrationError::Tool("expected 'keyword' in arguments".into()))?;
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as u32;

        let stocks = self.service.search_stocks(keyword, limit).await?;
        let mut text = String::new();
        for s in &stocks {
            text.push_str(&format!("{} ({}) 现价 {:.2}\n", s.name, s.symbol, s.price));
        }
        if text.is_empty() {
            text = "未找到匹配的股票".to_string();
        }
        Ok(json!({"data": text}))
    }
}
