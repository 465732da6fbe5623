//! News, hot-trend and research-report tools
//!
//! Hot-trend lookups go through a file-backed TTL cache, one
//! `<platform>.json` per platform under the cache directory.

use super::Tool;
use crate::error::OrchestrationError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotItem {
    pub rank: u32,
    pub title: String,
    #[serde(default)]
    pub heat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchReport {
    pub info_code: String,
    pub title: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub publish_date: String,
}

/// Interface boundary to the news collaborators
#[async_trait::async_trait]
pub trait NewsService: Send + Sync {
    async fn telegraph_list(&self) -> Result<Vec<NewsItem>>;
    async fn hot_trend(&self, platform: &str) -> Result<Vec<HotItem>>;
    async fn research_reports(
        &self,
        code: &str,
        page_size: u32,
        page_no: u32,
    ) -> Result<Vec<ResearchReport>>;
    async fn report_content(&self, info_code: &str) -> Result<String>;
}

//
// ================= Hot-Trend File Cache =================
//

pub const HOT_TREND_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    data: Vec<HotItem>,
    updated_at: DateTime<Utc>,
}

/// File cache keyed by platform, with lazy TTL expiry on read
pub struct HotTrendCache {
    cache_dir: PathBuf,
    ttl: Duration,
}

impl HotTrendCache {
    pub fn new(cache_dir: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(cache_dir.as_ref())?;
        Ok(Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ttl,
        })
    }

    fn cache_file(&self, platform: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", platform))
    }

    pub fn get(&self, platform: &str) -> Option<Vec<HotItem>> {
        let raw = std::fs::read(self.cache_file(platform)).ok()?;
        let entry: CacheEntry = serde_json::from_slice(&raw).ok()?;
        let age = Utc::now().signed_duration_since(entry.updated_at);
        if age.to_std().ok()? > self.ttl {
            return None;
        }
        Some(entry.data)
    }

    pub fn put(&self, platform: &str, data: &[HotItem]) -> Result<()> {
        let entry = CacheEntry {
            data: data.to_vec(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&entry)?;
        std::fs::write(self.cache_file(platform), raw)?;
        Ok(())
    }
}

//
// ================= Tools =================
//

pub struct TelegraphNewsTool {
    service: Arc<dyn NewsService>,
}

impl TelegraphNewsTool {
    pub fn new(service: Arc<dyn NewsService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Tool for TelegraphNewsTool {
    fn name(&self) -> &str {
        "get_telegraph_news"
    }

    fn description(&self) -> &str {
        "获取最新财经电报快讯"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<Value> {
        let items = self.service.telegraph_list().await?;
        let mut text = String::new();
        for item in items.iter().take(10) {
            text.push_str(&format!("[{}] {}\n", item.time, item.title));
        }
        Ok(json!({"data": text}))
    }
}

pub struct HotTrendTool {
    service: Arc<dyn NewsService>,
    cache: Option<HotTrendCache>,
}

impl HotTrendTool {
    pub fn new(service: Arc<dyn NewsService>, cache: Option<HotTrendCache>) -> Self {
        Self { service, cache }
    }
}

#[async_trait::async_trait]
impl Tool for HotTrendTool {
    fn name(&self) -> &str {
        "get_hot_trend"
    }

    fn description(&self) -> &str {
        "获取平台热搜榜（微博/百度/知乎等）"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "platform": {"type": "string", "description": "平台名，默认 weibo"}
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let platform = args
            .get("platform")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("weibo");

        let items = match self.cache.as_ref().and_then(|c| c.get(platform)) {
            Some(cached) => {
                debug!(platform, "hot trend served from cache");
                cached
            }
            None => {
                let fresh = self.service.hot_trend(platform).await?;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.put(platform, &fresh) {
                        warn!(error = %e, platform, "failed to write hot trend cache");
                    }
                }
                fresh
            }
        };

        let mut text = String::new();
        for item in items.iter().take(20) {
            text.push_str(&format!("{}. {} {}\n", item.rank, item.title, item.heat));
        }
        Ok(json!({"data": text}))
    }
}

pub struct ResearchReportTool {
    service: Arc<dyn NewsService>,
}

impl ResearchReportTool {
    pub fn new(service: Arc<dyn NewsService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Tool for ResearchReportTool {
    fn name(&self) -> &str {
        "get_research_reports"
    }

    fn description(&self) -> &str {
        "获取个股最新研报列表，或按 infoCode 读取研报正文"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "股票代码"},
                "infoCode": {"type": "string", "description": "研报编号；提供时返回正文"},
                "pageSize": {"type": "integer", "description": "每页条数，默认5"}
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        if let Some(info_code) = args.get("infoCode").and_then(|v| v.as_str()) {
            let content = self.service.report_content(info_code).await?;
            return Ok(json!({"data": content}));
        }

        let code = args
            .get("code")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OrchestrationError::Tool("expected 'code' or 'infoCode' in arguments".into())
            })?;
        let page_size = args.get("pageSize").and_then(|v| v.as_u64()).unwrap_or(5) as u32;

        let reports = self.service.research_reports(code, page_size, 1).await?;
        let mut text = String::new();
        for r in &reports {
            text.push_str(&format!(
                "[{}] {} - {} ({})\n",
                r.publish_date, r.title, r.org_name, r.info_code
            ));
        }
        Ok(json!({"data": text}))
    }
}
