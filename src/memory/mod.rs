//! Per-subject meeting memory
//!
//! Read synchronously before a meeting to seed expert context, written
//! asynchronously after a meeting closes. Records persist as one JSON file
//! per subject so memories survive restarts.

pub mod store;

pub use store::{MemoryRound, SubjectMemory};

use crate::llm::{vendor::filter_vendor_markers, Content, LanguageModel, LlmRequest};
use crate::error::OrchestrationError;
use crate::Result;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Rounds included verbatim in the context prefix
const CONTEXT_RECENT_ROUNDS: usize = 3;

/// Default round count between rolling-summary regenerations
const DEFAULT_SUMMARY_THRESHOLD: usize = 5;

/// One expert statement handed to key-point extraction
#[derive(Debug, Clone)]
pub struct DiscussionInput {
    pub agent_name: String,
    pub role: String,
    pub content: String,
}

pub struct Manager {
    records: RwLock<HashMap<String, Arc<Mutex<SubjectMemory>>>>,
    model: RwLock<Option<Arc<dyn LanguageModel>>>,
    data_dir: Option<PathBuf>,
    summary_threshold: usize,
}

impl Manager {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            model: RwLock::new(None),
            data_dir,
            summary_threshold: DEFAULT_SUMMARY_THRESHOLD,
        }
    }

    pub fn with_summary_threshold(mut self, threshold: usize) -> Self {
        self.summary_threshold = threshold.max(1);
        self
    }

    /// Set the model used for summarization and key-point extraction
    pub async fn set_model(&self, model: Arc<dyn LanguageModel>) {
        *self.model.write().await = Some(model);
    }

    /// Fetch the record for a subject, loading it from disk on first touch
    pub async fn get_or_create(&self, symbol: &str, name: &str) -> Arc<Mutex<SubjectMemory>> {
        if let Some(record) = self.records.read().await.get(symbol) {
            return Arc::clone(record);
        }

        let mut records = self.records.write().await;
        // Lost the race? Someone else inserted meanwhile.
        if let Some(record) = records.get(symbol) {
            return Arc::clone(record);
        }

        let memory = match self.load_from_disk(symbol).await {
            Some(loaded) => loaded,
            None => SubjectMemory::new(symbol, name),
        };
        let record = Arc::new(Mutex::new(memory));
        records.insert(symbol.to_string(), Arc::clone(&record));
        record
    }

    /// Compact context prefix: rolling summary plus the most recent rounds
    pub async fn build_context(
        &self,
        record: &Arc<Mutex<SubjectMemory>>,
        current_question: &str,
    ) -> String {
        let memory = record.lock().await;
        if memory.round_count() == 0 && memory.rolling_summary.is_empty() {
            return String::new();
        }

        let mut out = format!("【{}的历史讨论记忆】\n", memory.name);
        if !memory.rolling_summary.is_empty() {
            out.push_str(&format!("长期印象: {}\n", memory.rolling_summary));
        }
        for round in memory.recent_rounds(CONTEXT_RECENT_ROUNDS) {
            out.push_str(&format!(
                "- {} 问: {} / 结论: {}\n",
                round.timestamp.format("%m-%d"),
                round.question,
                round.summary
            ));
            for point in round.key_points.iter().take(3) {
                out.push_str(&format!("  · {}\n", point));
            }
        }
        out.push_str(&format!("本次问题: {}\n", current_question));
        out
    }

    /// Append one completed meeting. Regenerates the rolling summary every
    /// `summary_threshold` rounds when a model is configured.
    pub async fn add_round(
        &self,
        record: &Arc<Mutex<SubjectMemory>>,
        question: &str,
        summary: &str,
        key_points: Vec<String>,
    ) -> Result<()> {
        let snapshot = {
            let mut memory = record.lock().await;
            memory.push_round(MemoryRound {
                question: question.to_string(),
                summary: summary.to_string(),
                key_points,
                timestamp: Utc::now(),
            });
            memory.clone()
        };

        if snapshot.round_count() % self.summary_threshold == 0 {
            if let Err(e) = self.regenerate_rolling_summary(record).await {
                warn!(symbol = %snapshot.symbol, error = %e, "rolling summary regeneration failed");
            }
        }

        let final_state = record.lock().await.clone();
        self.save_to_disk(&final_state).await?;
        debug!(symbol = %final_state.symbol, rounds = final_state.round_count(), "memory round saved");
        Ok(())
    }

    /// LLM-assisted bullet extraction from a finished discussion
    pub async fn extract_key_points(
        &self,
        discussions: &[DiscussionInput],
    ) -> Result<Vec<String>> {
        if discussions.is_empty() {
            return Ok(Vec::new());
        }
        let model = self
            .model
            .read()
            .await
            .clone()
            .ok_or_else(|| OrchestrationError::Memory("no model configured".to_string()))?;

        let mut prompt = String::from(
            "从以下专家讨论中提取3-5条关键要点，每行一条，不要编号，不要额外说明。\n\n",
        );
        for d in discussions {
            prompt.push_str(&format!("【{}（{}）】{}\n", d.agent_name, d.role, d.content));
        }

        let text = generate_text(model.as_ref(), &prompt).await?;
        let points: Vec<String> = text
            .lines()
            .map(|line| line.trim_start_matches(['-', '·', '*', ' ']).trim())
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect();
        if points.is_empty() {
            return Err(OrchestrationError::Memory(
                "key point extraction returned nothing".to_string(),
            ));
        }
        Ok(points)
    }

    async fn regenerate_rolling_summary(&self, record: &Arc<Mutex<SubjectMemory>>) -> Result<()> {
        let model = self
            .model
            .read()
            .await
            .clone()
            .ok_or_else(|| OrchestrationError::Memory("no model configured".to_string()))?;

        let prompt = {
            let memory = record.lock().await;
            let mut p = format!(
                "请将对 {} ({}) 的多轮讨论记忆压缩为一段不超过100字的长期印象。\n\n",
                memory.name, memory.symbol
            );
            if !memory.rolling_summary.is_empty() {
                p.push_str(&format!("已有印象: {}\n", memory.rolling_summary));
            }
            for round in memory.rounds() {
                p.push_str(&format!("- 问: {} / 结论: {}\n", round.question, round.summary));
            }
            p
        };

        let summary = generate_text(model.as_ref(), &prompt).await?;
        record.lock().await.rolling_summary = summary.trim().to_string();
        Ok(())
    }

    fn record_path(&self, symbol: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", symbol)))
    }

    async fn load_from_disk(&self, symbol: &str) -> Option<SubjectMemory> {
        let path = self.record_path(symbol)?;
        let raw = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(memory) => Some(memory),
            Err(e) => {
                warn!(symbol, error = %e, "corrupt memory file ignored");
                None
            }
        }
    }

    async fn save_to_disk(&self, memory: &SubjectMemory) -> Result<()> {
        let Some(path) = self.record_path(&memory.symbol) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(memory)?;
        tokio::fs::write(&path, raw).await?;
        Ok(())
    }
}

/// Collect one non-streamed generation into visible text
async fn generate_text(model: &dyn LanguageModel, prompt: &str) -> Result<String> {
    let request = LlmRequest {
        contents: vec![Content::user_text(prompt)],
        config: Default::default(),
    };
    let mut stream = model.generate(request, false);
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        let response = item?;
        text.push_str(&response.content.visible_text());
    }
    Ok(filter_vendor_markers(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModel;

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let manager = Manager::new(None);
        let a = manager.get_or_create("sh600519", "贵州茅台").await;
        let b = manager.get_or_create("sh600519", "贵州茅台").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_build_context_empty_for_new_subject() {
        let manager = Manager::new(None);
        let record = manager.get_or_create("sh600519", "贵州茅台").await;
        let context = manager.build_context(&record, "能买吗").await;
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_context_includes_recent_rounds_and_summary() {
        let manager = Manager::new(None);
        let record = manager.get_or_create("sh600519", "贵州茅台").await;
        for i in 0..5 {
            manager
                .add_round(&record, &format!("问题{}", i), "观望为主", vec!["估值偏高".into()])
                .await
                .unwrap();
        }
        record.lock().await.rolling_summary = "长期看好".into();

        let context = manager.build_context(&record, "现在呢").await;
        assert!(context.contains("历史讨论记忆"));
        assert!(context.contains("长期看好"));
        assert!(context.contains("问题4"));
        // Only the recent window is included
        assert!(!context.contains("问题0"));
        assert!(context.contains("本次问题: 现在呢"));
    }

    #[tokio::test]
    async fn test_rolling_summary_regenerated_at_threshold() {
        let manager = Manager::new(None).with_summary_threshold(2);
        let model = MockModel::new();
        model.push_reply("两轮讨论后整体偏谨慎");
        manager.set_model(model.clone()).await;

        let record = manager.get_or_create("sh600519", "贵州茅台").await;
        manager
            .add_round(&record, "问1", "结1", vec![])
            .await
            .unwrap();
        assert!(record.lock().await.rolling_summary.is_empty());
        manager
            .add_round(&record, "问2", "结2", vec![])
            .await
            .unwrap();
        assert_eq!(record.lock().await.rolling_summary, "两轮讨论后整体偏谨慎");
    }

    #[tokio::test]
    async fn test_extract_key_points_parses_bullets() {
        let manager = Manager::new(None);
        let model = MockModel::new();
        model.push_reply("- 业绩超预期\n- 估值仍在高位\n");
        manager.set_model(model).await;

        let points = manager
            .extract_key_points(&[DiscussionInput {
                agent_name: "多头".into(),
                role: "看多分析师".into(),
                content: "业绩超预期，但估值不低".into(),
            }])
            .await
            .unwrap();
        assert_eq!(points, vec!["业绩超预期", "估值仍在高位"]);
    }

    #[tokio::test]
    async fn test_extract_key_points_without_model_errors() {
        let manager = Manager::new(None);
        let err = manager
            .extract_key_points(&[DiscussionInput {
                agent_name: "多头".into(),
                role: "看多分析师".into(),
                content: "内容".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Memory(_)));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(Some(dir.path().to_path_buf()));
        let record = manager.get_or_create("sh600519", "贵州茅台").await;
        manager
            .add_round(&record, "能买吗", "回调再买", vec!["放量滞涨".into()])
            .await
            .unwrap();

        // A fresh manager over the same directory sees the saved record
        let reloaded = Manager::new(Some(dir.path().to_path_buf()));
        let record = reloaded.get_or_create("sh600519", "贵州茅台").await;
        let memory = record.lock().await;
        assert_eq!(memory.round_count(), 1);
        assert_eq!(memory.rounds().next().unwrap().summary, "回调再买");
    }
}
