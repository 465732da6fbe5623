//! Tool trait and registry
//!
//! Tools are opaque to the orchestrator: it only needs descriptors for
//! prompt composition and callable handles for the agent loop. The
//! concrete tools wrap the market-data and news collaborators.

pub mod market;
pub mod news;

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for a single callable tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<Value>;
}

/// Descriptor used for prompt composition and UI listings
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Tool registry for looking up tools by id
pub struct Registry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Resolve an ordered id list into handles; unknown ids are skipped
    pub fn get_tools(&self, names: &[String]) -> Vec<Arc<dyn Tool>> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    pub fn tool_infos(&self, names: &[String]) -> Vec<ToolInfo> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolInfo {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
