//! MCP (Model Context Protocol) toolset manager
//!
//! The orchestrator consumes MCP servers purely as named toolsets. The
//! transport (SSE, streamable HTTP, spawned command) is configuration;
//! establishing it is delegated to an injected connector so this crate
//! stays at the interface boundary.

use crate::models::McpServerConfig;
use crate::tools::Tool;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// All tools exposed by one connected server
pub type Toolset = Vec<Arc<dyn Tool>>;

/// Establishes a connection to one configured server and returns its tools
#[async_trait::async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, config: &McpServerConfig) -> Result<Toolset>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub id: String,
    pub connected: bool,
    #[serde(default)]
    pub error: String,
}

/// Tool descriptor with server attribution, for prompt composition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub server_id: String,
    pub server_name: String,
}

pub struct Manager {
    toolsets: RwLock<HashMap<String, Toolset>>,
    configs: RwLock<HashMap<String, McpServerConfig>>,
}

impl Manager {
    pub fn new() -> Self {
        Self {
            toolsets: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Connect every enabled server, replacing previously loaded toolsets.
    /// A server that fails to connect is logged and skipped.
    pub async fn load_configs(
        &self,
        configs: Vec<McpServerConfig>,
        connector: &dyn McpConnector,
    ) {
        let mut toolsets = HashMap::new();
        let mut config_map = HashMap::new();

        for config in configs {
            if !config.enabled {
                continue;
            }
            match connector.connect(&config).await {
                Ok(mut toolset) => {
                    if !config.tool_filter.is_empty() {
                        toolset.retain(|t| config.tool_filter.iter().any(|f| f == t.name()));
                    }
                    info!(server = %config.id, tools = toolset.len(), "MCP server connected");
                    toolsets.insert(config.id.clone(), toolset);
                }
                Err(e) => {
                    warn!(server = %config.id, error = %e, "MCP server connection failed");
                }
            }
            config_map.insert(config.id.clone(), config);
        }

        *self.toolsets.write().await = toolsets;
        *self.configs.write().await = config_map;
    }

    pub async fn toolset(&self, server_id: &str) -> Option<Toolset> {
        self.toolsets.read().await.get(server_id).cloned()
    }

    /// Resolve an ordered server-id list into their combined toolsets
    pub async fn toolsets_by_ids(&self, ids: &[String]) -> Vec<Arc<dyn Tool>> {
        let toolsets = self.toolsets.read().await;
        ids.iter()
            .filter_map(|id| toolsets.get(id))
            .flat_map(|ts| ts.iter().cloned())
            .collect()
    }

    pub async fn tool_infos_by_server_ids(&self, ids: &[String]) -> Vec<McpToolInfo> {
        let toolsets = self.toolsets.read().await;
        let configs = self.configs.read().await;
        let mut infos = Vec::new();
        for id in ids {
            let Some(toolset) = toolsets.get(id) else {
                continue;
            };
            let server_name = configs
                .get(id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| id.clone());
            for tool in toolset {
                infos.push(McpToolInfo {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    server_id: id.clone(),
                    server_name: server_name.clone(),
                });
            }
        }
        infos
    }

    pub async fn server_tools(&self, server_id: &str) -> Vec<McpToolInfo> {
        self.tool_infos_by_server_ids(&[server_id.to_string()]).await
    }

    pub async fn test_connection(&self, server_id: &str) -> ServerStatus {
        let connected = self.toolsets.read().await.contains_key(server_id);
        ServerStatus {
            id: server_id.to_string(),
            connected,
            error: if connected {
                String::new()
            } else {
                "not connected".to_string()
            },
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}
