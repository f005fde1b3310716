//! Control tools - the externally callable operations of the supervisor.
//!
//! Five thin adapters over the task manager and the worker runner: start,
//! list, respond, cancel, health. Each returns a JSON document; precondition
//! violations on respond/cancel come back as documents describing the state,
//! while invalid inputs surface as tool errors.

mod cancel;
mod health;
mod list;
mod respond;
mod start;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::pool::ProcessPool;
use crate::task::TaskManager;
use crate::worker::WorkerRunner;

pub use start::compose_title;

/// Shared collaborators handed to every tool. Explicit wiring, no globals,
/// so tests can build fully isolated instances.
pub struct ToolContext {
    pub manager: TaskManager,
    pub runner: WorkerRunner,
    pub pool: ProcessPool,
    pub config: ServerConfig,
}

/// Trait for implementing control tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value) -> anyhow::Result<Value>;
}

/// Registry of the supervisor's control tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        let entries: Vec<Arc<dyn Tool>> = vec![
            Arc::new(start::StartTool::new(Arc::clone(&ctx))),
            Arc::new(list::ListTool::new(Arc::clone(&ctx))),
            Arc::new(respond::RespondTool::new(Arc::clone(&ctx))),
            Arc::new(cancel::CancelTool::new(Arc::clone(&ctx))),
            Arc::new(health::HealthTool::new(ctx)),
        ];
        let mut tools = HashMap::new();
        let mut order = Vec::new();
        for tool in entries {
            order.push(tool.name().to_string());
            tools.insert(tool.name().to_string(), tool);
        }
        Self { tools, order }
    }

    /// Tool definitions in registration order, for `tools/list`.
    pub fn definitions(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.parameters_schema(),
                })
            })
            .collect()
    }

    /// Dispatch one call. Unknown tool names are an error.
    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;
        tool.execute(args).await
    }
}
