//! List tool - enumerate known tasks, most recently active first.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::task::Task;

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ListTool {
    ctx: Arc<ToolContext>,
}

impl ListTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

fn project(task: &Task) -> Value {
    json!({
        "taskId": task.task_id,
        "sessionId": task.session_id,
        "title": task.title,
        "status": task.status,
        "model": task.model,
        "agent": task.agent,
        "createdAt": task.created_at.to_rfc3339(),
        "lastEventAt": task.last_event_at.to_rfc3339(),
    })
}

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List tasks known to the supervisor"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["active", "all"],
                    "description": "Which tasks to include (default: active)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of tasks to return (default: 10)"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: ListArgs = serde_json::from_value(args)?;
        let total = self.ctx.manager.list_all_tasks().len();

        let mut tasks = match args.status.as_deref() {
            None | Some("active") => self.ctx.manager.list_active_tasks(),
            Some("all") => self.ctx.manager.list_all_tasks(),
            Some(other) => bail!("status must be 'active' or 'all', got '{}'", other),
        };
        tasks.sort_by(|a, b| b.last_event_at.cmp(&a.last_event_at));

        let limit = args.limit.unwrap_or(DEFAULT_LIMIT);
        let sessions: Vec<Value> = tasks.iter().take(limit).map(project).collect();

        Ok(json!({
            "sessions": sessions,
            "total": total,
        }))
    }
}
