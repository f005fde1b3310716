//! Cancel tool - stop a task and its worker process.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{Tool, ToolContext};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelArgs {
    task_id: String,
}

pub struct CancelTool {
    ctx: Arc<ToolContext>,
}

impl CancelTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for CancelTool {
    fn name(&self) -> &str {
        "cancel"
    }

    fn description(&self) -> &str {
        "Cancel a running task and terminate its worker process"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": {
                    "type": "string",
                    "description": "The task to cancel"
                }
            },
            "required": ["taskId"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: CancelArgs = serde_json::from_value(args)?;

        let Some(status) = self.ctx.manager.get_task_status(&args.task_id) else {
            return Ok(json!({
                "taskId": args.task_id,
                "status": "failed",
                "message": format!("Task not found: {}", args.task_id),
            }));
        };

        if status.is_terminal() {
            return Ok(json!({
                "taskId": args.task_id,
                "status": status,
                "message": format!("Task is already in terminal state: {}", status),
            }));
        }

        let killed = self.ctx.runner.stop(&args.task_id);
        let _ = self.ctx.manager.cancel_task(&args.task_id);
        info!(task_id = %args.task_id, killed_child = killed, "Task cancelled");

        Ok(json!({
            "taskId": args.task_id,
            "status": "cancelled",
            "message": "Task cancelled",
        }))
    }
}
