//! Respond tool - answer a task that is waiting for user input.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{Tool, ToolContext};
use crate::task::TaskStatus;

const MAX_RESPONSE_LEN: usize = 50_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondArgs {
    task_id: String,
    response: String,
}

pub struct RespondTool {
    ctx: Arc<ToolContext>,
}

impl RespondTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for RespondTool {
    fn name(&self) -> &str {
        "respond"
    }

    fn description(&self) -> &str {
        "Send a response to a task that is waiting for user input"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": {
                    "type": "string",
                    "description": "The task to respond to"
                },
                "response": {
                    "type": "string",
                    "description": "The user's answer"
                }
            },
            "required": ["taskId", "response"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: RespondArgs = serde_json::from_value(args)?;
        if args.response.len() > MAX_RESPONSE_LEN {
            bail!("response exceeds {} characters", MAX_RESPONSE_LEN);
        }

        let Some(task) = self.ctx.manager.get_task_state(&args.task_id) else {
            return Ok(json!({
                "taskId": args.task_id,
                "status": "failed",
                "message": format!("Task not found: {}", args.task_id),
            }));
        };

        if task.status != TaskStatus::InputRequired {
            return Ok(json!({
                "taskId": args.task_id,
                "status": task.status,
                "message": format!(
                    "Task is not waiting for input (status: {})",
                    task.status
                ),
            }));
        }

        if task.session_id.is_empty() {
            return Ok(json!({
                "taskId": args.task_id,
                "status": task.status,
                "message": "Task has no worker session to continue",
            }));
        }

        info!(task_id = %args.task_id, session_id = %task.session_id, "Sending response to worker");
        self.ctx
            .runner
            .respond(&args.task_id, &task.session_id, &args.response);

        Ok(json!({
            "taskId": args.task_id,
            "status": "working",
            "message": "Response sent, task is resuming",
        }))
    }
}
