//! Start tool - create a task and launch its worker.

use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{Tool, ToolContext};
use crate::task::AgentKind;

/// Longest accepted task text.
const MAX_TASK_LEN: usize = 100_000;
const MAX_MODEL_LEN: usize = 128;
const MAX_GUIDANCE_LEN: usize = 10_000;
const MAX_TITLE_LEN: usize = 256;

/// Characters of the task text used for a derived title.
const TITLE_PREVIEW_CHARS: usize = 50;

fn model_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]+/[A-Za-z0-9._/-]+$").expect("model pattern is valid")
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartArgs {
    task: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output_guidance: Option<String>,
    #[serde(default)]
    session_title: Option<String>,
}

/// Derive a task title: the caller's session title verbatim, otherwise a
/// preview of the task text with elision.
pub fn compose_title(task: &str, session_title: Option<&str>) -> String {
    if let Some(title) = session_title {
        return title.to_string();
    }
    let preview: String = task.chars().take(TITLE_PREVIEW_CHARS).collect();
    if task.chars().count() > TITLE_PREVIEW_CHARS {
        format!("Task: {}…", preview)
    } else {
        format!("Task: {}", preview)
    }
}

pub struct StartTool {
    ctx: Arc<ToolContext>,
}

impl StartTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for StartTool {
    fn name(&self) -> &str {
        "start"
    }

    fn description(&self) -> &str {
        "Start a new background task executed by the worker CLI"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task to execute"
                },
                "agent": {
                    "type": "string",
                    "enum": ["explore", "plan", "build"],
                    "description": "Worker agent to use"
                },
                "model": {
                    "type": "string",
                    "description": "Worker model as provider/name"
                },
                "outputGuidance": {
                    "type": "string",
                    "description": "Appended guidance on the expected output"
                },
                "sessionTitle": {
                    "type": "string",
                    "description": "Human-readable title for the task"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: StartArgs = serde_json::from_value(args)?;

        if args.task.trim().is_empty() {
            bail!("task must not be empty");
        }
        if args.task.len() > MAX_TASK_LEN {
            bail!("task exceeds {} characters", MAX_TASK_LEN);
        }
        if let Some(model) = &args.model {
            if model.len() > MAX_MODEL_LEN || !model_pattern().is_match(model) {
                bail!("model must match provider/name and stay under {} characters", MAX_MODEL_LEN);
            }
        }
        if let Some(guidance) = &args.output_guidance {
            if guidance.len() > MAX_GUIDANCE_LEN {
                bail!("outputGuidance exceeds {} characters", MAX_GUIDANCE_LEN);
            }
        }
        if let Some(title) = &args.session_title {
            if title.len() > MAX_TITLE_LEN {
                bail!("sessionTitle exceeds {} characters", MAX_TITLE_LEN);
            }
        }
        let agent = match &args.agent {
            Some(raw) => Some(raw.parse::<AgentKind>().map_err(|e| anyhow::anyhow!(e))?),
            None => self.ctx.config.defaults.agent,
        };

        let model = args
            .model
            .clone()
            .unwrap_or_else(|| self.ctx.config.model.clone());
        let title = compose_title(&args.task, args.session_title.as_deref());

        let task_id = self.ctx.manager.create_task(title, model.clone(), agent);
        info!(task_id = %task_id, model = %model, "Starting task");

        self.ctx.runner.start(
            &task_id,
            &args.task,
            &model,
            agent,
            args.output_guidance.as_deref(),
        )?;

        Ok(json!({
            "taskId": task_id,
            "sessionId": "",
            "status": "working",
        }))
    }
}
