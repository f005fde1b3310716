//! Health tool - supervisor, pool, and worker CLI status.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{Tool, ToolContext};

/// How long the CLI version probe may take.
const CLI_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthTool {
    ctx: Arc<ToolContext>,
}

impl HealthTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

/// Probe the Worker CLI with its version flag.
async fn probe_cli(cli_path: &str) -> Value {
    let probe = Command::new(cli_path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match tokio::time::timeout(CLI_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            json!({ "available": true, "version": version })
        }
        Ok(Ok(output)) => json!({
            "available": false,
            "error": format!("version probe exited with {}", output.status),
        }),
        Ok(Err(e)) => json!({
            "available": false,
            "error": format!("failed to execute {}: {}", cli_path, e),
        }),
        Err(_) => json!({
            "available": false,
            "error": format!("version probe timed out after {}s", CLI_PROBE_TIMEOUT.as_secs()),
        }),
    }
}

#[async_trait]
impl Tool for HealthTool {
    fn name(&self) -> &str {
        "health"
    }

    fn description(&self) -> &str {
        "Report supervisor health: worker CLI, configuration, pool, and tasks"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value) -> Result<Value> {
        let cli = probe_cli(&self.ctx.config.cli_path).await;

        let mut config = json!({ "primaryModel": self.ctx.config.model });
        if let Some(fallback) = &self.ctx.config.fallback_model {
            config["fallbackModel"] = json!(fallback);
        }
        if let Some(agent) = self.ctx.config.defaults.agent {
            config["defaultAgent"] = json!(agent);
        }

        Ok(json!({
            "cli": cli,
            "config": config,
            "pool": self.ctx.pool.get_status(),
            "tasks": {
                "active": self.ctx.manager.list_active_tasks().len(),
                "total": self.ctx.manager.list_all_tasks().len(),
                "activeProcesses": self.ctx.runner.active_count(),
                "activeRespondProcesses": self.ctx.runner.active_respond_count(),
            },
        }))
    }
}
