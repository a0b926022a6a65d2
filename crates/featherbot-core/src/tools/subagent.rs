//! `spawn_subagent` — hands a bounded task off to a restricted child agent.
//!
//! Grounded on the teacher's stream-control tool: a thin `Tool` wrapper
//! around a shared manager, turning one action-shaped argument set into a
//! call against that manager and a short status string back to the model.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::Tool;
use crate::subagent::{SpawnOptions, SubagentManager, SubagentStatus};

pub struct SpawnSubagentTool {
    manager: Arc<SubagentManager>,
}

impl SpawnSubagentTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to work on a bounded task in the background with its own \
         restricted set of tools. Returns immediately with the sub-agent's id; use \
         its completion to learn the result rather than polling in a tight loop."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the sub-agent to complete"
                },
                "spec": {
                    "type": "string",
                    "description": "Name of the sub-agent persona to use (default: 'general')"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: HashMap<String, Value>) -> String {
        let Some(task) = args.get("task").and_then(|v| v.as_str()) else {
            return "Error: 'task' parameter is required".into();
        };

        let spec_name = args
            .get("spec")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();

        let id = self
            .manager
            .spawn(SpawnOptions {
                task: task.to_string(),
                spec_name,
                ..Default::default()
            })
            .await;

        format!("Spawned sub-agent '{}'. Check back with its id once it has had time to finish.", id)
    }
}

/// `get_subagent_result` — check on a previously spawned sub-agent.
pub struct GetSubagentResultTool {
    manager: Arc<SubagentManager>,
}

impl GetSubagentResultTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for GetSubagentResultTool {
    fn name(&self) -> &str {
        "get_subagent_result"
    }

    fn description(&self) -> &str {
        "Check the status and, if finished, the result of a sub-agent previously started with spawn_subagent."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "The sub-agent id returned by spawn_subagent"
                }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: HashMap<String, Value>) -> String {
        let Some(id) = args.get("id").and_then(|v| v.as_str()) else {
            return "Error: 'id' parameter is required".into();
        };

        match self.manager.get_state(id).await {
            None => format!("Error: no sub-agent found with id '{}'", id),
            Some(state) => match state.status {
                SubagentStatus::Running => format!("Sub-agent '{}' is still running.", id),
                SubagentStatus::Completed => {
                    format!("Sub-agent '{}' completed:\n{}", id, state.result.unwrap_or_default())
                }
                SubagentStatus::Failed => {
                    format!("Sub-agent '{}' failed: {}", id, state.error.unwrap_or_default())
                }
                SubagentStatus::Cancelled => format!("Sub-agent '{}' was cancelled.", id),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::provider::types::{ChatMessage, LlmResponse, ToolDefinition, Usage};
    use crate::provider::LlmProvider;
    use crate::subagent::SpecRegistry;
    use crate::tools::ToolRegistry;

    struct InstantProvider;

    #[async_trait]
    impl LlmProvider for InstantProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                content: Some("task complete".into()),
                tool_calls: Vec::new(),
                finish_reason: "stop".into(),
                usage: Usage::default(),
            })
        }

        fn default_model(&self) -> &str {
            "stub"
        }
    }

    #[tokio::test]
    async fn spawn_then_fetch_result_round_trips() {
        let manager = Arc::new(SubagentManager::new(
            Arc::new(InstantProvider),
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
            SpecRegistry::new(),
        ));

        let spawn_tool = SpawnSubagentTool::new(Arc::clone(&manager));
        let mut args = HashMap::new();
        args.insert("task".into(), Value::String("summarize this repo".into()));
        let spawn_reply = spawn_tool.execute(args).await;
        assert!(spawn_reply.starts_with("Spawned sub-agent"));

        let id = spawn_reply
            .split('\'')
            .nth(1)
            .expect("reply should quote the sub-agent id")
            .to_string();

        let mut result = String::new();
        for _ in 0..50 {
            let get_tool = GetSubagentResultTool::new(Arc::clone(&manager));
            let mut args = HashMap::new();
            args.insert("id".into(), Value::String(id.clone()));
            result = get_tool.execute(args).await;
            if !result.contains("still running") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(result.contains("completed"), "unexpected result: {result}");
        assert!(result.contains("task complete"));
    }

    #[tokio::test]
    async fn missing_task_argument_is_rejected() {
        let manager = Arc::new(SubagentManager::new(
            Arc::new(InstantProvider),
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
            SpecRegistry::new(),
        ));
        let tool = SpawnSubagentTool::new(manager);
        let result = tool.execute(HashMap::new()).await;
        assert!(result.starts_with("Error:"));
    }

    #[tokio::test]
    async fn unknown_subagent_id_is_reported() {
        let manager = Arc::new(SubagentManager::new(
            Arc::new(InstantProvider),
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
            SpecRegistry::new(),
        ));
        let tool = GetSubagentResultTool::new(manager);
        let mut args = HashMap::new();
        args.insert("id".into(), Value::String("nonexistent".into()));
        let result = tool.execute(args).await;
        assert!(result.contains("no sub-agent found"));
    }
}
