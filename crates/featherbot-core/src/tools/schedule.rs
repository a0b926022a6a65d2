//! LLM-powered scheduling tools.
//!
//! These tools let the agent schedule recurring tasks via natural
//! language. The model decides the cron expression or interval; firing
//! a job later re-enters the agent loop with the stored message, routed
//! back to the channel/chat that created it.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Tool;
use crate::cron::{CronPayload, CronSchedule, CronService};

// ── ScheduleTaskTool ────────────────────────────────────────────────

pub struct ScheduleTaskTool {
    cron: Arc<Mutex<CronService>>,
    /// Channel to route the fired job back to (e.g., "telegram", "direct").
    default_channel: Option<String>,
    /// Chat id to route the fired job back to, if the channel needs one.
    default_chat_id: Option<String>,
}

impl ScheduleTaskTool {
    pub fn new(cron: Arc<Mutex<CronService>>, default_channel: Option<String>, default_chat_id: Option<String>) -> Self {
        Self { cron, default_channel, default_chat_id }
    }
}

/// Parse `"60s"`/`"3600s"` as an interval, otherwise treat the string as a
/// cron expression.
fn parse_schedule(raw: &str) -> Result<CronSchedule, String> {
    if let Some(secs) = raw.strip_suffix('s') {
        return match secs.parse::<u64>() {
            Ok(s) if s > 0 => Ok(CronSchedule::Every { every_seconds: s }),
            _ => Err(format!("Invalid interval '{}'. Use e.g. '60s' or '3600s'", raw)),
        };
    }
    Ok(CronSchedule::Cron { cron_expr: raw.to_string(), timezone: None })
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a recurring or one-off task. The given message is sent back through \
         the agent when the schedule fires. Use this when the user asks to be reminded \
         or wants periodic updates ('every hour', 'every day at 9am', etc)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Human-readable name for the task"
                },
                "schedule": {
                    "type": "string",
                    "description": "Cron expression (e.g. '0 9 * * *' for 9am daily) or interval with 's' suffix (e.g. '3600s' for hourly)"
                },
                "message": {
                    "type": "string",
                    "description": "The message to process when the task fires"
                }
            },
            "required": ["name", "schedule", "message"]
        })
    }

    async fn execute(&self, args: HashMap<String, Value>) -> String {
        let Some(name) = args.get("name").and_then(|v| v.as_str()) else {
            return "Error: 'name' parameter is required".into();
        };
        let Some(schedule_str) = args.get("schedule").and_then(|v| v.as_str()) else {
            return "Error: 'schedule' parameter is required".into();
        };
        let Some(message) = args.get("message").and_then(|v| v.as_str()) else {
            return "Error: 'message' parameter is required".into();
        };

        let schedule = match parse_schedule(schedule_str) {
            Ok(s) => s,
            Err(e) => return format!("Error: {}", e),
        };

        let payload = CronPayload::agent_turn(message, self.default_channel.clone(), self.default_chat_id.clone());

        let cron = self.cron.lock().await;
        match cron.add_job(name, schedule, payload, false).await {
            Ok(job) => format!(
                "Scheduled task '{}' (id: {})\nSchedule: {}\nMessage: {}",
                job.name, job.id, schedule_str, message
            ),
            Err(e) => format!("Error scheduling task: {}", e),
        }
    }
}

// ── ListSchedulesTool ───────────────────────────────────────────────

pub struct ListSchedulesTool {
    cron: Arc<Mutex<CronService>>,
}

impl ListSchedulesTool {
    pub fn new(cron: Arc<Mutex<CronService>>) -> Self {
        Self { cron }
    }
}

#[async_trait]
impl Tool for ListSchedulesTool {
    fn name(&self) -> &str {
        "list_schedules"
    }

    fn description(&self) -> &str {
        "List all scheduled tasks with their name, schedule, and last-run status."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn execute(&self, _args: HashMap<String, Value>) -> String {
        let cron = self.cron.lock().await;
        let jobs = cron.list_jobs().await;

        if jobs.is_empty() {
            return "No scheduled tasks.".into();
        }

        let mut output = format!("{} scheduled task(s):\n\n", jobs.len());
        for job in jobs {
            let schedule_str = match &job.schedule {
                CronSchedule::Cron { cron_expr, timezone } => match timezone {
                    Some(tz) => format!("cron: {} ({})", cron_expr, tz),
                    None => format!("cron: {}", cron_expr),
                },
                CronSchedule::Every { every_seconds } => format!("every {}s", every_seconds),
                CronSchedule::At { at } => format!("at {}", at),
            };
            let status = if job.enabled { "enabled" } else { "disabled" };
            let last_run = job
                .state
                .last_run_at
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "never".into());

            output.push_str(&format!(
                "- {} ({})\n  id: {}\n  schedule: {}\n  message: {}\n  last run: {}\n\n",
                job.name, status, job.id, schedule_str, job.payload.message, last_run
            ));
        }

        output.trim_end().to_string()
    }
}

// ── CancelScheduleTool ──────────────────────────────────────────────

pub struct CancelScheduleTool {
    cron: Arc<Mutex<CronService>>,
}

impl CancelScheduleTool {
    pub fn new(cron: Arc<Mutex<CronService>>) -> Self {
        Self { cron }
    }
}

#[async_trait]
impl Tool for CancelScheduleTool {
    fn name(&self) -> &str {
        "cancel_schedule"
    }

    fn description(&self) -> &str {
        "Cancel a scheduled task by its id. Use list_schedules first to find the id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": {"type": "string", "description": "The id of the job to cancel"}
            },
            "required": ["job_id"]
        })
    }

    async fn execute(&self, args: HashMap<String, Value>) -> String {
        let Some(job_id) = args.get("job_id").and_then(|v| v.as_str()) else {
            return "Error: 'job_id' parameter is required".into();
        };

        let cron = self.cron.lock().await;
        match cron.remove_job(job_id).await {
            Ok(true) => format!("Cancelled task '{}'", job_id),
            Ok(false) => format!("No task found with id '{}'", job_id),
            Err(e) => format!("Error cancelling task: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron_service() -> Arc<Mutex<CronService>> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Mutex::new(CronService::new(dir.path().join("cron.json"))))
    }

    #[tokio::test]
    async fn schedule_interval_task_then_list_it() {
        let cron = cron_service();
        let schedule_tool = ScheduleTaskTool::new(Arc::clone(&cron), Some("telegram".into()), Some("123".into()));

        let mut args = HashMap::new();
        args.insert("name".into(), Value::String("hourly ping".into()));
        args.insert("schedule".into(), Value::String("3600s".into()));
        args.insert("message".into(), Value::String("ping".into()));
        let result = schedule_tool.execute(args).await;
        assert!(result.starts_with("Scheduled task"));

        let list_tool = ListSchedulesTool::new(Arc::clone(&cron));
        let listing = list_tool.execute(HashMap::new()).await;
        assert!(listing.contains("hourly ping"));
        assert!(listing.contains("every 3600s"));
    }

    #[tokio::test]
    async fn invalid_interval_is_rejected() {
        let cron = cron_service();
        let tool = ScheduleTaskTool::new(cron, None, None);
        let mut args = HashMap::new();
        args.insert("name".into(), Value::String("bad".into()));
        args.insert("schedule".into(), Value::String("0s".into()));
        args.insert("message".into(), Value::String("x".into()));
        let result = tool.execute(args).await;
        assert!(result.starts_with("Error:"));
    }

    #[tokio::test]
    async fn cancel_removes_job() {
        let cron = cron_service();
        let job = {
            let locked = cron.lock().await;
            locked
                .add_job("once", CronSchedule::Every { every_seconds: 60 }, CronPayload::agent_turn("go", None, None), false)
                .await
                .unwrap()
        };

        let cancel_tool = CancelScheduleTool::new(Arc::clone(&cron));
        let mut args = HashMap::new();
        args.insert("job_id".into(), Value::String(job.id.clone()));
        let result = cancel_tool.execute(args).await;
        assert!(result.starts_with("Cancelled task"));

        let list_tool = ListSchedulesTool::new(cron);
        assert_eq!(list_tool.execute(HashMap::new()).await, "No scheduled tasks.");
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_reported() {
        let cron = cron_service();
        let tool = CancelScheduleTool::new(cron);
        let mut args = HashMap::new();
        args.insert("job_id".into(), Value::String("nonexistent".into()));
        let result = tool.execute(args).await;
        assert!(result.starts_with("No task found"));
    }
}
