//! `shell_exec` — runs a shell command and captures its output.
//!
//! Grounded on the teacher's workspace-restricted exec tool: a
//! platform-specific shell invocation wrapped in a timeout, with
//! stdout/stderr concatenated and an exit-code footer appended.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use super::Tool;

const MAX_OUTPUT_CHARS: usize = 50_000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct ExecTool {
    workspace: PathBuf,
    timeout_secs: u64,
}

impl ExecTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace, timeout_secs: DEFAULT_TIMEOUT_SECS }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "shell_exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace directory and return its output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to run"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: HashMap<String, Value>) -> String {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return "Error: 'command' parameter is required".into();
        };

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        cmd.current_dir(&self.workspace);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output()).await;

        let output = match output {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return format!("Error: failed to spawn command: {}", e),
            Err(_) => return format!("Error: command timed out after {}s", self.timeout_secs),
        };

        let mut combined = String::new();
        combined.push_str(&String::from_utf8_lossy(&output.stdout));
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        if combined.len() > MAX_OUTPUT_CHARS {
            combined.truncate(MAX_OUTPUT_CHARS);
            combined.push_str("\n... (output truncated)");
        }

        let code = output.status.code().unwrap_or(-1);
        if code == 0 {
            if combined.is_empty() {
                "(command produced no output, exit code 0)".into()
            } else {
                combined
            }
        } else {
            format!("{}\n(exit code {})", combined, code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf());
        let mut args = HashMap::new();
        args.insert("command".into(), Value::String("echo hello".into()));
        let result = tool.execute(args).await;
        assert!(result.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf());
        let mut args = HashMap::new();
        args.insert("command".into(), Value::String("exit 3".into()));
        let result = tool.execute(args).await;
        assert!(result.contains("exit code 3"));
    }

    #[tokio::test]
    async fn missing_command_argument_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf());
        let result = tool.execute(HashMap::new()).await;
        assert!(result.starts_with("Error:"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf()).with_timeout(1);
        let mut args = HashMap::new();
        args.insert("command".into(), Value::String("sleep 5".into()));
        let result = tool.execute(args).await;
        assert!(result.contains("timed out"));
    }
}
