//! Tool system: trait, registry, and built-in tool implementations.
//!
//! Every tool implements the [`Tool`] trait and registers itself in the
//! [`ToolRegistry`]. The agent loop queries the registry for available
//! tools and dispatches tool calls by name. The registry is the single
//! source of dispatch — it never lets a tool failure escape as a Rust
//! error; every outcome, including "tool not found" and "bad arguments",
//! comes back as a plain string the model can read.

pub mod filesystem;
pub mod schedule;
pub mod shell;
pub mod subagent;
pub mod web;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Trait that all agent tools must implement.
///
/// Tools are capabilities the agent can invoke (read files, run commands,
/// schedule a job, spawn a sub-agent, …). Each tool declares its name,
/// description, JSON Schema parameters, and an async `execute` method
/// that never throws — failures are encoded in the returned string.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in function calls (e.g., "read_file").
    /// Must match `[a-z_][a-z0-9_]*`.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: HashMap<String, Value>) -> String;
}

/// Error raised by [`ToolRegistry::register`] — the one place this
/// module treats a failure as a genuine Rust error rather than a
/// string outcome, since a duplicate tool name is programmer misuse,
/// not a runtime condition the model can recover from.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),
}

/// Configuration for the registry's result-eviction wrapper.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Results longer than this many bytes are evicted to a scratch file.
    pub threshold: usize,
    /// Directory scratch files are written under.
    pub scratch_dir: PathBuf,
    /// Bytes of head/tail kept in the inline preview.
    pub preview_chars: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            threshold: 20_000,
            scratch_dir: std::env::temp_dir().join("featherbot-tool-results"),
            preview_chars: 2_000,
        }
    }
}

/// Dynamic registry for agent tools.
///
/// Allows runtime registration and lookup of tools by name, validates
/// arguments against each tool's declared schema before dispatch, and
/// optionally evicts oversized results to a scratch file.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    eviction: Option<EvictionConfig>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            eviction: None,
        }
    }

    /// Enable the result-eviction wrapper with the given configuration.
    pub fn with_eviction(mut self, config: EvictionConfig) -> Self {
        self.eviction = Some(config);
        self
    }

    /// Register a tool. Fails if a tool with the same name is already
    /// registered — unlike a runtime tool failure, this is caller error
    /// and is reported as a real `Result`.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        self.register_arc(Arc::from(tool))
    }

    /// Register a tool that's already behind an `Arc`, e.g. because the
    /// caller also wants to keep a handle to it, or because the same
    /// instance will be shared into a restricted sub-registry later.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        debug!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool by name. Returns whether one was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Execute a tool by name with the given raw (untyped) arguments.
    ///
    /// Always returns a plain string: `"Error: Tool '<name>' not found"`
    /// for unknown tools, `"Error: Invalid parameters for '<name>': …"`
    /// if the arguments fail schema validation, or the tool's own result
    /// (possibly wrapped by the eviction policy) otherwise.
    pub async fn execute(&self, name: &str, args: HashMap<String, Value>) -> String {
        let Some(tool) = self.tools.get(name) else {
            error!(tool = name, "tool not found");
            return format!("Error: Tool '{}' not found", name);
        };

        if let Err(reason) = validate_args(&tool.parameters(), &args) {
            warn!(tool = name, reason = %reason, "invalid tool parameters");
            return format!("Error: Invalid parameters for '{}': {}", name, reason);
        }

        debug!(tool = name, "executing tool");
        let result = tool.execute(args).await;
        self.apply_eviction(name, result)
    }

    fn apply_eviction(&self, tool_name: &str, result: String) -> String {
        let Some(config) = &self.eviction else {
            return result;
        };
        if result.len() <= config.threshold {
            return result;
        }

        if let Err(e) = std::fs::create_dir_all(&config.scratch_dir) {
            warn!(error = %e, "failed to create tool-result scratch dir; returning unevicted result");
            return result;
        }

        let file_name = format!("{}-{}.txt", tool_name, uuid::Uuid::new_v4());
        let path = config.scratch_dir.join(&file_name);
        if let Err(e) = std::fs::write(&path, &result) {
            warn!(error = %e, "failed to write tool-result scratch file; returning unevicted result");
            return result;
        }

        let head: String = result.chars().take(config.preview_chars).collect();
        let tail: String = result
            .chars()
            .rev()
            .take(config.preview_chars)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        format!(
            "{}\n\n… ({} bytes total, truncated) …\n\n{}\n\n[full result written to {}]",
            head,
            result.len(),
            tail,
            path.display()
        )
    }

    /// Get all tool definitions in OpenAI function-calling format.
    pub fn list_definitions(&self) -> Vec<crate::provider::types::ToolDefinition> {
        self.tools
            .values()
            .map(|tool| {
                crate::provider::types::ToolDefinition::function(
                    tool.name(),
                    tool.description(),
                    tool.parameters(),
                )
            })
            .collect()
    }

    /// Build a restricted copy of this registry containing only tools
    /// named in `allow_list`. Used by [`crate::subagent::SubagentManager`]
    /// to hand a child agent a tool-restricted registry of its own. The
    /// underlying tool instances are shared (cheap `Arc` clones), not
    /// duplicated.
    pub fn restricted_to(&self, allow_list: &[&str]) -> ToolRegistry {
        let mut restricted = ToolRegistry::new();
        restricted.eviction = self.eviction.clone();
        for name in allow_list {
            if let Some(tool) = self.tools.get(*name) {
                restricted.tools.insert(name.to_string(), Arc::clone(tool));
            }
        }
        restricted
    }

    /// Get the list of registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate `args` against a JSON-Schema-shaped `object` schema: checks
/// that every name in `required` is present, and that declared
/// `properties` types loosely match (string/integer/number/boolean/
/// array/object). Not a full JSON Schema implementation — just enough
/// to catch the missing-argument and wrong-type mistakes a model makes.
fn validate_args(schema: &Value, args: &HashMap<String, Value>) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        for req in required {
            let Some(key) = req.as_str() else { continue };
            if !args.contains_key(key) {
                return Err(format!("missing required parameter '{}'", key));
            }
        }
    }

    if let Some(properties) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in args {
            let Some(prop_schema) = properties.get(key) else {
                continue;
            };
            let Some(expected_type) = prop_schema.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            if !type_matches(expected_type, value) {
                return Err(format!(
                    "parameter '{}' expected type '{}', got '{}'",
                    key,
                    expected_type,
                    json_type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyTool;

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            "dummy"
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {"x": {"type": "string"}},
                "required": ["x"]
            })
        }
        async fn execute(&self, args: HashMap<String, Value>) -> String {
            format!("got: {}", args.get("x").and_then(|v| v.as_str()).unwrap_or(""))
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool)).unwrap();

        assert!(registry.has("dummy"));
        assert_eq!(registry.len(), 1);

        let mut args = HashMap::new();
        args.insert("x".to_string(), Value::String("hi".into()));
        let result = registry.execute("dummy", args).await;
        assert_eq!(result, "got: hi");
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool)).unwrap();
        let err = registry.register(Box::new(DummyTool)).unwrap_err();
        assert!(matches!(err, ToolError::DuplicateName(n) if n == "dummy"));
    }

    #[tokio::test]
    async fn missing_tool_reports_not_found() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nonexistent", HashMap::new()).await;
        assert_eq!(result, "Error: Tool 'nonexistent' not found");
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool)).unwrap();
        let result = registry.execute("dummy", HashMap::new()).await;
        assert!(result.starts_with("Error: Invalid parameters for 'dummy':"));
    }

    #[tokio::test]
    async fn unregister_removes_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool)).unwrap();
        assert!(registry.unregister("dummy"));
        assert!(!registry.has("dummy"));
        assert!(!registry.unregister("dummy"));
    }

    #[tokio::test]
    async fn oversized_result_is_evicted_to_scratch_file() {
        struct BigTool;
        #[async_trait]
        impl Tool for BigTool {
            fn name(&self) -> &str {
                "big"
            }
            fn description(&self) -> &str {
                "returns a huge string"
            }
            fn parameters(&self) -> Value {
                serde_json::json!({"type": "object", "properties": {}})
            }
            async fn execute(&self, _args: HashMap<String, Value>) -> String {
                "x".repeat(100)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new().with_eviction(EvictionConfig {
            threshold: 50,
            scratch_dir: dir.path().to_path_buf(),
            preview_chars: 10,
        });
        registry.register(Box::new(BigTool)).unwrap();

        let result = registry.execute("big", HashMap::new()).await;
        assert!(result.contains("full result written to"));
        assert!(result.contains("100 bytes total"));
    }
}
