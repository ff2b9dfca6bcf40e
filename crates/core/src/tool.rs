//! Tool trait: the abstraction over model-requested project actions.
//!
//! Tools let the model inspect the project before it answers: list
//! directories, read files, search for text. A tool returns a JSON payload
//! which the coordinator normalizes into the continuation wire format.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// A request, embedded in model output, to run one tool.
///
/// Wire format: `{"name": "<tool>", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        let args = match args {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            name: name.into(),
            args,
        }
    }

    /// Arguments rendered back to JSON text, as shown in tool usage records.
    pub fn arguments_json(&self) -> String {
        serde_json::Value::Object(self.args.clone()).to_string()
    }

    /// The `path` argument, if the call targets a file or directory.
    pub fn file_path(&self) -> Option<&str> {
        self.args
            .get("path")
            .or_else(|| self.args.get("filePath"))
            .and_then(|v| v.as_str())
    }
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object
    pub parameters: serde_json::Value,
}

/// Lifecycle of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Runtime record of one tool invocation, shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub arguments_json: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, with = "duration_millis")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl ToolUsage {
    pub fn pending(call: &ToolCall) -> Self {
        Self {
            tool_name: call.name.clone(),
            arguments_json: call.arguments_json(),
            status: ToolStatus::Pending,
            result: None,
            duration: Duration::ZERO,
            file_path: call.file_path().map(str::to_string),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// The core Tool trait.
///
/// Implementations return the tool-specific payload; the coordinator adds
/// the `ok` flag and turns errors into structured failures.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The name the model uses to call this tool (e.g. `listFiles`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing this tool's arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, keyed by name.
///
/// Tools are held behind `Arc` so a batch can hand each call to its own task.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions sorted by name, for stable prompts.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(
        &self,
        call: &ToolCall,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.execute(call.args.clone()).await
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            args: serde_json::Map<String, serde_json::Value>,
        ) -> std::result::Result<serde_json::Value, ToolError> {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!({ "echo": text }))
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.definitions()[0].name, "echo");
    }

    #[tokio::test]
    async fn registry_execute_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let call = ToolCall::new("echo", json!({"text": "hello world"}));
        let result = registry.execute(&call).await.unwrap();
        assert_eq!(result["echo"], "hello world");
    }

    #[tokio::test]
    async fn registry_execute_missing_tool() {
        let registry = ToolRegistry::new();
        let call = ToolCall::new("nonexistent", json!({}));
        let err = registry.execute(&call).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn tool_call_wire_format() {
        let call: ToolCall =
            serde_json::from_str(r#"{"name":"listFiles","args":{"path":"."}}"#).unwrap();
        assert_eq!(call.name, "listFiles");
        assert_eq!(call.file_path(), Some("."));

        let usage = ToolUsage::pending(&call);
        assert_eq!(usage.status, ToolStatus::Pending);
        assert_eq!(usage.arguments_json, r#"{"path":"."}"#);
        assert_eq!(usage.file_path.as_deref(), Some("."));
    }

    #[test]
    fn non_object_args_become_empty() {
        let call = ToolCall::new("listFiles", json!("oops"));
        assert!(call.args.is_empty());
    }
}
