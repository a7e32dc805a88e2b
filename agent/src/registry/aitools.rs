//! AI-tool registry (`spec.md` §3 `AIToolDefinition`, §4.5 "AI-tool
//! registry"): plugin-contributed, JSON-schema-described callables a
//! server-side agent can invoke by name.

use crate::error::{AgentError, AgentResult};
use crate::model::AiToolDefinition;
use std::collections::HashMap;
use std::sync::Arc;

/// `(parsed arguments, invoking session id) -> JSON result`.
pub type AiToolHandler = Arc<dyn Fn(serde_json::Value, &str) -> AgentResult<serde_json::Value> + Send + Sync>;

struct RegisteredTool {
    definition: AiToolDefinition,
    handler: AiToolHandler,
}

#[derive(Default)]
pub struct AiToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl AiToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: AiToolDefinition, handler: AiToolHandler) {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool { definition, handler },
        );
    }

    /// Enumerates the tool catalogue, each with its generated JSON schema.
    pub fn catalogue(&self) -> Vec<(AiToolDefinition, serde_json::Value)> {
        self.tools
            .values()
            .map(|t| (t.definition.clone(), t.definition.json_schema()))
            .collect()
    }

    pub fn schema_for(&self, name: &str) -> AgentResult<serde_json::Value> {
        self.tools
            .get(name)
            .map(|t| t.definition.json_schema())
            .ok_or_else(|| AgentError::UnknownCommand)
    }

    /// Parses `raw_args` as JSON and invokes the named tool's handler,
    /// returning the raw JSON result for the reply frame.
    pub fn invoke(&self, name: &str, raw_args: &str, session_id: &str) -> AgentResult<serde_json::Value> {
        let tool = self.tools.get(name).ok_or_else(|| AgentError::UnknownCommand)?;
        let args: serde_json::Value = serde_json::from_str(raw_args)
            .map_err(|e| AgentError::BadArguments(e.to_string()))?;
        (tool.handler)(args, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AiToolParameter;

    fn sample_tool() -> AiToolDefinition {
        AiToolDefinition {
            name: "echo".into(),
            category: "debug".into(),
            description: "Echoes its input".into(),
            parameters: vec![AiToolParameter {
                name: "message".into(),
                json_type: "string".into(),
                description: "Text to echo".into(),
                required: true,
                default: None,
                constraint: None,
            }],
        }
    }

    #[test]
    fn invoke_round_trips_json_arguments() {
        let mut registry = AiToolRegistry::new();
        registry.register(
            sample_tool(),
            Arc::new(|args, _session| Ok(args["message"].clone())),
        );
        let result = registry
            .invoke("echo", r#"{"message": "hi"}"#, "session-1")
            .unwrap();
        assert_eq!(result, serde_json::json!("hi"));
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let registry = AiToolRegistry::new();
        let err = registry.invoke("nope", "{}", "session-1").unwrap_err();
        assert!(matches!(err, AgentError::UnknownCommand));
    }

    #[test]
    fn malformed_json_args_reports_bad_arguments() {
        let mut registry = AiToolRegistry::new();
        registry.register(sample_tool(), Arc::new(|args, _| Ok(args)));
        let err = registry.invoke("echo", "not json", "session-1").unwrap_err();
        assert!(matches!(err, AgentError::BadArguments(_)));
    }

    #[test]
    fn catalogue_lists_generated_schema() {
        let mut registry = AiToolRegistry::new();
        registry.register(sample_tool(), Arc::new(|args, _| Ok(args)));
        let catalogue = registry.catalogue();
        assert_eq!(catalogue.len(), 1);
        assert_eq!(catalogue[0].1["required"][0], "message");
    }
}
