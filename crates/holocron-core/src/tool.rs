use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use holocron_provider::ToolDef;
use serde::de::DeserializeOwned;

/// Prefix of every tool result that reports a failure instead of data.
pub const TOOL_ERROR_PREFIX: &str = "Tool execution error:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: format!("{TOOL_ERROR_PREFIX} {message}"),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definition(&self) -> ToolDef;
    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutput>;
}

/// Decode tool arguments into their typed form.
pub fn parse_args<T: DeserializeOwned>(tool: &str, input: serde_json::Value) -> Result<T> {
    serde_json::from_value(input).with_context(|| format!("invalid arguments for {tool}"))
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Names must be unique and every schema must describe a JSON object
    /// whose required fields are declared.
    pub fn register(&mut self, tool: Box<dyn ToolExecutor>) -> Result<()> {
        let def = tool.definition();
        validate_definition(&def)?;
        if self.tools.contains_key(&def.name) {
            return Err(anyhow!("duplicate tool name: {}", def.name));
        }
        self.tools.insert(def.name, tool);
        Ok(())
    }

    /// Definitions sorted by name, so requests are stable across runs.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("tool not found: {name}"))?;
        tool.execute(input).await
    }

    /// Run a tool under `timeout`. Never fails: unknown names, bad
    /// arguments, errors and timeouts all come back as error text.
    pub async fn dispatch(
        &self,
        name: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> ToolOutput {
        match tokio::time::timeout(timeout, self.execute(name, input)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!("tool {name} failed: {e:#}");
                ToolOutput::error(format!("{e:#}"))
            }
            Err(_) => {
                tracing::warn!("tool {name} timed out after {}s", timeout.as_secs());
                ToolOutput::error(format!("{name} timed out after {}s", timeout.as_secs()))
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_definition(def: &ToolDef) -> Result<()> {
    let valid_name = !def.name.is_empty()
        && def
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_name {
        return Err(anyhow!("invalid tool name: {:?}", def.name));
    }

    let schema = &def.input_schema;
    if schema["type"] != "object" {
        return Err(anyhow!("tool {} schema must have type \"object\"", def.name));
    }
    let properties = schema["properties"]
        .as_object()
        .ok_or_else(|| anyhow!("tool {} schema is missing properties", def.name))?;
    if let Some(required) = schema.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| anyhow!("tool {} schema has non-array required", def.name))?;
        for field in required {
            let field = field.as_str().unwrap_or_default();
            if !properties.contains_key(field) {
                return Err(anyhow!(
                    "tool {} requires undeclared parameter {field:?}",
                    def.name
                ));
            }
        }
    }
    Ok(())
}
