use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::LLMError;

/// A tool as advertised to the model. `parameters` is a JSON schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    #[default]
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default)]
    pub kind: ToolKind,
    pub function: ToolDefinition,
}

impl From<ToolDefinition> for Tool {
    fn from(function: ToolDefinition) -> Self {
        Self {
            kind: ToolKind::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    None,
    Auto,
    Required,
}

/// A tool call requested by the model. `arguments` keeps the raw JSON text the
/// provider sent; providers that send an object get it re-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ToolKind,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, deserialize_with = "arguments_as_text")]
    pub arguments: String,
}

fn arguments_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            kind: ToolKind::Function,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Decoded arguments. Blank argument text is an empty object.
    pub fn arguments(&self) -> Result<Map<String, Value>, LLMError> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(LLMError::InvalidToolArguments(format!(
                "arguments for {} are not a JSON object",
                self.function.name
            ))),
            Err(error) => Err(LLMError::InvalidToolArguments(format!(
                "arguments for {} are not valid JSON: {error}",
                self.function.name
            ))),
        }
    }
}

#[async_trait]
pub trait ToolFunction: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError>;
}

pub type DynToolFunction = Arc<dyn ToolFunction>;

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, DynToolFunction>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: DynToolFunction) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    pub fn register_all<I>(&mut self, tools: I)
    where
        I: IntoIterator<Item = DynToolFunction>,
    {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&DynToolFunction> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.definitions().into_iter().map(Tool::from).collect()
    }

    pub async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, LLMError> {
        let tool = self
            .get(name)
            .ok_or_else(|| LLMError::UnknownTool(name.to_string()))?;
        tool.invoke(arguments).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ToolCall;

    #[test]
    fn accepts_object_arguments_from_provider() {
        let call: ToolCall = serde_json::from_value(json!({
            "id": "call_1",
            "type": "function",
            "function": { "name": "get_weather", "arguments": { "city": "Oslo" } }
        }))
        .unwrap();

        let args = call.arguments().unwrap();
        assert_eq!(args.get("city"), Some(&json!("Oslo")));
    }

    #[test]
    fn blank_arguments_decode_to_empty_object() {
        let call: ToolCall = serde_json::from_value(json!({
            "function": { "name": "list_cities", "arguments": "" }
        }))
        .unwrap();

        assert!(call.arguments().unwrap().is_empty());
    }

    #[test]
    fn rejects_non_object_arguments() {
        let call = ToolCall::new("get_weather", json!([1, 2]));
        assert!(call.arguments().is_err());
    }
}
