//! Tools served by a live MCP server, either spawned over stdio or reached
//! through a streamable HTTP endpoint.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::McpServerSection;
use crate::tools::{ToolDefinition, ToolFunction, ToolRegistry};
use crate::LLMError;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("mcp_server needs exactly one of `command` or `url`")]
    NoTransport,

    #[error("mcp_server command is empty")]
    EmptyCommand,

    #[error("failed to start MCP server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to MCP server {target}: {message}")]
    Connect { target: String, message: String },

    #[error("failed to list tools from MCP server {target}: {message}")]
    ListTools { target: String, message: String },
}

/// How to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpServer {
    Stdio { program: String, args: Vec<String> },
    Http { url: String },
}

impl McpServer {
    pub fn from_section(section: &McpServerSection) -> Result<Self, McpError> {
        match (&section.command, &section.url) {
            (Some(command), None) => {
                let mut parts = command.split_whitespace().map(str::to_string);
                let program = parts.next().ok_or(McpError::EmptyCommand)?;
                Ok(McpServer::Stdio {
                    program,
                    args: parts.collect(),
                })
            }
            (None, Some(url)) if !url.trim().is_empty() => Ok(McpServer::Http {
                url: url.trim().to_string(),
            }),
            _ => Err(McpError::NoTransport),
        }
    }
}

impl fmt::Display for McpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpServer::Stdio { program, args } if args.is_empty() => write!(f, "`{program}`"),
            McpServer::Stdio { program, args } => write!(f, "`{program} {}`", args.join(" ")),
            McpServer::Http { url } => f.write_str(url),
        }
    }
}

/// An initialized client session. Dropping it shuts the session down, which
/// also stops a spawned server process.
pub struct McpConnection {
    target: String,
    service: RunningService<RoleClient, ()>,
}

impl McpConnection {
    pub async fn connect(server: &McpServer) -> Result<Self, McpError> {
        let target = server.to_string();
        let connect_error = |message: String| McpError::Connect {
            target: target.clone(),
            message,
        };

        let service = match server {
            McpServer::Stdio { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                let transport = TokioChildProcess::new(command).map_err(|source| McpError::Spawn {
                    command: target.clone(),
                    source,
                })?;
                ().serve(transport)
                    .await
                    .map_err(|error| connect_error(error.to_string()))?
            }
            McpServer::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                ().serve(transport)
                    .await
                    .map_err(|error| connect_error(error.to_string()))?
            }
        };

        debug!(server = %target, "connected to MCP server");
        Ok(Self { target, service })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let listed = self
            .service
            .list_all_tools()
            .await
            .map_err(|error| McpError::ListTools {
                target: self.target.clone(),
                message: error.to_string(),
            })?;

        let mut definitions = Vec::with_capacity(listed.len());
        for tool in listed {
            let raw = serde_json::to_value(&tool).map_err(|error| McpError::ListTools {
                target: self.target.clone(),
                message: error.to_string(),
            })?;
            match definition_from_listing(&raw) {
                Some(definition) => definitions.push(definition),
                None => warn!(server = %self.target, "skipping MCP tool without a name"),
            }
        }
        Ok(definitions)
    }

    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, LLMError> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other.clone(),
        };
        let request: CallToolRequestParam =
            serde_json::from_value(json!({ "name": name, "arguments": arguments }))?;

        let result = self
            .service
            .call_tool(request)
            .await
            .map_err(|error| LLMError::ToolExecution {
                tool: name.to_string(),
                message: error.to_string(),
            })?;
        value_from_call_result(name, serde_json::to_value(result)?)
    }
}

/// Tool listing entries use MCP's camelCase `inputSchema`.
pub fn definition_from_listing(raw: &Value) -> Option<ToolDefinition> {
    let name = raw.get("name").and_then(Value::as_str).filter(|name| !name.is_empty())?;
    let mut definition = ToolDefinition::new(name);
    if let Some(description) = raw.get("description").and_then(Value::as_str) {
        definition = definition.with_description(description);
    }
    if let Some(schema) = raw.get("inputSchema").filter(|schema| schema.is_object()) {
        definition = definition.with_parameters(schema.clone());
    }
    Some(definition)
}

/// Structured content wins; otherwise the text blocks are joined and read as
/// JSON when they parse. `isError` results become tool errors.
pub fn value_from_call_result(tool: &str, raw: Value) -> Result<Value, LLMError> {
    let text = raw
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if raw.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = if text.is_empty() {
            "tool reported an error".to_string()
        } else {
            text
        };
        return Err(LLMError::ToolExecution {
            tool: tool.to_string(),
            message,
        });
    }

    if let Some(structured) = raw.get("structuredContent").filter(|value| !value.is_null()) {
        return Ok(structured.clone());
    }
    if text.is_empty() {
        return Ok(raw.get("content").cloned().unwrap_or(Value::Null));
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// A tool whose calls are forwarded to the server it was listed by.
pub struct McpTool {
    definition: ToolDefinition,
    connection: Arc<McpConnection>,
}

impl McpTool {
    pub fn new(definition: ToolDefinition, connection: Arc<McpConnection>) -> Self {
        Self {
            definition,
            connection,
        }
    }
}

#[async_trait]
impl ToolFunction for McpTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        self.connection.call_tool(&self.definition.name, arguments).await
    }
}

/// Connect to the configured server and register every tool it lists.
pub async fn load_mcp_tools(section: &McpServerSection) -> Result<ToolRegistry, McpError> {
    let server = McpServer::from_section(section)?;
    let connection = Arc::new(McpConnection::connect(&server).await?);
    let definitions = connection.list_tools().await?;
    info!(server = %connection.target(), tools = definitions.len(), "loaded MCP tools");

    let mut registry = ToolRegistry::new();
    for definition in definitions {
        registry.register(Arc::new(McpTool::new(definition, connection.clone())));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(command: Option<&str>, url: Option<&str>) -> McpServerSection {
        McpServerSection {
            command: command.map(str::to_string),
            url: url.map(str::to_string),
        }
    }

    #[test]
    fn command_is_split_into_program_and_args() {
        let server = McpServer::from_section(&section(Some("npx -y  @example/weather-mcp"), None)).unwrap();
        assert_eq!(
            server,
            McpServer::Stdio {
                program: "npx".to_string(),
                args: vec!["-y".to_string(), "@example/weather-mcp".to_string()],
            }
        );
        assert_eq!(server.to_string(), "`npx -y @example/weather-mcp`");

        assert!(matches!(
            McpServer::from_section(&section(Some("   "), None)),
            Err(McpError::EmptyCommand)
        ));
    }

    #[test]
    fn url_or_nothing() {
        let server = McpServer::from_section(&section(None, Some(" http://localhost:8080/mcp "))).unwrap();
        assert_eq!(
            server,
            McpServer::Http {
                url: "http://localhost:8080/mcp".to_string()
            }
        );
        assert!(matches!(
            McpServer::from_section(&section(None, None)),
            Err(McpError::NoTransport)
        ));
        assert!(matches!(
            McpServer::from_section(&section(Some("srv"), Some("http://x"))),
            Err(McpError::NoTransport)
        ));
    }

    #[test]
    fn listing_maps_input_schema_to_parameters() {
        let definition = definition_from_listing(&json!({
            "name": "get_weather",
            "description": "Current weather",
            "inputSchema": {
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            }
        }))
        .unwrap();
        assert_eq!(definition.name, "get_weather");
        assert_eq!(definition.description.as_deref(), Some("Current weather"));
        assert_eq!(definition.parameters["required"], json!(["city"]));

        let bare = definition_from_listing(&json!({ "name": "ping" })).unwrap();
        assert_eq!(bare.parameters["type"], "object");
        assert!(definition_from_listing(&json!({ "description": "nameless" })).is_none());
    }

    #[test]
    fn call_results_prefer_structured_then_json_text() {
        let structured = value_from_call_result(
            "get_weather",
            json!({
                "content": [{ "type": "text", "text": "12 degrees" }],
                "structuredContent": { "temp_c": 12 },
                "isError": false
            }),
        )
        .unwrap();
        assert_eq!(structured, json!({ "temp_c": 12 }));

        let parsed = value_from_call_result(
            "get_weather",
            json!({ "content": [{ "type": "text", "text": "{\"temp_c\": 7}" }] }),
        )
        .unwrap();
        assert_eq!(parsed["temp_c"], 7);

        let plain = value_from_call_result(
            "get_weather",
            json!({ "content": [{ "type": "text", "text": "Sunny" }, { "type": "text", "text": "12C" }] }),
        )
        .unwrap();
        assert_eq!(plain, json!("Sunny\n12C"));
    }

    #[test]
    fn error_results_become_tool_errors() {
        let err = value_from_call_result(
            "get_weather",
            json!({ "content": [{ "type": "text", "text": "unknown city" }], "isError": true }),
        )
        .unwrap_err();
        match err {
            LLMError::ToolExecution { tool, message } => {
                assert_eq!(tool, "get_weather");
                assert_eq!(message, "unknown city");
            }
            other => panic!("expected a tool error, got {other:?}"),
        }
    }
}
