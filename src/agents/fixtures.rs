//! Tools whose answers come from YAML fixtures instead of a live server.
//!
//! ```yaml
//! tools:
//!   - name: get_weather
//!     description: Current weather for a city
//!     parameters:
//!       type: object
//!       properties: { city: { type: string } }
//!       required: [city]
//!     fixtures:
//!       - when: { city: Oslo }
//!         then: { kind: ok, value: { temp_c: 12 } }
//!     default: { kind: err, message: unknown city }
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::AgentError;
use crate::tools::{ToolDefinition, ToolFunction, ToolRegistry};
use crate::LLMError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub tools: Vec<FixtureToolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub fixtures: Vec<ToolFixture>,
    #[serde(default)]
    pub default: Option<FixtureResult>,
}

/// Returned when the call's arguments contain everything in `when`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFixture {
    #[serde(default = "empty_object")]
    pub when: Value,
    pub then: FixtureResult,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureResult {
    Ok { value: Value },
    Err { message: String },
}

#[derive(Debug, Clone)]
pub struct FixtureTool {
    definition: ToolDefinition,
    fixtures: Vec<ToolFixture>,
    default: Option<FixtureResult>,
}

impl FixtureTool {
    pub fn new(spec: FixtureToolSpec) -> Self {
        let mut definition = ToolDefinition::new(spec.name);
        if let Some(description) = spec.description {
            definition = definition.with_description(description);
        }
        if let Some(parameters) = spec.parameters {
            definition = definition.with_parameters(parameters);
        }

        Self {
            definition,
            fixtures: spec.fixtures,
            default: spec.default,
        }
    }

    fn match_fixture(&self, arguments: &Value) -> Option<&FixtureResult> {
        self.fixtures
            .iter()
            .find(|fixture| value_is_subset(&fixture.when, arguments))
            .map(|fixture| &fixture.then)
            .or(self.default.as_ref())
    }
}

#[async_trait]
impl ToolFunction for FixtureTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        match self.match_fixture(arguments) {
            Some(FixtureResult::Ok { value }) => Ok(value.clone()),
            Some(FixtureResult::Err { message }) => Err(LLMError::ToolExecution {
                tool: self.definition.name.clone(),
                message: message.clone(),
            }),
            None => Err(LLMError::ToolExecution {
                tool: self.definition.name.clone(),
                message: "no matching fixture and no default specified".to_string(),
            }),
        }
    }
}

fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(key, value)| actual.get(key).is_some_and(|found| value_is_subset(value, found)))
}

pub fn parse_fixture_tools(content: &str) -> Result<ToolRegistry, serde_yaml::Error> {
    let file: FixtureFile = serde_yaml::from_str(content)?;
    let mut registry = ToolRegistry::new();
    for spec in file.tools {
        registry.register(Arc::new(FixtureTool::new(spec)));
    }
    Ok(registry)
}

pub fn load_fixture_tools(path: &Path) -> Result<ToolRegistry, AgentError> {
    let tools_error = |message: String| AgentError::Tools {
        path: path.display().to_string(),
        message,
    };
    let content = fs::read_to_string(path).map_err(|error| tools_error(error.to_string()))?;
    parse_fixture_tools(&content).map_err(|error| tools_error(error.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const WEATHER_TOOLS: &str = r#"
tools:
  - name: get_weather
    description: Current weather
    parameters:
      type: object
      properties:
        city: { type: string }
      required: [city]
    fixtures:
      - when: { city: Oslo }
        then: { kind: ok, value: { temp_c: 12 } }
      - when: { city: Atlantis }
        then: { kind: err, message: city not found }
    default: { kind: ok, value: { temp_c: 20 } }
  - name: list_cities
"#;

    #[tokio::test]
    async fn fixtures_match_argument_subsets() {
        let registry = parse_fixture_tools(WEATHER_TOOLS).unwrap();
        assert_eq!(registry.len(), 2);

        let oslo = registry
            .invoke("get_weather", &json!({"city": "Oslo", "units": "metric"}))
            .await
            .unwrap();
        assert_eq!(oslo, json!({"temp_c": 12}));

        let fallback = registry.invoke("get_weather", &json!({"city": "Rome"})).await.unwrap();
        assert_eq!(fallback, json!({"temp_c": 20}));

        let err = registry
            .invoke("get_weather", &json!({"city": "Atlantis"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("city not found"));
    }

    #[tokio::test]
    async fn tool_without_fixtures_or_default_fails() {
        let registry = parse_fixture_tools(WEATHER_TOOLS).unwrap();
        let err = registry.invoke("list_cities", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("no matching fixture"));

        let definitions = registry.definitions();
        let list = definitions.iter().find(|d| d.name == "list_cities").unwrap();
        assert_eq!(list.parameters["type"], "object");
    }

    #[test]
    fn missing_file_is_a_tools_error() {
        let err = load_fixture_tools(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, AgentError::Tools { .. }));
    }
}
