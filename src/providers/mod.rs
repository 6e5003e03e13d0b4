use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::{ConfigError, LlmConfig};
use crate::types::{CompletionRequest, CompletionResponse, TokenUsage};
use crate::LLMError;

pub mod ollama;
pub mod openai;
pub mod scripted;

/// Provider names accepted in config files and on the command line.
pub const PROVIDER_NAMES: &[&str] = &["ollama", "openai"];

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}

/// Build the provider named by `config.provider`.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LLMProvider>, ConfigError> {
    match config.provider.as_str() {
        "openai" => {
            let provider = openai::OpenAICompatible::openai(config)?;
            Ok(Arc::new(provider))
        }
        "ollama" => {
            let provider = ollama::Ollama::from_config(config)?;
            Ok(Arc::new(provider))
        }
        other => Err(ConfigError::UnknownProvider {
            name: other.to_string(),
            available: PROVIDER_NAMES.join(", "),
        }),
    }
}

/// Run a completion that must answer with JSON shaped like `T`.
///
/// The request carries `T`'s JSON schema as a `response_format`; the reply is
/// then decoded leniently since smaller models wrap JSON in prose or fences.
pub async fn complete_json<T>(
    provider: &dyn LLMProvider,
    request: CompletionRequest,
) -> Result<(T, Option<TokenUsage>), LLMError>
where
    T: DeserializeOwned + JsonSchema,
{
    let request = request.with_response_format(response_format_for::<T>()?);
    let response = provider.complete(request).await?;
    let value = parse_json_output(response.message.text())?;
    Ok((value, response.usage))
}

fn response_format_for<T: JsonSchema>() -> Result<Value, LLMError> {
    let schema = serde_json::to_value(schemars::schema_for!(T))?;
    Ok(json!({
        "type": "json_schema",
        "json_schema": {
            "name": T::schema_name(),
            "schema": schema,
        }
    }))
}

/// Decode model output as JSON: whole text first, then a fenced block, then the
/// last complete top-level object embedded in prose.
pub fn parse_json_output<T: DeserializeOwned>(content: &str) -> Result<T, LLMError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(LLMError::Structured("model returned an empty response".to_string()));
    }

    let first_error = match serde_json::from_str::<T>(trimmed) {
        Ok(value) => return Ok(value),
        Err(error) => error,
    };

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(&fenced) {
            return Ok(value);
        }
    }

    if let Some(object) = extract_last_object(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(object) {
            return Ok(value);
        }
    }

    Err(LLMError::Structured(first_error.to_string()))
}

fn extract_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

// Quote/escape aware; braces inside strings do not count.
fn extract_last_object(content: &str) -> Option<&str> {
    let mut start = None;
    let mut last = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in content.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        last = Some((s, i + 1));
                    }
                }
            }
            _ => {}
        }
    }

    last.map(|(s, e)| &content[s..e])
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::parse_json_output;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        met: bool,
        note: String,
    }

    #[test]
    fn parses_plain_json() {
        let verdict: Verdict = parse_json_output(r#"{"met": true, "note": "ok"}"#).unwrap();
        assert!(verdict.met);
        assert_eq!(verdict.note, "ok");
    }

    #[test]
    fn parses_fenced_json() {
        let content = "Here you go:\n```json\n{\"met\": false, \"note\": \"missing city\"}\n```";
        let verdict: Verdict = parse_json_output(content).unwrap();
        assert!(!verdict.met);
    }

    #[test]
    fn takes_last_object_from_prose_and_ignores_braces_in_strings() {
        let content = r#"draft {"met": false, "note": "x"} final {"met": true, "note": "brace {ok}"} done"#;
        let verdict: Verdict = parse_json_output(content).unwrap();
        assert!(verdict.met);
        assert_eq!(verdict.note, "brace {ok}");
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(parse_json_output::<Verdict>("   ").is_err());
    }
}
