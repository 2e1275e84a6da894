//! OpenAI-compatible classifier backend
//!
//! Talks to a `/chat/completions` endpoint.
//!
//! - `structured`: `response_format = json_schema` (strict), output read from
//!   the message content
//! - `function_call`: a single strict tool forced via `tool_choice`, output read
//!   from the tool call arguments
//!
//! Report attachments become a `file` content block (uploaded file id, or a
//! base64 data URI when the upload was not possible).

use super::schema::OutputSchema;
use super::{ClassifierBackend, ClassifierRequest, InvocationStrategy};
use crate::attachments::AttachmentHandle;
use crate::error::ClassifierError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use studylink_common::config::ClassifierSettings;
use tracing::debug;

/// Prefix for reviewer instructions sent as a second system message
pub const REVIEWER_INSTRUCTIONS_PREFIX: &str = "Reviewer instructions (follow as primary guidance): ";

/// Chat-completions backend
pub struct OpenAiBackend {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(settings: &ClassifierSettings) -> Result<Self, ClassifierError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| ClassifierError::Setup(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl ClassifierBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn prepare(
        &self,
        _strategy: InvocationStrategy,
        _request: &ClassifierRequest,
        _schema: &OutputSchema,
    ) -> Result<(), ClassifierError> {
        match &self.api_key {
            Some(key) if !key.trim().is_empty() => Ok(()),
            _ => Err(ClassifierError::Setup("no classifier API key configured".to_string())),
        }
    }

    async fn invoke(
        &self,
        strategy: InvocationStrategy,
        request: &ClassifierRequest,
        schema: &OutputSchema,
    ) -> Result<Value, ClassifierError> {
        let body = build_body(strategy, request, schema);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            stage = request.stage,
            strategy = strategy.as_str(),
            model = request.variant.model_name(),
            "Sending classifier request"
        );

        let mut builder = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.trim());
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(format!("Chat response: {}", e)))?;
        extract_output(strategy, schema, parsed)
    }
}

/// Request body for one invocation
pub fn build_body(strategy: InvocationStrategy, request: &ClassifierRequest, schema: &OutputSchema) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
    if let Some(instructions) = request
        .reviewer_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        messages.push(json!({
            "role": "system",
            "content": format!("{}{}", REVIEWER_INSTRUCTIONS_PREFIX, instructions),
        }));
    }

    let mut content = Vec::new();
    if let Some(attachment) = &request.attachment {
        content.push(file_block(attachment));
    }
    content.push(json!({"type": "text", "text": request.payload.to_string()}));
    messages.push(json!({"role": "user", "content": content}));

    let mut body = json!({
        "model": request.variant.model_name(),
        "messages": messages,
    });

    match strategy {
        InvocationStrategy::Structured => {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "description": schema.description,
                    "strict": true,
                    "schema": schema.schema,
                }
            });
        }
        InvocationStrategy::FunctionCall => {
            body["tools"] = json!([{
                "type": "function",
                "function": {
                    "name": schema.name,
                    "description": schema.description,
                    "strict": true,
                    "parameters": schema.schema,
                }
            }]);
            body["tool_choice"] = json!({"type": "function", "function": {"name": schema.name}});
        }
    }

    if let Some(temperature) = request.temperature {
        if request.variant.supports_temperature() {
            body["temperature"] = json!(temperature);
        } else {
            debug!(
                model = request.variant.model_name(),
                "Ignoring temperature for variant without sampling control"
            );
        }
    }

    body
}

fn file_block(attachment: &AttachmentHandle) -> Value {
    match attachment {
        AttachmentHandle::FileRef { file_id } => json!({
            "type": "file",
            "file": {"file_id": file_id}
        }),
        AttachmentHandle::Inline {
            base64,
            mime_type,
            filename,
        } => json!({
            "type": "file",
            "file": {
                "filename": filename,
                "file_data": format!("data:{};base64,{}", mime_type, base64),
            }
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
    arguments: String,
}

/// Pull the raw output out of a chat response
///
/// Returns the JSON text as a string value; schema validation parses it.
pub fn extract_output(
    strategy: InvocationStrategy,
    schema: &OutputSchema,
    response: ChatResponse,
) -> Result<Value, ClassifierError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| ClassifierError::InvalidResponse("no choices in response".to_string()))?;

    if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ClassifierError::InvalidResponse(format!("refused: {}", refusal)));
    }

    match strategy {
        InvocationStrategy::Structured => message
            .content
            .filter(|c| !c.trim().is_empty())
            .map(Value::String)
            .ok_or_else(|| ClassifierError::InvalidResponse("empty message content".to_string())),
        InvocationStrategy::FunctionCall => message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .find(|call| call.function.name == schema.name)
            .map(|call| Value::String(call.function.arguments))
            .ok_or_else(|| {
                ClassifierError::InvalidResponse(format!("no {} tool call in response", schema.name))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::schema::{InitialDecision, StageOutput};
    use crate::gateway::ClassifierVariant;

    fn request(attachment: Option<AttachmentHandle>) -> ClassifierRequest {
        ClassifierRequest {
            stage: "classify_initial",
            system_prompt: "triage".into(),
            reviewer_instructions: Some("prefer registration ids".into()),
            payload: json!({"report": {"CRGReportID": 1}}),
            attachment,
            variant: ClassifierVariant::Gpt41,
            temperature: Some(0.2),
            subject: None,
        }
    }

    #[test]
    fn test_structured_body() {
        let schema = InitialDecision::schema();
        let body = build_body(InvocationStrategy::Structured, &request(None), &schema);

        assert_eq!(body["model"], "gpt-4.1");
        assert_eq!(body["response_format"]["json_schema"]["name"], "initial_decision");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][1]["content"], "Reviewer instructions (follow as primary guidance): prefer registration ids");
        let temperature = body["temperature"].as_f64().unwrap();
        assert!((temperature - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_function_call_body_with_inline_file() {
        let schema = InitialDecision::schema();
        let attachment = AttachmentHandle::Inline {
            base64: "JVBERi0=".into(),
            mime_type: "application/pdf".into(),
            filename: "report_1.pdf".into(),
        };
        let mut req = request(Some(attachment));
        req.variant = ClassifierVariant::Gpt5;
        let body = build_body(InvocationStrategy::FunctionCall, &req, &schema);

        assert_eq!(body["tool_choice"]["function"]["name"], "initial_decision");
        assert!(body.get("temperature").is_none());
        let user = &body["messages"][2]["content"];
        assert_eq!(user[0]["file"]["file_data"], "data:application/pdf;base64,JVBERi0=");
        assert_eq!(user[1]["type"], "text");
    }

    #[test]
    fn test_extract_tool_arguments() {
        let schema = InitialDecision::schema();
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "c1", "type": "function", "function": {
                    "name": "initial_decision",
                    "arguments": "{\"decision\":\"unsure\",\"rationale\":\"no abstract\"}"
                }}]
            }}]
        }))
        .unwrap();

        let raw = extract_output(InvocationStrategy::FunctionCall, &schema, response).unwrap();
        let parsed = InitialDecision::from_value(raw).unwrap();
        assert_eq!(parsed.rationale, "no abstract");
    }

    #[test]
    fn test_refusal_is_invalid_response() {
        let schema = InitialDecision::schema();
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "refusal": "cannot help"}}]
        }))
        .unwrap();
        let err = extract_output(InvocationStrategy::Structured, &schema, response).unwrap_err();
        assert_eq!(err.class_name(), "InvalidResponseError");
    }

    #[test]
    fn test_missing_key_fails_setup() {
        let backend = OpenAiBackend::new(&ClassifierSettings::default()).unwrap();
        let schema = InitialDecision::schema();
        let err = backend
            .prepare(InvocationStrategy::Structured, &request(None), &schema)
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Setup(_)));
    }
}
