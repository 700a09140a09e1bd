//! LLM function-calling: the port, the provider adapter, and the retry loop.
//!
//! ## Function Calling
//!
//! The adapter forces a call to the requested function through the
//! provider's native tool API (`chat_with_tools` + `ToolChoice::function`).
//! Providers without tool support receive the schema in the system prompt.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Each attempt is bounded by `api_timeout_secs`; failed
//! attempts back off exponentially (`retry_backoff_ms * 2^(attempt-1)`).

use crate::config::PipelineConfig;
use crate::error::{CallError, InvoiceError};
use crate::prompts::function_instructions;
use async_trait::async_trait;
use edgequake_llm::{
    ChatMessage, CompletionOptions, LLMProvider, LLMResponse, ProviderFactory, ToolChoice,
    ToolDefinition,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// One function-calling request: the function's JSON Schema plus the prompt.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
    pub system: String,
    pub user: String,
}

/// Structured-output capability of the LLM collaborator.
///
/// Returns the arguments object the model produced for the function. Field
/// validation is the caller's job.
#[async_trait]
pub trait FunctionCaller: Send + Sync {
    async fn call(&self, request: &FunctionCall) -> Result<Value, CallError>;
}

/// [`FunctionCaller`] over any `edgequake_llm` provider.
///
/// Providers with native tool support get the function as a tool definition
/// and are forced to call it; the arguments come from the returned tool call.
/// Other providers get the schema in the system prompt and the reply content
/// is parsed as the arguments object.
pub struct ProviderFunctionCaller {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl ProviderFunctionCaller {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }

    async fn call_with_tool(&self, request: &FunctionCall) -> Result<LLMResponse, CallError> {
        let mut tool = ToolDefinition::function(
            request.name.as_str(),
            request.description.as_str(),
            request.parameters.clone(),
        );
        // Strict mode demands every property be required; nullable fields are not.
        tool.function.strict = None;

        let messages = vec![
            ChatMessage::system(request.system.clone()),
            ChatMessage::user(request.user.clone()),
        ];
        self.provider
            .chat_with_tools(
                &messages,
                &[tool],
                Some(ToolChoice::function(request.name.as_str())),
                Some(&self.options),
            )
            .await
            .map_err(|e| CallError::Provider(e.to_string()))
    }

    async fn call_with_prompt(&self, request: &FunctionCall) -> Result<LLMResponse, CallError> {
        let system = format!(
            "{}{}",
            request.system,
            function_instructions(&request.name, &request.description, &request.parameters)
        );
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(request.user.clone()),
        ];
        self.provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| CallError::Provider(e.to_string()))
    }
}

#[async_trait]
impl FunctionCaller for ProviderFunctionCaller {
    async fn call(&self, request: &FunctionCall) -> Result<Value, CallError> {
        let response = if self.provider.supports_function_calling() {
            self.call_with_tool(request).await?
        } else {
            self.call_with_prompt(request).await?
        };

        debug!(
            "{}: {} input tokens, {} output tokens, {} tool calls",
            request.name,
            response.prompt_tokens,
            response.completion_tokens,
            response.tool_calls.len()
        );
        arguments_from_response(&request.name, &response)
    }
}

/// Arguments of the tool call named `name` (or the only tool call), falling
/// back to the reply content when the provider answered in text.
pub fn arguments_from_response(name: &str, response: &LLMResponse) -> Result<Value, CallError> {
    let call = response
        .tool_calls
        .iter()
        .find(|c| c.name() == name)
        .or_else(|| match response.tool_calls.as_slice() {
            [only] => Some(only),
            _ => None,
        });

    match call {
        Some(call) => parse_arguments(call.arguments()),
        None if !response.tool_calls.is_empty() => Err(CallError::MalformedResponse(format!(
            "model called {:?} instead of {name}",
            response.tool_calls.iter().map(|c| c.name()).collect::<Vec<_>>()
        ))),
        None => {
            debug!("{}: no tool call, parsing reply content", name);
            parse_arguments(&response.content)
        }
    }
}

/// Build `CompletionOptions` from the pipeline config.
pub(crate) fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[A-Za-z]*\s*\n(.*?)\n?```\s*$").unwrap());

/// Parse tool-call arguments or a model reply into a JSON arguments object.
///
/// Accepts a bare object, an object wrapped in markdown fences, an object
/// surrounded by prose, and the `{"name": …, "arguments": …}` envelope some
/// models echo back (with `arguments` as an object or a JSON string).
pub fn parse_arguments(content: &str) -> Result<Value, CallError> {
    let trimmed = content.trim();
    let body = RE_OUTER_FENCES
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());

    let value = match serde_json::from_str::<Value>(body) {
        Ok(v) => v,
        Err(first) => {
            let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
                return Err(CallError::MalformedResponse(format!("not JSON: {first}")));
            };
            if end <= start {
                return Err(CallError::MalformedResponse(format!("not JSON: {first}")));
            }
            serde_json::from_str(&body[start..=end])
                .map_err(|e| CallError::MalformedResponse(format!("not JSON: {e}")))?
        }
    };

    let value = match value {
        Value::Object(mut map) if map.contains_key("arguments") && map.contains_key("name") => {
            match map.remove("arguments") {
                Some(Value::String(s)) => serde_json::from_str(&s)
                    .map_err(|e| CallError::MalformedResponse(format!("arguments: {e}")))?,
                Some(v) => v,
                None => Value::Null,
            }
        }
        other => other,
    };

    if value.is_object() {
        Ok(value)
    } else {
        Err(CallError::MalformedResponse(
            "expected a JSON object of arguments".into(),
        ))
    }
}

/// Run `op` up to `1 + max_retries` times, each attempt bounded by the
/// configured API timeout.
///
/// Returns the first success, or the last error once retries are exhausted.
pub async fn call_with_retries<T, F, Fut>(
    label: &str,
    config: &PipelineConfig,
    max_retries: u32,
    mut op: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let limit = config.api_timeout();
    let mut last_err = CallError::Provider("no attempt made".into());

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff(attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt,
                max_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match timeout(limit, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!("{}: attempt {} failed: {}", label, attempt + 1, e);
                last_err = e;
            }
            Err(_) => {
                let e = CallError::Timeout {
                    secs: limit.as_secs(),
                };
                warn!("{}: attempt {} failed: {}", label, attempt + 1, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        InvoiceError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. `config.provider`, used as-is.
/// 2. `config.provider_name` with `config.model`.
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set.
/// 4. OpenAI when `OPENAI_API_KEY` is set.
/// 5. `ProviderFactory::from_env()` auto-detection.
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| InvoiceError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgequake_llm::providers::{MockAgentProvider, MockProvider};
    use edgequake_llm::ToolCall;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&PipelineConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn parses_bare_object() {
        let v = parse_arguments(r#"{"invoice_number": "A-1"}"#).unwrap();
        assert_eq!(v["invoice_number"], "A-1");
    }

    #[test]
    fn strips_json_fences() {
        let v = parse_arguments("```json\n{\"total_amount\": 12.5}\n```").unwrap();
        assert_eq!(v["total_amount"], 12.5);
    }

    #[test]
    fn extracts_object_from_prose() {
        let v = parse_arguments("Sure! Here you go: {\"a\": 1} Hope this helps.").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn unwraps_function_envelope() {
        let v = parse_arguments(r#"{"name": "extract_data", "arguments": "{\"a\": 2}"}"#).unwrap();
        assert_eq!(v, json!({"a": 2}));
        let v = parse_arguments(r#"{"name": "extract_data", "arguments": {"b": 3}}"#).unwrap();
        assert_eq!(v, json!({"b": 3}));
    }

    #[test]
    fn rejects_non_object() {
        assert!(matches!(
            parse_arguments("[1, 2, 3]"),
            Err(CallError::MalformedResponse(_))
        ));
        assert!(parse_arguments("I cannot read this document.").is_err());
    }

    fn tool_call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: edgequake_llm::FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    fn request() -> FunctionCall {
        FunctionCall {
            name: "extract_data".into(),
            description: "Extract invoice fields".into(),
            parameters: json!({"type": "object", "properties": {"invoice_number": {"type": ["string", "null"]}}}),
            system: "You extract invoices.".into(),
            user: "Invoice A-1".into(),
        }
    }

    #[test]
    fn prefers_the_named_tool_call() {
        let response = LLMResponse::new("", "m").with_tool_calls(vec![
            tool_call("other", r#"{"x": 1}"#),
            tool_call("extract_data", r#"{"invoice_number": "A-1"}"#),
        ]);
        let v = arguments_from_response("extract_data", &response).unwrap();
        assert_eq!(v, json!({"invoice_number": "A-1"}));
    }

    #[test]
    fn wrong_tool_is_malformed() {
        let response = LLMResponse::new("", "m")
            .with_tool_calls(vec![tool_call("a", "{}"), tool_call("b", "{}")]);
        assert!(matches!(
            arguments_from_response("extract_data", &response),
            Err(CallError::MalformedResponse(_))
        ));
    }

    #[test]
    fn text_reply_falls_back_to_content() {
        let response = LLMResponse::new("```json\n{\"invoice_number\": \"B-2\"}\n```", "m");
        let v = arguments_from_response("extract_data", &response).unwrap();
        assert_eq!(v["invoice_number"], "B-2");
    }

    #[tokio::test]
    async fn tool_capable_provider_answers_through_tool_call() {
        let provider = Arc::new(MockAgentProvider::new());
        provider
            .add_tool_response(
                "",
                vec![tool_call("extract_data", r#"{"invoice_number": "T-9"}"#)],
            )
            .await;
        let caller = ProviderFunctionCaller::new(provider.clone(), &PipelineConfig::default());

        let v = caller.call(&request()).await.unwrap();
        assert_eq!(v["invoice_number"], "T-9");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn plain_chat_provider_uses_prompt_schema() {
        let provider = Arc::new(MockProvider::new());
        provider.add_response(r#"{"invoice_number": "P-3"}"#).await;
        let caller = ProviderFunctionCaller::new(provider, &PipelineConfig::default());

        let v = caller.call(&request()).await.unwrap();
        assert_eq!(v["invoice_number"], "P-3");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let config = PipelineConfig::builder().retry_backoff_ms(10).build().unwrap();
        let attempts = AtomicU32::new(0);
        let out = call_with_retries("test", &config, 3, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CallError::Provider("503".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_error() {
        let config = PipelineConfig::builder().retry_backoff_ms(10).build().unwrap();
        let attempts = AtomicU32::new(0);
        let err = call_with_retries::<(), _, _>("test", &config, 2, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CallError::MalformedResponse("nope".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CallError::MalformedResponse(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let config = PipelineConfig::builder()
            .api_timeout_secs(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        let err = call_with_retries::<(), _, _>("slow", &config, 0, || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CallError::Timeout { secs: 1 }));
    }
}
