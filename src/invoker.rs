//! The LLM boundary. Every model call in the pipeline goes through the
//! `Invoker` trait as an opaque `role + prompt -> JSON` primitive, so the
//! engine never depends on a concrete provider. Implementations must honor
//! the cancellation context: a tripped token aborts the in-flight request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{InvokerConfig, RoleEndpoint};
use crate::error::InvokerError;
use crate::llm_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Main,
    Fast,
    Judge,
    Processor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Main => "main",
            Role::Fast => "fast",
            Role::Judge => "judge",
            Role::Processor => "processor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Prompt bundle: system text, optional prior messages, current user text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatPrompt {
    pub system: String,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
    pub user: String,
}

impl ChatPrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
            user: user.into(),
        }
    }
}

#[async_trait]
pub trait Invoker: Send + Sync {
    /// Run one model call. When `schema` is set the result is a parsed JSON
    /// value shaped by that schema; without a schema the raw completion text
    /// comes back as a JSON string.
    async fn invoke(
        &self,
        role: Role,
        prompt: &ChatPrompt,
        schema: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, InvokerError>;
}

/// Retry-once policy for timeouts. Cancellation propagates immediately;
/// other errors are returned to the caller for its stage fallback.
pub async fn invoke_with_retry(
    invoker: &dyn Invoker,
    role: Role,
    prompt: &ChatPrompt,
    schema: Option<&Value>,
    cancel: &CancellationToken,
) -> Result<Value, InvokerError> {
    match invoker.invoke(role, prompt, schema, cancel).await {
        Err(e) if e.is_timeout() => {
            tracing::warn!("{} call timed out; retrying once", role.as_str());
            invoker.invoke(role, prompt, schema, cancel).await
        }
        other => other,
    }
}

// ==========================================
// OpenAI-compatible HTTP invoker
// ==========================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<PromptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

pub struct HttpInvoker {
    client: reqwest::Client,
    config: InvokerConfig,
}

impl HttpInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, role: Role) -> &RoleEndpoint {
        match role {
            Role::Main => &self.config.main,
            Role::Fast => &self.config.fast,
            Role::Judge => &self.config.judge,
            Role::Processor => &self.config.processor,
        }
    }

    fn deadline(&self, role: Role) -> Duration {
        let secs = match role {
            Role::Main => self.config.timeout.main_secs,
            Role::Fast => self.config.timeout.fast_secs,
            Role::Judge => self.config.timeout.judge_secs,
            Role::Processor => self.config.timeout.processor_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    async fn request_completion(
        &self,
        role: Role,
        prompt: &ChatPrompt,
        schema: Option<&Value>,
    ) -> Result<String, InvokerError> {
        let endpoint = self.endpoint(role);
        let url = format!("{}/chat/completions", endpoint.api_url.trim_end_matches('/'));

        let mut system = prompt.system.clone();
        if let Some(schema) = schema {
            system.push_str("\n\nRespond ONLY with valid JSON matching this schema:\n");
            system.push_str(&schema.to_string());
        }

        let mut messages = Vec::with_capacity(prompt.messages.len() + 2);
        messages.push(PromptMessage {
            role: "system".to_string(),
            content: system,
        });
        messages.extend(prompt.messages.iter().cloned());
        messages.push(PromptMessage {
            role: "user".to_string(),
            content: prompt.user.clone(),
        });

        let request = ChatCompletionRequest {
            model: endpoint.model.clone(),
            messages,
            temperature: Some(endpoint.temperature),
            max_tokens: Some(endpoint.max_tokens),
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| InvokerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(InvokerError::Transport(format!(
                "{} returned {}: {}",
                role.as_str(),
                status,
                body
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| InvokerError::Parse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| InvokerError::Parse("empty choices".to_string()))
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(
        &self,
        role: Role,
        prompt: &ChatPrompt,
        schema: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, InvokerError> {
        let deadline = self.deadline(role);
        let call = self.request_completion(role, prompt, schema);

        let content = tokio::select! {
            _ = cancel.cancelled() => return Err(InvokerError::Canceled),
            result = tokio::time::timeout(deadline, call) => match result {
                Err(_) => return Err(InvokerError::Timeout { role: role.as_str() }),
                Ok(inner) => inner?,
            },
        };

        if schema.is_none() {
            return Ok(Value::String(content));
        }

        llm_json::parse_best_effort(&content)
            .ok_or_else(|| InvokerError::Parse(truncate(&content, 300)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_are_stable() {
        assert_eq!(Role::Main.as_str(), "main");
        assert_eq!(Role::Judge.as_str(), "judge");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "你好你好你好";
        let t = truncate(s, 4);
        assert!(t.starts_with('你'));
        assert!(t.ends_with('…'));
    }

    #[tokio::test]
    async fn canceled_token_short_circuits_http_invoker() {
        // Points at a port nobody listens on; the token must win the race.
        let mut config = InvokerConfig::default();
        config.fast.api_url = "http://127.0.0.1:1/v1".to_string();
        let invoker = HttpInvoker::new(config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = invoker
            .invoke(
                Role::Fast,
                &ChatPrompt::new("sys", "hi"),
                None,
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(InvokerError::Canceled)));
    }
}
