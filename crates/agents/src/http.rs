//! Model-provider executor speaking the OpenAI-compatible chat completions API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use agentops_access::AgentInstance;

use crate::executor::AgentExecutor;
use crate::job::AgentJob;
use crate::result::{ExecutionResult, ExecutorError, StepKind, StepTrace, Usage};

#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    /// Base URL up to, not including, `/chat/completions`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub prompt_price_per_1k: f64,
    pub completion_price_per_1k: f64,
}

impl HttpModelConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout: Duration::from_secs(60),
            prompt_price_per_1k: 0.0,
            completion_price_per_1k: 0.0,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prices(mut self, prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        self.prompt_price_per_1k = prompt_per_1k;
        self.completion_price_per_1k = completion_per_1k;
        self
    }

    fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_price_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_price_per_1k
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Production execution strategy backed by a chat completion endpoint.
///
/// Provider errors are domain failures: 429 and 5xx are `model_unavailable`
/// (retriable), other 4xx are `model_request_rejected`. Transport problems
/// and the request timeout surface as `ExecutorError`.
#[derive(Debug, Clone)]
pub struct HttpModelExecutor {
    config: HttpModelConfig,
    client: Client,
}

impl HttpModelExecutor {
    pub fn new(config: HttpModelConfig) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExecutorError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpModelConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_messages(job: &AgentJob, agent: &AgentInstance) -> Vec<ChatMessage> {
        let mut system = format!("You are a '{}' agent.", agent.agent_type);
        if let Some(tone) = &agent.config.tone {
            system.push_str(&format!(" Respond in a {tone} tone."));
        }
        if !agent.config.data_scopes.is_empty() {
            system.push_str(&format!(
                " You may only use these data scopes: {}.",
                agent.config.data_scopes.join(", ")
            ));
        }
        let denied = agent.guardrails.denied_actions();
        if !denied.is_empty() {
            system.push_str(&format!(" You must not: {}.", denied.join(", ")));
        }
        if !agent.guardrails.require_approval_for.is_empty() {
            system.push_str(&format!(
                " These actions need human approval: {}.",
                agent.guardrails.require_approval_for.join(", ")
            ));
        }

        let user = json!({ "job_type": job.job_type, "payload": job.payload }).to_string();

        vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ]
    }

    fn transport_error(&self, err: reqwest::Error) -> ExecutorError {
        if err.is_timeout() {
            ExecutorError::Timeout(self.config.timeout.as_millis() as u64)
        } else {
            ExecutorError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl AgentExecutor for HttpModelExecutor {
    async fn execute(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        let messages = Self::build_messages(job, agent);
        let mut trace = StepTrace::new();
        trace.push(
            StepKind::Thought,
            "prompt",
            json!({ "messages": messages.len(), "job_type": job.job_type }),
        );

        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: agent.config.temperature,
            max_tokens: agent.config.max_tokens,
        };
        trace.push(
            StepKind::ToolCall,
            "chat_completion",
            json!({ "model": self.config.model }),
        );

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let res = builder.send().await.map_err(|e| self.transport_error(e))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            debug!(%status, body = %body, "model provider returned an error");
            let retriable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            let code = if retriable {
                "model_unavailable"
            } else {
                "model_request_rejected"
            };
            trace.push(StepKind::ToolResult, "chat_completion", json!({ "status": status.as_u16() }));
            return Ok(ExecutionResult::failed(
                code,
                format!("model provider returned {status}"),
                retriable,
            )
            .with_steps(trace));
        }

        let bytes = res.bytes().await.map_err(|e| self.transport_error(e))?;
        let parsed: ChatResponse = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(ExecutionResult::failed(
                    "model_response_invalid",
                    format!("unparseable model response: {e}"),
                    false,
                )
                .with_steps(trace));
            }
        };

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(ExecutionResult::failed(
                "model_response_invalid",
                "model response contained no choices",
                false,
            )
            .with_steps(trace));
        };

        trace.push(
            StepKind::ToolResult,
            "chat_completion",
            json!({ "status": status.as_u16(), "finish_reason": choice.finish_reason }),
        );

        let content = choice.message.content.unwrap_or_default();
        // Structured replies are kept as JSON; anything else is stored as text.
        let output = serde_json::from_str::<JsonValue>(&content)
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or(JsonValue::String(content));
        trace.push(StepKind::Output, "reply", output.clone());

        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        let usage = Usage::new(
            prompt_tokens,
            completion_tokens,
            self.config.cost(prompt_tokens, completion_tokens),
        );

        Ok(ExecutionResult::succeeded(Some(output), usage).with_steps(trace))
    }
}
