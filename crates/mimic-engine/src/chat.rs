use anyhow::{Context, Result};
use mimic_contracts::chat::{Content, Message, Role};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use std::time::Duration;

use crate::{non_empty_env, response_json_or_error, ChatBackend};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const MAX_COMPLETION_TOKENS: u64 = 12_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Blocking chat-completion client. Built once per run and passed by
/// reference into every call site; there is no process-wide client state.
pub struct ChatClient {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl ChatClient {
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = non_empty_env("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;
        let api_base = non_empty_env("OPENAI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build chat HTTP client")?;
        Ok(Self {
            api_base,
            api_key,
            model: model.into(),
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl ChatBackend for ChatClient {
    fn complete(&self, messages: &[Message]) -> Result<Message> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": MAX_COMPLETION_TOKENS,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("chat completion request failed ({endpoint})"))?;
        let parsed = response_json_or_error("chat completion", response)?;
        message_from_completion(&parsed)
    }
}

fn message_from_completion(payload: &Value) -> Result<Message> {
    let message = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("message"))
        .context("chat completion response missing choices[0].message")?;
    let role = match message.get("role").and_then(Value::as_str) {
        Some("system") => Role::System,
        Some("user") => Role::User,
        _ => Role::Assistant,
    };
    let content = match message.get("content") {
        None | Some(Value::Null) => Content::Text(String::new()),
        Some(value) => serde_json::from_value(value.clone())
            .context("chat completion content has an unsupported shape")?,
    };
    Ok(Message { role, content })
}
