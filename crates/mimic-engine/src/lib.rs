use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mimic_contracts::chat::{comparison_message, initial_user_message, system_message, Message};
use mimic_contracts::events::{EventPayload, EventWriter};
use mimic_contracts::extract::{extract_html, FencedFallback};
use mimic_contracts::transcript::{ContextPolicy, ConversationLog, Transcript};
use serde_json::Value;

mod chat;
mod render;
mod upload;

pub use chat::ChatClient;
pub use render::{ChromeRenderer, Rendered};
pub use upload::ImageHost;

/// Fixed screenshot slot inside the run directory. Each round overwrites
/// it; round k+1's comparison prompt reads what round k rendered.
pub const SCREENSHOT_FILE: &str = "screenshot.png";

/// Chat-completion backend: conversation in, one assistant reply out.
pub trait ChatBackend {
    fn complete(&self, messages: &[Message]) -> Result<Message>;
}

/// Renders an HTML body to a full-page PNG at the given path.
pub trait RenderBackend {
    fn capture(&self, html_body: &str, png_path: &Path) -> Result<Rendered>;
}

/// Turns a local screenshot into a publicly dereferenceable URL.
pub trait PublishBackend {
    fn publish(&self, png_path: &Path) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub design_url: String,
    pub iterations: u64,
    pub context_policy: ContextPolicy,
    pub fenced_fallback: FencedFallback,
    pub polish_final: bool,
    pub out_dir: PathBuf,
}

/// Drives the refinement rounds: grow the transcript, ask the model,
/// extract the artifact, render it, and feed the rendering back into the
/// next round's comparison prompt. Strictly sequential; the first chat,
/// render, or publish failure aborts the whole run.
pub struct RefineEngine {
    options: RunOptions,
    events: EventWriter,
    chat: Box<dyn ChatBackend>,
    render: Box<dyn RenderBackend>,
    publish: Box<dyn PublishBackend>,
}

impl RefineEngine {
    pub fn new(
        options: RunOptions,
        events: EventWriter,
        chat: Box<dyn ChatBackend>,
        render: Box<dyn RenderBackend>,
        publish: Box<dyn PublishBackend>,
    ) -> Self {
        Self {
            options,
            events,
            chat,
            render,
            publish,
        }
    }

    /// Runs all configured rounds and returns the final round's artifact.
    /// An empty final artifact is still a completed run.
    pub fn run(&self) -> Result<String> {
        match self.run_rounds() {
            Ok(html) => {
                let mut payload = EventPayload::new();
                payload.insert(
                    "html_chars".to_string(),
                    Value::Number((html.chars().count() as u64).into()),
                );
                let _ = self.events.emit("run_completed", payload);
                Ok(html)
            }
            Err(err) => {
                let mut payload = EventPayload::new();
                payload.insert("error".to_string(), Value::String(format!("{err:#}")));
                let _ = self.events.emit("run_failed", payload);
                Err(err)
            }
        }
    }

    fn run_rounds(&self) -> Result<String> {
        self.validate()?;
        fs::create_dir_all(&self.options.out_dir)
            .with_context(|| format!("failed to create {}", self.options.out_dir.display()))?;

        let mut payload = EventPayload::new();
        payload.insert(
            "design_url".to_string(),
            Value::String(self.options.design_url.clone()),
        );
        payload.insert(
            "iterations".to_string(),
            Value::Number(self.options.iterations.into()),
        );
        let _ = self.events.emit("run_started", payload);

        let screenshot_path = self.options.out_dir.join(SCREENSHOT_FILE);
        let log = ConversationLog::new(&self.options.out_dir);
        let mut transcript = Transcript::seeded(
            system_message(),
            initial_user_message(&self.options.design_url),
        );
        let mut html = String::new();

        for index in 0..self.options.iterations {
            let round = index + 1;
            let _ = self
                .events
                .emit_iteration("iteration_started", round, EventPayload::new());

            if index > 0 {
                let screenshot_url = self.publish.publish(&screenshot_path).with_context(|| {
                    format!("iteration {round}: publishing the previous screenshot failed")
                })?;
                let mut payload = EventPayload::new();
                payload.insert("url".to_string(), Value::String(screenshot_url.clone()));
                let _ = self
                    .events
                    .emit_iteration("screenshot_published", round, payload);

                let polish = self.options.polish_final && round == self.options.iterations;
                transcript.push(comparison_message(
                    &self.options.design_url,
                    &screenshot_url,
                    polish,
                ));
            }

            let context = transcript.context(self.options.context_policy);
            let reply = self
                .chat
                .complete(&context)
                .with_context(|| format!("iteration {round}: chat completion failed"))?;
            transcript.push(reply.clone());

            html = extract_html(&reply.content, self.options.fenced_fallback);
            let mut payload = EventPayload::new();
            payload.insert(
                "html_chars".to_string(),
                Value::Number((html.chars().count() as u64).into()),
            );
            let _ = self
                .events
                .emit_iteration("assistant_replied", round, payload);

            let rendered = self
                .render
                .capture(&html, &screenshot_path)
                .with_context(|| format!("iteration {round}: screenshot capture failed"))?;
            let mut payload = EventPayload::new();
            payload.insert("width".to_string(), Value::Number(rendered.width.into()));
            payload.insert("height".to_string(), Value::Number(rendered.height.into()));
            payload.insert(
                "path".to_string(),
                Value::String(screenshot_path.display().to_string()),
            );
            let _ = self
                .events
                .emit_iteration("screenshot_captured", round, payload);

            // Advisory: a failed transcript dump never aborts the run.
            if let Err(err) = log.write(&transcript, round) {
                let mut payload = EventPayload::new();
                payload.insert("error".to_string(), Value::String(format!("{err:#}")));
                let _ = self
                    .events
                    .emit_iteration("conversation_log_failed", round, payload);
            }
        }

        Ok(html)
    }

    fn validate(&self) -> Result<()> {
        if self.options.design_url.trim().is_empty() {
            bail!("a design image URL is required");
        }
        if self.options.iterations == 0 {
            bail!("iteration count must be a positive integer");
        }
        Ok(())
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn response_json_or_error(
    service: &str,
    response: reqwest::blocking::Response,
) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{service} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
