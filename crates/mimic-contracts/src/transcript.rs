use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

use crate::chat::{Message, Role};

/// Number of seed messages every context starts with: the system
/// instruction and the initial design message.
pub const SEED_LEN: usize = 2;

/// How much prior conversation the model sees each round.
///
/// `FullHistory` replays the whole transcript (the model remembers its own
/// replies). `Windowed` sends only the seed prefix plus the round's
/// comparison message, so earlier attempts reach the model only through the
/// rendered screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextPolicy {
    #[default]
    FullHistory,
    Windowed,
}

/// Append-only record of the conversation. Messages are never removed or
/// reordered; round-scoped contexts are computed, not carved out of the
/// history in place.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn seeded(system: Message, initial: Message) -> Self {
        Self {
            messages: vec![system, initial],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Context to submit for the current round. Under `Windowed` this is
    /// the seed prefix plus the trailing comparison message, if one has
    /// been appended since the seed; under `FullHistory` it is everything.
    pub fn context(&self, policy: ContextPolicy) -> Vec<Message> {
        match policy {
            ContextPolicy::FullHistory => self.messages.clone(),
            ContextPolicy::Windowed => {
                let mut context: Vec<Message> =
                    self.messages.iter().take(SEED_LEN).cloned().collect();
                if let Some(last) = self.messages.get(SEED_LEN..).and_then(|tail| tail.last()) {
                    if last.role == Role::User {
                        context.push(last.clone());
                    }
                }
                context
            }
        }
    }
}

/// Per-iteration JSON dump of the transcript, named
/// `conversation_log_{iteration}_{timestamp}.json`. Colons in the
/// timestamp are replaced so the name stays filesystem-safe everywhere.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    dir: PathBuf,
}

impl ConversationLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, transcript: &Transcript, iteration: u64) -> Result<PathBuf> {
        let timestamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace(':', "-");
        let path = self
            .dir
            .join(format!("conversation_log_{iteration}_{timestamp}.json"));
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let payload = serde_json::to_string_pretty(transcript.messages())
            .context("failed to serialize conversation log")?;
        std::fs::write(&path, payload)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::chat::{comparison_message, initial_user_message, system_message, Message};

    use super::*;

    fn seeded() -> Transcript {
        Transcript::seeded(system_message(), initial_user_message("https://x/design.png"))
    }

    #[test]
    fn seed_context_is_identical_under_both_policies() {
        let transcript = seeded();
        assert_eq!(transcript.context(ContextPolicy::FullHistory).len(), 2);
        assert_eq!(transcript.context(ContextPolicy::Windowed).len(), 2);
    }

    #[test]
    fn full_history_replays_everything() {
        let mut transcript = seeded();
        transcript.push(Message::assistant("attempt one"));
        transcript.push(comparison_message("d", "s1", false));
        let context = transcript.context(ContextPolicy::FullHistory);
        assert_eq!(context.len(), 4);
        assert_eq!(context, transcript.messages().to_vec());
    }

    #[test]
    fn windowed_context_drops_prior_assistant_replies() {
        let mut transcript = seeded();
        transcript.push(Message::assistant("attempt one"));
        let comparison = comparison_message("d", "s1", false);
        transcript.push(comparison.clone());
        let context = transcript.context(ContextPolicy::Windowed);
        assert_eq!(context.len(), 3);
        assert_eq!(context[2], comparison);
    }

    #[test]
    fn windowed_context_never_ends_with_an_assistant_turn() {
        let mut transcript = seeded();
        transcript.push(comparison_message("d", "s1", false));
        transcript.push(Message::assistant("attempt two"));
        let context = transcript.context(ContextPolicy::Windowed);
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn log_name_carries_iteration_and_no_colons() {
        let temp = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(temp.path());
        let path = log.write(&seeded(), 1).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("conversation_log_1_"));
        assert!(name.ends_with(".json"));
        assert!(!name.contains(':'));
    }

    #[test]
    fn log_content_is_the_ordered_message_array() {
        let temp = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(temp.path());
        let mut transcript = seeded();
        transcript.push(Message::assistant("reply"));
        let path = log.write(&transcript, 2).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        let rows = parsed.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["role"], Value::String("system".to_string()));
        assert_eq!(rows[2]["content"], Value::String("reply".to_string()));
    }
}
