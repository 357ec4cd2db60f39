use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only `events.jsonl` writer for one refinement run. Every line is
/// a compact JSON object with `type`, `run_id`, and `ts` defaults; the
/// caller payload is merged last and may override them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: PathBuf,
    run_id: String,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(serde_json::to_string(&event)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(Value::Object(event))
    }

    /// Iteration-scoped emit; rounds are reported 1-based.
    pub fn emit_iteration(
        &self,
        event_type: &str,
        iteration: u64,
        mut payload: EventPayload,
    ) -> anyhow::Result<Value> {
        payload.insert("iteration".to_string(), Value::Number(iteration.into()));
        self.emit(event_type, payload)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_appends_one_compact_line_per_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-abc");

        writer.emit("run_started", EventPayload::new())?;
        let mut payload = EventPayload::new();
        payload.insert("html_chars".to_string(), Value::Number(42.into()));
        writer.emit("run_completed", payload)?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["type"], Value::String("run_started".to_string()));
        assert_eq!(first["run_id"], Value::String("run-abc".to_string()));
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;

        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["html_chars"], Value::Number(42.into()));
        Ok(())
    }

    #[test]
    fn emit_iteration_stamps_the_round() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-abc");
        let emitted = writer.emit_iteration("iteration_started", 3, EventPayload::new())?;
        assert_eq!(emitted["iteration"], Value::Number(3.into()));
        Ok(())
    }
}
