use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write;

/// An operation-completion notification pushed to stream subscribers.
///
/// Immutable once built; [`Event::to_frame`] renders it with the push-stream
/// framing (`event:`, optional `id:` and `retry:`, `data:`, blank trailer line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: String,
    payload: Value,
    id: Option<String>,
    retry_hint_millis: Option<u64>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            id: None,
            retry_hint_millis: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry_hint(mut self, millis: u64) -> Self {
        self.retry_hint_millis = Some(millis);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn retry_hint_millis(&self) -> Option<u64> {
        self.retry_hint_millis
    }

    pub fn to_frame(&self) -> String {
        let mut frame = String::new();
        // Field values must stay on one line or the frame splits in two
        let _ = writeln!(frame, "event: {}", single_line(&self.event_type));
        if let Some(id) = &self.id {
            let _ = writeln!(frame, "id: {}", single_line(id));
        }
        if let Some(retry) = self.retry_hint_millis {
            let _ = writeln!(frame, "retry: {retry}");
        }
        // serde_json escapes control characters, so compact JSON is always one line
        let _ = writeln!(frame, "data: {}", self.payload);
        frame.push('\n');
        frame
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}
