use crate::constants::MAX_PENDING_BYTES;
use crate::types::*;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Late citation payload for the assistant message already on screen.
    CitationUpdate(Option<CitationMetadata>),
    MessageDelta(Message),
    History(HistoryMetadata),
    /// The backend reported an error in-band.
    Failure(String),
}

/// Accumulates fragments until they form whole JSON objects.
#[derive(Debug, Default)]
pub struct FragmentMerger {
    pending: String,
}

impl FragmentMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Appends `fragment` and classifies every object that is now complete.
    /// An incomplete tail stays pending and yields no events.
    pub fn push(&mut self, fragment: &str) -> Result<Vec<StreamEvent>> {
        self.pending.push_str(fragment);
        if self.pending.len() > MAX_PENDING_BYTES {
            let size = self.pending.len();
            self.pending.clear();
            tracing::error!(
                "[☁️  -> ⚙️ ] Incomplete JSON grew to {} bytes; giving up",
                size
            );
            return Err(CitelineError::MalformedStream(format!(
                "incomplete JSON exceeds {} bytes",
                MAX_PENDING_BYTES
            ))
            .into());
        }

        let (values, consumed, malformed) = {
            let mut iter = serde_json::Deserializer::from_str(&self.pending).into_iter::<Value>();
            let mut values = Vec::new();
            let mut malformed = None;
            let mut exhausted = false;
            loop {
                match iter.next() {
                    Some(Ok(value)) => values.push(value),
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        malformed = Some(e);
                        break;
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            let consumed = if exhausted {
                self.pending.len()
            } else {
                iter.byte_offset()
            };
            (values, consumed, malformed)
        };

        if let Some(e) = malformed {
            let snippet = crate::str_utils::snippet(&self.pending, 200).into_owned();
            self.pending.clear();
            tracing::error!("[☁️  -> ⚙️ ] Unparseable stream payload: {} ({})", e, snippet);
            return Err(CitelineError::MalformedStream(format!("{}: {}", e, snippet)).into());
        }

        self.pending.drain(..consumed);
        if !self.pending.is_empty() {
            tracing::trace!(
                "[☁️  -> ⚙️ ] Holding {} chars of incomplete JSON",
                self.pending.len()
            );
        }

        let mut events = Vec::new();
        for value in values {
            events.extend(classify(value)?);
        }
        Ok(events)
    }
}

/// Turns one complete stream object into events.
pub fn classify(value: Value) -> Result<Vec<StreamEvent>> {
    let object = match value {
        Value::Object(map) => map,
        other => {
            return Err(CitelineError::MalformedStream(format!(
                "expected a JSON object, got {}",
                crate::str_utils::snippet(&other.to_string(), 200)
            ))
            .into())
        }
    };

    // keep-alive split across fragments
    if object.is_empty() {
        return Ok(Vec::new());
    }

    if object.get("citation_update").and_then(Value::as_bool) == Some(true) {
        let metadata = match object.get("citation_metadata") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(CitationMetadata::deserialize(raw)?),
        };
        tracing::debug!(
            "[☁️  -> ⚙️ ] Citation update ({} citations)",
            match &metadata {
                Some(m) => m.citations().len(),
                None => 0,
            }
        );
        return Ok(vec![StreamEvent::CitationUpdate(metadata)]);
    }

    if let Some(message) = object.get("error").and_then(error_text) {
        tracing::warn!("[☁️  -> ⚙️ ] In-band error: {}", message);
        return Ok(vec![StreamEvent::Failure(message)]);
    }

    let payload: ResponsePayload = serde_json::from_value(Value::Object(object))?;
    let messages = match payload.choices.into_iter().next() {
        Some(choice) => choice.messages,
        None => Vec::new(),
    };
    match messages.first() {
        Some(first) if !first.content.is_empty() => {}
        _ => return Err(CitelineError::ContentMissing.into()),
    }

    let mut events = Vec::with_capacity(messages.len() + 1);
    if let Some(history) = payload.history_metadata {
        events.push(StreamEvent::History(history));
    }

    let stamp = chrono::Utc::now().timestamp_millis();
    for (index, mut message) in messages.into_iter().enumerate() {
        message.id = format!("{}-{}-{}-{}", payload.id, message.role, index, stamp);
        message.date = now_iso();
        events.push(StreamEvent::MessageDelta(message));
    }
    Ok(events)
}

/// `"error": "text"` or `"error": {"message": "text"}`.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(m) => Some(m.to_string()),
            None => Some(value.to_string()),
        },
        other => Some(other.to_string()),
    }
}
