use crate::types::{Citation, Citations, Frame};
use serde_json::{Map, Value};

const LOG_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Frame(Frame),
    /// The payload was not a structured frame; its raw text is content.
    Literal(String),
}

pub fn parse_payload(data: &str) -> LineEvent {
    match serde_json::from_str::<Frame>(data) {
        Ok(frame) => LineEvent::Frame(frame),
        Err(e) => {
            tracing::debug!(
                "[STREAM] Payload is not a frame ({}), treating as literal text: {}",
                e,
                snippet(data)
            );
            LineEvent::Literal(data.to_string())
        }
    }
}

/// Reads a citation map entry by entry, skipping entries that are not citations
/// instead of rejecting the whole map.
pub fn parse_citations(value: &Value) -> Citations {
    let mut citations = Citations::new();
    let Some(map) = value.as_object() else {
        return citations;
    };
    for (ref_id, raw) in map {
        match serde_json::from_value::<Citation>(raw.clone()) {
            Ok(c) => {
                citations.insert(ref_id.clone(), c);
            }
            Err(e) => {
                tracing::warn!("[STREAM] Skipping malformed citation '{}': {}", ref_id, e);
            }
        }
    }
    citations
}

/// Fields a terminal frame's result object may carry. Read leniently: a bad
/// field never costs the rest of the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalParts {
    pub short_summary: Option<String>,
    pub processed_content: Option<String>,
    pub session_id: Option<String>,
    pub citations: Citations,
}

impl TerminalParts {
    pub fn from_frame(frame: &Frame) -> Self {
        let object = frame.data_object();
        let text = |m: Option<&Map<String, Value>>, key: &str| {
            m.and_then(|m| m.get(key))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            short_summary: text(object, "short_summary"),
            processed_content: text(object, "processed_content"),
            session_id: frame
                .session_id
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| text(object, "session_id")),
            citations: frame
                .citation_value()
                .map(parse_citations)
                .unwrap_or_default(),
        }
    }
}

pub fn snippet(s: &str) -> std::borrow::Cow<'_, str> {
    match s.char_indices().nth(LOG_SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}...", &s[..idx]).into(),
        None => s.into(),
    }
}
