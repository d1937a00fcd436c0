use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing_error::SpanTrace;

pub use crate::status::StatusToken;

#[derive(Error, Debug)]
pub enum CiteflowError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Fallback unavailable: {0}")]
    Fallback(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl CiteflowError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into(), SpanTrace::capture())
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            CiteflowError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_REQUEST",
            ),
            CiteflowError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            CiteflowError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            CiteflowError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            CiteflowError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            CiteflowError::Decode(m) => (
                axum::http::StatusCode::BAD_GATEWAY,
                m.clone(),
                "DECODE_ERROR",
            ),
            CiteflowError::Fallback(m) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                m.clone(),
                "FALLBACK_ERROR",
            ),
            CiteflowError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: CiteflowError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<CiteflowError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CITATIONS ---

pub type Citations = BTreeMap<String, Citation>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(
        default,
        deserialize_with = "year_from_any",
        skip_serializing_if = "Option::is_none"
    )]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drug_citation_type: Option<String>,
}

// Upstreams disagree on whether `year` is a number or a string.
fn year_from_any<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Flattened, display-ordered view of the citation map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub ref_id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
}

impl Source {
    /// Numeric ref ids sort numerically ("2" before "10"), anything else after them.
    pub fn normalize(citations: &Citations) -> Vec<Source> {
        let mut sources: Vec<Source> = citations
            .iter()
            .map(|(ref_id, c)| Source {
                ref_id: ref_id.clone(),
                title: c.title.clone(),
                url: c.url.clone(),
                year: c.year.clone(),
                source_type: c.source_type.clone(),
            })
            .collect();
        sources.sort_by(|a, b| {
            match (a.ref_id.parse::<u64>(), b.ref_id.parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => a.ref_id.cmp(&b.ref_id),
            }
        });
        sources
    }
}

/// --- WIRE TYPES ---

/// One decoded event of the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FrameData>,
    /// Some upstreams put the citation map next to `status` instead of inside `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FrameData {
    Text(String),
    Object(Map<String, Value>),
    Other(Value),
}

impl Frame {
    pub fn new(status: StatusToken) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn with_data(mut self, data: FrameData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        match &self.data {
            Some(FrameData::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// The citation map carried by this frame, wherever the upstream put it.
    pub fn citation_value(&self) -> Option<&Value> {
        let nested = self
            .data_object()
            .and_then(|m| m.get("citations"))
            .filter(|v| v.is_object());
        nested.or(self.citations.as_ref().filter(|v| v.is_object()))
    }
}

/// The fully-assembled result object carried by a `complete` frame, and the
/// JSON shape a non-streaming upstream answers with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnswerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_summary: Option<String>,
    #[serde(default)]
    pub processed_content: String,
    #[serde(default)]
    pub citations: Citations,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Request body of the answer route.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// --- ENGINE OUTPUT ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssembledResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_summary: Option<String>,
    pub processed_content: String,
    pub citations: Citations,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Set only when the stream broke mid-way or hit its deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AssembledResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Incremental notifications delivered to the caller, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status {
        status: StatusToken,
        message: Option<String>,
    },
    /// Only the new fragment, never the accumulation.
    Chunk(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_year_accepts_number_or_string() {
        let a: Citation =
            serde_json::from_str(r#"{"title":"A","url":"u","year":2021}"#).unwrap();
        let b: Citation =
            serde_json::from_str(r#"{"title":"B","url":"u","year":"2019"}"#).unwrap();
        let c: Citation = serde_json::from_str(r#"{"title":"C","url":"u","year":null}"#).unwrap();
        assert_eq!(a.year.as_deref(), Some("2021"));
        assert_eq!(b.year.as_deref(), Some("2019"));
        assert_eq!(c.year, None);
    }

    #[test]
    fn sources_are_ordered_by_numeric_ref() {
        let mut citations = Citations::new();
        for key in ["10", "2", "b", "1"] {
            citations.insert(
                key.to_string(),
                Citation {
                    title: format!("t{}", key),
                    url: format!("https://example.org/{}", key),
                    ..Default::default()
                },
            );
        }
        let order: Vec<String> = Source::normalize(&citations)
            .into_iter()
            .map(|s| s.ref_id)
            .collect();
        assert_eq!(order, vec!["1", "2", "10", "b"]);
    }

    #[test]
    fn frame_finds_citations_in_data_or_top_level() {
        let nested: Frame = serde_json::from_str(
            r#"{"status":"complete","data":{"citations":{"1":{"title":"x","url":"y"}}}}"#,
        )
        .unwrap();
        let top: Frame =
            serde_json::from_str(r#"{"citations":{"1":{"title":"x","url":"y"}}}"#).unwrap();
        let none: Frame = serde_json::from_str(r#"{"status":"chunk","data":"hi"}"#).unwrap();
        assert!(nested.citation_value().is_some());
        assert!(top.citation_value().is_some());
        assert!(none.citation_value().is_none());
    }
}
