use crate::types::{Frame, FrameData};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status vocabulary of the wire protocol. Tokens are case-sensitive; anything
/// else is kept as `Unknown` so newer upstreams never break decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusToken {
    Status,
    Connecting,
    Processing,
    Searching,
    Summarizing,
    Formatting,
    GeneratingVisual,
    Chunk,
    CompleteImage,
    Complete,
    Error,
    Unknown(String),
}

impl StatusToken {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Status => "status",
            Self::Connecting => "connecting",
            Self::Processing => "processing",
            Self::Searching => "searching",
            Self::Summarizing => "summarizing",
            Self::Formatting => "formatting response",
            Self::GeneratingVisual => "generating_visual",
            Self::Chunk => "chunk",
            Self::CompleteImage => "complete_image",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Unknown(s) => s,
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::Status
                | Self::Connecting
                | Self::Processing
                | Self::Searching
                | Self::Summarizing
                | Self::Formatting
                | Self::GeneratingVisual
        )
    }
}

impl From<String> for StatusToken {
    fn from(s: String) -> Self {
        match s.as_str() {
            "status" => Self::Status,
            "connecting" => Self::Connecting,
            "processing" => Self::Processing,
            "searching" => Self::Searching,
            "summarizing" => Self::Summarizing,
            "formatting response" | "formatting" => Self::Formatting,
            "generating_visual" => Self::GeneratingVisual,
            "chunk" => Self::Chunk,
            "complete_image" => Self::CompleteImage,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => Self::Unknown(s),
        }
    }
}

impl From<&str> for StatusToken {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<StatusToken> for String {
    fn from(token: StatusToken) -> Self {
        token.as_str().to_string()
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single frame means for the request it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Progress {
        status: StatusToken,
        message: Option<String>,
    },
    Content(String),
    Terminal,
    Failed(String),
    Ignored,
}

/// A request is done on either an explicit `complete` or any frame carrying a
/// citation map, whatever its status token says.
pub fn is_terminal(frame: &Frame) -> bool {
    frame.status == Some(StatusToken::Complete) || frame.citation_value().is_some()
}

pub fn dispatch(frame: &Frame) -> Dispatch {
    if frame.status == Some(StatusToken::Error) {
        let reason = frame
            .message
            .clone()
            .or_else(|| data_text(frame))
            .unwrap_or_else(|| "upstream reported an error".to_string());
        return Dispatch::Failed(reason);
    }

    if is_terminal(frame) {
        return Dispatch::Terminal;
    }

    let status = match &frame.status {
        Some(s) => s,
        None => {
            tracing::debug!("[STREAM] Frame without status token ignored");
            return Dispatch::Ignored;
        }
    };

    match status {
        StatusToken::Chunk => match chunk_fragment(frame) {
            Some(fragment) if !fragment.is_empty() => Dispatch::Content(fragment),
            Some(_) => Dispatch::Ignored,
            None => {
                tracing::warn!("[STREAM] chunk frame without text payload ignored");
                Dispatch::Ignored
            }
        },
        StatusToken::CompleteImage => Dispatch::Progress {
            status: status.clone(),
            message: match &frame.data {
                Some(FrameData::Text(s)) => Some(s.clone()),
                Some(data) => serde_json::to_string(data).ok(),
                None => frame.message.clone(),
            },
        },
        s if s.is_progress() => Dispatch::Progress {
            status: s.clone(),
            message: frame.message.clone().or_else(|| data_text(frame)),
        },
        StatusToken::Unknown(token) => {
            tracing::warn!("[STREAM] Unknown status token '{}' ignored", token);
            Dispatch::Ignored
        }
        _ => Dispatch::Ignored,
    }
}

fn data_text(frame: &Frame) -> Option<String> {
    match &frame.data {
        Some(FrameData::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

/// `chunk` frames carry either a bare string or `{ chunk, progress }`.
fn chunk_fragment(frame: &Frame) -> Option<String> {
    match &frame.data {
        Some(FrameData::Text(s)) => Some(s.clone()),
        Some(FrameData::Object(map)) => map
            .get("chunk")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> Frame {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn tokens_round_trip_through_wire_names() {
        for name in [
            "status",
            "chunk",
            "formatting response",
            "generating_visual",
            "complete_image",
            "complete",
            "error",
        ] {
            let token = StatusToken::from(name);
            assert!(!matches!(token, StatusToken::Unknown(_)), "{}", name);
            assert_eq!(token.as_str(), name);
        }
        assert_eq!(
            StatusToken::from("Complete"),
            StatusToken::Unknown("Complete".to_string())
        );
    }

    #[test]
    fn chunk_appends_fragment_from_string_or_object() {
        assert_eq!(
            dispatch(&frame(r#"{"status":"chunk","data":"Hello "}"#)),
            Dispatch::Content("Hello ".to_string())
        );
        assert_eq!(
            dispatch(&frame(r#"{"status":"chunk","data":{"chunk":"world ","progress":50}}"#)),
            Dispatch::Content("world ".to_string())
        );
    }

    #[test]
    fn citations_terminate_regardless_of_status() {
        let f = frame(r#"{"status":"processing","data":{"citations":{"1":{"title":"a","url":"b"}}}}"#);
        assert!(is_terminal(&f));
        assert_eq!(dispatch(&f), Dispatch::Terminal);
        assert_eq!(
            dispatch(&frame(r#"{"status":"complete","data":{}}"#)),
            Dispatch::Terminal
        );
    }

    #[test]
    fn progress_and_image_frames_are_notifications() {
        assert_eq!(
            dispatch(&frame(r#"{"status":"status","message":"Searching"}"#)),
            Dispatch::Progress {
                status: StatusToken::Status,
                message: Some("Searching".to_string())
            }
        );
        match dispatch(&frame(r#"{"status":"complete_image","data":{"url":"img.png"}}"#)) {
            Dispatch::Progress { status, message } => {
                assert_eq!(status, StatusToken::CompleteImage);
                assert_eq!(message.as_deref(), Some(r#"{"url":"img.png"}"#));
            }
            other => panic!("Expected progress, got {:?}", other),
        }
    }

    #[test]
    fn unknown_status_is_ignored_and_error_fails() {
        assert_eq!(
            dispatch(&frame(r#"{"status":"thinking_harder"}"#)),
            Dispatch::Ignored
        );
        assert_eq!(
            dispatch(&frame(r#"{"status":"error","message":"backend down"}"#)),
            Dispatch::Failed("backend down".to_string())
        );
    }
}
