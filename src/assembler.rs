use crate::logging::StreamMetric;
use crate::parser::{parse_payload, LineEvent, TerminalParts};
use crate::status::{dispatch, Dispatch};
use crate::types::{AssembledResponse, Citations, Frame, Source, StreamEvent};

/// Mutable per-request accumulator. Owned by exactly one assembler; the
/// partial-line buffer lives in the `FrameDecoder` feeding it.
#[derive(Debug, Default, Clone)]
pub struct StreamState {
    pub accumulated_content: String,
    pub citations: Citations,
    /// Session id carried by the terminal frame(s).
    pub session_id: Option<String>,
    pub short_summary: Option<String>,
    /// A terminal frame has arrived.
    pub completed: bool,
}

/// One-shot latch around delivery of the final result.
#[derive(Debug, Default)]
pub struct CompletionGuard {
    fired: bool,
}

impl CompletionGuard {
    /// True exactly once.
    pub fn claim(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Result of applying one decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Forward to the caller.
    Event(StreamEvent),
    /// First terminal frame; the caller should stop listening and `finish`.
    Terminal,
    /// The upstream reported an error.
    Failed(String),
    Nothing,
}

pub struct ResponseAssembler {
    state: StreamState,
    guard: CompletionGuard,
    caller_session_id: Option<String>,
    header_session_id: Option<String>,
    metric: StreamMetric,
}

impl ResponseAssembler {
    pub fn new(caller_session_id: Option<String>) -> Self {
        Self {
            state: StreamState::default(),
            guard: CompletionGuard::default(),
            caller_session_id,
            header_session_id: None,
            metric: StreamMetric::new(),
        }
    }

    pub fn set_header_session(&mut self, session_id: Option<String>) {
        self.header_session_id = session_id.filter(|s| !s.is_empty());
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.guard.has_fired()
    }

    /// Applies one `data: ` payload in arrival order.
    pub fn apply_line(&mut self, payload: &str) -> Applied {
        if self.guard.has_fired() {
            tracing::trace!("[ASSEMBLER] Line after completion ignored");
            return Applied::Nothing;
        }
        self.metric.record_frame();
        match parse_payload(payload) {
            LineEvent::Literal(text) => {
                if self.state.completed {
                    self.metric.record_ignored();
                    return Applied::Nothing;
                }
                self.metric.record_literal(&text);
                self.state.accumulated_content.push_str(&text);
                Applied::Event(StreamEvent::Chunk(text))
            }
            LineEvent::Frame(frame) => self.apply_frame(&frame),
        }
    }

    pub fn apply_frame(&mut self, frame: &Frame) -> Applied {
        if self.guard.has_fired() {
            return Applied::Nothing;
        }
        match dispatch(frame) {
            Dispatch::Terminal => {
                if self.absorb_terminal(frame) {
                    Applied::Terminal
                } else {
                    Applied::Nothing
                }
            }
            // Content and progress are frozen once a terminal frame is in.
            _ if self.state.completed => {
                self.metric.record_ignored();
                Applied::Nothing
            }
            Dispatch::Content(fragment) => {
                self.metric.record_chunk(&fragment);
                self.state.accumulated_content.push_str(&fragment);
                Applied::Event(StreamEvent::Chunk(fragment))
            }
            Dispatch::Progress { status, message } => {
                Applied::Event(StreamEvent::Status { status, message })
            }
            Dispatch::Failed(reason) => Applied::Failed(reason),
            Dispatch::Ignored => {
                self.metric.record_ignored();
                Applied::Nothing
            }
        }
    }

    /// Merges a terminal frame into the state. Returns true for the first one.
    fn absorb_terminal(&mut self, frame: &Frame) -> bool {
        let parts = TerminalParts::from_frame(frame);
        self.merge_citations(parts.citations);
        self.metric.record_terminal(self.state.citations.len());

        let first = !self.state.completed;
        if first {
            self.state.completed = true;
            self.state.session_id = parts.session_id;
            self.state.short_summary = parts.short_summary;
            // A `complete` that carries the whole text stands in for missing chunks.
            if self.state.accumulated_content.is_empty() {
                if let Some(content) = parts.processed_content {
                    self.state.accumulated_content = content;
                }
            }
        } else {
            if self.state.session_id.is_none() {
                self.state.session_id = parts.session_id;
            }
            if self.state.short_summary.is_none() {
                self.state.short_summary = parts.short_summary;
            }
        }
        first
    }

    fn merge_citations(&mut self, incoming: Citations) {
        for (ref_id, citation) in incoming {
            if let Some(existing) = self.state.citations.get(&ref_id) {
                if existing != &citation {
                    tracing::warn!(
                        "[ASSEMBLER] Citation '{}' redefined ('{}' -> '{}'); keeping the later one",
                        ref_id,
                        existing.title,
                        citation.title
                    );
                }
            }
            self.state.citations.insert(ref_id, citation);
        }
    }

    /// Delivers the result once. With no terminal frame seen, the result is
    /// synthesized from whatever content accumulated.
    pub fn finish(&mut self) -> Option<AssembledResponse> {
        if !self.guard.claim() {
            return None;
        }
        if !self.state.completed {
            tracing::debug!(
                "[ASSEMBLER] Stream ended without a terminal frame; synthesizing result ({} bytes)",
                self.state.accumulated_content.len()
            );
        }
        self.metric.log_summary("complete");
        Some(self.build(None))
    }

    /// Delivers an errored result carrying the partial content. Once a terminal
    /// frame is in, the result is already settled and delivered as a success.
    pub fn fail(&mut self, reason: impl Into<String>) -> Option<AssembledResponse> {
        let reason = reason.into();
        if self.state.completed {
            tracing::warn!(
                "[ASSEMBLER] Error after terminal frame ignored: {}",
                reason
            );
            return self.finish();
        }
        if !self.guard.claim() {
            return None;
        }
        tracing::error!("[ASSEMBLER] Stream failed: {}", reason);
        self.metric.log_summary("error");
        Some(self.build(Some(reason)))
    }

    fn resolve_session_id(&self) -> Option<String> {
        self.state
            .session_id
            .clone()
            .or_else(|| self.caller_session_id.clone())
            .or_else(|| self.header_session_id.clone())
    }

    fn build(&self, error: Option<String>) -> AssembledResponse {
        AssembledResponse {
            short_summary: self.state.short_summary.clone(),
            processed_content: self.state.accumulated_content.clone(),
            citations: self.state.citations.clone(),
            sources: Source::normalize(&self.state.citations),
            session_id: self.resolve_session_id(),
            error,
        }
    }
}
