use crate::constants::REQUEST_ID_HEADER;
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::any::Any;
use std::panic;
use tracing::{error, info, info_span, Instrument};
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Routes panics through tracing before the default hook runs. A panic inside
/// a request or stream task carries that task's spans, so the log line names
/// the request id and stream id it happened under.
pub fn setup_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let thread = std::thread::current();

        error!(
            reason = %panic_reason(info.payload()),
            location = %location,
            thread = thread.name().unwrap_or("unnamed"),
            spans = %SpanTrace::capture(),
            "Task panicked"
        );

        default_hook(info);
    }));
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Reuses the caller's `x-request-id` when present, otherwise mints one, and
/// runs the request inside a span carrying it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = header.clone() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-request counters, logged once when the request completes.
#[derive(Debug, Default, Clone)]
pub struct StreamMetric {
    pub frames: usize,
    pub chunks: usize,
    pub content_bytes: usize,
    pub literals: usize,
    pub ignored: usize,
    pub terminal_frames: usize,
    pub citations: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn record_chunk(&mut self, fragment: &str) {
        self.chunks += 1;
        self.content_bytes += fragment.len();
    }

    pub fn record_literal(&mut self, text: &str) {
        self.literals += 1;
        self.content_bytes += text.len();
    }

    pub fn record_ignored(&mut self) {
        self.ignored += 1;
    }

    pub fn record_terminal(&mut self, citations_total: usize) {
        self.terminal_frames += 1;
        self.citations = citations_total;
    }

    pub fn log_summary(&self, outcome: &str) {
        info!(
            "[STREAM END] Outcome: {} | Frames: {} | Chunks: {} | Literal: {} | Ignored: {} | Terminal: {} | Citations: {} | Content: {} bytes",
            outcome,
            self.frames,
            self.chunks,
            self.literals,
            self.ignored,
            self.terminal_frames,
            self.citations,
            self.content_bytes
        );
    }
}
