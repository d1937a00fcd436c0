use crate::config::{ProducerConfig, ServeArgs};
use crate::constants::{
    ANSWER_ROUTE, KEEP_ALIVE_INTERVAL, MAX_LINE_LENGTH, SESSION_ID_HEADER,
    UPSTREAM_RETRYABLE_STATUS_CODES,
};
use crate::decoder::FrameDecoder;
use crate::hardening::CircuitBreaker;
use crate::health;
use crate::logging::request_id_middleware;
use crate::producer::{FallbackSimulator, FrameProducer};
use crate::status::StatusToken;
use crate::types::{AnswerPayload, AnswerRequest, CiteflowError, Frame, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, Method},
    middleware,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;

type SseSender = mpsc::Sender<std::result::Result<Event, Infallible>>;

pub struct AppState {
    pub client: reqwest::Client,
    pub upstream_url: Option<String>,
    pub upstream_timeout: Duration,
    pub producer: ProducerConfig,
    pub fallback: FallbackSimulator,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub max_body_size: usize,
}

impl AppState {
    pub fn from_args(client: reqwest::Client, args: &ServeArgs) -> Self {
        let producer = args.producer_config();
        Self {
            client,
            upstream_url: args.upstream_url.clone().filter(|u| !u.trim().is_empty()),
            upstream_timeout: Duration::from_secs(args.upstream_timeout_secs),
            fallback: FallbackSimulator::new(producer.fallback_word_delay),
            producer,
            circuit_breaker: Arc::new(CircuitBreaker::new(
                args.circuit_breaker_threshold,
                Duration::from_secs(args.circuit_recovery_secs),
            )),
            max_body_size: args.max_body_size,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::HeaderName::from_static(SESSION_ID_HEADER)]);

    Router::new()
        .route(ANSWER_ROUTE, post(answer_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

#[tracing::instrument(skip_all, fields(session_id = tracing::field::Empty))]
async fn answer_handler(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<AnswerRequest>,
) -> Result<Response> {
    if request.query.trim().is_empty() {
        return Err(CiteflowError::InvalidRequest("query must not be empty".to_string()).into());
    }

    let session_id = match request.session_id.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(s) => s.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    request.session_id = Some(session_id.clone());
    tracing::Span::current().record("session_id", session_id.as_str());
    tracing::info!(
        "[🧑 -> ⚙️ ] Answer request ({} chars, mode {:?})",
        request.query.chars().count(),
        request.mode
    );

    let (tx, rx) = mpsc::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
    tokio::spawn(serve_answer(state, request, tx).instrument(tracing::Span::current()));

    let mut response = Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    Ok(response)
}

/// How an upstream attempt ended, as far as the client is concerned.
enum Delivery {
    /// The client got a full answer.
    Delivered,
    /// The client went away; nothing more to send.
    Disconnected,
    /// Frames were sent but the upstream broke off mid-stream.
    Broken(String),
    /// Nothing usable reached the client; the fallback takes over.
    Unavailable { reason: String, breaker_failure: bool },
}

async fn serve_answer(state: Arc<AppState>, request: AnswerRequest, tx: SseSender) {
    let session_id = request.session_id.clone();
    let session = session_id.as_deref();

    if !send_frame(&tx, &FrameProducer::acknowledgement(session)).await {
        return;
    }

    let reason = match state.upstream_url.as_deref() {
        None => "no upstream configured".to_string(),
        Some(url) => match state.circuit_breaker.check().await {
            Err(e) => e.inner.to_string(),
            Ok(()) => match try_upstream(&state, url, &request, &tx).await {
                Delivery::Delivered => {
                    state.circuit_breaker.record_success().await;
                    return;
                }
                Delivery::Disconnected => {
                    tracing::debug!("[⚙️  -> 🧑 ] Client disconnected");
                    return;
                }
                Delivery::Broken(reason) => {
                    tracing::warn!("[☁️  -> ⚙️ ] Upstream stream broke: {}", reason);
                    state.circuit_breaker.record_failure().await;
                    let frame = Frame::new(StatusToken::Error)
                        .with_message(reason)
                        .with_session(session);
                    send_frame(&tx, &frame).await;
                    return;
                }
                Delivery::Unavailable {
                    reason,
                    breaker_failure,
                } => {
                    if breaker_failure {
                        state.circuit_breaker.record_failure().await;
                    }
                    reason
                }
            },
        },
    };

    tracing::info!("[⚙️ ] Serving fallback answer: {}", reason);
    match state.fallback.spawn(&request, session) {
        Ok(frames) => {
            forward_frames(frames, &tx).await;
        }
        Err(e) => {
            tracing::error!("[⚙️ ] Fallback failed: {}", e.inner);
            let frame = Frame::new(StatusToken::Error)
                .with_message(e.inner.to_string())
                .with_session(session);
            send_frame(&tx, &frame).await;
        }
    }
}

/// Calls the answer backend. An event-stream reply is relayed frame by frame;
/// a JSON reply is re-chunked word by word.
async fn try_upstream(
    state: &AppState,
    url: &str,
    request: &AnswerRequest,
    tx: &SseSender,
) -> Delivery {
    tracing::debug!("[⚙️  -> ☁️ ] POST {}", url);
    let response = match state
        .client
        .post(url)
        .header(header::ACCEPT, "text/event-stream, application/json")
        .timeout(state.upstream_timeout)
        .json(request)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return Delivery::Unavailable {
                reason: format!("upstream request failed: {}", e),
                breaker_failure: true,
            }
        }
    };

    let status = response.status();
    tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
    if !status.is_success() {
        return Delivery::Unavailable {
            reason: format!("upstream answered {}", status),
            breaker_failure: UPSTREAM_RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
        };
    }

    let is_event_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        let body = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        return relay_event_stream(Box::pin(body), tx).await;
    }

    let answer = match response.json::<AnswerPayload>().await {
        Ok(a) => a,
        Err(e) => {
            return Delivery::Unavailable {
                reason: format!("upstream body was not an answer: {}", e),
                breaker_failure: true,
            }
        }
    };
    if answer.processed_content.trim().is_empty() {
        return Delivery::Unavailable {
            reason: "upstream answer was empty".to_string(),
            breaker_failure: false,
        };
    }

    let frames = match FrameProducer::answer_frames(&answer, request.session_id.as_deref()) {
        Ok(f) => f,
        Err(e) => {
            return Delivery::Unavailable {
                reason: e.inner.to_string(),
                breaker_failure: false,
            }
        }
    };
    let paced = FrameProducer::new(state.producer.real_word_delay).spawn(frames);
    if forward_frames(paced, tx).await {
        Delivery::Delivered
    } else {
        Delivery::Disconnected
    }
}

async fn relay_event_stream(body: crate::transport::ByteStream, tx: &SseSender) -> Delivery {
    let mut lines = FrameDecoder::framed(body, MAX_LINE_LENGTH);
    let mut relayed = 0usize;
    while let Some(line) = lines.next().await {
        match line {
            Ok(payload) => {
                if tx.send(Ok(relay_event(&payload))).await.is_err() {
                    return Delivery::Disconnected;
                }
                relayed += 1;
            }
            Err(e) if relayed == 0 => {
                return Delivery::Unavailable {
                    reason: format!("upstream stream failed before any frame: {}", e),
                    breaker_failure: true,
                }
            }
            Err(e) => return Delivery::Broken(e.to_string()),
        }
    }
    if relayed == 0 {
        return Delivery::Unavailable {
            reason: "upstream stream was empty".to_string(),
            breaker_failure: false,
        };
    }
    tracing::debug!("[☁️  -> 🧑 ] Relayed {} frames", relayed);
    Delivery::Delivered
}

/// SSE treats a bare `\r` as a line break, so one cannot sit inside a data
/// field. Inside JSON it can only be whitespace, so a space keeps both frames
/// and literal text intact.
fn relay_event(payload: &str) -> Event {
    if payload.contains('\r') {
        Event::default().data(payload.replace('\r', " "))
    } else {
        Event::default().data(payload)
    }
}

/// Returns false once the client has gone away.
async fn forward_frames<S>(mut frames: S, tx: &SseSender) -> bool
where
    S: Stream<Item = Frame> + Unpin,
{
    while let Some(frame) = frames.next().await {
        if !send_frame(tx, &frame).await {
            return false;
        }
    }
    true
}

async fn send_frame(tx: &SseSender, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => tx.send(Ok(Event::default().data(json))).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize frame: {}", e);
            true
        }
    }
}
