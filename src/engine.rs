use crate::assembler::{Applied, ResponseAssembler};
use crate::config::EngineConfig;
use crate::decoder::{FrameDecoder, FrameLines};
use crate::producer::{into_byte_stream, FallbackSimulator, FrameProducer};
use crate::transport::{Transport, TransportResponse};
use crate::types::{AnswerRequest, AssembledResponse, CiteflowError, Result, StreamEvent};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::Instrument;

/// Handle to one in-flight request: ordered incremental events, then exactly
/// one final result.
pub struct AnswerStream {
    events: mpsc::Receiver<StreamEvent>,
    completion: oneshot::Receiver<AssembledResponse>,
}

impl AnswerStream {
    /// Next status or chunk notification; `None` once the request is over.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn split(
        self,
    ) -> (
        mpsc::Receiver<StreamEvent>,
        oneshot::Receiver<AssembledResponse>,
    ) {
        (self.events, self.completion)
    }

    /// Waits for the final result, discarding incremental events.
    pub async fn completion(self) -> Result<AssembledResponse> {
        drop(self.events);
        self.completion
            .await
            .map_err(|_| CiteflowError::internal("stream task ended without a result").into())
    }

    /// Drains every event, then returns them with the final result.
    pub async fn collect(mut self) -> Result<(Vec<StreamEvent>, AssembledResponse)> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let response = self.completion().await?;
        Ok((events, response))
    }
}

/// Turns a backend's incremental frames into one assembled answer per request.
pub struct AnswerEngine {
    transport: Arc<dyn Transport>,
    fallback: FallbackSimulator,
    config: EngineConfig,
}

impl AnswerEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        fallback: FallbackSimulator,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            fallback,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn ask(&self, request: AnswerRequest) -> Result<AnswerStream> {
        self.ask_with_deadline(request, self.config.request_deadline)
            .await
    }

    /// Opens the stream and starts its read loop. Transport failures switch to
    /// the fallback simulator; `Err` means the fallback itself could not run.
    pub async fn ask_with_deadline(
        &self,
        request: AnswerRequest,
        deadline: Duration,
    ) -> Result<AnswerStream> {
        let started = Instant::now();
        let caller_session = request.session_id.clone();

        let (opened, read_deadline, path) = match self.transport.open(&request, deadline).await {
            Ok(opened) => (opened, started + deadline, "upstream"),
            Err(e) => {
                tracing::warn!(
                    "[ENGINE] Transport failed, switching to fallback: {}",
                    e.inner
                );
                let opened = self.open_fallback(&request, caller_session.as_deref())?;
                (
                    opened,
                    Instant::now() + self.config.fallback_deadline,
                    "fallback",
                )
            }
        };

        let mut assembler = ResponseAssembler::new(caller_session);
        assembler.set_header_session(opened.session_id);
        let lines = FrameDecoder::framed(opened.body, self.config.max_line_length);

        let (tx_events, rx_events) = mpsc::channel(self.config.event_buffer);
        let (tx_done, rx_done) = oneshot::channel();

        let stream_span = tracing::info_span!(
            "stream",
            stream_id = %uuid::Uuid::new_v4(),
            path = path,
            query_chars = request.query.chars().count()
        );
        tokio::spawn(
            run_stream(lines, assembler, read_deadline, tx_events, tx_done).instrument(stream_span),
        );

        Ok(AnswerStream {
            events: rx_events,
            completion: rx_done,
        })
    }

    fn open_fallback(
        &self,
        request: &AnswerRequest,
        session_id: Option<&str>,
    ) -> Result<TransportResponse> {
        let mut frames = vec![FrameProducer::acknowledgement(session_id)];
        frames.extend(self.fallback.frames(request, session_id)?);
        let paced = self.fallback.producer().spawn(frames);
        Ok(TransportResponse::new(into_byte_stream(paced)))
    }
}

/// The per-request read loop. The only awaits are the next line and the
/// caller's event channel, both bounded by the deadline.
///
/// The first terminal frame ends event delivery, but the body is still read to
/// its end so that later terminal frames can add their citations. The result
/// then depends only on the bytes received, never on how reads were split.
async fn run_stream(
    mut lines: FrameLines,
    mut assembler: ResponseAssembler,
    deadline: Instant,
    events: mpsc::Sender<StreamEvent>,
    done: oneshot::Sender<AssembledResponse>,
) {
    let mut events = Some(events);

    let result = loop {
        let next = match timeout_at(deadline, lines.next()).await {
            Ok(next) => next,
            Err(_) => break assembler.fail("deadline exceeded while waiting for the stream"),
        };

        let payload = match next {
            None => break assembler.finish(),
            Some(Err(e)) => break assembler.fail(format!("stream read failed: {}", e)),
            Some(Ok(payload)) => payload,
        };

        match assembler.apply_line(&payload) {
            Applied::Event(event) => {
                let Some(tx) = events.as_ref() else {
                    continue;
                };
                let sent = timeout_at(deadline, tx.send(event)).await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        tracing::trace!("Caller stopped listening to events; still assembling");
                        events = None;
                    }
                    Err(_) => break assembler.fail("deadline exceeded while delivering events"),
                }
            }
            Applied::Terminal => {
                tracing::debug!("[ENGINE] Terminal frame received; reading the rest for citations");
                events = None;
            }
            Applied::Failed(reason) => break assembler.fail(reason),
            Applied::Nothing => {}
        }
    };

    // Close the event channel first so callers observe every event before the result.
    drop(events);
    if let Some(response) = result {
        if done.send(response).is_err() {
            tracing::trace!("Caller dropped the stream before completion");
        }
    }
}
