use crate::constants::{DATA_PREFIX, EVENT_CHANNEL_CAPACITY, FALLBACK_ANSWER_TEXT, FALLBACK_SHORT_SUMMARY};
use crate::status::StatusToken;
use crate::transport::ByteStream;
use crate::types::{
    AnswerPayload, AnswerRequest, Citation, Citations, CiteflowError, Frame, FrameData, Result,
    Source,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Splits text into words, each keeping the whitespace that follows it, so the
/// tokens concatenate back to the input byte for byte. Leading whitespace rides
/// on the first word.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space = true;
    let mut seen_word = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_space = true;
            continue;
        }
        if in_space && seen_word {
            tokens.push(&text[start..i]);
            start = i;
        }
        in_space = false;
        seen_word = true;
    }
    if seen_word {
        tokens.push(&text[start..]);
    }
    tokens
}

/// Serializes one frame the way the decoder expects it: a `data: ` line
/// followed by a blank line.
pub fn encode_frame(frame: &Frame) -> serde_json::Result<String> {
    Ok(format!("{}{}\n\n", DATA_PREFIX, serde_json::to_string(frame)?))
}

/// Wire bytes for a frame stream, for feeding produced frames straight back
/// into a decoder.
pub fn into_byte_stream<S>(frames: S) -> ByteStream
where
    S: Stream<Item = Frame> + Send + 'static,
{
    Box::pin(frames.map(|frame| {
        encode_frame(&frame)
            .map(Bytes::from)
            .map_err(std::io::Error::other)
    }))
}

/// Turns a fully generated answer into paced frames.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    word_delay: Duration,
}

impl FrameProducer {
    pub fn new(word_delay: Duration) -> Self {
        Self { word_delay }
    }

    pub fn word_delay(&self) -> Duration {
        self.word_delay
    }

    /// The first frame of every response.
    pub fn acknowledgement(session_id: Option<&str>) -> Frame {
        Frame::new(StatusToken::Status)
            .with_message("Connecting")
            .with_session(session_id)
    }

    pub fn chunk_frames(text: &str) -> Vec<Frame> {
        let tokens = tokenize(text);
        let total = tokens.len();
        tokens
            .into_iter()
            .enumerate()
            .map(|(i, word)| {
                let progress = ((i + 1) as f64 / total as f64 * 100.0).round() as u32;
                let mut data = serde_json::Map::new();
                data.insert("chunk".to_string(), Value::String(word.to_string()));
                data.insert("progress".to_string(), json!(progress));
                Frame::new(StatusToken::Chunk).with_data(FrameData::Object(data))
            })
            .collect()
    }

    /// The single `complete` frame: full text, citation map and the normalized
    /// source list.
    pub fn terminal_frame(answer: &AnswerPayload, session_id: Option<&str>) -> Result<Frame> {
        let mut payload = answer.clone();
        payload.sources = Source::normalize(&payload.citations);
        if payload.session_id.is_none() {
            payload.session_id = session_id.map(str::to_string);
        }
        let data = match serde_json::to_value(&payload)? {
            Value::Object(map) => map,
            other => {
                return Err(CiteflowError::internal(format!(
                    "answer payload serialized to a non-object: {}",
                    other
                ))
                .into())
            }
        };
        Ok(Frame::new(StatusToken::Complete)
            .with_session(payload.session_id.as_deref())
            .with_data(FrameData::Object(data)))
    }

    /// Chunk frames for every word, then the terminal frame.
    pub fn answer_frames(answer: &AnswerPayload, session_id: Option<&str>) -> Result<Vec<Frame>> {
        let mut frames = Self::chunk_frames(&answer.processed_content);
        frames.push(Self::terminal_frame(answer, session_id)?);
        Ok(frames)
    }

    /// Emits frames on a background task, sleeping `word_delay` before each
    /// chunk. Stops early once the receiver is dropped.
    pub fn spawn(&self, frames: Vec<Frame>) -> ReceiverStream<Frame> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let delay = self.word_delay;
        tokio::spawn(async move {
            for frame in frames {
                if frame.status == Some(StatusToken::Chunk) && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(frame).await.is_err() {
                    tracing::trace!("[PRODUCER] Receiver dropped, stopping emission");
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

/// Manufactures a plausible answer when the upstream is unreachable or has
/// nothing usable. Its frames are schema-identical to a real answer's.
#[derive(Debug, Clone)]
pub struct FallbackSimulator {
    answer: AnswerPayload,
    producer: FrameProducer,
}

impl FallbackSimulator {
    pub fn new(word_delay: Duration) -> Self {
        Self::with_answer(Self::canned_answer(), word_delay)
    }

    pub fn with_answer(answer: AnswerPayload, word_delay: Duration) -> Self {
        Self {
            answer,
            producer: FrameProducer::new(word_delay),
        }
    }

    pub fn canned_answer() -> AnswerPayload {
        let mut citations = Citations::new();
        citations.insert(
            "1".to_string(),
            Citation {
                title: "Cochrane Database of Systematic Reviews".to_string(),
                url: "https://www.cochranelibrary.com/cdsr/reviews".to_string(),
                source_type: Some("systematic_review".to_string()),
                journal: Some("Cochrane Library".to_string()),
                ..Default::default()
            },
        );
        citations.insert(
            "2".to_string(),
            Citation {
                title: "DailyMed Prescribing Information".to_string(),
                url: "https://dailymed.nlm.nih.gov/dailymed/".to_string(),
                source_type: Some("drug_label".to_string()),
                drug_citation_type: Some("label".to_string()),
                ..Default::default()
            },
        );
        AnswerPayload {
            short_summary: Some(FALLBACK_SHORT_SUMMARY.to_string()),
            processed_content: FALLBACK_ANSWER_TEXT.to_string(),
            citations,
            sources: Vec::new(),
            session_id: None,
        }
    }

    pub fn answer(&self) -> &AnswerPayload {
        &self.answer
    }

    pub fn producer(&self) -> &FrameProducer {
        &self.producer
    }

    /// Progress frames, one chunk per word, and one terminal frame. Fails only
    /// when there is no answer text to simulate.
    pub fn frames(&self, request: &AnswerRequest, session_id: Option<&str>) -> Result<Vec<Frame>> {
        if tokenize(&self.answer.processed_content).is_empty() {
            return Err(CiteflowError::Fallback("fallback answer has no text".to_string()).into());
        }
        tracing::debug!(
            "[FALLBACK] Simulating answer for query of {} chars",
            request.query.chars().count()
        );
        let mut frames = vec![
            Frame::new(StatusToken::Status)
                .with_message("Searching the literature")
                .with_session(session_id),
            Frame::new(StatusToken::Formatting).with_session(session_id),
        ];
        frames.extend(FrameProducer::answer_frames(&self.answer, session_id)?);
        Ok(frames)
    }

    pub fn spawn(&self, request: &AnswerRequest, session_id: Option<&str>) -> Result<ReceiverStream<Frame>> {
        let frames = self.frames(request, session_id)?;
        Ok(self.producer.spawn(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_rebuild_the_text_exactly() {
        for text in [
            "Hello world!",
            "  leading and trailing  ",
            "line one\nline two\n\n- bullet",
            "single",
        ] {
            assert_eq!(tokenize(text).concat(), text);
        }
        assert_eq!(tokenize("a  b\tc").len(), 3);
        assert!(tokenize(" \n ").is_empty());
    }

    #[test]
    fn chunk_frames_carry_word_and_progress() {
        let frames = FrameProducer::chunk_frames("one two three");
        assert_eq!(frames.len(), 3);
        let progress: Vec<u64> = frames
            .iter()
            .map(|f| f.data_object().unwrap()["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(progress, vec![33, 67, 100]);
        assert_eq!(
            frames[0].data_object().unwrap()["chunk"],
            Value::String("one ".to_string())
        );
    }

    #[test]
    fn encoded_frame_is_one_data_line_and_blank_line() {
        let encoded = encode_frame(&Frame::new(StatusToken::Status).with_message("hi")).unwrap();
        assert_eq!(encoded, "data: {\"status\":\"status\",\"message\":\"hi\"}\n\n");
    }

    #[test]
    fn terminal_frame_carries_citations_sources_and_session() {
        let answer = FallbackSimulator::canned_answer();
        let frame = FrameProducer::terminal_frame(&answer, Some("s-9")).unwrap();
        assert_eq!(frame.status, Some(StatusToken::Complete));
        assert_eq!(frame.session_id.as_deref(), Some("s-9"));
        let data = frame.data_object().unwrap();
        assert_eq!(data["citations"].as_object().unwrap().len(), 2);
        assert_eq!(data["sources"][0]["ref_id"], "1");
    }

    #[test]
    fn fallback_frames_are_status_then_words_then_terminal() {
        let sim = FallbackSimulator::new(Duration::ZERO);
        let frames = sim.frames(&AnswerRequest::new("statins"), None).unwrap();
        let words = tokenize(FALLBACK_ANSWER_TEXT).len();
        assert_eq!(frames.len(), 2 + words + 1);
        assert!(frames[..2].iter().all(|f| f
            .status
            .as_ref()
            .map(StatusToken::is_progress)
            .unwrap_or(false)));
        assert!(frames[2..2 + words]
            .iter()
            .all(|f| f.status == Some(StatusToken::Chunk)));
        assert_eq!(frames.last().unwrap().status, Some(StatusToken::Complete));
    }

    #[test]
    fn empty_fallback_answer_is_unrecoverable() {
        let sim = FallbackSimulator::with_answer(AnswerPayload::default(), Duration::ZERO);
        let err = sim.frames(&AnswerRequest::new("q"), None).unwrap_err();
        assert!(matches!(err.inner, CiteflowError::Fallback(_)));
    }

    #[tokio::test]
    async fn spawned_frames_arrive_in_order() {
        let producer = FrameProducer::new(Duration::from_millis(1));
        let frames = FrameProducer::chunk_frames("a b c");
        let received: Vec<Frame> = producer.spawn(frames.clone()).collect().await;
        assert_eq!(received, frames);
    }
}
