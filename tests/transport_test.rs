use citeflow::config::EngineConfig;
use citeflow::producer::FallbackSimulator;
use citeflow::*;
use futures_util::StreamExt;
use httpmock::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_http_transport_posts_request_and_reads_session_header() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/answer")
                .header("accept", "text/event-stream")
                .json_body(json!({ "query": "what is dvt prophylaxis", "mode": "fast" }));
            then.status(200)
                .header("content-type", "text/event-stream")
                .header("x-session-id", "hdr-7")
                .body("data: {\"status\":\"complete\"}\n\n");
        })
        .await;

    let transport = HttpTransport::new(reqwest::Client::new(), server.url("/api/answer"));
    let mut request = AnswerRequest::new("what is dvt prophylaxis");
    request.mode = Some("fast".to_string());

    let opened = transport
        .open(&request, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(opened.session_id.as_deref(), Some("hdr-7"));

    let body: Vec<u8> = opened
        .body
        .map(|chunk| chunk.unwrap().to_vec())
        .concat()
        .await;
    assert_eq!(body, b"data: {\"status\":\"complete\"}\n\n");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_transport_non_success_is_an_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/answer");
            then.status(500).body("boom");
        })
        .await;

    let transport = HttpTransport::new(reqwest::Client::new(), server.url("/api/answer"));
    let err = transport
        .open(&AnswerRequest::new("q"), Duration::from_secs(5))
        .await
        .err()
        .unwrap();
    match err.inner {
        CiteflowError::Upstream(status, body) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "boom");
        }
        other => panic!("Expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_over_http_uses_header_session_as_last_resort() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/answer");
            then.status(200)
                .header("content-type", "text/event-stream")
                .header("x-session-id", "hdr-9")
                .body(concat!(
                    "data: {\"status\":\"chunk\",\"data\":{\"chunk\":\"Low \",\"progress\":50}}\n\n",
                    "data: {\"status\":\"chunk\",\"data\":{\"chunk\":\"risk.\",\"progress\":100}}\n\n",
                    "data: {\"status\":\"complete\",\"data\":{\"citations\":{\"1\":{\"title\":\"t\",\"url\":\"u\"}}}}\n\n",
                ));
        })
        .await;

    let engine = AnswerEngine::new(
        Arc::new(HttpTransport::new(
            reqwest::Client::new(),
            server.url("/api/answer"),
        )),
        FallbackSimulator::new(Duration::ZERO),
        EngineConfig::default(),
    );
    let response = engine
        .ask(AnswerRequest::new("q"))
        .await
        .unwrap()
        .completion()
        .await
        .unwrap();

    assert_eq!(response.processed_content, "Low risk.");
    assert_eq!(response.session_id.as_deref(), Some("hdr-9"));
    assert_eq!(response.citations.len(), 1);
}

#[tokio::test]
async fn test_engine_falls_back_when_server_is_down() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/answer");
            then.status(502).body("bad gateway");
        })
        .await;

    let engine = AnswerEngine::new(
        Arc::new(HttpTransport::new(
            reqwest::Client::new(),
            server.url("/api/answer"),
        )),
        FallbackSimulator::new(Duration::ZERO),
        EngineConfig::default(),
    );
    let mut request = AnswerRequest::new("q");
    request.session_id = Some("mine".to_string());
    let response = engine.ask(request).await.unwrap().completion().await.unwrap();

    assert_eq!(
        response.processed_content,
        citeflow::constants::FALLBACK_ANSWER_TEXT
    );
    assert_eq!(response.session_id.as_deref(), Some("mine"));
    assert!(!response.is_error());
}
