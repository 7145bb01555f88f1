//! Integration tests for the backend client and retry policy.
//!
//! Every test runs against a scripted transport; nothing touches the
//! network.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kestrel_agent::llm::Transport;
use kestrel_agent::{
    AgentError, ChatBackend, LlmClient, LlmClientConfig, Message, ProviderKind, RetryPolicy,
};

use support::{Exchange, ScriptedTransport};

fn client(provider: ProviderKind, transport: Arc<dyn Transport>) -> LlmClient {
    LlmClient::new(
        LlmClientConfig {
            provider,
            model: "test-model".into(),
            api_key: Some("sk-test".into()),
            base_url: Some("http://localhost:9999".into()),
            max_tokens: 256,
            temperature: None,
            context_budget_tokens: 100_000,
            persona: Some("You are a test persona.".into()),
        },
        transport,
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(5),
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn sse(events: &[&str]) -> Vec<String> {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming / non-streaming equivalence
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn openai_stream_deltas_concatenate_to_blocking_content() {
    let blocking_body = r#"{"choices":[{"message":{"role":"assistant","content":"Hello, world! <think>hmm</think>Done."}}],"usage":{"prompt_tokens":7,"completion_tokens":5}}"#;

    // The same text, split awkwardly, including a tag broken across chunks.
    let mut chunks = sse(&[
        r#"{"choices":[{"delta":{"content":"Hello, "}}]}"#,
        r#"{"choices":[{"delta":{"content":"world! <thi"}}]}"#,
        r#"{"choices":[{"delta":{"content":"nk>hmm</th"}}]}"#,
        r#"{"choices":[{"delta":{"content":"ink>Done."}}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":5}}"#,
        "[DONE]",
    ]);
    // Split one SSE line across two transport chunks as well.
    let tail = chunks.remove(1);
    let (a, b) = tail.split_at(12);
    chunks.insert(1, b.to_owned());
    chunks.insert(1, a.to_owned());

    let transport = ScriptedTransport::new(vec![
        Exchange::Json {
            status: 200,
            body: blocking_body.into(),
        },
        Exchange::Stream {
            status: 200,
            chunks,
        },
    ]);
    let client = client(ProviderKind::OpenAi, transport);
    let messages = vec![Message::user("hi")];

    let blocking = client.send_message(&messages).await.unwrap();

    let deltas = Mutex::new(Vec::<String>::new());
    let sink = |d: &str| deltas.lock().unwrap().push(d.to_owned());
    let streamed = client.send_message_stream(&messages, &sink).await.unwrap();

    let concatenated: String = deltas.lock().unwrap().concat();
    assert_eq!(concatenated, streamed.content);
    assert_eq!(streamed.content, blocking.content);
    assert!(!blocking.content.contains("think"));
    assert_eq!(streamed.reasoning.as_deref(), Some("hmm"));
    assert_eq!(streamed.usage.map(|u| u.total()), Some(12));
}

#[tokio::test]
async fn anthropic_stream_matches_blocking() {
    let blocking_body =
        r#"{"content":[{"type":"text","text":"Patched the parser."}],"usage":{"input_tokens":3,"output_tokens":4}}"#;
    let chunks: Vec<String> = vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3,\"output_tokens\":0}}}\n\n".into(),
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Patched the \"}}\n\n".into(),
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"parser.\"}}\n\n".into(),
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":4}}\n\n".into(),
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".into(),
    ];

    let transport = ScriptedTransport::new(vec![
        Exchange::Json {
            status: 200,
            body: blocking_body.into(),
        },
        Exchange::Stream {
            status: 200,
            chunks,
        },
    ]);
    let client = client(ProviderKind::Anthropic, transport.clone());
    let messages = vec![Message::system("sys"), Message::user("fix it")];

    let blocking = client.send_message(&messages).await.unwrap();
    let deltas = Mutex::new(String::new());
    let sink = |d: &str| deltas.lock().unwrap().push_str(d);
    let streamed = client.send_message_stream(&messages, &sink).await.unwrap();

    assert_eq!(*deltas.lock().unwrap(), streamed.content);
    assert_eq!(streamed.content, blocking.content);

    let requests = transport.requests.lock().unwrap();
    assert!(requests[0].url.ends_with("/v1/messages"));
    assert_eq!(requests[0].body["system"], "sys");
    assert!(requests[0].headers.iter().any(|(k, _)| k == "anthropic-version"));
}

#[tokio::test]
async fn ollama_ndjson_stream_is_accumulated() {
    let chunks = vec![
        "{\"message\":{\"content\":\"line one \"},\"done\":false}\n".to_owned(),
        "{\"message\":{\"content\":\"and two\"},\"done\":false}\n{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":2,\"eval_count\":3}\n".to_owned(),
    ];
    let transport = ScriptedTransport::new(vec![Exchange::Stream {
        status: 200,
        chunks,
    }]);
    let client = client(ProviderKind::Ollama, transport);
    let noop = |_: &str| {};
    let reply = client
        .send_message_stream(&[Message::user("hi")], &noop)
        .await
        .unwrap();
    assert_eq!(reply.content, "line one and two");
    assert_eq!(reply.usage.map(|u| u.total()), Some(5));
}

// ═══════════════════════════════════════════════════════════════════════
//  Persona injection
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn persona_is_injected_when_no_system_message() {
    let transport = ScriptedTransport::new(vec![Exchange::Json {
        status: 200,
        body: r#"{"choices":[{"message":{"content":"ok"}}]}"#.into(),
    }]);
    let client = client(ProviderKind::OpenAi, transport.clone());
    client.send_message(&[Message::user("hi")]).await.unwrap();

    let requests = transport.requests.lock().unwrap();
    let wire = requests[0].body["messages"].as_array().unwrap();
    assert_eq!(wire[0]["role"], "system");
    assert_eq!(wire[0]["content"], "You are a test persona.");
    assert!(
        requests[0]
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test")
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Retry classification
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unauthorized_is_never_retried() {
    let transport = ScriptedTransport::new(vec![
        Exchange::Json {
            status: 401,
            body: r#"{"error":{"message":"invalid api key"}}"#.into(),
        },
        Exchange::Json {
            status: 200,
            body: r#"{"choices":[{"message":{"content":"unreachable"}}]}"#.into(),
        },
    ]);
    let client = client(ProviderKind::OpenAi, transport.clone());
    let messages = vec![Message::user("hi")];

    let result = fast_retry()
        .execute_with_retry("test", &CancellationToken::new(), || {
            client.send_message(&messages)
        })
        .await;

    assert!(matches!(
        result,
        Err(AgentError::AuthenticationFailure { status: 401, .. })
    ));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn network_failure_retries_to_bound_then_surfaces_last_error() {
    let transport = ScriptedTransport::new(vec![
        Exchange::NetworkError("connection reset (1)".into()),
        Exchange::NetworkError("connection reset (2)".into()),
        Exchange::NetworkError("connection reset (3)".into()),
    ]);
    let client = client(ProviderKind::OpenAi, transport.clone());
    let messages = vec![Message::user("hi")];

    let result = fast_retry()
        .execute_with_retry("test", &CancellationToken::new(), || {
            client.send_message(&messages)
        })
        .await;

    match result {
        Err(AgentError::NetworkFailure { reason }) => assert_eq!(reason, "connection reset (3)"),
        other => panic!("expected network failure, got {other:?}"),
    }
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn empty_success_body_is_retried() {
    let transport = ScriptedTransport::new(vec![
        Exchange::Json {
            status: 200,
            body: String::new(),
        },
        Exchange::Json {
            status: 200,
            body: r#"{"choices":[{"message":{"content":"second time lucky"}}]}"#.into(),
        },
    ]);
    let client = client(ProviderKind::OpenAi, transport.clone());
    let messages = vec![Message::user("hi")];

    let reply = fast_retry()
        .execute_with_retry("test", &CancellationToken::new(), || {
            client.send_message(&messages)
        })
        .await
        .unwrap();

    assert_eq!(reply.content, "second time lucky");
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn missing_credential_fails_without_a_request() {
    let transport = ScriptedTransport::new(vec![]);
    let mut config = client(ProviderKind::Anthropic, transport.clone()).config().clone();
    config.api_key = None;
    let client = LlmClient::new(config, transport.clone());

    let err = client.send_message(&[Message::user("hi")]).await.unwrap_err();
    assert!(matches!(err, AgentError::MissingCredential { .. }));
    assert!(!err.is_retryable());
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn stream_failure_after_output_is_not_retryable() {
    let transport = ScriptedTransport::new(vec![Exchange::Stream {
        status: 200,
        chunks: sse(&[
            r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
            "{not json",
        ]),
    }]);
    let client = client(ProviderKind::OpenAi, transport);
    let noop = |_: &str| {};
    let err = client
        .send_message_stream(&[Message::user("hi")], &noop)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AgentError::StreamFailure {
            after_output: true,
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_error_on_stream_is_classified() {
    let transport = ScriptedTransport::new(vec![Exchange::Stream {
        status: 503,
        chunks: vec!["upstream overloaded".into()],
    }]);
    let client = client(ProviderKind::OpenAi, transport);
    let noop = |_: &str| {};
    let err = client
        .send_message_stream(&[Message::user("hi")], &noop)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ServerError { status: 503, .. }));
    assert!(err.is_retryable());
}
