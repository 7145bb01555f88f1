//! Shared fixtures for the integration tests: a scripted backend, a
//! scripted HTTP transport and a few file tools.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use kestrel_agent::llm::{
    ByteStream, HttpRequest, HttpResponse, StreamingResponse, Transport,
};
use kestrel_agent::tools::value::ParamValue;
use kestrel_agent::{
    AgentContext, AgentError, ChatBackend, ChatReply, DeltaSink, Message, ParamType, ParameterSpec,
    Result, Tool, ToolParams, ToolResult, Usage,
};

// ═══════════════════════════════════════════════════════════════════════
//  Scripted backend
// ═══════════════════════════════════════════════════════════════════════

/// Replays a fixed list of replies; once exhausted it repeats the fallback.
pub struct StubBackend {
    replies: Mutex<VecDeque<Result<String>>>,
    fallback: String,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Vec<Message>>>,
}

impl StubBackend {
    pub fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Self::with_fallback(replies, "done")
    }

    pub fn with_fallback(replies: Vec<Result<String>>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: fallback.to_owned(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self, messages: &[Message]) -> Result<ChatReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()));
        next.map(|content| ChatReply {
            content,
            reasoning: None,
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        })
    }
}

#[async_trait]
impl ChatBackend for StubBackend {
    fn model(&self) -> &str {
        "stub"
    }

    async fn send_message(&self, messages: &[Message]) -> Result<ChatReply> {
        self.next(messages)
    }

    async fn send_message_stream(
        &self,
        messages: &[Message],
        on_delta: DeltaSink<'_>,
    ) -> Result<ChatReply> {
        let reply = self.next(messages)?;
        // Deliver in small pieces to exercise delta accumulation.
        let chars: Vec<char> = reply.content.chars().collect();
        for piece in chars.chunks(7) {
            on_delta(&piece.iter().collect::<String>());
        }
        Ok(reply)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Scripted transport
// ═══════════════════════════════════════════════════════════════════════

/// One scripted HTTP exchange.
pub enum Exchange {
    /// A buffered response.
    Json { status: u16, body: String },
    /// A streamed response delivered in the given chunks.
    Stream { status: u16, chunks: Vec<String> },
    /// A transport-level failure.
    NetworkError(String),
}

#[derive(Default)]
pub struct ScriptedTransport {
    exchanges: Mutex<VecDeque<Exchange>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(exchanges: Vec<Exchange>) -> Arc<Self> {
        Arc::new(Self {
            exchanges: Mutex::new(exchanges.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: HttpRequest) -> Exchange {
        self.requests.lock().unwrap().push(request);
        self.exchanges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Exchange::NetworkError("script exhausted".into()))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse> {
        match self.next(request) {
            Exchange::Json { status, body } => Ok(HttpResponse { status, body }),
            Exchange::Stream { status, chunks } => Ok(HttpResponse {
                status,
                body: chunks.concat(),
            }),
            Exchange::NetworkError(reason) => Err(AgentError::NetworkFailure { reason }),
        }
    }

    async fn post_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
        match self.next(request) {
            Exchange::Stream { status, chunks } => {
                let items: Vec<Result<Vec<u8>>> =
                    chunks.into_iter().map(|c| Ok(c.into_bytes())).collect();
                let body: ByteStream = Box::pin(futures::stream::iter(items));
                Ok(StreamingResponse { status, body })
            }
            Exchange::Json { status, body } => {
                let body: ByteStream =
                    Box::pin(futures::stream::iter(vec![Ok(body.into_bytes())]));
                Ok(StreamingResponse { status, body })
            }
            Exchange::NetworkError(reason) => Err(AgentError::NetworkFailure { reason }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  File tools
// ═══════════════════════════════════════════════════════════════════════

fn target(params: &ToolParams, ctx: &AgentContext) -> Option<PathBuf> {
    params
        .get("path")
        .and_then(ParamValue::as_str)
        .map(|p| ctx.resolve_path(p))
}

/// Minimal `write_file` for driving snapshots end to end.
pub struct WriteFile {
    pub runs: Arc<AtomicUsize>,
}

impl WriteFile {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("path", ParamType::String, "File path"),
            ParameterSpec::required("content", ParamType::String, "New content"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let Some(path) = target(params, ctx) else {
            return ToolResult::failure("missing path");
        };
        let content = params
            .get("content")
            .and_then(ParamValue::as_str)
            .unwrap_or_default();
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::ok(json!(format!("wrote {}", path.display()))),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}

/// Records the order in which it runs.
pub struct Recorder {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Records invocations"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        Vec::new()
    }

    async fn execute(&self, _params: &ToolParams, _ctx: &AgentContext) -> ToolResult {
        self.log.lock().unwrap().push(self.name.to_owned());
        ToolResult::ok(json!(self.name))
    }
}

/// A directive for `write_file`, as the model would emit it.
pub fn write_directive(path: &str, content: &str) -> String {
    json!({"tool": "write_file", "parameters": {"path": path, "content": content}}).to_string()
}
