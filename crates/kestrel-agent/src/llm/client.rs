//! Multi-provider backend client.
//!
//! Supports the **OpenAI Chat Completions API** (and OpenAI-compatible
//! servers), the **Anthropic Messages API**, **Google Gemini** and **Ollama**,
//! each in blocking and streaming mode.  Whatever the provider, callers see
//! one contract: [`ChatBackend`].  Visible text is the same in both modes,
//! and the streamed reply's content is exactly the concatenation of the
//! deltas handed to the caller.

use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::{Value, json};

use crate::config::BackendConfig;
use crate::error::{AgentError, Result};
use crate::llm::extract::{
    ThinkSplitter, extract_content, extract_error, extract_reasoning, extract_usage, merge_usage,
    split_think,
};
use crate::llm::sse::{Frame, LineBuffer, classify_line};
use crate::llm::transport::{HttpRequest, ReqwestTransport, Transport};
use crate::llm::types::{ChatReply, Message, Role, Usage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Error bodies are cut to this many characters before they are stored in
/// an error.
const MAX_ERROR_BODY_CHARS: usize = 500;

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Callback receiving each visible text delta as it streams in.
pub type DeltaSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// The capability the agent loop needs from an AI backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Model identifier, for logging.
    fn model(&self) -> &str;

    /// Send the conversation and wait for the complete reply.
    async fn send_message(&self, messages: &[Message]) -> Result<ChatReply>;

    /// Send the conversation and stream visible deltas to `on_delta`.
    async fn send_message_stream(
        &self,
        messages: &[Message],
        on_delta: DeltaSink<'_>,
    ) -> Result<ChatReply>;
}

// ---------------------------------------------------------------------------
// Provider enum
// ---------------------------------------------------------------------------

/// Identifies which wire protocol the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
    /// Any server implementing the OpenAI chat completions protocol.
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::OpenAiCompatible => "openai_compatible",
        }
    }

    fn default_base_url(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some(OPENAI_BASE_URL),
            Self::Anthropic => Some(ANTHROPIC_BASE_URL),
            Self::Gemini => Some(GEMINI_BASE_URL),
            Self::Ollama => Some(OLLAMA_BASE_URL),
            Self::OpenAiCompatible => None,
        }
    }

    fn requires_api_key(self) -> bool {
        matches!(self, Self::OpenAi | Self::Anthropic | Self::Gemini)
    }
}

impl FromStr for ProviderKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "openai_compatible" | "openai-compatible" | "compatible" | "deepseek"
            | "lmstudio" | "lm_studio" => Ok(Self::OpenAiCompatible),
            other => Err(AgentError::UnknownProvider {
                provider: other.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Resolved settings for one backend endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    /// Base URL without trailing slash; `None` when the provider has no
    /// default and none was configured.
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub context_budget_tokens: usize,
    /// Injected as the system message when the caller supplies none.
    pub persona: Option<String>,
}

impl LlmClientConfig {
    /// Resolve a [`BackendConfig`] into concrete client settings.
    pub fn from_backend_config(config: &BackendConfig, persona: Option<String>) -> Result<Self> {
        let provider: ProviderKind = config.provider.parse()?;
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| {
                if config.provider.eq_ignore_ascii_case("deepseek") {
                    Some("https://api.deepseek.com/v1".to_owned())
                } else {
                    provider.default_base_url().map(str::to_owned)
                }
            })
            .map(|u| u.trim_end_matches('/').to_owned());

        Ok(Self {
            provider,
            model: config.model.clone(),
            api_key: config.resolve_api_key(),
            base_url,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            context_budget_tokens: config.context_budget_tokens,
            persona,
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A [`ChatBackend`] speaking one provider's HTTP protocol.
pub struct LlmClient {
    config: LlmClientConfig,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.config.provider)
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl LlmClient {
    /// Create a client over an explicit transport.
    pub fn new(config: LlmClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    pub fn config(&self) -> &LlmClientConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Request construction
    // -----------------------------------------------------------------------

    fn credential(&self) -> Result<Option<&str>> {
        let key = self.config.api_key.as_deref().filter(|k| !k.is_empty());
        if key.is_none() && self.config.provider.requires_api_key() {
            return Err(AgentError::MissingCredential {
                provider: self.config.provider.to_string(),
            });
        }
        Ok(key)
    }

    fn endpoint(&self) -> Result<&str> {
        self.config
            .base_url
            .as_deref()
            .ok_or_else(|| AgentError::MissingEndpoint {
                provider: self.config.provider.to_string(),
            })
    }

    /// Inject the persona and trim history to the context budget.
    pub fn prepare_messages(&self, messages: &[Message]) -> Vec<Message> {
        let mut prepared = messages.to_vec();
        if !prepared.iter().any(|m| m.role == Role::System) {
            if let Some(persona) = &self.config.persona {
                prepared.insert(0, Message::system(persona.clone()));
            }
        }
        truncate_to_budget(prepared, self.config.context_budget_tokens)
    }

    fn build_request(&self, messages: &[Message], stream: bool) -> Result<HttpRequest> {
        let key = self.credential()?;
        let base = self.endpoint()?;
        let messages = self.prepare_messages(messages);
        let model = &self.config.model;

        let request = match self.config.provider {
            ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => {
                let mut body = json!({
                    "model": model,
                    "messages": messages_to_openai(&messages),
                    "max_tokens": self.config.max_tokens,
                    "stream": stream,
                });
                if let Some(t) = self.config.temperature {
                    body["temperature"] = json!(t);
                }
                if stream && self.config.provider == ProviderKind::OpenAi {
                    body["stream_options"] = json!({"include_usage": true});
                }
                let req = HttpRequest::new(format!("{base}/chat/completions"), body);
                match key {
                    Some(key) => req.header("Authorization", format!("Bearer {key}")),
                    None => req,
                }
            }
            ProviderKind::Anthropic => {
                let (system, wire) = messages_to_anthropic(&messages);
                let mut body = json!({
                    "model": model,
                    "messages": wire,
                    "max_tokens": self.config.max_tokens,
                });
                if let Some(system) = system {
                    body["system"] = json!(system);
                }
                if let Some(t) = self.config.temperature {
                    body["temperature"] = json!(t);
                }
                if stream {
                    body["stream"] = json!(true);
                }
                HttpRequest::new(format!("{base}/v1/messages"), body)
                    .header("x-api-key", key.unwrap_or_default())
                    .header("anthropic-version", ANTHROPIC_VERSION)
            }
            ProviderKind::Gemini => {
                let (system, contents) = messages_to_gemini(&messages);
                let mut generation = json!({"maxOutputTokens": self.config.max_tokens});
                if let Some(t) = self.config.temperature {
                    generation["temperature"] = json!(t);
                }
                let mut body = json!({
                    "contents": contents,
                    "generationConfig": generation,
                });
                if let Some(system) = system {
                    body["systemInstruction"] = json!({"parts": [{"text": system}]});
                }
                let url = if stream {
                    format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
                } else {
                    format!("{base}/v1beta/models/{model}:generateContent")
                };
                HttpRequest::new(url, body).header("x-goog-api-key", key.unwrap_or_default())
            }
            ProviderKind::Ollama => {
                let mut options = json!({"num_predict": self.config.max_tokens});
                if let Some(t) = self.config.temperature {
                    options["temperature"] = json!(t);
                }
                let body = json!({
                    "model": model,
                    "messages": messages_to_openai(&messages),
                    "stream": stream,
                    "options": options,
                });
                let req = HttpRequest::new(format!("{base}/api/chat"), body);
                match key {
                    Some(key) => req.header("Authorization", format!("Bearer {key}")),
                    None => req,
                }
            }
        };

        Ok(request)
    }

    // -----------------------------------------------------------------------
    // Response handling
    // -----------------------------------------------------------------------

    fn parse_blocking_body(&self, status: u16, body: &str) -> Result<ChatReply> {
        if body.trim().is_empty() {
            return Err(AgentError::EmptyResponse);
        }

        let v: Value = serde_json::from_str(body)?;
        if let Some(message) = extract_error(&v) {
            return Err(classify_status(status, &message, &self.config.model));
        }

        let raw = extract_content(&v).unwrap_or_default();
        let split = split_think(&raw);
        if split.visible.trim().is_empty() {
            return Err(AgentError::EmptyResponse);
        }

        let mut reasoning = extract_reasoning(&v).unwrap_or_default();
        reasoning.push_str(&split.reasoning);

        Ok(ChatReply {
            content: split.visible,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            usage: extract_usage(&v),
        })
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send_message(&self, messages: &[Message]) -> Result<ChatReply> {
        let request = self.build_request(messages, false)?;
        tracing::debug!(
            url = %request.url,
            provider = %self.config.provider,
            model = %self.config.model,
            messages = messages.len(),
            "sending backend request"
        );

        let resp = self.transport.post_json(request).await?;
        if !(200..300).contains(&resp.status) {
            return Err(classify_status(resp.status, &resp.body, &self.config.model));
        }
        self.parse_blocking_body(resp.status, &resp.body)
    }

    async fn send_message_stream(
        &self,
        messages: &[Message],
        on_delta: DeltaSink<'_>,
    ) -> Result<ChatReply> {
        let request = self.build_request(messages, true)?;
        tracing::debug!(
            url = %request.url,
            provider = %self.config.provider,
            model = %self.config.model,
            messages = messages.len(),
            "sending streaming backend request"
        );

        let resp = self.transport.post_stream(request).await?;
        if !(200..300).contains(&resp.status) {
            let status = resp.status;
            let body = resp.collect_text().await;
            return Err(classify_status(status, &body, &self.config.model));
        }

        let mut body = resp.body;
        let mut lines = LineBuffer::new();
        let mut acc = StreamAccumulator::default();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| acc.stream_error(e.to_string()))?;
            for line in lines.push(&chunk) {
                if acc.feed_line(&line, on_delta)? {
                    break 'read;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            acc.feed_line(&rest, on_delta)?;
        }

        acc.into_reply(on_delta)
    }
}

// ---------------------------------------------------------------------------
// Stream accumulator
// ---------------------------------------------------------------------------

/// Aggregates streamed payloads into a [`ChatReply`].
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    reasoning: String,
    usage: Option<Usage>,
    splitter: ThinkSplitter,
    emitted: bool,
}

impl StreamAccumulator {
    fn stream_error(&self, reason: String) -> AgentError {
        AgentError::StreamFailure {
            reason,
            after_output: self.emitted,
        }
    }

    /// Process one line; returns `true` when the stream signalled its end.
    fn feed_line(&mut self, line: &str, on_delta: DeltaSink<'_>) -> Result<bool> {
        let payload = match classify_line(line) {
            Frame::Skip => return Ok(false),
            Frame::Done => return Ok(true),
            Frame::Payload(p) => p,
        };

        let v: Value = serde_json::from_str(payload)
            .map_err(|e| self.stream_error(format!("invalid JSON in stream: {e}")))?;

        if let Some(message) = extract_error(&v) {
            return Err(self.stream_error(message));
        }

        if let Some(text) = extract_content(&v) {
            let split = self.splitter.feed(&text);
            self.emit(&split.visible, on_delta);
            self.reasoning.push_str(&split.reasoning);
        }
        if let Some(reasoning) = extract_reasoning(&v) {
            self.reasoning.push_str(&reasoning);
        }
        if let Some(usage) = extract_usage(&v) {
            merge_usage(&mut self.usage, usage);
        }

        Ok(v["type"] == "message_stop")
    }

    fn emit(&mut self, visible: &str, on_delta: DeltaSink<'_>) {
        if visible.is_empty() {
            return;
        }
        on_delta(visible);
        self.content.push_str(visible);
        self.emitted = true;
    }

    fn into_reply(mut self, on_delta: DeltaSink<'_>) -> Result<ChatReply> {
        let rest = self.splitter.finish();
        self.emit(&rest.visible, on_delta);
        self.reasoning.push_str(&rest.reasoning);

        if self.content.trim().is_empty() {
            return Err(AgentError::EmptyResponse);
        }

        Ok(ChatReply {
            content: self.content,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            usage: self.usage,
        })
    }
}

// ===========================================================================
// Factory
// ===========================================================================

/// Build the production backend for a configuration.
pub fn create_backend(
    config: &BackendConfig,
    persona: Option<String>,
) -> Result<Arc<dyn ChatBackend>> {
    let client_config = LlmClientConfig::from_backend_config(config, persona)?;
    let transport = ReqwestTransport::new(Duration::from_secs(config.connect_timeout_secs))?;
    tracing::info!(
        provider = %client_config.provider,
        model = %client_config.model,
        "backend configured"
    );
    Ok(Arc::new(LlmClient::new(client_config, Arc::new(transport))))
}

// ===========================================================================
// Error classification
// ===========================================================================

static OVERLOAD_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)rate.?limit|overloaded|too many requests|quota").ok());

static MODEL_MISSING_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)model.{0,80}(not found|does not exist|unknown)|no such model").ok()
});

fn pattern_matches(pattern: &LazyLock<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(text))
}

/// Map a non-2xx status (or an error embedded in a 2xx body) into the error
/// taxonomy.
pub fn classify_status(status: u16, body: &str, model: &str) -> AgentError {
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();

    match status {
        401 | 403 => AgentError::AuthenticationFailure { status, body },
        429 => AgentError::RateLimited { body },
        404 => AgentError::ModelNotFound {
            model: model.to_owned(),
        },
        500..=599 => AgentError::ServerError { status, body },
        _ if pattern_matches(&MODEL_MISSING_PATTERN, &body) => AgentError::ModelNotFound {
            model: model.to_owned(),
        },
        _ if pattern_matches(&OVERLOAD_PATTERN, &body) => AgentError::RateLimited { body },
        _ => AgentError::ApiError { status, body },
    }
}

// ===========================================================================
// Format conversion (free functions)
// ===========================================================================

/// Tool results go back to the model as user turns on every provider.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

/// Convert to the OpenAI / Ollama `messages` array.
pub fn messages_to_openai(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": wire_role(m.role), "content": m.content}))
        .collect()
}

/// Merge consecutive same-role turns, which Anthropic and Gemini reject.
fn merge_turns<'a>(messages: impl Iterator<Item = &'a Message>) -> Vec<(&'static str, String)> {
    let mut turns: Vec<(&'static str, String)> = Vec::new();
    for m in messages {
        let role = wire_role(m.role);
        match turns.last_mut() {
            Some((last_role, text)) if *last_role == role => {
                text.push_str("\n\n");
                text.push_str(&m.content);
            }
            _ => turns.push((role, m.content.clone())),
        }
    }
    turns
}

fn join_system(messages: &[Message]) -> Option<String> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    (!system.is_empty()).then(|| system.join("\n\n"))
}

/// Split system messages into Anthropic's top-level field and convert the
/// rest.
fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let turns = merge_turns(messages.iter().filter(|m| m.role != Role::System));
    let wire = turns
        .into_iter()
        .map(|(role, text)| json!({"role": role, "content": text}))
        .collect();
    (join_system(messages), wire)
}

/// Gemini uses `model` for assistant turns and `parts` for content.
fn messages_to_gemini(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let turns = merge_turns(messages.iter().filter(|m| m.role != Role::System));
    let contents = turns
        .into_iter()
        .map(|(role, text)| {
            let role = if role == "assistant" { "model" } else { role };
            json!({"role": role, "parts": [{"text": text}]})
        })
        .collect();
    (join_system(messages), contents)
}

/// Drop the oldest non-system messages until the estimated size fits
/// `budget_tokens`.  System messages and the most recent message are always
/// kept.
pub fn truncate_to_budget(mut messages: Vec<Message>, budget_tokens: usize) -> Vec<Message> {
    let mut total: usize = messages.iter().map(Message::estimated_tokens).sum();
    let mut dropped = 0usize;

    while total > budget_tokens {
        let last = messages.len().saturating_sub(1);
        let Some(idx) = messages
            .iter()
            .enumerate()
            .position(|(i, m)| m.role != Role::System && i < last)
        else {
            break;
        };
        total -= messages[idx].estimated_tokens();
        messages.remove(idx);
        dropped += 1;
    }

    if dropped > 0 {
        tracing::debug!(dropped, remaining = messages.len(), "truncated history to context budget");
    }
    messages
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
