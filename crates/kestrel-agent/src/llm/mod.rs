//! AI backend integration layer.
//!
//! - [`types`] -- Conversation data types (messages, tool calls, replies).
//! - [`client`] -- Multi-provider HTTP client behind the [`ChatBackend`] trait.
//! - [`transport`] -- HTTP seam so the client can be driven without a network.
//! - [`sse`] -- Line framing for SSE and NDJSON streams.
//! - [`extract`] -- Provider-agnostic text, reasoning and usage extraction.
//! - [`retry`] -- Bounded retry with backoff, timeout and cancellation.

pub mod client;
pub mod extract;
pub mod retry;
pub mod sse;
pub mod transport;
pub mod types;

pub use client::{
    ChatBackend, DeltaSink, LlmClient, LlmClientConfig, ProviderKind, classify_status,
    create_backend,
};
pub use retry::RetryPolicy;
pub use transport::{ByteStream, HttpRequest, HttpResponse, ReqwestTransport, StreamingResponse, Transport};
pub use types::{ChatReply, Message, MessageStatus, Role, ToolCall, ToolResult, Usage};
