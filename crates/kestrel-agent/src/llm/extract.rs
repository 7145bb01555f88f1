//! Provider-agnostic extraction of text, reasoning and usage from response
//! payloads.
//!
//! Each provider nests its text differently.  Rather than branch per
//! provider, every payload (blocking body or streamed chunk) is run through
//! one ordered list of typed extractors and the first non-empty match wins.
//! Inline `<think>...</think>` blocks are separated from visible text by
//! [`ThinkSplitter`], which is safe to feed arbitrary chunk boundaries.

use serde_json::Value;

use crate::llm::types::Usage;

/// Reads one candidate location in a payload.
type Extractor = fn(&Value) -> Option<String>;

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.is_empty()).map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Visible content
// ---------------------------------------------------------------------------

fn openai_delta_content(v: &Value) -> Option<String> {
    non_empty(v["choices"][0]["delta"]["content"].as_str())
}

fn openai_message_content(v: &Value) -> Option<String> {
    non_empty(v["choices"][0]["message"]["content"].as_str())
}

fn ollama_message_content(v: &Value) -> Option<String> {
    non_empty(v["message"]["content"].as_str())
}

fn first_text_block(v: &Value) -> Option<String> {
    v["content"]
        .as_array()?
        .iter()
        .find(|block| block["type"].as_str().is_none_or(|t| t == "text"))
        .and_then(|block| non_empty(block["text"].as_str()))
}

fn top_level_content(v: &Value) -> Option<String> {
    non_empty(v["content"].as_str())
}

fn anthropic_delta_text(v: &Value) -> Option<String> {
    non_empty(v["delta"]["text"].as_str())
}

fn gemini_parts(v: &Value, thought: bool) -> Option<String> {
    let text: String = v["candidates"][0]["content"]["parts"]
        .as_array()?
        .iter()
        .filter(|part| part["thought"].as_bool().unwrap_or(false) == thought)
        .filter_map(|part| part["text"].as_str())
        .collect();
    (!text.is_empty()).then_some(text)
}

fn gemini_text(v: &Value) -> Option<String> {
    gemini_parts(v, false)
}

/// Ordered content extractors.
const CONTENT_EXTRACTORS: &[Extractor] = &[
    openai_delta_content,
    openai_message_content,
    ollama_message_content,
    first_text_block,
    top_level_content,
    anthropic_delta_text,
    gemini_text,
];

/// Extract visible text from a payload.
pub fn extract_content(v: &Value) -> Option<String> {
    CONTENT_EXTRACTORS.iter().find_map(|extract| extract(v))
}

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

fn openai_delta_reasoning(v: &Value) -> Option<String> {
    let delta = &v["choices"][0]["delta"];
    non_empty(delta["reasoning_content"].as_str()).or_else(|| non_empty(delta["reasoning"].as_str()))
}

fn openai_message_reasoning(v: &Value) -> Option<String> {
    let msg = &v["choices"][0]["message"];
    non_empty(msg["reasoning_content"].as_str()).or_else(|| non_empty(msg["reasoning"].as_str()))
}

fn ollama_thinking(v: &Value) -> Option<String> {
    non_empty(v["message"]["thinking"].as_str())
}

fn anthropic_thinking_blocks(v: &Value) -> Option<String> {
    let text: String = v["content"]
        .as_array()?
        .iter()
        .filter(|block| block["type"] == "thinking")
        .filter_map(|block| block["thinking"].as_str())
        .collect();
    (!text.is_empty()).then_some(text)
}

fn anthropic_delta_thinking(v: &Value) -> Option<String> {
    non_empty(v["delta"]["thinking"].as_str())
}

fn gemini_thoughts(v: &Value) -> Option<String> {
    gemini_parts(v, true)
}

/// Ordered reasoning extractors.
const REASONING_EXTRACTORS: &[Extractor] = &[
    openai_delta_reasoning,
    openai_message_reasoning,
    ollama_thinking,
    anthropic_thinking_blocks,
    anthropic_delta_thinking,
    gemini_thoughts,
];

/// Extract reasoning text reported in a dedicated field.
pub fn extract_reasoning(v: &Value) -> Option<String> {
    REASONING_EXTRACTORS.iter().find_map(|extract| extract(v))
}

// ---------------------------------------------------------------------------
// Usage and errors
// ---------------------------------------------------------------------------

/// Extract token usage from a payload, whichever provider produced it.
pub fn extract_usage(v: &Value) -> Option<Usage> {
    let pair = |input: &Value, output: &Value| -> Option<Usage> {
        if input.is_null() && output.is_null() {
            return None;
        }
        Some(Usage {
            input_tokens: input.as_u64().unwrap_or(0),
            output_tokens: output.as_u64().unwrap_or(0),
        })
    };

    let usage = &v["usage"];
    if usage.is_object() {
        if let Some(u) = pair(&usage["prompt_tokens"], &usage["completion_tokens"]) {
            return Some(u);
        }
        if let Some(u) = pair(&usage["input_tokens"], &usage["output_tokens"]) {
            return Some(u);
        }
    }

    let message_usage = &v["message"]["usage"];
    if message_usage.is_object() {
        if let Some(u) = pair(&message_usage["input_tokens"], &message_usage["output_tokens"]) {
            return Some(u);
        }
    }

    let meta = &v["usageMetadata"];
    if meta.is_object() {
        if let Some(u) = pair(&meta["promptTokenCount"], &meta["candidatesTokenCount"]) {
            return Some(u);
        }
    }

    pair(&v["prompt_eval_count"], &v["eval_count"])
}

/// Fold a streamed usage record into the running total.
///
/// Providers report cumulative counts across chunks (and Anthropic splits
/// input and output over two events), so the larger value per field wins.
pub fn merge_usage(acc: &mut Option<Usage>, next: Usage) {
    let current = acc.get_or_insert_with(Usage::default);
    current.input_tokens = current.input_tokens.max(next.input_tokens);
    current.output_tokens = current.output_tokens.max(next.output_tokens);
}

/// Detect an error object embedded in a 2xx payload or stream chunk.
pub fn extract_error(v: &Value) -> Option<String> {
    let err = &v["error"];
    if err.is_null() {
        return None;
    }
    Some(
        err["message"]
            .as_str()
            .or_else(|| err.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| err.to_string()),
    )
}

// ---------------------------------------------------------------------------
// <think> splitting
// ---------------------------------------------------------------------------

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Separates inline `<think>` blocks from visible text.
///
/// Feed chunks in order; tags split across chunk boundaries are held back
/// until they can be recognised.
#[derive(Debug, Default)]
pub struct ThinkSplitter {
    buffer: String,
    in_think: bool,
}

/// Output of one [`ThinkSplitter`] step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SplitText {
    pub visible: String,
    pub reasoning: String,
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the text that is now unambiguous.
    pub fn feed(&mut self, chunk: &str) -> SplitText {
        self.buffer.push_str(chunk);
        let mut out = SplitText::default();

        loop {
            let tag = if self.in_think { CLOSE_TAG } else { OPEN_TAG };
            let sink = if self.in_think {
                &mut out.reasoning
            } else {
                &mut out.visible
            };

            if let Some(pos) = self.buffer.find(tag) {
                sink.push_str(&self.buffer[..pos]);
                self.buffer.drain(..pos + tag.len());
                self.in_think = !self.in_think;
                continue;
            }

            let keep = partial_suffix_len(&self.buffer, tag);
            let emit_to = self.buffer.len() - keep;
            sink.push_str(&self.buffer[..emit_to]);
            self.buffer.drain(..emit_to);
            break;
        }

        out
    }

    /// Flush held-back text once the stream has ended.
    pub fn finish(&mut self) -> SplitText {
        let rest = std::mem::take(&mut self.buffer);
        if self.in_think {
            SplitText {
                visible: String::new(),
                reasoning: rest,
            }
        } else {
            SplitText {
                visible: rest,
                reasoning: String::new(),
            }
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| text.ends_with(&tag[..k]))
        .unwrap_or(0)
}

/// Split a complete text in one step.
pub fn split_think(text: &str) -> SplitText {
    let mut splitter = ThinkSplitter::new();
    let mut out = splitter.feed(text);
    let rest = splitter.finish();
    out.visible.push_str(&rest.visible);
    out.reasoning.push_str(&rest.reasoning);
    out
}
