//! Line framing for streamed responses.
//!
//! All supported providers stream either Server-Sent Events (`data:` lines,
//! optionally terminated by `data: [DONE]`) or newline-delimited JSON
//! (Ollama).  [`LineBuffer`] reassembles lines from arbitrary byte chunks and
//! [`classify_line`] turns each line into a [`Frame`].

/// Reassembles complete lines from a chunked byte stream.
///
/// Buffering happens on bytes, so a multi-byte UTF-8 sequence split across
/// two chunks is decoded only once the whole line has arrived.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the
    /// trailing `\n` / `\r\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Return whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_owned();
        (!text.is_empty()).then_some(text)
    }
}

/// What a single stream line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Blank line, comment, or a non-data SSE field.
    Skip,
    /// The `[DONE]` sentinel.
    Done,
    /// A JSON payload to decode.
    Payload(&'a str),
}

/// Classify one line of an SSE or NDJSON stream.
pub fn classify_line(line: &str) -> Frame<'_> {
    let line = line.trim();

    if line.is_empty() || line.starts_with(':') {
        return Frame::Skip;
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        return match data {
            "" => Frame::Skip,
            "[DONE]" => Frame::Done,
            _ => Frame::Payload(data),
        };
    }

    // NDJSON streams carry bare JSON objects, one per line.
    if line.starts_with('{') {
        return Frame::Payload(line);
    }

    // `event:`, `id:`, `retry:` and anything unrecognised.
    tracing::trace!(line = %line, "ignoring stream line");
    Frame::Skip
}
