//! Generic SSE pipeline primitives shared by the dialect streaming
//! transformers: a `(bytes -> events)` tokenizer and an `(events -> bytes)`
//! serializer. Per-request state only; nothing here is shared across
//! requests.

/// Accumulates raw bytes from an upstream stream and yields complete
/// `data: ...` payloads as they become available, retaining any partial
/// line across calls to `push`.
#[derive(Debug, Default)]
pub struct SseTokenizer {
    buffer: String,
}

impl SseTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning zero or more complete `data:` payload
    /// strings extracted from it (in order). Non-UTF8 bytes are replaced
    /// lossily; other SSE fields (`event:`, `id:`, comments) are ignored —
    /// the dialects this gateway bridges only ever use bare `data:` lines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if let Some(payload) = line.strip_prefix("data:") {
                out.push(payload.trim_start().to_string());
            }
        }
        out
    }
}

/// Serialize a named SSE event with a JSON-encodable payload:
/// `event: <name>\ndata: <json>\n\n`.
pub fn format_event(event: &str, data: &serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Serialize an unnamed (bare `data:`) SSE event, as OpenAI-style streams use.
pub fn format_data(data: &serde_json::Value) -> String {
    format!("data: {}\n\n", data)
}

/// The literal `data: [DONE]\n\n` terminator OpenAI-compatible streams send.
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_retains_partial_lines_across_pushes() {
        let mut tok = SseTokenizer::new();
        assert!(tok.push(b"data: {\"a\":1}\ndata: [DO").is_empty() == false);
        let second = tok.push(b"NE]\n\n");
        assert_eq!(second, vec!["[DONE]".to_string()]);
    }

    #[test]
    fn tokenizer_splits_arbitrary_chunk_boundaries_identically() {
        let full = b"data: {\"x\":1}\ndata: {\"x\":2}\ndata: [DONE]\n\n".to_vec();
        for split_at in 0..full.len() {
            let mut tok = SseTokenizer::new();
            let mut all = tok.push(&full[..split_at]);
            all.extend(tok.push(&full[split_at..]));
            assert_eq!(
                all,
                vec![
                    "{\"x\":1}".to_string(),
                    "{\"x\":2}".to_string(),
                    "[DONE]".to_string()
                ],
                "split at {split_at} produced different events"
            );
        }
    }
}
