//! Anthropic Messages streaming translation (§4.3.3): turns a stream of
//! OpenAI-dialect SSE chunks into the Anthropic
//! `message_start`/`content_block_*`/`message_delta`/`message_stop` event
//! sequence.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::sse::format_event;

use super::anthropic::map_finish_reason;

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenBlock {
    Text { index: usize },
}

struct ToolAccum {
    id: String,
    name: String,
    args: String,
}

/// Per-request state machine. One instance per streamed response; not
/// shared across requests.
pub struct AnthropicStreamTranslator {
    id: String,
    model: String,
    started: bool,
    finished: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    tool_order: Vec<u64>,
    tools: HashMap<u64, ToolAccum>,
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicStreamTranslator {
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            model,
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            tool_order: Vec::new(),
            tools: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Feed one decoded OpenAI SSE `data:` payload (either a JSON chunk or
    /// the literal `[DONE]`), returning zero or more fully-formatted
    /// Anthropic SSE events to forward to the client.
    pub fn push(&mut self, payload: &str) -> Vec<String> {
        if payload == "[DONE]" {
            return self.finish(None);
        }

        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        self.ensure_started(&mut out);

        if let Some(usage) = chunk.get("usage") {
            if let Some(p) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.input_tokens = p;
            }
            if let Some(c) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.output_tokens = c;
            }
        }

        let choice = chunk.get("choices").and_then(|c| c.get(0));
        let delta = choice.and_then(|c| c.get("delta"));

        if let Some(text) = delta.and_then(|d| d.get("content")).and_then(|v| v.as_str()) {
            if !text.is_empty() {
                self.open_text(&mut out);
                out.push(format_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.text_index(),
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
                self.output_tokens += (text.len() as u64 + 3) / 4;
            }
        }

        if let Some(tool_calls) = delta.and_then(|d| d.get("tool_calls")).and_then(|v| v.as_array()) {
            if !tool_calls.is_empty() {
                self.close_open(&mut out);
            }
            for tc in tool_calls {
                let openai_index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                self.accumulate_tool(openai_index, tc);
            }
        }

        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if let Some(reason) = finish_reason {
            out.extend(self.finish(Some(reason)));
        }

        out
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(format_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0}
                }
            }),
        ));
    }

    fn close_open(&mut self, out: &mut Vec<String>) {
        if let Some(block) = self.open.take() {
            let index = match block {
                OpenBlock::Text { index } => index,
            };
            out.push(format_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    fn open_text(&mut self, out: &mut Vec<String>) {
        if matches!(self.open, Some(OpenBlock::Text { .. })) {
            return;
        }
        self.close_open(out);
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(OpenBlock::Text { index });
        out.push(format_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""}
            }),
        ));
    }

    fn text_index(&self) -> usize {
        match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => 0,
        }
    }

    /// Accrete a tool-call delta's `id`/`name`/`arguments` fragment. No
    /// events are emitted here — tool calls are purely accumulated during
    /// streaming and materialised as a single block only at `finish`.
    fn accumulate_tool(&mut self, openai_index: u64, tc: &Value) {
        if !self.tools.contains_key(&openai_index) {
            self.tool_order.push(openai_index);
            self.tools.insert(
                openai_index,
                ToolAccum {
                    id: String::new(),
                    name: String::new(),
                    args: String::new(),
                },
            );
        }
        let entry = self.tools.get_mut(&openai_index).unwrap();
        if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
            entry.id = id.to_string();
        }
        if let Some(name) = tc.get("function").and_then(|f| f.get("name")).and_then(|v| v.as_str()) {
            entry.name = name.to_string();
        }
        if let Some(args) = tc.get("function").and_then(|f| f.get("arguments")).and_then(|v| v.as_str()) {
            entry.args.push_str(args);
        }
    }

    /// Close any open block, materialise accumulated tool calls, and emit
    /// `message_delta`/`message_stop`. Safe to call more than once (a
    /// `finish_reason` chunk followed by `[DONE]`) — the second call is a
    /// no-op.
    fn finish(&mut self, finish_reason: Option<String>) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open(&mut out);

        for openai_index in std::mem::take(&mut self.tool_order) {
            let Some(tool) = self.tools.remove(&openai_index) else { continue };
            let index = self.next_index;
            self.next_index += 1;
            out.push(format_event(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "tool_use", "id": tool.id, "name": tool.name, "input": {}}
                }),
            ));
            let parsed: Value = serde_json::from_str(&tool.args)
                .unwrap_or_else(|_| json!({"raw": tool.args}));
            out.push(format_event(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "input_json_delta", "partial_json": serde_json::to_string(&parsed).unwrap_or_default()}
                }),
            ));
            out.push(format_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }

        let stop_reason = map_finish_reason(finish_reason.as_deref());
        out.push(format_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {"output_tokens": self.output_tokens}
            }),
        ));
        out.push(format_event("message_stop", &json!({"type": "message_stop"})));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_only_stream_produces_full_event_sequence() {
        let mut t = AnthropicStreamTranslator::new("msg_1".to_string(), "claude-sonnet".to_string());
        let mut events = Vec::new();
        events.extend(t.push(r#"{"choices":[{"delta":{"content":"hel"}}]}"#));
        events.extend(t.push(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#));
        events.extend(t.push("[DONE]"));

        let joined = events.concat();
        assert!(joined.contains("event: message_start"));
        assert!(joined.contains("event: content_block_start"));
        assert!(joined.contains("\"text\":\"hel\""));
        assert!(joined.contains("\"text\":\"lo\""));
        assert!(joined.contains("event: content_block_stop"));
        assert!(joined.contains("\"stop_reason\":\"end_turn\""));
        assert!(joined.contains("event: message_stop"));
        // [DONE] after finish_reason must be a no-op, not a second message_stop.
        assert_eq!(joined.matches("event: message_stop").count(), 1);
    }

    #[test]
    fn tool_call_arguments_accumulate_silently_until_finish() {
        let mut t = AnthropicStreamTranslator::new("msg_2".to_string(), "claude-sonnet".to_string());
        let mut events = Vec::new();
        events.extend(t.push(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"f","arguments":""}}]}}]}"#,
        ));
        events.extend(t.push(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":"}}]}}]}"#,
        ));
        // Two accumulation-only chunks before finish_reason must emit nothing
        // but the message_start on the very first push.
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("event: message_start"));

        events.extend(t.push(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]},"finish_reason":"tool_calls"}]}"#,
        ));

        // Exactly one content_block_start/delta/stop triple for the merged
        // tool call, regardless of how the upstream chunked `arguments`.
        assert_eq!(events.len(), 1 + 5);
        let kinds: Vec<&str> = events[1..]
            .iter()
            .map(|e| e.lines().next().unwrap().trim_start_matches("event: "))
            .collect();
        assert_eq!(
            kinds,
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let joined = events.concat();
        assert!(joined.contains("\"type\":\"tool_use\""));
        assert!(joined.contains("\"name\":\"f\""));
        assert!(joined.contains("\"type\":\"input_json_delta\""));
        assert!(joined.contains("\"partial_json\":\"{\\\"a\\\":1}\""));
        assert!(joined.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn text_output_tokens_are_estimated_from_chunk_length() {
        let mut t = AnthropicStreamTranslator::new("msg_3".to_string(), "claude-sonnet".to_string());
        t.push(r#"{"choices":[{"delta":{"content":"hello"}}]}"#);
        let events = t.push(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        let joined = events.concat();
        // ceil(5/4) == 2, no explicit usage field was ever supplied.
        assert!(joined.contains("\"output_tokens\":2"));
    }
}
