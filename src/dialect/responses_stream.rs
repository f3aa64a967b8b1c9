//! OpenAI Responses API streaming translation (§4.3.4, streaming half):
//! turns OpenAI Chat Completions SSE chunks into the Responses API's
//! `response.*` event sequence, materializing `response.completed` as soon
//! as a `finish_reason` is seen rather than waiting for `[DONE]` — some
//! upstreams omit or delay it.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::sse::format_event;

struct ToolItem {
    output_index: usize,
    call_id: String,
    name: String,
    args: String,
}

pub struct ResponsesStreamTranslator {
    id: String,
    model: String,
    created: bool,
    finished: bool,
    next_output_index: usize,
    text_index: Option<usize>,
    text_buf: String,
    tool_order: Vec<u64>,
    tools: HashMap<u64, ToolItem>,
    input_tokens: u64,
    output_tokens: u64,
}

impl ResponsesStreamTranslator {
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            model,
            created: false,
            finished: false,
            next_output_index: 0,
            text_index: None,
            text_buf: String::new(),
            tool_order: Vec::new(),
            tools: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn push(&mut self, payload: &str) -> Vec<String> {
        if payload == "[DONE]" {
            return self.finish();
        }

        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        self.ensure_created(&mut out);

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
                let index = self.open_text(&mut out);
                self.text_buf.push_str(text);
                out.push(format_event(
                    "response.output_text.delta",
                    &json!({"type": "response.output_text.delta", "output_index": index, "content_index": 0, "delta": text}),
                ));
            }
        }

        if let Some(tool_calls) = delta.and_then(|d| d.get("tool_calls")).and_then(|v| v.as_array()) {
            for tc in tool_calls {
                let openai_index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let index = self.open_tool(openai_index, tc, &mut out);
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    if !args.is_empty() {
                        self.tools.get_mut(&openai_index).unwrap().args.push_str(args);
                        out.push(format_event(
                            "response.function_call_arguments.delta",
                            &json!({"type": "response.function_call_arguments.delta", "output_index": index, "delta": args}),
                        ));
                    }
                }
            }
        }

        if choice.and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str()).is_some() {
            out.extend(self.finish());
        }

        out
    }

    fn ensure_created(&mut self, out: &mut Vec<String>) {
        if self.created {
            return;
        }
        self.created = true;
        out.push(format_event(
            "response.created",
            &json!({
                "type": "response.created",
                "response": {"id": self.id, "object": "response", "status": "in_progress", "model": self.model, "output": []}
            }),
        ));
    }

    fn open_text(&mut self, out: &mut Vec<String>) -> usize {
        if let Some(index) = self.text_index {
            return index;
        }
        let index = self.next_output_index;
        self.next_output_index += 1;
        self.text_index = Some(index);
        out.push(format_event(
            "response.output_item.added",
            &json!({
                "type": "response.output_item.added",
                "output_index": index,
                "item": {"type": "message", "role": "assistant", "content": []}
            }),
        ));
        out.push(format_event(
            "response.content_part.added",
            &json!({
                "type": "response.content_part.added",
                "output_index": index,
                "content_index": 0,
                "part": {"type": "output_text", "text": ""}
            }),
        ));
        index
    }

    fn open_tool(&mut self, openai_index: u64, tc: &Value, out: &mut Vec<String>) -> usize {
        if let Some(item) = self.tools.get(&openai_index) {
            return item.output_index;
        }
        let index = self.next_output_index;
        self.next_output_index += 1;
        let call_id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let name = tc
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        self.tool_order.push(openai_index);
        self.tools.insert(
            openai_index,
            ToolItem {
                output_index: index,
                call_id: call_id.clone(),
                name: name.clone(),
                args: String::new(),
            },
        );
        out.push(format_event(
            "response.output_item.added",
            &json!({
                "type": "response.output_item.added",
                "output_index": index,
                "item": {"type": "function_call", "call_id": call_id, "name": name, "arguments": ""}
            }),
        ));
        index
    }

    /// Close any open items, materialize the final output array, and emit
    /// `response.completed`. Idempotent: a later `[DONE]` after an earlier
    /// `finish_reason` chunk is a no-op.
    fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        self.ensure_created(&mut out);

        let mut output = Vec::new();

        if let Some(index) = self.text_index {
            out.push(format_event(
                "response.output_text.done",
                &json!({"type": "response.output_text.done", "output_index": index, "content_index": 0, "text": self.text_buf}),
            ));
            out.push(format_event(
                "response.content_part.done",
                &json!({
                    "type": "response.content_part.done",
                    "output_index": index,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": self.text_buf}
                }),
            ));
            let item = json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": self.text_buf}]
            });
            out.push(format_event(
                "response.output_item.done",
                &json!({"type": "response.output_item.done", "output_index": index, "item": item}),
            ));
            output.push((index, item));
        }

        for openai_index in &self.tool_order {
            let item_data = self.tools.get(openai_index).unwrap();
            let index = item_data.output_index;
            out.push(format_event(
                "response.function_call_arguments.done",
                &json!({"type": "response.function_call_arguments.done", "output_index": index, "arguments": item_data.args}),
            ));
            let item = json!({
                "type": "function_call",
                "call_id": item_data.call_id,
                "name": item_data.name,
                "arguments": item_data.args
            });
            out.push(format_event(
                "response.output_item.done",
                &json!({"type": "response.output_item.done", "output_index": index, "item": item}),
            ));
            output.push((index, item));
        }

        output.sort_by_key(|(index, _)| *index);
        let output: Vec<Value> = output.into_iter().map(|(_, item)| item).collect();

        out.push(format_event(
            "response.completed",
            &json!({
                "type": "response.completed",
                "response": {
                    "id": self.id,
                    "object": "response",
                    "status": "completed",
                    "model": self.model,
                    "output": output,
                    "usage": {
                        "input_tokens": self.input_tokens,
                        "output_tokens": self.output_tokens,
                        "total_tokens": self.input_tokens + self.output_tokens,
                    }
                }
            }),
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_stream_emits_created_then_text_events_then_completed() {
        let mut t = ResponsesStreamTranslator::new("resp_1".to_string(), "gpt-4o".to_string());
        let mut events = Vec::new();
        events.extend(t.push(r#"{"choices":[{"delta":{"content":"hi"}}]}"#));
        events.extend(t.push(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
        events.extend(t.push("[DONE]"));

        let joined = events.concat();
        assert!(joined.contains("event: response.created"));
        assert!(joined.contains("event: response.output_text.delta"));
        assert!(joined.contains("event: response.completed"));
        assert_eq!(joined.matches("event: response.completed").count(), 1);
        assert!(joined.contains("\"status\":\"completed\""));
    }

    #[test]
    fn function_call_stream_materializes_arguments_in_final_output() {
        let mut t = ResponsesStreamTranslator::new("resp_2".to_string(), "gpt-4o".to_string());
        let mut events = Vec::new();
        events.extend(t.push(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"f","arguments":""}}]}}]}"#,
        ));
        events.extend(t.push(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":1}"}}]},"finish_reason":"tool_calls"}]}"#,
        ));

        let joined = events.concat();
        assert!(joined.contains("response.function_call_arguments.delta"));
        assert!(joined.contains("\"arguments\":\"{\\\"a\\\":1}\""));
        assert!(joined.contains("\"type\":\"function_call\""));
    }

    #[test]
    fn completes_on_done_when_finish_reason_was_never_sent() {
        let mut t = ResponsesStreamTranslator::new("resp_3".to_string(), "gpt-4o".to_string());
        let mut events = Vec::new();
        events.extend(t.push(r#"{"choices":[{"delta":{"content":"hi"}}]}"#));
        events.extend(t.push("[DONE]"));
        let joined = events.concat();
        assert!(joined.contains("event: response.completed"));
    }
}
