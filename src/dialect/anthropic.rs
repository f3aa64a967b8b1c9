//! Anthropic Messages v1 <-> OpenAI Chat Completions translation (§4.3.1,
//! §4.3.2). Non-streaming only; see [`super::anthropic_stream`] for the SSE
//! side.

use serde_json::{json, Value};

/// Translate an Anthropic Messages request body into an OpenAI Chat
/// Completions request body.
pub fn request_to_openai(anthropic: &Value) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = anthropic.get("system").and_then(|v| v.as_str()) {
        messages.push(json!({"role": "system", "content": system}));
    }

    if let Some(msgs) = anthropic.get("messages").and_then(|v| v.as_array()) {
        for msg in msgs {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            translate_message(role, msg.get("content").unwrap_or(&Value::Null), &mut messages);
        }
    }

    let mut out = json!({ "messages": messages });
    let obj = out.as_object_mut().unwrap();

    if let Some(tools) = anthropic.get("tools").and_then(|v| v.as_array()) {
        let translated: Vec<Value> = tools.iter().map(translate_tool).collect();
        obj.insert("tools".to_string(), Value::Array(translated));
    }
    if let Some(tc) = anthropic.get("tool_choice") {
        obj.insert("tool_choice".to_string(), translate_tool_choice(tc));
    }
    for key in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(v) = anthropic.get(key) {
            obj.insert(key.to_string(), v.clone());
        }
    }
    if let Some(stop) = anthropic.get("stop_sequences") {
        obj.insert("stop".to_string(), stop.clone());
    }

    out
}

/// Walk one Anthropic message's content (string or block array) and push
/// the resulting OpenAI message(s) onto `out`. Text/image content becomes a
/// single message of the same role; `tool_use` blocks become a separate
/// assistant message carrying `tool_calls`; `tool_result` blocks each become
/// their own `role: tool` message.
fn translate_message(role: &str, content: &Value, out: &mut Vec<Value>) {
    let blocks = content_as_blocks(content);

    let mut text_buf = String::new();
    let mut image_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    macro_rules! flush_content {
        () => {
            if !text_buf.is_empty() || !image_parts.is_empty() {
                let content_value = if image_parts.is_empty() {
                    Value::String(std::mem::take(&mut text_buf))
                } else {
                    let mut parts = Vec::new();
                    if !text_buf.is_empty() {
                        parts.push(json!({"type": "text", "text": text_buf}));
                        text_buf = String::new();
                    }
                    parts.extend(image_parts.drain(..));
                    Value::Array(parts)
                };
                out.push(json!({"role": role, "content": content_value}));
            }
        };
    }
    macro_rules! flush_tool_calls {
        () => {
            if !tool_calls.is_empty() {
                out.push(json!({
                    "role": "assistant",
                    "content": Value::Null,
                    "tool_calls": std::mem::take(&mut tool_calls),
                }));
            }
        };
    }

    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_buf.push_str(t);
                }
            }
            Some("image") => {
                if let Some(source) = block.get("source") {
                    let media_type = source
                        .get("media_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("image/png");
                    let data = source.get("data").and_then(|v| v.as_str()).unwrap_or("");
                    image_parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
                    }));
                }
            }
            Some("tool_use") => {
                flush_content!();
                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let input = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(&input).unwrap_or_default(),
                    }
                }));
            }
            Some("tool_result") => {
                flush_content!();
                flush_tool_calls!();
                let tool_use_id = block.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or("");
                let content = block.get("content").cloned().unwrap_or(Value::Null);
                let content_str = stringify_tool_result(&content);
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content_str,
                }));
            }
            _ => {}
        }
    }
    flush_content!();
    flush_tool_calls!();
}

fn stringify_tool_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Normalize a message's `content` field (string or block array) to a
/// uniform `Vec<Value>` of block objects.
fn content_as_blocks(content: &Value) -> Vec<Value> {
    match content {
        Value::String(s) => vec![json!({"type": "text", "text": s})],
        Value::Array(arr) => arr.clone(),
        _ => Vec::new(),
    }
}

fn translate_tool(tool: &Value) -> Value {
    let name = tool.get("name").cloned().unwrap_or(Value::Null);
    let description = tool.get("description").cloned().unwrap_or(Value::Null);
    let mut schema = tool.get("input_schema").cloned().unwrap_or(json!({}));
    clean_schema(&mut schema);
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": schema,
        }
    })
}

/// Drop `$schema`/`title`/`examples`, recurse into `properties`, and strip
/// `format` on string-typed properties (§4.3.1).
fn clean_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    obj.remove("$schema");
    obj.remove("title");
    obj.remove("examples");

    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for (_, prop) in props.iter_mut() {
            clean_schema(prop);
            if prop.get("type").and_then(|v| v.as_str()) == Some("string") {
                if let Some(prop_obj) = prop.as_object_mut() {
                    prop_obj.remove("format");
                }
            }
        }
    }
}

fn translate_tool_choice(tc: &Value) -> Value {
    match tc {
        Value::String(s) if s == "auto" => Value::String("auto".to_string()),
        Value::String(s) if s == "none" => Value::String("none".to_string()),
        Value::String(s) if s == "any" || s == "required" => Value::String("required".to_string()),
        Value::Object(obj) => match obj.get("type").and_then(|v| v.as_str()) {
            Some("auto") => Value::String("auto".to_string()),
            Some("any") => Value::String("required".to_string()),
            Some("tool") => {
                let name = obj.get("name").cloned().unwrap_or(Value::Null);
                json!({"type": "function", "function": {"name": name}})
            }
            _ => Value::String("auto".to_string()),
        },
        _ => Value::String("auto".to_string()),
    }
}

/// Map an OpenAI `finish_reason` to an Anthropic `stop_reason`.
pub fn map_finish_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

/// Translate a non-streaming OpenAI Chat Completions response into an
/// Anthropic Messages response, using `original_model` as the client-visible
/// model id (§4.3.2).
pub fn response_from_openai(openai: &Value, original_model: &str) -> Value {
    // Already Anthropic-shaped (pass-through from an Anthropic-native upstream).
    if openai.get("type").and_then(|v| v.as_str()) == Some("message") && openai.get("content").is_some() {
        return openai.clone();
    }

    let choice = openai.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let mut blocks = Vec::new();
    if let Some(text) = message.and_then(|m| m.get("content")).and_then(|v| v.as_str()) {
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(tool_calls) = message.and_then(|m| m.get("tool_calls")).and_then(|v| v.as_array()) {
        for tc in tool_calls {
            let id = tc.get("id").cloned().unwrap_or(Value::Null);
            let function = tc.get("function");
            let name = function.and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null);
            let arguments = function.and_then(|f| f.get("arguments")).and_then(|v| v.as_str()).unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments)
                .unwrap_or_else(|_| json!({"raw": arguments}));
            blocks.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
        }
    }
    if blocks.is_empty() {
        blocks.push(json!({"type": "text", "text": ""}));
    }

    let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str());
    let stop_reason = map_finish_reason(finish_reason);

    let usage = openai.get("usage");
    let input_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);

    let id = openai
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("msg_{}", chrono::Utc::now().timestamp_millis()));

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "content": blocks,
        "model": original_model,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_system_and_text_message() {
        let req = json!({
            "model": "claude-sonnet",
            "max_tokens": 100,
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let out = request_to_openai(&req);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0], json!({"role": "system", "content": "be terse"}));
        assert_eq!(messages[1], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn translates_tool_use_and_tool_result() {
        let req = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "calling"},
                    {"type": "tool_use", "id": "t1", "name": "f", "input": {"x": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
                ]}
            ]
        });
        let out = request_to_openai(&req);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"], json!("calling"));
        assert_eq!(messages[1]["tool_calls"][0]["function"]["name"], json!("f"));
        assert_eq!(messages[2]["role"], json!("tool"));
        assert_eq!(messages[2]["tool_call_id"], json!("t1"));
    }

    #[test]
    fn cleans_tool_schema() {
        let tool = json!({
            "name": "f",
            "description": "d",
            "input_schema": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "F",
                "type": "object",
                "properties": {
                    "name": {"type": "string", "format": "email", "examples": ["a@b.com"]}
                }
            }
        });
        let translated = translate_tool(&tool);
        let params = &translated["function"]["parameters"];
        assert!(params.get("$schema").is_none());
        assert!(params.get("title").is_none());
        assert!(params["properties"]["name"].get("format").is_none());
    }

    #[test]
    fn tool_choice_mapping() {
        assert_eq!(translate_tool_choice(&json!("auto")), json!("auto"));
        assert_eq!(translate_tool_choice(&json!("none")), json!("none"));
        assert_eq!(translate_tool_choice(&json!("required")), json!("required"));
        assert_eq!(
            translate_tool_choice(&json!({"type": "tool", "name": "f"})),
            json!({"type": "function", "function": {"name": "f"}})
        );
    }

    #[test]
    fn seed_scenario_1_text_only_response() {
        let openai = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1}
        });
        let out = response_from_openai(&openai, "claude-sonnet");
        assert_eq!(out["type"], json!("message"));
        assert_eq!(out["role"], json!("assistant"));
        assert_eq!(out["content"], json!([{"type": "text", "text": "hello"}]));
        assert_eq!(out["model"], json!("claude-sonnet"));
        assert_eq!(out["stop_reason"], json!("end_turn"));
        assert_eq!(out["usage"], json!({"input_tokens": 3, "output_tokens": 1}));
    }

    #[test]
    fn tool_calls_translate_to_ordered_tool_use_blocks() {
        let openai = json!({
            "choices": [{"message": {"role": "assistant", "tool_calls": [
                {"id": "c1", "function": {"name": "f1", "arguments": "{\"a\":1}"}},
                {"id": "c2", "function": {"name": "f2", "arguments": "{\"b\":2}"}}
            ]}, "finish_reason": "tool_calls"}]
        });
        let out = response_from_openai(&openai, "m");
        let blocks = out["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["name"], json!("f1"));
        assert_eq!(blocks[1]["name"], json!("f2"));
        assert_eq!(out["stop_reason"], json!("tool_use"));
    }
}
