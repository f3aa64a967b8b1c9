//! OpenAI Responses API <-> OpenAI Chat Completions translation (§4.3.4,
//! non-streaming half). See [`super::responses_stream`] for the SSE side.

use serde_json::{json, Value};

/// Translate a Responses API request body into a Chat Completions request
/// body.
pub fn request_to_openai(responses: &Value) -> Value {
    let mut messages = Vec::new();

    if let Some(instructions) = responses.get("instructions").and_then(|v| v.as_str()) {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    match responses.get("input") {
        Some(Value::String(s)) => {
            messages.push(json!({"role": "user", "content": s}));
        }
        Some(Value::Array(items)) => {
            let mut pending_calls: Vec<Value> = Vec::new();
            let flush = |pending: &mut Vec<Value>, out: &mut Vec<Value>| {
                if !pending.is_empty() {
                    out.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": std::mem::take(pending),
                    }));
                }
            };

            for item in items {
                match item.get("type").and_then(|v| v.as_str()) {
                    Some("function_call") => {
                        let call_id = item.get("call_id").cloned().unwrap_or(Value::Null);
                        let name = item.get("name").cloned().unwrap_or(Value::Null);
                        let arguments = item.get("arguments").cloned().unwrap_or(json!("{}"));
                        pending_calls.push(json!({
                            "id": call_id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments}
                        }));
                    }
                    Some("function_call_output") => {
                        flush(&mut pending_calls, &mut messages);
                        let call_id = item.get("call_id").cloned().unwrap_or(Value::Null);
                        let output = item.get("output").cloned().unwrap_or(Value::Null);
                        let content = match output {
                            Value::String(s) => s,
                            other => serde_json::to_string(&other).unwrap_or_default(),
                        };
                        messages.push(json!({"role": "tool", "tool_call_id": call_id, "content": content}));
                    }
                    _ => {
                        flush(&mut pending_calls, &mut messages);
                        let role = match item.get("role").and_then(|v| v.as_str()) {
                            Some("developer") => "system",
                            Some(other) => other,
                            None => "user",
                        };
                        let content = translate_input_content(item.get("content").unwrap_or(&Value::Null));
                        messages.push(json!({"role": role, "content": content}));
                    }
                }
            }
            flush(&mut pending_calls, &mut messages);
        }
        _ => {}
    }

    let mut out = json!({ "messages": messages });
    let obj = out.as_object_mut().unwrap();

    if let Some(tools) = responses.get("tools").and_then(|v| v.as_array()) {
        let translated: Vec<Value> = tools
            .iter()
            .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("function"))
            .map(translate_tool)
            .collect();
        obj.insert("tools".to_string(), Value::Array(translated));
    }
    if let Some(tc) = responses.get("tool_choice") {
        obj.insert("tool_choice".to_string(), tc.clone());
    }
    if let Some(v) = responses.get("max_output_tokens") {
        obj.insert("max_tokens".to_string(), v.clone());
    }
    for key in ["temperature", "top_p", "stream"] {
        if let Some(v) = responses.get(key) {
            obj.insert(key.to_string(), v.clone());
        }
    }

    out
}

/// A message item's `content` is either a bare string or an array of
/// `input_text`/`input_image` parts.
fn translate_input_content(content: &Value) -> Value {
    match content {
        Value::String(_) => content.clone(),
        Value::Array(parts) => {
            let translated: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p.get("type").and_then(|v| v.as_str()) {
                    Some("input_text") => Some(json!({
                        "type": "text",
                        "text": p.get("text").cloned().unwrap_or(Value::Null)
                    })),
                    Some("input_image") => Some(json!({
                        "type": "image_url",
                        "image_url": {"url": p.get("image_url").cloned().unwrap_or(Value::Null)}
                    })),
                    _ => None,
                })
                .collect();
            Value::Array(translated)
        }
        _ => Value::String(String::new()),
    }
}

/// Responses-style tool, either flat (`{type, name, description,
/// parameters}`) or nested (`{type, function: {name, description,
/// parameters}}`), to the nested Chat Completions shape.
fn translate_tool(tool: &Value) -> Value {
    let source = tool.get("function").unwrap_or(tool);
    json!({
        "type": "function",
        "function": {
            "name": source.get("name").cloned().unwrap_or(Value::Null),
            "description": source.get("description").cloned().unwrap_or(Value::Null),
            "parameters": source.get("parameters").cloned().unwrap_or(json!({})),
        }
    })
}

/// Translate a non-streaming Chat Completions response into a Responses API
/// response object.
pub fn response_from_openai(openai: &Value, original_model: &str) -> Value {
    let choice = openai.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let mut output = Vec::new();
    if let Some(tool_calls) = message.and_then(|m| m.get("tool_calls")).and_then(|v| v.as_array()) {
        for tc in tool_calls {
            let call_id = tc.get("id").cloned().unwrap_or(Value::Null);
            let function = tc.get("function");
            output.push(json!({
                "type": "function_call",
                "call_id": call_id,
                "name": function.and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
                "arguments": function.and_then(|f| f.get("arguments")).cloned().unwrap_or(json!("{}")),
            }));
        }
    }

    let text = message.and_then(|m| m.get("content")).and_then(|v| v.as_str()).unwrap_or("");
    if !text.is_empty() || output.is_empty() {
        output.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}]
        }));
    }

    let id = openai
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| format!("resp_{}", s))
        .unwrap_or_else(|| format!("resp_{}", chrono::Utc::now().timestamp_millis()));

    let usage = openai.get("usage");
    let input_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);

    json!({
        "id": id,
        "object": "response",
        "status": "completed",
        "model": original_model,
        "output": output,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_input_becomes_single_user_message() {
        let req = json!({"model": "gpt-4o", "input": "hello there"});
        let out = request_to_openai(&req);
        assert_eq!(
            out["messages"],
            json!([{"role": "user", "content": "hello there"}])
        );
    }

    #[test]
    fn instructions_become_leading_system_message() {
        let req = json!({"instructions": "be terse", "input": "hi"});
        let out = request_to_openai(&req);
        assert_eq!(out["messages"][0], json!({"role": "system", "content": "be terse"}));
    }

    #[test]
    fn function_call_and_output_round_trip_through_messages() {
        let req = json!({
            "input": [
                {"type": "function_call", "call_id": "c1", "name": "f", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "c1", "output": "42"}
            ]
        });
        let out = request_to_openai(&req);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["tool_calls"][0]["function"]["name"], json!("f"));
        assert_eq!(messages[1]["role"], json!("tool"));
        assert_eq!(messages[1]["tool_call_id"], json!("c1"));
    }

    #[test]
    fn developer_role_maps_to_system() {
        let req = json!({
            "input": [{"type": "message", "role": "developer", "content": "rules"}]
        });
        let out = request_to_openai(&req);
        assert_eq!(out["messages"][0]["role"], json!("system"));
    }

    #[test]
    fn flat_tool_schema_is_nested_for_chat_completions() {
        let req = json!({
            "input": "hi",
            "tools": [{"type": "function", "name": "f", "parameters": {"type": "object"}}]
        });
        let out = request_to_openai(&req);
        assert_eq!(out["tools"][0]["function"]["name"], json!("f"));
    }

    #[test]
    fn nested_tool_schema_is_also_accepted() {
        let req = json!({
            "input": "hi",
            "tools": [{
                "type": "function",
                "function": {"name": "f", "description": "d", "parameters": {"type": "object"}}
            }]
        });
        let out = request_to_openai(&req);
        assert_eq!(out["tools"][0]["function"]["name"], json!("f"));
        assert_eq!(out["tools"][0]["function"]["description"], json!("d"));
    }

    #[test]
    fn response_wraps_text_in_message_output_item() {
        let openai = json!({
            "id": "abc",
            "choices": [{"message": {"content": "hi there"}}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 3}
        });
        let out = response_from_openai(&openai, "gpt-4o");
        assert_eq!(out["status"], json!("completed"));
        assert_eq!(out["output"][0]["type"], json!("message"));
        assert_eq!(out["output"][0]["content"][0]["text"], json!("hi there"));
        assert_eq!(out["usage"]["total_tokens"], json!(5));
    }

    #[test]
    fn response_emits_function_call_items_before_message() {
        let openai = json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "c1", "function": {"name": "f", "arguments": "{}"}}
            ]}}]
        });
        let out = response_from_openai(&openai, "gpt-4o");
        let output = out["output"].as_array().unwrap();
        assert_eq!(output[0]["type"], json!("function_call"));
        assert_eq!(output.len(), 1);
    }
}
