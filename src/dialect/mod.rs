//! Dialect transformation (C3): detect which of the three supported wire
//! dialects a client request is using, normalize its path, and translate
//! request/response bodies (including streamed SSE) to and from the
//! upstream's OpenAI Chat Completions dialect.

pub mod anthropic;
pub mod anthropic_stream;
pub mod responses;
pub mod responses_stream;

/// One of the three client-facing wire dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAiChat,
    Anthropic,
    Responses,
}

/// Detect the dialect of a decoded request body by field presence (§4.3).
/// Responses API is checked first, then Anthropic; anything else is treated
/// as OpenAI Chat Completions.
pub fn detect(body: &serde_json::Value) -> Dialect {
    let has = |key: &str| body.get(key).is_some();

    if has("input") || has("instructions") || has("previous_response_id") {
        return Dialect::Responses;
    }
    if has("system") || has("stop_sequences") || has("top_k") {
        return Dialect::Anthropic;
    }
    Dialect::OpenAiChat
}

/// Normalize an inbound request path per §4.3: strip `/claude` and `/openai`
/// prefixes, collapse a doubled `/v1/v1/` segment, and route dialect-specific
/// entry points to the upstream OpenAI Chat Completions path.
pub fn normalize_path(path: &str, dialect: Dialect, passthrough: bool) -> String {
    let mut path = path.to_string();
    for prefix in ["/claude", "/openai"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            path = rest.to_string();
            break;
        }
    }
    if let Some(rest) = path.strip_prefix("/v1/v1/") {
        path = format!("/v1/{}", rest);
    }

    match dialect {
        Dialect::Anthropic if path == "/v1/messages" || path == "/messages" => {
            "/v1/chat/completions".to_string()
        }
        Dialect::Responses if !passthrough && (path == "/v1/responses" || path == "/responses") => {
            "/v1/chat/completions".to_string()
        }
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_responses_api_by_field_presence() {
        assert_eq!(detect(&json!({"input": "hi"})), Dialect::Responses);
        assert_eq!(detect(&json!({"instructions": "be nice"})), Dialect::Responses);
        assert_eq!(
            detect(&json!({"previous_response_id": "r1"})),
            Dialect::Responses
        );
    }

    #[test]
    fn detects_anthropic_when_not_responses() {
        assert_eq!(detect(&json!({"system": "s", "messages": []})), Dialect::Anthropic);
        assert_eq!(detect(&json!({"stop_sequences": ["x"]})), Dialect::Anthropic);
        assert_eq!(detect(&json!({"top_k": 5})), Dialect::Anthropic);
    }

    #[test]
    fn defaults_to_openai_chat() {
        assert_eq!(detect(&json!({"model": "gpt-4o", "messages": []})), Dialect::OpenAiChat);
    }

    #[test]
    fn strips_prefixes_and_collapses_double_v1() {
        assert_eq!(
            normalize_path("/claude/v1/v1/messages", Dialect::Anthropic, false),
            "/v1/chat/completions"
        );
        assert_eq!(
            normalize_path("/openai/v1/chat/completions", Dialect::OpenAiChat, false),
            "/v1/chat/completions"
        );
    }

    #[test]
    fn passthrough_responses_path_is_untouched() {
        assert_eq!(
            normalize_path("/v1/responses", Dialect::Responses, true),
            "/v1/responses"
        );
    }
}
