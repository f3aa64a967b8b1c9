//! Model routing (C4): map a client-requested model name to an effective
//! model, then narrow the provider set to those that can serve it.

use std::collections::HashMap;

use crate::config::Provider;

/// Map `requested` to an effective model name per §4.4.
///
/// The fallthrough order here is load-bearing and intentionally preserved
/// even though it looks surprising: a provider-supported model wins over the
/// bare `*` wildcard, but loses to an exact or `prefix*` mapping entry. See
/// the "Open question" note in the design notes — do not reorder this.
pub fn map_model(
    requested: &str,
    model_mapping: &HashMap<String, String>,
    default_model: Option<&str>,
    providers: &[Provider],
) -> Option<String> {
    if requested.is_empty() {
        return default_model.map(|s| s.to_string());
    }

    if let Some(target) = model_mapping.get(requested) {
        return Some(target.clone());
    }

    if let Some(target) = longest_prefix_wildcard_match(requested, model_mapping) {
        return Some(target);
    }

    if providers.iter().any(|p| p.supports_model(requested)) {
        return Some(requested.to_string());
    }

    if let Some(target) = model_mapping.get("*") {
        return Some(target.clone());
    }

    if let Some(default_model) = default_model {
        return Some(default_model.to_string());
    }

    Some(requested.to_string())
}

/// Find the longest `prefix*` pattern (excluding the bare `*` wildcard) that
/// matches `requested`, returning its mapped target.
fn longest_prefix_wildcard_match(
    requested: &str,
    model_mapping: &HashMap<String, String>,
) -> Option<String> {
    model_mapping
        .iter()
        .filter_map(|(pattern, target)| {
            let prefix = pattern.strip_suffix('*')?;
            if prefix.is_empty() {
                return None; // bare "*" handled separately, later
            }
            if requested.starts_with(prefix) {
                Some((prefix.len(), target.clone()))
            } else {
                None
            }
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, target)| target)
}

/// Narrow `providers` down to the ones that should be tried for `model`.
///
/// If `model` is of the form `provider,model`, the named provider is picked
/// directly (with the model part stripped). Otherwise providers are filtered
/// by support for `model`; if none support it, the *entire* provider set is
/// returned so the load balancer's recovery path still has candidates.
pub fn select_providers<'a>(model: &str, providers: &'a [Provider]) -> (Vec<&'a Provider>, String) {
    if let Some((provider_name, model_name)) = model.split_once(',') {
        if let Some(p) = providers.iter().find(|p| p.name == provider_name) {
            return (vec![p], model_name.to_string());
        }
    }

    let matching: Vec<&Provider> = providers.iter().filter(|p| p.supports_model(model)).collect();
    if matching.is_empty() {
        (providers.iter().collect(), model.to_string())
    } else {
        (matching, model.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider(name: &str, models: &[&str]) -> Provider {
        Provider {
            name: name.to_string(),
            base_url: "https://example.test".parse().unwrap(),
            models: models.iter().map(|m| m.to_string()).collect(),
            api_keys: vec!["k".to_string()],
            priority: None,
            weight: 1,
            timeout_ms: 60_000,
            headers: HashMap::new(),
            tool_format: crate::config::ToolFormat::Openai,
        }
    }

    #[test]
    fn empty_model_uses_default() {
        assert_eq!(
            map_model("", &HashMap::new(), Some("gpt-4o"), &[]),
            Some("gpt-4o".to_string())
        );
    }

    #[test]
    fn supported_model_passes_through_without_mapping() {
        let providers = vec![provider("a", &["gpt-4o"])];
        assert_eq!(
            map_model("gpt-4o", &HashMap::new(), Some("other"), &providers),
            Some("gpt-4o".to_string())
        );
    }

    #[test]
    fn wildcard_mapping_applies_when_model_mapping_present() {
        let mut mapping = HashMap::new();
        mapping.insert("claude-*".to_string(), "gpt-4o".to_string());
        mapping.insert("*".to_string(), "gpt-3.5".to_string());
        let providers = vec![provider("a", &["gpt-4o", "gpt-3.5"])];

        assert_eq!(
            map_model("claude-sonnet", &mapping, None, &providers),
            Some("gpt-4o".to_string())
        );
        assert_eq!(
            map_model("mystery", &mapping, None, &providers),
            Some("gpt-3.5".to_string())
        );
    }

    #[test]
    fn explicit_provider_prefixed_model_selects_that_provider() {
        let providers = vec![provider("a", &["m"]), provider("b", &["m"])];
        let (selected, model) = select_providers("b,special-model", &providers);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "b");
        assert_eq!(model, "special-model");
    }

    #[test]
    fn unsupported_model_falls_back_to_full_provider_set() {
        let providers = vec![provider("a", &["m1"]), provider("b", &["m2"])];
        let (selected, _) = select_providers("unknown", &providers);
        assert_eq!(selected.len(), 2);
    }
}
