use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// Appends `/v1` unless the URL already carries a version segment.
/// A trailing `#` opts out and is stripped.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.trim_end_matches('/').to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(without_slash) || without_slash.contains("/v1/") {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}

/// Uses the configured URL when present, the provider default otherwise.
pub fn resolve_base_url(configured: &str, provider_default: &str) -> String {
    if configured.trim().is_empty() {
        normalize_base_url(provider_default)
    } else {
        normalize_base_url(configured)
    }
}

pub fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}
