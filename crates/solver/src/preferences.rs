use tracing::debug;

use crate::config::ApiConfig;

pub const DEFAULT_LANGUAGE: &str = "python";

pub const SUPPORTED_LANGUAGES: [&str; 6] = ["python", "javascript", "java", "cpp", "go", "rust"];

/// Environment variable consulted when the config carries no key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Normalize a requested solution language. Unknown or missing values fall
/// back to [`DEFAULT_LANGUAGE`].
pub fn language_preference(requested: Option<&str>) -> &'static str {
    let Some(requested) = requested.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_LANGUAGE;
    };
    let lowered = requested.to_ascii_lowercase();
    match SUPPORTED_LANGUAGES.iter().copied().find(|lang| *lang == lowered) {
        Some(lang) => lang,
        None => {
            debug!(requested, "Unsupported language, using {DEFAULT_LANGUAGE}");
            DEFAULT_LANGUAGE
        }
    }
}

/// The model credential: the configured key, else `GEMINI_API_KEY`.
/// Blank values count as absent.
pub fn model_credential(api: &ApiConfig) -> Option<String> {
    credential_from(&api.key, std::env::var(API_KEY_ENV).ok())
}

fn credential_from(configured: &str, env: Option<String>) -> Option<String> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    env.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
