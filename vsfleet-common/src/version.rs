// Version information reported to the host runtime at Init.
// Read from the deployment environment at runtime, with fixed fallbacks.

use std::env;

pub const DEFAULT_VERSION: &str = "0.1.0";
pub const DEFAULT_BUILD_INFO: &str = "HEAD";

/// Provider version from `VERSION`, falling back to `0.1.0`.
pub fn provider_version() -> String {
    non_empty_or(env::var("VERSION").ok(), DEFAULT_VERSION)
}

/// Build identifier from `BUILD_INFO`, falling back to `HEAD`.
pub fn build_info() -> String {
    non_empty_or(env::var("BUILD_INFO").ok(), DEFAULT_BUILD_INFO)
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_fall_back() {
        assert_eq!(non_empty_or(None, DEFAULT_VERSION), "0.1.0");
        assert_eq!(non_empty_or(Some("  ".to_string()), DEFAULT_BUILD_INFO), "HEAD");
        assert_eq!(non_empty_or(Some(" 1.4.2 ".to_string()), DEFAULT_VERSION), "1.4.2");
    }
}
