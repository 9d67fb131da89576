//! Known source identifiers and subscription patterns.
//!
//! The plant floor runs a fixed fleet of monitored motor-pumps; each one
//! publishes under a stable identifier. The registry is the single place
//! that knows which identifiers are expected, so rotation and promotion can
//! classify rows the same way.

use regex::Regex;
use std::sync::LazyLock;

/// Motor-pump identifiers monitored by default.
///
/// Overridable at daemon startup; these match the commissioning defaults.
pub const DEFAULT_SOURCES: &[&str] = &["ITU-693", "ITU-694", "ITU-695"];

/// Topic patterns subscribed to when none are configured (wildcard-all).
pub const DEFAULT_TOPIC_PATTERNS: &[&str] = &["#"];

/// Shape of a plausible source identifier, used as a last-resort matcher
/// when a file carries sources the registry has not been told about.
static SOURCE_ID_FALLBACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ITU-\d{2,6}").expect("fallback pattern is valid"));

/// Registry of expected source identifiers.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<String>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect())
    }
}

impl SourceRegistry {
    /// Create a registry over the given identifiers.
    pub fn new(sources: Vec<String>) -> Self {
        Self { sources }
    }

    /// All registered identifiers.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Whether `id` (after normalization) is a registered source.
    pub fn is_known(&self, id: &str) -> bool {
        self.classify(id).is_some()
    }

    /// Normalize a raw identifier by stripping trailing path segments.
    pub fn normalize(id: &str) -> &str {
        id.split('/').next().unwrap_or(id)
    }

    /// Map a raw identifier onto its registered form, if any.
    pub fn classify(&self, id: &str) -> Option<&str> {
        let normalized = Self::normalize(id);
        self.sources
            .iter()
            .find(|s| s.as_str() == normalized)
            .map(|s| s.as_str())
    }

    /// Registered identifiers that appear as substrings of `text`.
    ///
    /// Used against topic-like columns where the identifier is embedded in a
    /// longer path.
    pub fn known_in<'a>(&'a self, text: &str) -> Vec<&'a str> {
        self.sources
            .iter()
            .filter(|s| text.contains(s.as_str()))
            .map(|s| s.as_str())
            .collect()
    }

    /// Identifier-shaped tokens found in `text` by the fallback pattern.
    pub fn fallback_in(text: &str) -> Vec<String> {
        SOURCE_ID_FALLBACK
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_knows_commissioned_pumps() {
        let registry = SourceRegistry::default();
        assert!(registry.is_known("ITU-693"));
        assert!(!registry.is_known("ITU-999"));
    }

    #[test]
    fn test_normalize_strips_path_suffix() {
        assert_eq!(SourceRegistry::normalize("ITU-693/status"), "ITU-693");
        assert_eq!(SourceRegistry::normalize("ITU-693"), "ITU-693");
    }

    #[test]
    fn test_classify_normalizes_first() {
        let registry = SourceRegistry::default();
        assert_eq!(registry.classify("ITU-693/extra"), Some("ITU-693"));
        assert_eq!(registry.classify("unknown"), None);
    }

    #[test]
    fn test_known_in_matches_substrings() {
        let registry = SourceRegistry::default();
        let found = registry.known_in("sensors/ITU-693/EngRPM");
        assert_eq!(found, vec!["ITU-693"]);
    }

    #[test]
    fn test_fallback_finds_identifier_shapes() {
        let found = SourceRegistry::fallback_in("plant/ITU-42777/x and ITU-9");
        assert_eq!(found, vec!["ITU-42777".to_string()]);
    }
}
