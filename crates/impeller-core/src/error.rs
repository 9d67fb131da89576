//! Error types for record decomposition.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decomposing a raw broker message.
///
/// These are never fatal to the pipeline: a record that fails to decompose
/// is kept in the raw rotation output and dropped from structured output.
#[derive(Error, Debug)]
pub enum Error {
    /// Topic path has too few segments to carry a source identifier.
    #[error("topic '{0}' has fewer than 2 segments")]
    TopicShape(String),

    /// Payload does not match the expected nested single-key shape.
    #[error("payload shape: {0}")]
    PayloadShape(String),

    /// Payload is not valid JSON, even after quote cleanup.
    #[error("payload JSON: {0}")]
    PayloadJson(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_shape_display() {
        let err = Error::TopicShape("sensors".to_string());
        assert!(err.to_string().contains("sensors"));
        assert!(err.to_string().contains("fewer than 2"));
    }

    #[test]
    fn test_payload_shape_display() {
        let err = Error::PayloadShape("expected a single key".to_string());
        assert!(err.to_string().contains("single key"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::PayloadJson(_)));
    }
}
