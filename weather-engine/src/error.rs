use thiserror::Error;

use crate::provider::ProviderId;

/// HTTP-level failures, kept apart from payload problems so callers can tell
/// "server said no" from "server sent garbage".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request failed with status {code}: {text}")]
    Status { code: u16, text: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("response body is not valid JSON: {0}")]
    Malformed(String),
}

/// The payload was JSON but did not have the shape a provider needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is missing the `{0}` block")]
    MissingBlock(&'static str),

    #[error("payload is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("payload has an unexpected shape: {0}")]
    Invalid(String),

    #[error("lookup service rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(
        "No API key configured for provider '{0}'.\n\
         Hint: run `weather configure {0}` and enter your API key."
    )]
    MissingCredential(ProviderId),

    #[error("refresh interval must be at least one minute")]
    InvalidInterval,

    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("font family and style must not be empty")]
    InvalidFont,

    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

/// Everything the engine surfaces to collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("a request is already in flight")]
    AlreadyInFlight,

    #[error("no request url has been built yet")]
    NoRequestUrl,

    #[error("refresh timer unavailable: {0}")]
    Timer(String),

    #[error("engine is not running")]
    Stopped,

    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl EngineError {
    /// True for payload problems, whether the body was not JSON at all or
    /// JSON of the wrong shape.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            EngineError::Parse(_) | EngineError::Transport(TransportError::Malformed(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_body_counts_as_parse_error() {
        let err = EngineError::from(TransportError::Malformed("eof".into()));
        assert!(err.is_parse_error());

        let err = EngineError::from(TransportError::Status { code: 500, text: "boom".into() });
        assert!(!err.is_parse_error());
    }

    #[test]
    fn missing_credential_message_has_hint() {
        let msg = ConfigError::MissingCredential(ProviderId::OpenWeather).to_string();
        assert!(msg.contains("No API key configured for provider 'openweather'"));
        assert!(msg.contains("weather configure openweather"));
    }
}
