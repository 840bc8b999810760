use std::fmt;

use serde::{Deserialize, Serialize};

pub const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota",
    "throttl",
];

pub const UNAUTHORIZED_KEYWORDS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "unauthorized",
    "authentication",
    "permission denied",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceErrorKind {
    RateLimited,
    Unauthorized,
    Transport,
    Protocol,
    Other,
}

impl InferenceErrorKind {
    /// Classifies a provider failure from its HTTP status (when known) and error text.
    /// Status codes win over message keywords.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        match status {
            Some(429) => return Self::RateLimited,
            Some(401) | Some(403) => return Self::Unauthorized,
            _ => {}
        }

        let lowered = message.to_ascii_lowercase();
        if RATE_LIMIT_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return Self::RateLimited;
        }
        if UNAUTHORIZED_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return Self::Unauthorized;
        }

        Self::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceError {
    pub kind: InferenceErrorKind,
    pub message: String,
    pub credential_fingerprint: Option<String>,
    pub http_status: Option<u16>,
}

impl InferenceError {
    pub fn new(kind: InferenceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            credential_fingerprint: None,
            http_status: None,
        }
    }

    pub fn with_credential(mut self, fingerprint: impl Into<String>) -> Self {
        self.credential_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.credential_fingerprint, self.http_status) {
            (Some(fingerprint), Some(status)) => write!(
                f,
                "{} (credential={}, status={})",
                self.message, fingerprint, status
            ),
            (Some(fingerprint), None) => {
                write!(f, "{} (credential={})", self.message, fingerprint)
            }
            (None, Some(status)) => write!(f, "{} (status={})", self.message, status),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for InferenceError {}

pub fn map_http_error(status: u16, body: &str) -> InferenceError {
    let normalized_body = body.chars().take(240).collect::<String>();
    let kind = match InferenceErrorKind::classify(Some(status), &normalized_body) {
        InferenceErrorKind::Other if status >= 500 => InferenceErrorKind::Transport,
        kind => kind,
    };

    let mut message = format!("provider returned status {}", status);
    if !normalized_body.is_empty() {
        message = format!("{}: {}", message, normalized_body);
    }

    InferenceError::new(kind, message).with_http_status(status)
}

pub fn transport_error(message: impl Into<String>) -> InferenceError {
    let message = message.into();
    let kind = match InferenceErrorKind::classify(None, &message) {
        InferenceErrorKind::Other => InferenceErrorKind::Transport,
        kind => kind,
    };
    InferenceError::new(kind, message)
}

pub fn protocol_error(message: impl Into<String>) -> InferenceError {
    InferenceError::new(InferenceErrorKind::Protocol, message)
}
