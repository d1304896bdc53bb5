//! Crate-level error type
//!
//! Each layer owns its own `thiserror` enum; `PlatformError` wraps the ones
//! that reach the binaries and the HTTP surface. Text that leaves the process
//! goes through [`sanitize_error_message`] first.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length, in bytes, of an error message exposed to clients
pub const MAX_PUBLIC_MESSAGE_LEN: usize = 500;

const TRUNCATION_SUFFIX: &str = "...[truncated]";

/// Main error type for platform operations
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("HTTP server error: {message}")]
    Server { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PlatformError {
    /// Create HTTP server error
    pub fn server<S: Into<String>>(message: S) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error text safe to return to an HTTP client or write to shared logs
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Mask credentials and sensitive paths, then bound the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_PUBLIC_MESSAGE_LEN {
        let mut cut = MAX_PUBLIC_MESSAGE_LEN - TRUNCATION_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATION_SUFFIX);
    }

    sanitized
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use crate::transport::mqtt::{ConnectionState, MqttError};

    #[test]
    fn test_from_conversions() {
        let error: PlatformError = StorageError::NotFound {
            id: "dev-1".to_string(),
        }
        .into();
        assert!(matches!(error, PlatformError::Storage(_)));

        let error: PlatformError = MqttError::NotConnected {
            state: ConnectionState::Disconnected,
        }
        .into();
        assert!(matches!(error, PlatformError::Mqtt(_)));
        assert!(error.to_string().starts_with("MQTT error:"));
    }

    #[test]
    fn test_public_message_masks_credentials() {
        let error = PlatformError::internal("broker auth failed: password=hunter2 token: abc");
        let message = error.public_message();

        assert!(!message.contains("hunter2"));
        assert!(!message.contains("abc"));
        assert!(message.contains("password=***"));
        assert!(message.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= MAX_PUBLIC_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= MAX_PUBLIC_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_exactly_max_len_is_untouched() {
        let message = "x".repeat(MAX_PUBLIC_MESSAGE_LEN);
        assert_eq!(sanitize_error_message(&message), message);
    }

    #[test]
    fn test_sensitive_path_redaction() {
        let sanitized = sanitize_error_message("cannot read /home/user/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("id_rsa"));
    }

    #[test]
    fn test_constructors() {
        assert_eq!(
            PlatformError::server("bind failed").to_string(),
            "HTTP server error: bind failed"
        );
        assert_eq!(
            PlatformError::internal("unexpected").to_string(),
            "Internal error: unexpected"
        );
    }
}
