use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Anything wrong with settings, mapping or schema documents. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} should be MM/DD/YYYY, got '{value}'")]
    InvalidDate { name: &'static str, value: String },

    #[error("date range is inverted: from {from} is after to {to}")]
    InvertedRange { from: String, to: String },

    #[error("results per page should be between 1 and {max}, got {value}")]
    PageSize { value: u32, max: u32 },

    #[error(
        "interval seconds should be 1 second at the very least to prevent hitting the API rate limit, got {0}"
    )]
    Interval(u64),

    #[error("{name} should be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        value: u64,
        min: u64,
    },

    #[error("{name} must not be empty")]
    Empty { name: &'static str },

    #[error("{path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: invalid JSON schema: {message}")]
    Schema { path: PathBuf, message: String },

    #[error("mappings do not match the schema:\n{}", .0.join("\n"))]
    Mapping(Vec<String>),

    #[error("client secrets file {path} has no 'installed' or 'web' section")]
    ClientSecrets { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(
        "no usable credential and interactive authorization is disabled; \
         run once with EMAIL_EXPORTER_INTERACTIVE_AUTH=true"
    )]
    InteractiveUnavailable,

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("interactive authorization failed: {0}")]
    Interactive(String),

    #[error("provider rejected the credential (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        /// From the `Retry-After` header, when the provider sent one in seconds.
        retry_after: Option<Duration>,
    },

    #[error("unexpected payload: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Worth another attempt later in the same cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) => false,
        }
    }

    /// How long the provider asked us to wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Status { status: 401 | 403, .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "transport",
            ProviderError::Status { status, .. } if *status == 429 => "rate_limited",
            ProviderError::Status { status, .. } if *status >= 500 => "server",
            ProviderError::Status { .. } => "client",
            ProviderError::Decode(_) => "decode",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExporterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExporterError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ExporterError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        let limited = ProviderError::Status {
            status: 429,
            body: String::new(),
            retry_after: Some(Duration::from_secs(7)),
        };
        let server = ProviderError::Status {
            status: 503,
            body: String::new(),
            retry_after: None,
        };
        assert!(limited.is_transient());
        assert!(server.is_transient());
        assert_eq!(limited.kind(), "rate_limited");
        assert_eq!(server.kind(), "server");
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(server.retry_after(), None);
    }

    #[test]
    fn auth_failures_are_not_retried() {
        let err = ProviderError::Status {
            status: 401,
            body: "invalid_token".into(),
            retry_after: None,
        };
        assert!(err.is_auth());
        assert!(!err.is_transient());
    }

    #[test]
    fn decode_errors_are_permanent() {
        let err = ProviderError::Decode("missing messages".into());
        assert!(!err.is_transient());
        assert!(!err.is_auth());
    }

    #[test]
    fn mapping_error_lists_every_violation() {
        let err = ConfigError::Mapping(vec!["a".into(), "b".into()]);
        assert_eq!(
            err.to_string(),
            "mappings do not match the schema:\na\nb"
        );
    }
}
