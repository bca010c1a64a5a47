//! Error types for remote storage operations.

use thiserror::Error;

/// Errors raised while talking to a remote artifact store.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("no remote configured (pass --remote, set TRELLIS_REMOTE, or add remote.url to .trellis/config.yaml)")]
    NotConfigured,

    #[error("unsupported remote url: {0}")]
    UnsupportedUrl(String),

    #[error("object {0} not found on remote")]
    ObjectMissing(String),

    #[error("digest mismatch for pulled object: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] trellis_core::TrellisError),

    #[error("cache error: {0}")]
    Cache(#[from] trellis_core::CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_lowercase_and_specific() {
        let err = RemoteError::ObjectMissing("ab12".to_string());
        assert_eq!(err.to_string(), "object ab12 not found on remote");

        let err = RemoteError::DigestMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(err.to_string().contains("expected aa"));
        assert!(err.to_string().contains("got bb"));
    }

    #[test]
    fn not_configured_names_every_source() {
        let msg = RemoteError::NotConfigured.to_string();
        assert!(msg.contains("--remote"));
        assert!(msg.contains("TRELLIS_REMOTE"));
        assert!(msg.contains("config.yaml"));
    }
}
