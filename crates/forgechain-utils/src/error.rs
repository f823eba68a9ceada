//! Library-level error taxonomy with stable exit-code mapping.
//!
//! Mirrors the error categories in SPEC_FULL.md §7. Library code returns
//! `ForgeError` (or a more specific sub-error it converts into) and never
//! calls `std::process::exit`; only the CLI entry point maps the final
//! error to a process exit code via [`ForgeError::to_exit_code`].

use thiserror::Error;

/// Top-level error type returned by every `forgechain-*` library crate.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("contract error: {0}")]
    Contract(String),

    #[error("remote transient failure after exhausting retries: {0}")]
    RemoteTransientExhausted(String),

    #[error("remote rejection: {status} {body}")]
    RemoteRejection { status: u16, body: String },

    #[error(
        "selected model explicitly rejects previous_response_id (required for cascades): {0}"
    )]
    ContinuationInvalid(String),

    #[error("path violation: {0}")]
    PathViolation(String),

    #[error("run cancelled by user")]
    CancelRequested,

    #[error("vector store indexing failed: {0}")]
    VectorStoreFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("secret detected in {location}: {pattern}")]
    SecretDetected { pattern: String, location: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    /// Map to the process exit code table in SPEC_FULL.md §7.
    #[must_use]
    pub fn to_exit_code(&self) -> i32 {
        match self {
            ForgeError::Config(_) => 2,
            ForgeError::PathViolation(_) => 7,
            ForgeError::SecretDetected { .. } => 8,
            ForgeError::CancelRequested => 9,
            ForgeError::Contract(_) => 10,
            ForgeError::RemoteTransientExhausted(_) => 20,
            ForgeError::RemoteRejection { .. } => 21,
            ForgeError::ContinuationInvalid(_) => 22,
            ForgeError::VectorStoreFailed(_) => 23,
            ForgeError::Io(_) | ForgeError::Json(_) | ForgeError::Other(_) => 1,
        }
    }

    /// A user-facing rendering: the error plus, where useful, a suggestion.
    #[must_use]
    pub fn display_for_user(&self) -> String {
        match self {
            ForgeError::ContinuationInvalid(msg) => format!(
                "{msg}\nSuggestion: choose a model whose capability record shows \
                 supports_continuation=true, or run in BATCH mode."
            ),
            ForgeError::SecretDetected { pattern, location } => format!(
                "Refusing to upload {location}: looks like a {pattern}.\n\
                 Suggestion: exclude the file or set security.allow_upload_sensitive=true."
            ),
            ForgeError::PathViolation(msg) => format!(
                "{msg}\nSuggestion: contract paths must be relative, contain no \
                 '..' segments, and use '/' separators."
            ),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_table() {
        assert_eq!(ForgeError::Config("x".into()).to_exit_code(), 2);
        assert_eq!(ForgeError::PathViolation("x".into()).to_exit_code(), 7);
        assert_eq!(
            ForgeError::SecretDetected {
                pattern: "api_key".into(),
                location: "f".into()
            }
            .to_exit_code(),
            8
        );
        assert_eq!(ForgeError::CancelRequested.to_exit_code(), 9);
        assert_eq!(ForgeError::Contract("x".into()).to_exit_code(), 10);
        assert_eq!(
            ForgeError::RemoteTransientExhausted("x".into()).to_exit_code(),
            20
        );
        assert_eq!(
            ForgeError::RemoteRejection {
                status: 400,
                body: "x".into()
            }
            .to_exit_code(),
            21
        );
        assert_eq!(ForgeError::ContinuationInvalid("x".into()).to_exit_code(), 22);
        assert_eq!(ForgeError::VectorStoreFailed("x".into()).to_exit_code(), 23);
    }

    #[test]
    fn display_for_user_adds_suggestion() {
        let err = ForgeError::ContinuationInvalid("refused".into());
        assert!(err.display_for_user().contains("Suggestion"));
    }
}
