use crate::jwe::JweError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller misuse. Always a defect in the calling code.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Network failure or timeout while talking to a federation participant.
    #[error("Federation unavailable during {operation}: {detail}")]
    FederationUnavailable {
        operation: &'static str,
        detail: String,
    },

    #[error("Malformed statement: {0}")]
    MalformedStatement(String),

    #[error("Untrusted entity {entity}: {reason}")]
    UntrustedEntity { entity: String, reason: String },

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unknown identity provider: {0}")]
    UnknownIdp(String),

    #[error("No decryption key for kid {0}")]
    MissingDecryptionKey(String),

    #[error("Bad ID token: {0}")]
    BadIdToken(#[from] JweError),

    #[error("Bad ID token signature from {issuer}: {reason}")]
    BadIdTokenSignature { issuer: String, reason: String },

    #[error("ID token claims rejected: {0}")]
    IdTokenClaims(String),

    #[error("Token endpoint returned {status}: {detail}")]
    TokenEndpoint { status: u16, detail: String },

    #[error("Session expired")]
    SessionExpired,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller may retry the failed operation under its own policy.
    ///
    /// Every other kind requires restarting the authentication flow.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FederationUnavailable { .. })
    }

    pub(crate) fn untrusted(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UntrustedEntity {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(operation: &'static str, detail: impl ToString) -> Self {
        Self::FederationUnavailable {
            operation,
            detail: detail.to_string(),
        }
    }
}
