//! Protocol error model
//!
//! Every failure an endpoint can surface is a value: an [`ErrorCode`] drawn
//! from the OAuth/OIDC error registries plus a human-readable description.
//! Pipelines return `Result<T, ProtocolError>` and stop at the first error;
//! nothing in the crate uses panics or exceptions for protocol control flow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OAuth 2.x / OpenID Connect error codes.
///
/// Covers RFC 6749 §5.2, RFC 7009, RFC 7662, RFC 7591/7592, RFC 8628,
/// OpenID Connect Core and CIBA, plus the `missing_user_code` server
/// extension used by the backchannel authentication endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    AccessDenied,
    ServerError,
    TemporarilyUnavailable,
    /// RFC 7662 / RFC 7009: the presented token type is not supported.
    UnsupportedTokenType,
    /// RFC 7592: bearer token does not authorize the registration record.
    InvalidToken,
    /// RFC 7591: rejected client metadata.
    InvalidClientMetadata,
    /// RFC 7591: a redirect URI failed registration policy.
    InvalidRedirectUri,
    /// OpenID Connect Core §3.1.2.6.
    LoginRequired,
    ConsentRequired,
    AccountSelectionRequired,
    InteractionRequired,
    RequestNotSupported,
    RequestUriNotSupported,
    RegistrationNotSupported,
    /// RFC 8628 / CIBA: the user has not yet decided.
    AuthorizationPending,
    /// RFC 8628 / CIBA: the client polls too fast.
    SlowDown,
    /// RFC 8628 / CIBA: the device code or auth_req_id has expired.
    ExpiredToken,
    /// CIBA extension: the client requires a user code but none was sent.
    MissingUserCode,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::UnsupportedTokenType => "unsupported_token_type",
            Self::InvalidToken => "invalid_token",
            Self::InvalidClientMetadata => "invalid_client_metadata",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::LoginRequired => "login_required",
            Self::ConsentRequired => "consent_required",
            Self::AccountSelectionRequired => "account_selection_required",
            Self::InteractionRequired => "interaction_required",
            Self::RequestNotSupported => "request_not_supported",
            Self::RequestUriNotSupported => "request_uri_not_supported",
            Self::RegistrationNotSupported => "registration_not_supported",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken => "expired_token",
            Self::MissingUserCode => "missing_user_code",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-level failure, rendered to the client as the standard
/// `{error, error_description, error_uri?, state?}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {description}")]
pub struct ProtocolError {
    #[serde(rename = "error")]
    pub code: ErrorCode,
    #[serde(rename = "error_description")]
    pub description: String,
    #[serde(rename = "error_uri", skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            uri: None,
            state: None,
        }
    }

    /// Attach the request's `state` so the adapter can echo it back.
    pub fn with_state(mut self, state: Option<String>) -> Self {
        self.state = state;
        self
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, description)
    }

    /// Client authentication failed. The real reason must only be logged,
    /// never echoed, so this constructor takes no detail.
    pub fn invalid_client() -> Self {
        Self::new(ErrorCode::InvalidClient, "client authentication failed")
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGrant, description)
    }

    pub fn unauthorized_client(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnauthorizedClient, description)
    }

    pub fn unsupported_grant_type(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedGrantType, description)
    }

    pub fn unsupported_response_type(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedResponseType, description)
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidScope, description)
    }

    pub fn access_denied(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessDenied, description)
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, description)
    }

    pub fn invalid_token(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidToken, description)
    }

    pub fn invalid_client_metadata(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidClientMetadata, description)
    }

    pub fn invalid_redirect_uri(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRedirectUri, description)
    }

    pub fn authorization_pending() -> Self {
        Self::new(
            ErrorCode::AuthorizationPending,
            "the authorization request is still pending",
        )
    }

    pub fn slow_down() -> Self {
        Self::new(ErrorCode::SlowDown, "polling interval not respected")
    }

    pub fn expired_token(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExpiredToken, description)
    }

    pub fn missing_user_code() -> Self {
        Self::new(
            ErrorCode::MissingUserCode,
            "this client requires a user_code with backchannel requests",
        )
    }
}

/// Failure inside a storage or registry backend.
///
/// These never reach the wire as-is; endpoint pipelines convert them to
/// `server_error` and log the detail.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Codec(String),
}

impl From<StorageError> for ProtocolError {
    fn from(err: StorageError) -> Self {
        tracing::error!(error = %err, "storage backend failure");
        Self::server_error("internal storage failure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_registry_names() {
        assert_eq!(ErrorCode::InvalidGrant.as_str(), "invalid_grant");
        assert_eq!(ErrorCode::SlowDown.as_str(), "slow_down");
        assert_eq!(ErrorCode::MissingUserCode.as_str(), "missing_user_code");
        let json = serde_json::to_string(&ErrorCode::AuthorizationPending).unwrap();
        assert_eq!(json, "\"authorization_pending\"");
    }

    #[test]
    fn envelope_shape_matches_rfc6749() {
        let err = ProtocolError::invalid_grant("authorization code is spent")
            .with_state(Some("xyz".into()));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"], "invalid_grant");
        assert_eq!(value["error_description"], "authorization code is spent");
        assert_eq!(value["state"], "xyz");
        assert!(value.get("error_uri").is_none());
    }

    #[test]
    fn invalid_client_carries_no_detail() {
        let err = ProtocolError::invalid_client();
        assert_eq!(err.description, "client authentication failed");
    }
}
