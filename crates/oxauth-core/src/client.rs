//! Registered client model
//!
//! [`ClientInfo`] is the catalogue's unit of truth: everything the server
//! needs to validate a request from, authenticate, or issue tokens to one
//! relying party. The catalogue owns these records; the pipelines hold
//! value copies obtained through [`crate::collaborators::ClientInfoProvider`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use url::Url;

use crate::error::ProtocolError;

/// OAuth 2.0 client classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Public,
    Confidential,
}

/// Token endpoint authentication methods (OIDC Core §9 + RFC 8705).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    None,
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
    PrivateKeyJwt,
    TlsClientAuth,
    SelfSignedTlsClientAuth,
}

impl TokenEndpointAuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretJwt => "client_secret_jwt",
            Self::PrivateKeyJwt => "private_key_jwt",
            Self::TlsClientAuth => "tls_client_auth",
            Self::SelfSignedTlsClientAuth => "self_signed_tls_client_auth",
        }
    }

    /// Whether registration must mint a shared secret for this method.
    pub fn requires_secret(self) -> bool {
        matches!(
            self,
            Self::ClientSecretBasic | Self::ClientSecretPost | Self::ClientSecretJwt
        )
    }
}

/// A client secret at rest.
///
/// Secrets are stored as SHA-256 and SHA-512 digests. The raw value is
/// retained only for clients authenticating with `client_secret_jwt`,
/// where the HMAC computation needs the original octets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecret {
    pub sha256: Vec<u8>,
    pub sha512: Vec<u8>,
    #[serde(with = "opt_secret", skip_serializing_if = "Option::is_none", default)]
    pub value: Option<SecretString>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ClientSecret {
    /// Digest a plaintext secret, optionally retaining the raw value.
    pub fn from_plain(plain: &str, keep_value: bool, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            sha256: Sha256::digest(plain.as_bytes()).to_vec(),
            sha512: Sha512::digest(plain.as_bytes()).to_vec(),
            value: keep_value.then(|| SecretString::from(plain.to_owned())),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Constant-time comparison of a presented secret against the digest.
    pub fn matches(&self, presented: &str) -> bool {
        let digest = Sha256::digest(presented.as_bytes());
        digest.as_slice().ct_eq(&self.sha256).into()
    }

    /// Raw secret octets, present only for HMAC-based authentication.
    pub fn raw_value(&self) -> Option<&str> {
        self.value.as_ref().map(|v| v.expose_secret().as_str())
    }
}

/// `SecretString` deliberately does not implement `Serialize`; persistence
/// of the raw HMAC secret needs an explicit opt-in.
mod opt_secret {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<SecretString>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(secret) => serializer.serialize_some(secret.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SecretString>, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
    }
}

/// PKCE enforcement for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PkcePolicy {
    /// A `code_challenge` must accompany every authorization request.
    pub required: bool,
    /// The `plain` challenge method is acceptable.
    pub plain_allowed: bool,
}

/// Refresh token expiry and reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenPolicy {
    /// Hard ceiling measured from the first token in the chain.
    pub absolute_expiry: Duration,
    /// Optional inactivity window, reset at each rotation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sliding_expiry: Option<Duration>,
    /// When false, presenting a rotated-out token revokes the whole chain.
    pub allow_reuse: bool,
}

impl Default for RefreshTokenPolicy {
    fn default() -> Self {
        Self {
            absolute_expiry: Duration::from_secs(30 * 24 * 3600),
            sliding_expiry: None,
            allow_reuse: false,
        }
    }
}

/// Subject identifier strategy (OIDC Core §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    #[default]
    Public,
    Pairwise,
}

/// CIBA token delivery mode declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackchannelTokenDeliveryMode {
    #[default]
    Poll,
    Ping,
    Push,
}

impl BackchannelTokenDeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Ping => "ping",
            Self::Push => "push",
        }
    }
}

/// Expected peer-certificate attributes for `tls_client_auth` (RFC 8705 §2.1.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsClientAuthOptions {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject_dn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub san_dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub san_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub san_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub san_email: Option<String>,
}

impl TlsClientAuthOptions {
    pub fn is_empty(&self) -> bool {
        self.subject_dn.is_none()
            && self.san_dns.is_none()
            && self.san_uri.is_none()
            && self.san_ip.is_none()
            && self.san_email.is_none()
    }
}

/// Client key material: an embedded JWK set or a dereferenceable URI.
///
/// When both are registered the embedded set is authoritative and the URI
/// is not consulted; the two sources are never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientKeys {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwks: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwks_uri: Option<Url>,
}

/// Token lifetimes for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLifetimes {
    pub access_token: Duration,
    pub identity_token: Duration,
    /// Capped at one minute by [`ClientInfo::validate`].
    pub authorization_code: Duration,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access_token: Duration::from_secs(3600),
            identity_token: Duration::from_secs(300),
            authorization_code: Duration::from_secs(60),
        }
    }
}

/// A registered relying party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_type: ClientType,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub secrets: Vec<ClientSecret>,
    pub redirect_uris: Vec<Url>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub post_logout_redirect_uris: Vec<Url>,
    pub grant_types: Vec<String>,
    /// Allowed `response_type` combinations, each a space-separated set.
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_token_signed_response_alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub userinfo_signed_response_alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_object_signing_alg: Option<String>,
    #[serde(default)]
    pub keys: ClientKeys,
    #[serde(default)]
    pub pkce: PkcePolicy,
    #[serde(default)]
    pub lifetimes: TokenLifetimes,
    #[serde(default)]
    pub refresh_token: RefreshTokenPolicy,
    #[serde(default)]
    pub subject_type: SubjectType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sector_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frontchannel_logout_uri: Option<Url>,
    #[serde(default)]
    pub frontchannel_logout_session_required: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backchannel_logout_uri: Option<Url>,
    #[serde(default)]
    pub backchannel_logout_session_required: bool,
    #[serde(default)]
    pub backchannel_token_delivery_mode: BackchannelTokenDeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backchannel_client_notification_endpoint: Option<Url>,
    #[serde(default)]
    pub backchannel_user_code_parameter: bool,
    #[serde(default, skip_serializing_if = "TlsClientAuthOptions::is_empty")]
    pub tls_client_auth: TlsClientAuthOptions,
    /// Scopes the client may request; empty means any scope is allowed.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allowed_scopes: Vec<String>,
    /// Resource indicators (RFC 8707) the client may request.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allowed_resources: Vec<Url>,
    /// Whether the client may be issued refresh tokens for `offline_access`.
    #[serde(default = "default_true")]
    pub offline_access_allowed: bool,
}

fn default_true() -> bool {
    true
}

const ALLOWED_REDIRECT_SCHEMES: &[&str] = &["https", "http"];

impl ClientInfo {
    /// A confidential client with sensible defaults, used by registration
    /// and heavily by tests.
    pub fn confidential(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_type: ClientType::Confidential,
            secrets: Vec::new(),
            redirect_uris: Vec::new(),
            post_logout_redirect_uris: Vec::new(),
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            token_endpoint_auth_method: TokenEndpointAuthMethod::ClientSecretBasic,
            id_token_signed_response_alg: None,
            userinfo_signed_response_alg: None,
            request_object_signing_alg: None,
            keys: ClientKeys::default(),
            pkce: PkcePolicy::default(),
            lifetimes: TokenLifetimes::default(),
            refresh_token: RefreshTokenPolicy::default(),
            subject_type: SubjectType::Public,
            sector_identifier: None,
            frontchannel_logout_uri: None,
            frontchannel_logout_session_required: false,
            backchannel_logout_uri: None,
            backchannel_logout_session_required: false,
            backchannel_token_delivery_mode: BackchannelTokenDeliveryMode::Poll,
            backchannel_client_notification_endpoint: None,
            backchannel_user_code_parameter: false,
            tls_client_auth: TlsClientAuthOptions::default(),
            allowed_scopes: Vec::new(),
            allowed_resources: Vec::new(),
            offline_access_allowed: true,
        }
    }

    /// A public client (no secret, PKCE required).
    pub fn public(client_id: impl Into<String>) -> Self {
        let mut info = Self::confidential(client_id);
        info.client_type = ClientType::Public;
        info.token_endpoint_auth_method = TokenEndpointAuthMethod::None;
        info.pkce = PkcePolicy {
            required: true,
            plain_allowed: false,
        };
        info
    }

    /// Enforce the registration invariants.
    ///
    /// # Errors
    ///
    /// Returns `invalid_client_metadata` / `invalid_redirect_uri` when a
    /// registered value violates catalogue policy.
    pub fn validate(&self, supported_signing_algs: &[String]) -> Result<(), ProtocolError> {
        for uri in &self.redirect_uris {
            if uri.cannot_be_a_base() || !ALLOWED_REDIRECT_SCHEMES.contains(&uri.scheme()) {
                return Err(ProtocolError::invalid_redirect_uri(format!(
                    "redirect_uri {uri} is not an absolute http(s) URI"
                )));
            }
            if uri.fragment().is_some() {
                return Err(ProtocolError::invalid_redirect_uri(format!(
                    "redirect_uri {uri} must not carry a fragment"
                )));
            }
        }
        for alg in [
            self.id_token_signed_response_alg.as_ref(),
            self.userinfo_signed_response_alg.as_ref(),
            self.request_object_signing_alg.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if !supported_signing_algs.iter().any(|s| s == alg) {
                return Err(ProtocolError::invalid_client_metadata(format!(
                    "algorithm {alg} is not supported by this server"
                )));
            }
        }
        if self.subject_type == SubjectType::Pairwise && self.sector_identifier.is_none() {
            return Err(ProtocolError::invalid_client_metadata(
                "pairwise subject type requires a sector_identifier",
            ));
        }
        if self.token_endpoint_auth_method.requires_secret() && self.secrets.is_empty() {
            return Err(ProtocolError::invalid_client_metadata(format!(
                "{} requires at least one client secret",
                self.token_endpoint_auth_method.as_str()
            )));
        }
        if self.token_endpoint_auth_method == TokenEndpointAuthMethod::None
            && self.client_type == ClientType::Confidential
        {
            return Err(ProtocolError::invalid_client_metadata(
                "confidential clients cannot use the none authentication method",
            ));
        }
        if self.lifetimes.authorization_code > Duration::from_secs(60) {
            return Err(ProtocolError::invalid_client_metadata(
                "authorization code lifetime cannot exceed one minute",
            ));
        }
        if self.backchannel_token_delivery_mode != BackchannelTokenDeliveryMode::Poll
            && self.backchannel_client_notification_endpoint.is_none()
        {
            return Err(ProtocolError::invalid_client_metadata(
                "ping and push delivery require a backchannel_client_notification_endpoint",
            ));
        }
        Ok(())
    }

    /// Whether the exact registered redirect URI is known, byte for byte.
    pub fn has_redirect_uri(&self, candidate: &str) -> bool {
        self.redirect_uris.iter().any(|u| u.as_str() == candidate)
    }

    pub fn allows_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    /// Whether the requested `response_type` set equals a registered one,
    /// treating each registration as an unordered set.
    pub fn allows_response_type(&self, requested: &[&str]) -> bool {
        self.response_types.iter().any(|registered| {
            let mut reg: Vec<&str> = registered.split_ascii_whitespace().collect();
            let mut req = requested.to_vec();
            reg.sort_unstable();
            req.sort_unstable();
            reg == req
        })
    }

    pub fn allows_scope(&self, scope: &str) -> bool {
        self.allowed_scopes.is_empty() || self.allowed_scopes.iter().any(|s| s == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported() -> Vec<String> {
        vec!["RS256".into(), "ES256".into()]
    }

    #[test]
    fn secret_digest_comparison_is_exact() {
        let secret = ClientSecret::from_plain("correct horse battery staple", false, None);
        assert!(secret.matches("correct horse battery staple"));
        assert!(!secret.matches("correct horse battery stapl"));
        assert!(secret.raw_value().is_none());
    }

    #[test]
    fn raw_value_retained_only_on_request() {
        let secret = ClientSecret::from_plain("hmac-secret", true, None);
        assert_eq!(secret.raw_value(), Some("hmac-secret"));
    }

    #[test]
    fn pairwise_requires_sector() {
        let mut client = ClientInfo::public("c1");
        client.subject_type = SubjectType::Pairwise;
        let err = client.validate(&supported()).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidClientMetadata);
        client.sector_identifier = Some("example.org".into());
        client.validate(&supported()).unwrap();
    }

    #[test]
    fn redirect_uri_must_be_absolute_http() {
        let mut client = ClientInfo::public("c1");
        client.redirect_uris = vec![Url::parse("https://a.example/cb").unwrap()];
        client.validate(&supported()).unwrap();
        client.redirect_uris = vec![Url::parse("data:text/plain,hi").unwrap()];
        assert!(client.validate(&supported()).is_err());
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let mut client = ClientInfo::public("c1");
        client.id_token_signed_response_alg = Some("HS1".into());
        assert!(client.validate(&supported()).is_err());
    }

    #[test]
    fn response_type_match_is_order_insensitive() {
        let mut client = ClientInfo::public("c1");
        client.response_types = vec!["code id_token".into()];
        assert!(client.allows_response_type(&["id_token", "code"]));
        assert!(!client.allows_response_type(&["code"]));
    }

    #[test]
    fn secret_bearing_method_needs_secret() {
        let client = ClientInfo::confidential("c1");
        assert!(client.validate(&supported()).is_err());
    }
}
