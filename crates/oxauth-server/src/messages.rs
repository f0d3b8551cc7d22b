//! Wire request / response records shared by the endpoint pipelines
//!
//! JSON (and form encoding) is only the transport; the pipelines work on
//! these explicit records. Optional members follow the RFC 7591 serde
//! idiom: absent fields are absent on the wire.

use serde::{Deserialize, Serialize};

/// Token endpoint request body (all grants flattened).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenRequestParameters {
    pub grant_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub auth_req_id: Option<String>,
    /// JWT-bearer grant assertion.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub assertion: Option<String>,
    /// RFC 8707 resource indicators.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub resource: Vec<String>,
}

impl TokenRequestParameters {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_owned)
            .collect()
    }
}

/// RFC 6749 §5.1 token response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
}

/// RFC 7009 revocation request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token_type_hint: Option<String>,
}

/// RFC 7662 introspection request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectionRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token_type_hint: Option<String>,
}

/// RFC 7662 introspection response. `active: false` carries nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aud: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token_type: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// RFC 8628 §3.1 device authorization request body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceAuthorizationRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
}

/// RFC 8628 §3.2 device authorization response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// CIBA §7.1 backchannel authentication request body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackchannelAuthenticationRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub login_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub login_hint_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_token_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binding_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requested_expiry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_notification_token: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub resource: Vec<String>,
}

/// CIBA §7.3 backchannel authentication response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackchannelAuthenticationResponse {
    pub auth_req_id: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// RFC 9126 pushed authorization response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushedAuthorizationResponse {
    pub request_uri: String,
    pub expires_in: u64,
}

/// End-session request parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_token_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub post_logout_redirect_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
}

/// What the adapter renders after a logout: an optional redirect plus the
/// front-channel iframe URI list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndSessionResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub post_logout_redirect: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub frontchannel_logout_uris: Vec<String>,
}
