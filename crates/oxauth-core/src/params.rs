//! Authorization request wire parameters and flow taxonomy
//!
//! [`AuthorizationParameters`] is the untrusted inbound record: exactly what
//! the client sent, whether through the front channel, a request object, or
//! a pushed authorization request. Validation turns it into the server
//! crate's typed valid request.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// The detected authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    AuthorizationCode,
    Implicit,
    Hybrid,
}

/// `response_type` treated as an unordered set of the three primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseTypeSet {
    pub code: bool,
    pub token: bool,
    pub id_token: bool,
}

impl ResponseTypeSet {
    /// Parse a space-separated `response_type` value.
    ///
    /// # Errors
    ///
    /// `unsupported_response_type` on unknown members or an empty set.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut set = Self::default();
        for part in raw.split_ascii_whitespace() {
            match part {
                "code" => set.code = true,
                "token" => set.token = true,
                "id_token" => set.id_token = true,
                other => {
                    return Err(ProtocolError::unsupported_response_type(format!(
                        "unknown response_type member {other}"
                    )));
                }
            }
        }
        if set == Self::default() {
            return Err(ProtocolError::unsupported_response_type(
                "response_type must name at least one of code, token, id_token",
            ));
        }
        Ok(set)
    }

    /// Flow detection: `{code}` is the code flow, any token without `code`
    /// is implicit, `code` plus a token is hybrid.
    pub fn flow(self) -> Flow {
        match (self.code, self.token || self.id_token) {
            (true, false) => Flow::AuthorizationCode,
            (false, _) => Flow::Implicit,
            (true, true) => Flow::Hybrid,
        }
    }

    pub fn members(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.code {
            out.push("code");
        }
        if self.token {
            out.push("token");
        }
        if self.id_token {
            out.push("id_token");
        }
        out
    }

    pub fn includes_id_token(self) -> bool {
        self.id_token
    }
}

/// How artifacts travel back to the redirect URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
}

impl ResponseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Fragment => "fragment",
            Self::FormPost => "form_post",
        }
    }

    /// Parse a `response_mode` parameter value.
    ///
    /// # Errors
    ///
    /// `invalid_request` on unknown modes.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw {
            "query" => Ok(Self::Query),
            "fragment" => Ok(Self::Fragment),
            "form_post" => Ok(Self::FormPost),
            other => Err(ProtocolError::invalid_request(format!(
                "unknown response_mode {other}"
            ))),
        }
    }

    /// Default mode for a flow and the allowed set (query only for code).
    pub fn default_for(flow: Flow) -> Self {
        match flow {
            Flow::AuthorizationCode => Self::Query,
            Flow::Implicit | Flow::Hybrid => Self::Fragment,
        }
    }

    pub fn allowed_for(self, flow: Flow) -> bool {
        match flow {
            Flow::AuthorizationCode => true,
            Flow::Implicit | Flow::Hybrid => self != Self::Query,
        }
    }
}

/// Grant types dispatched by the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
    DeviceCode,
    Ciba,
    JwtBearer,
}

impl GrantType {
    pub const DEVICE_CODE_URN: &'static str = "urn:ietf:params:oauth:grant-type:device_code";
    pub const CIBA_URN: &'static str = "urn:openid:params:grant-type:ciba";
    pub const JWT_BEARER_URN: &'static str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
            Self::DeviceCode => Self::DEVICE_CODE_URN,
            Self::Ciba => Self::CIBA_URN,
            Self::JwtBearer => Self::JWT_BEARER_URN,
        }
    }

    /// Parse a `grant_type` parameter value.
    ///
    /// # Errors
    ///
    /// `unsupported_grant_type` for anything outside the six grants.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw {
            "authorization_code" => Ok(Self::AuthorizationCode),
            "refresh_token" => Ok(Self::RefreshToken),
            "client_credentials" => Ok(Self::ClientCredentials),
            Self::DEVICE_CODE_URN => Ok(Self::DeviceCode),
            Self::CIBA_URN => Ok(Self::Ciba),
            Self::JWT_BEARER_URN => Ok(Self::JwtBearer),
            other => Err(ProtocolError::unsupported_grant_type(format!(
                "unsupported grant_type {other}"
            ))),
        }
    }
}

/// Raw authorization request parameters, straight off the wire.
///
/// `request`, `request_uri` and pushed handles are resolved before
/// validation; the resolver folds the referenced object back into this
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthorizationParameters {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub acr_values: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub claims: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub login_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_token_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ui_locales: Option<String>,
    /// RFC 8707 resource indicators; repeatable on the wire.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub resource: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_uri: Option<String>,
}

impl AuthorizationParameters {
    /// Requested scopes as a list.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_owned)
            .collect()
    }

    /// Space-separated `prompt` values.
    pub fn prompts(&self) -> Vec<&str> {
        self.prompt
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .collect()
    }

    /// Merge a resolved request object over the plain parameters.
    ///
    /// Per OIDC Core §6.1 the object's members win; `client_id` and
    /// `response_type` must agree with the outer request when both appear.
    pub fn merge_request_object(&mut self, object: AuthorizationParameters) {
        macro_rules! take {
            ($field:ident) => {
                if object.$field.is_some() {
                    self.$field = object.$field;
                }
            };
        }
        take!(response_type);
        take!(response_mode);
        take!(redirect_uri);
        take!(scope);
        take!(state);
        take!(nonce);
        take!(code_challenge);
        take!(code_challenge_method);
        take!(prompt);
        take!(max_age);
        take!(acr_values);
        take!(claims);
        take!(login_hint);
        take!(id_token_hint);
        take!(display);
        take!(ui_locales);
        if !object.resource.is_empty() {
            self.resource = object.resource;
        }
        // Never inherit nested references.
        self.request = None;
        self.request_uri = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_detection_table() {
        let cases = [
            ("code", Flow::AuthorizationCode),
            ("id_token", Flow::Implicit),
            ("token", Flow::Implicit),
            ("id_token token", Flow::Implicit),
            ("code id_token", Flow::Hybrid),
            ("code token", Flow::Hybrid),
            ("token code id_token", Flow::Hybrid),
        ];
        for (raw, expected) in cases {
            assert_eq!(ResponseTypeSet::parse(raw).unwrap().flow(), expected, "{raw}");
        }
    }

    #[test]
    fn empty_response_type_is_unsupported() {
        let err = ResponseTypeSet::parse("").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::UnsupportedResponseType);
    }

    #[test]
    fn default_modes_follow_flow() {
        assert_eq!(
            ResponseMode::default_for(Flow::AuthorizationCode),
            ResponseMode::Query
        );
        assert_eq!(ResponseMode::default_for(Flow::Implicit), ResponseMode::Fragment);
        assert_eq!(ResponseMode::default_for(Flow::Hybrid), ResponseMode::Fragment);
    }

    #[test]
    fn query_mode_is_refused_for_token_bearing_flows() {
        assert!(!ResponseMode::Query.allowed_for(Flow::Implicit));
        assert!(!ResponseMode::Query.allowed_for(Flow::Hybrid));
        assert!(ResponseMode::FormPost.allowed_for(Flow::Hybrid));
        assert!(ResponseMode::Fragment.allowed_for(Flow::AuthorizationCode));
    }

    #[test]
    fn grant_type_urns_round_trip() {
        for grant in [
            GrantType::AuthorizationCode,
            GrantType::RefreshToken,
            GrantType::ClientCredentials,
            GrantType::DeviceCode,
            GrantType::Ciba,
            GrantType::JwtBearer,
        ] {
            assert_eq!(GrantType::parse(grant.as_str()).unwrap(), grant);
        }
    }

    #[test]
    fn request_object_members_win() {
        let mut outer = AuthorizationParameters {
            client_id: Some("c1".into()),
            scope: Some("openid".into()),
            state: Some("outer".into()),
            ..Default::default()
        };
        let inner = AuthorizationParameters {
            scope: Some("openid profile".into()),
            request_uri: Some("https://evil.example/nested".into()),
            ..Default::default()
        };
        outer.merge_request_object(inner);
        assert_eq!(outer.scope.as_deref(), Some("openid profile"));
        assert_eq!(outer.state.as_deref(), Some("outer"));
        assert!(outer.request_uri.is_none());
    }
}
