//! Runtime records owned by the storage layer
//!
//! The core holds only value copies of these; every mutation goes back
//! through the storage traits so hosts can persist them wherever they like.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::claims::RequestedClaims;
use crate::client::BackchannelTokenDeliveryMode;
use crate::params::{AuthorizationParameters, ResponseMode, ResponseTypeSet};

/// Lifecycle status of a registered JWT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Also the benign default for records the registry never saw.
    #[default]
    Active,
    Used,
    Revoked,
}

/// Registry record for an issued access or refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub jti: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
    /// Refresh chains only: ceiling inherited from the first link.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub absolute_expires_at: Option<DateTime<Utc>>,
    /// Refresh chains only: inactivity window, reset at each rotation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sliding_expires_at: Option<DateTime<Utc>>,
    /// Identifier shared by every link of one refresh chain.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chain_id: Option<String>,
}

/// The server's persisted authorization decision, keyed by the SHA-256 of
/// the authorization code (or the `auth_req_id` / `device_code` for the
/// backchannel flows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationContext {
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub claims: Option<RequestedClaims>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge_method: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub resources: Vec<String>,
    #[serde(with = "response_type_set")]
    pub response_type: ResponseTypeSet,
    pub response_mode: ResponseMode,
    pub subject: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub acr: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

mod response_type_set {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::params::ResponseTypeSet;

    pub fn serialize<S: Serializer>(
        set: &ResponseTypeSet,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        set.members().join(" ").serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<ResponseTypeSet, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ResponseTypeSet::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// An authenticated end-user session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub subject: String,
    pub session_id: String,
    pub auth_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub acr: Option<String>,
    /// Clients that received tokens under this session; drives logout fanout.
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub affected_client_ids: BTreeSet<String>,
}

impl AuthSession {
    pub fn new(subject: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session_id: session_id.into(),
            auth_time: Utc::now(),
            identity_provider: None,
            acr: None,
            affected_client_ids: BTreeSet::new(),
        }
    }
}

/// CIBA request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CibaStatus {
    Pending,
    Authorized,
    Denied,
    Expired,
}

/// One backchannel authentication request, keyed by `auth_req_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CibaRequest {
    pub auth_req_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub resources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binding_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_code: Option<String>,
    pub status: CibaStatus,
    /// Set when the user approves; the subject tokens are minted for.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    pub delivery_mode: BackchannelTokenDeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_notification_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    /// Current interval; `slow_down` doubles it up to the engine cap.
    pub interval: Duration,
}

impl CibaRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Device grant state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceGrantStatus {
    Pending,
    Approved,
    Denied,
    /// Tokens were handed out; further polls fail.
    Consumed,
    Expired,
}

/// One device authorization grant, addressable by `device_code` and by
/// `user_code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGrant {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub verification_uri: Url,
    pub status: DeviceGrantStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub interval: Duration,
}

impl DeviceGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Binding of one `registration_access_token` to one client.
///
/// The bearer string itself is never stored; only its SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClientHandle {
    pub client_id: String,
    pub token_sha256: Vec<u8>,
    pub issued_at: DateTime<Utc>,
}

/// A persisted (pushed or interaction-suspended) authorization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// Opaque handle; on the wire it travels as
    /// `urn:ietf:params:oauth:request_uri:<id>`.
    pub id: String,
    pub client_id: String,
    pub parameters: AuthorizationParameters,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub const URN_PREFIX: &'static str = "urn:ietf:params:oauth:request_uri:";

    pub fn request_uri(&self) -> String {
        format!("{}{}", Self::URN_PREFIX, self.id)
    }

    /// Extract the handle from a `request_uri` value, if it is ours.
    pub fn id_from_request_uri(request_uri: &str) -> Option<&str> {
        request_uri.strip_prefix(Self::URN_PREFIX)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
