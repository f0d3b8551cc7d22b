//! Dynamic client registration and management (RFC 7591 / RFC 7592)
//!
//! Registration mints the client id, an optional secret, and a
//! `registration_access_token` bound to exactly that client. The CRUD
//! surface authenticates with that bearer token; a token bound to a
//! different client id is `invalid_token`, full stop.

use chrono::Utc;
use oxauth_core::client::{
    BackchannelTokenDeliveryMode, ClientInfo, ClientSecret, ClientType, SubjectType,
    TokenEndpointAuthMethod,
};
use oxauth_core::error::ProtocolError;
use oxauth_core::random;
use oxauth_core::records::RegisteredClientHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::issuance::Ctx;

/// RFC 7591 client metadata, request and response side.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientMetadata {
    /// Present in RFC 7592 update bodies; must equal the path client.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwks: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwks_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sector_identifier_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_token_signed_response_alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub userinfo_signed_response_alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_object_signing_alg: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub post_logout_redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frontchannel_logout_uri: Option<String>,
    #[serde(default)]
    pub frontchannel_logout_session_required: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backchannel_logout_uri: Option<String>,
    #[serde(default)]
    pub backchannel_logout_session_required: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backchannel_token_delivery_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backchannel_client_notification_endpoint: Option<String>,
    #[serde(default)]
    pub backchannel_user_code_parameter: bool,
}

/// Registration response: credentials plus the echoed metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub registration_access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub registration_client_uri: Option<String>,
    pub client_id_issued_at: i64,
    #[serde(flatten)]
    pub metadata: ClientMetadata,
}

fn parse_auth_method(raw: &str) -> Result<TokenEndpointAuthMethod, ProtocolError> {
    match raw {
        "none" => Ok(TokenEndpointAuthMethod::None),
        "client_secret_basic" => Ok(TokenEndpointAuthMethod::ClientSecretBasic),
        "client_secret_post" => Ok(TokenEndpointAuthMethod::ClientSecretPost),
        "client_secret_jwt" => Ok(TokenEndpointAuthMethod::ClientSecretJwt),
        "private_key_jwt" => Ok(TokenEndpointAuthMethod::PrivateKeyJwt),
        "tls_client_auth" => Ok(TokenEndpointAuthMethod::TlsClientAuth),
        "self_signed_tls_client_auth" => Ok(TokenEndpointAuthMethod::SelfSignedTlsClientAuth),
        other => Err(ProtocolError::invalid_client_metadata(format!(
            "unknown token_endpoint_auth_method {other}"
        ))),
    }
}

fn parse_url(raw: &str, what: &str) -> Result<Url, ProtocolError> {
    Url::parse(raw)
        .map_err(|_| ProtocolError::invalid_client_metadata(format!("{what} is not a valid URL")))
}

pub struct RegistrationHandler {
    ctx: Ctx,
}

impl RegistrationHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// POST /connect/register.
    ///
    /// # Errors
    ///
    /// `invalid_client_metadata` / `invalid_redirect_uri` per RFC 7591,
    /// `server_error` when registration is not enabled.
    pub async fn register(
        &self,
        metadata: ClientMetadata,
    ) -> Result<ClientRegistrationResponse, ProtocolError> {
        let manager = self.ctx.manager.as_ref().ok_or_else(|| {
            ProtocolError::server_error("dynamic registration is not enabled")
        })?;
        let issuer = self.ctx.issuer_id().await?;

        let client_id = Uuid::new_v4().to_string();
        let mut client = self.apply_metadata(ClientInfo::confidential(&client_id), &metadata)?;

        // Only secret-bearing methods get one; the raw value is retained
        // when HMAC assertions need the original octets.
        let client_secret = if client.token_endpoint_auth_method.requires_secret() {
            let secret = random::urlsafe(32);
            let keep_raw =
                client.token_endpoint_auth_method == TokenEndpointAuthMethod::ClientSecretJwt;
            client.secrets = vec![ClientSecret::from_plain(&secret, keep_raw, None)];
            Some(secret)
        } else {
            None
        };

        client.validate(&self.ctx.options.supported_signing_algorithms)?;
        manager.add(client.clone()).await?;
        self.ctx.catalogue.invalidate(&client_id);

        let registration_access_token = random::urlsafe(32);
        self.ctx
            .handles
            .put(RegisteredClientHandle {
                client_id: client_id.clone(),
                token_sha256: Sha256::digest(registration_access_token.as_bytes()).to_vec(),
                issued_at: Utc::now(),
            })
            .await?;

        info!(client_id = %client_id, "client registered");
        Ok(ClientRegistrationResponse {
            registration_client_uri: Some(format!(
                "{}/{}",
                self.ctx
                    .endpoint_url(&issuer, &self.ctx.options.paths.registration),
                client_id
            )),
            client_id: client_id.clone(),
            client_secret,
            client_secret_expires_at: client_secret_seen(&client),
            registration_access_token: Some(registration_access_token),
            client_id_issued_at: Utc::now().timestamp(),
            metadata: metadata_of(&client),
        })
    }

    /// GET /connect/register/{id}.
    ///
    /// # Errors
    ///
    /// `invalid_token` when the bearer is not the handle bound to this
    /// client id.
    pub async fn read(
        &self,
        client_id: &str,
        bearer: &str,
    ) -> Result<ClientRegistrationResponse, ProtocolError> {
        self.authorize_handle(client_id, bearer).await?;
        let client = self.ctx.catalogue.require(client_id).await?;
        Ok(ClientRegistrationResponse {
            client_id: client_id.to_owned(),
            client_secret: None,
            client_secret_expires_at: None,
            registration_access_token: None,
            registration_client_uri: None,
            client_id_issued_at: 0,
            metadata: metadata_of(&client),
        })
    }

    /// PUT /connect/register/{id}.
    ///
    /// # Errors
    ///
    /// `invalid_token` for a foreign handle, `invalid_request` when the
    /// body's `client_id` contradicts the path, metadata errors otherwise.
    pub async fn update(
        &self,
        client_id: &str,
        bearer: &str,
        metadata: ClientMetadata,
    ) -> Result<ClientRegistrationResponse, ProtocolError> {
        self.authorize_handle(client_id, bearer).await?;
        let manager = self.ctx.manager.as_ref().ok_or_else(|| {
            ProtocolError::server_error("dynamic registration is not enabled")
        })?;
        if metadata.client_id.as_deref() != Some(client_id) {
            return Err(ProtocolError::invalid_request(
                "the update body must carry the client_id being updated",
            ));
        }

        let existing = self.ctx.catalogue.require(client_id).await?;
        let mut updated = self.apply_metadata(existing.clone(), &metadata)?;
        // Secrets survive updates; rotation happens through re-registration.
        updated.secrets = existing.secrets;
        updated.validate(&self.ctx.options.supported_signing_algorithms)?;
        manager.update(updated.clone()).await?;
        self.ctx.catalogue.invalidate(client_id);

        info!(client_id = %client_id, "client updated");
        Ok(ClientRegistrationResponse {
            client_id: client_id.to_owned(),
            client_secret: None,
            client_secret_expires_at: None,
            registration_access_token: None,
            registration_client_uri: None,
            client_id_issued_at: 0,
            metadata: metadata_of(&updated),
        })
    }

    /// DELETE /connect/register/{id}: the client, its secrets, its handle
    /// and every active grant die together.
    ///
    /// # Errors
    ///
    /// `invalid_token` for a foreign handle.
    pub async fn delete(&self, client_id: &str, bearer: &str) -> Result<(), ProtocolError> {
        self.authorize_handle(client_id, bearer).await?;
        let manager = self.ctx.manager.as_ref().ok_or_else(|| {
            ProtocolError::server_error("dynamic registration is not enabled")
        })?;
        manager.remove(client_id).await?;
        self.ctx.handles.remove(client_id).await?;
        self.ctx.registry.revoke_client(client_id).await?;
        self.ctx.catalogue.invalidate(client_id);
        info!(client_id = %client_id, "client deleted");
        Ok(())
    }

    async fn authorize_handle(&self, client_id: &str, bearer: &str) -> Result<(), ProtocolError> {
        let handle = self
            .ctx
            .handles
            .get(client_id)
            .await?
            .ok_or_else(|| ProtocolError::invalid_token("unknown registration"))?;
        let digest = Sha256::digest(bearer.as_bytes());
        if !bool::from(digest.as_slice().ct_eq(&handle.token_sha256)) {
            return Err(ProtocolError::invalid_token(
                "registration access token does not match this client",
            ));
        }
        Ok(())
    }

    /// Fold the metadata over a client record, validating shapes.
    fn apply_metadata(
        &self,
        mut client: ClientInfo,
        metadata: &ClientMetadata,
    ) -> Result<ClientInfo, ProtocolError> {
        client.redirect_uris = metadata
            .redirect_uris
            .iter()
            .map(|raw| parse_url(raw, "redirect_uri"))
            .collect::<Result<_, _>>()?;
        client.post_logout_redirect_uris = metadata
            .post_logout_redirect_uris
            .iter()
            .map(|raw| parse_url(raw, "post_logout_redirect_uri"))
            .collect::<Result<_, _>>()?;

        if let Some(raw) = &metadata.token_endpoint_auth_method {
            client.token_endpoint_auth_method = parse_auth_method(raw)?;
        }
        client.client_type = if client.token_endpoint_auth_method == TokenEndpointAuthMethod::None
        {
            ClientType::Public
        } else {
            ClientType::Confidential
        };
        if let Some(grant_types) = &metadata.grant_types {
            client.grant_types = grant_types.clone();
        }
        if let Some(response_types) = &metadata.response_types {
            client.response_types = response_types.clone();
        }
        if let Some(scope) = &metadata.scope {
            client.allowed_scopes = scope
                .split_ascii_whitespace()
                .map(str::to_owned)
                .collect();
        }
        if metadata.jwks.is_some() && metadata.jwks_uri.is_some() {
            return Err(ProtocolError::invalid_client_metadata(
                "jwks and jwks_uri are mutually exclusive",
            ));
        }
        client.keys.jwks = metadata.jwks.clone();
        client.keys.jwks_uri = metadata
            .jwks_uri
            .as_deref()
            .map(|raw| parse_url(raw, "jwks_uri"))
            .transpose()?;
        if let Some(subject_type) = &metadata.subject_type {
            client.subject_type = match subject_type.as_str() {
                "public" => SubjectType::Public,
                "pairwise" => SubjectType::Pairwise,
                other => {
                    return Err(ProtocolError::invalid_client_metadata(format!(
                        "unknown subject_type {other}"
                    )));
                }
            };
        }
        client.sector_identifier = metadata
            .sector_identifier_uri
            .as_deref()
            .map(|raw| parse_url(raw, "sector_identifier_uri"))
            .transpose()?
            .and_then(|url| url.host_str().map(str::to_owned));
        client.id_token_signed_response_alg = metadata.id_token_signed_response_alg.clone();
        client.userinfo_signed_response_alg = metadata.userinfo_signed_response_alg.clone();
        client.request_object_signing_alg = metadata.request_object_signing_alg.clone();
        client.frontchannel_logout_uri = metadata
            .frontchannel_logout_uri
            .as_deref()
            .map(|raw| parse_url(raw, "frontchannel_logout_uri"))
            .transpose()?;
        client.frontchannel_logout_session_required =
            metadata.frontchannel_logout_session_required;
        client.backchannel_logout_uri = metadata
            .backchannel_logout_uri
            .as_deref()
            .map(|raw| parse_url(raw, "backchannel_logout_uri"))
            .transpose()?;
        client.backchannel_logout_session_required =
            metadata.backchannel_logout_session_required;
        if let Some(mode) = &metadata.backchannel_token_delivery_mode {
            client.backchannel_token_delivery_mode = match mode.as_str() {
                "poll" => BackchannelTokenDeliveryMode::Poll,
                "ping" => BackchannelTokenDeliveryMode::Ping,
                "push" => BackchannelTokenDeliveryMode::Push,
                other => {
                    return Err(ProtocolError::invalid_client_metadata(format!(
                        "unknown backchannel_token_delivery_mode {other}"
                    )));
                }
            };
        }
        client.backchannel_client_notification_endpoint = metadata
            .backchannel_client_notification_endpoint
            .as_deref()
            .map(|raw| parse_url(raw, "backchannel_client_notification_endpoint"))
            .transpose()?;
        client.backchannel_user_code_parameter = metadata.backchannel_user_code_parameter;
        Ok(client)
    }
}

fn client_secret_seen(client: &ClientInfo) -> Option<i64> {
    client
        .secrets
        .first()
        .map(|s| s.expires_at.map_or(0, |at| at.timestamp()))
}

/// Render a client record back into RFC 7591 metadata.
fn metadata_of(client: &ClientInfo) -> ClientMetadata {
    ClientMetadata {
        client_id: Some(client.client_id.clone()),
        redirect_uris: client
            .redirect_uris
            .iter()
            .map(|u| u.as_str().to_owned())
            .collect(),
        token_endpoint_auth_method: Some(
            client.token_endpoint_auth_method.as_str().to_owned(),
        ),
        grant_types: Some(client.grant_types.clone()),
        response_types: Some(client.response_types.clone()),
        client_name: None,
        scope: (!client.allowed_scopes.is_empty()).then(|| client.allowed_scopes.join(" ")),
        jwks: client.keys.jwks.clone(),
        jwks_uri: client.keys.jwks_uri.as_ref().map(|u| u.as_str().to_owned()),
        subject_type: Some(
            match client.subject_type {
                SubjectType::Public => "public",
                SubjectType::Pairwise => "pairwise",
            }
            .to_owned(),
        ),
        sector_identifier_uri: None,
        id_token_signed_response_alg: client.id_token_signed_response_alg.clone(),
        userinfo_signed_response_alg: client.userinfo_signed_response_alg.clone(),
        request_object_signing_alg: client.request_object_signing_alg.clone(),
        post_logout_redirect_uris: client
            .post_logout_redirect_uris
            .iter()
            .map(|u| u.as_str().to_owned())
            .collect(),
        frontchannel_logout_uri: client
            .frontchannel_logout_uri
            .as_ref()
            .map(|u| u.as_str().to_owned()),
        frontchannel_logout_session_required: client.frontchannel_logout_session_required,
        backchannel_logout_uri: client
            .backchannel_logout_uri
            .as_ref()
            .map(|u| u.as_str().to_owned()),
        backchannel_logout_session_required: client.backchannel_logout_session_required,
        backchannel_token_delivery_mode: Some(
            client.backchannel_token_delivery_mode.as_str().to_owned(),
        ),
        backchannel_client_notification_endpoint: client
            .backchannel_client_notification_endpoint
            .as_ref()
            .map(|u| u.as_str().to_owned()),
        backchannel_user_code_parameter: client.backchannel_user_code_parameter,
    }
}
