//! Token endpoint pipeline
//!
//! Authenticate the client, dispatch on `grant_type`, let the grant
//! validator produce a [`ValidTokenRequest`], then mint through the shared
//! processor. Every grant converges on the same issuance path so claim
//! layout and registry bookkeeping cannot drift between grants.

pub mod grants;

use chrono::Utc;
use oxauth_core::claims::RequestedClaims;
use oxauth_core::client::ClientInfo;
use oxauth_core::error::ProtocolError;
use oxauth_core::params::GrantType;
use oxauth_jose::token::JwtClaims;
use tracing::info;

use crate::client_auth::ClientAuthEvidence;
use crate::issuance::{self, Ctx, TokenSubject};
use crate::messages::{TokenRequestParameters, TokenResponse};

/// A grant that passed validation and is ready for minting.
#[derive(Debug)]
pub struct ValidTokenRequest {
    pub client: ClientInfo,
    pub subject: Option<TokenSubject>,
    pub scopes: Vec<String>,
    pub resources: Vec<String>,
    pub claims: Option<RequestedClaims>,
    pub nonce: Option<String>,
    /// Mint a fresh refresh chain (authorization_code with offline_access).
    pub issue_refresh: bool,
    /// Rotate this presented refresh token instead.
    pub refresh_presented: Option<JwtClaims>,
    /// Revocation chain the minted tokens join.
    pub chain_key: Option<String>,
    pub include_identity: bool,
}

impl ValidTokenRequest {
    pub(crate) fn bare(client: ClientInfo) -> Self {
        Self {
            client,
            subject: None,
            scopes: Vec::new(),
            resources: Vec::new(),
            claims: None,
            nonce: None,
            issue_refresh: false,
            refresh_presented: None,
            chain_key: None,
            include_identity: false,
        }
    }
}

/// The endpoint handler.
pub struct TokenHandler {
    ctx: Ctx,
}

impl TokenHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Process one token request.
    ///
    /// # Errors
    ///
    /// The RFC 6749 error envelope for the failing stage: authentication
    /// (`invalid_client`), grant validation (`invalid_grant`,
    /// `authorization_pending`, ...), or minting (`server_error`).
    pub async fn handle(
        &self,
        params: &TokenRequestParameters,
        evidence: &ClientAuthEvidence,
    ) -> Result<TokenResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let audiences = self.ctx.client_assertion_audiences(&issuer);
        let client = self
            .ctx
            .authenticator
            .authenticate(evidence, &audiences)
            .await?;

        let grant = GrantType::parse(&params.grant_type)?;
        if !client.allows_grant_type(grant.as_str()) {
            return Err(ProtocolError::unauthorized_client(format!(
                "grant_type {} is not registered for this client",
                grant.as_str()
            )));
        }

        let valid = match grant {
            GrantType::AuthorizationCode => {
                grants::authorization_code(&self.ctx, client, params).await?
            }
            GrantType::RefreshToken => {
                grants::refresh_token(&self.ctx, &issuer, client, params).await?
            }
            GrantType::ClientCredentials => grants::client_credentials(client, params)?,
            GrantType::DeviceCode => grants::device_code(&self.ctx, client, params).await?,
            GrantType::Ciba => grants::ciba(&self.ctx, client, params).await?,
            GrantType::JwtBearer => {
                grants::jwt_bearer(&self.ctx, &issuer, client, params).await?
            }
        };

        self.process(&issuer, valid, grant).await
    }

    /// Shared minting for every grant.
    async fn process(
        &self,
        issuer: &str,
        valid: ValidTokenRequest,
        grant: GrantType,
    ) -> Result<TokenResponse, ProtocolError> {
        let client = &valid.client;

        let refresh_token = if let Some(presented) = &valid.refresh_presented {
            let (minted, _) = self
                .ctx
                .tokens
                .rotate_refresh(presented, &client.refresh_token)
                .await?;
            Some(minted.token)
        } else if valid.issue_refresh {
            let subject = valid
                .subject
                .as_ref()
                .ok_or_else(|| ProtocolError::server_error("refresh grant without a subject"))?;
            Some(
                issuance::mint_refresh_chain(
                    &self.ctx,
                    issuer,
                    client,
                    subject,
                    &valid.scopes,
                    &valid.resources,
                    valid.chain_key.as_deref(),
                )
                .await?
                .token,
            )
        } else {
            None
        };

        let access = issuance::mint_access_token(
            &self.ctx,
            issuer,
            client,
            valid.subject.as_ref(),
            &valid.scopes,
            &valid.resources,
            valid.claims.as_ref(),
            valid.chain_key.as_deref(),
        )
        .await?;

        let id_token = if valid.include_identity {
            let subject = valid
                .subject
                .as_ref()
                .ok_or_else(|| ProtocolError::server_error("identity grant without a subject"))?;
            Some(
                issuance::mint_identity_token(
                    &self.ctx,
                    issuer,
                    client,
                    subject,
                    valid.nonce.as_deref(),
                    valid.claims.as_ref(),
                    Some(&access.token),
                    None,
                )
                .await?
                .token,
            )
        } else {
            None
        };

        info!(
            client_id = %client.client_id,
            grant = grant.as_str(),
            "tokens issued"
        );
        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".to_owned(),
            expires_in: (access.expires_at - Utc::now()).num_seconds().max(0) as u64,
            refresh_token,
            id_token,
            scope: (!valid.scopes.is_empty()).then(|| valid.scopes.join(" ")),
        })
    }
}
