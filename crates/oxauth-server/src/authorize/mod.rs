//! Authorization endpoint pipeline
//!
//! Validate, interact, issue. The validator chain runs first; a validated
//! request is handed to the host's interaction collaborator, whose
//! non-approved outcomes become redirects to the interaction UI carrying a
//! persisted request handle. Approval issues artifacts per flow and
//! delivers them through the negotiated response mode.
//!
//! Per-request state machine:
//! `Received -> Validated -> Interacting <-> {LoginRequired, ...} ->
//! Approved -> Issued | Denied`.

pub mod fetcher;
pub mod response;
pub mod validators;

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use oxauth_core::claims::RequestedClaims;
use oxauth_core::client::ClientInfo;
use oxauth_core::collaborators::{Approval, InteractionOutcome};
use oxauth_core::error::{ErrorCode, ProtocolError};
use oxauth_core::params::{AuthorizationParameters, Flow, ResponseMode, ResponseTypeSet};
use oxauth_core::random;
use oxauth_core::records::{AuthorizationContext, PendingAuthorization, TokenStatus};
use tracing::{debug, info};
use url::Url;

use crate::context::ServerContext;
use crate::issuance::{self, Ctx, TokenSubject};
use crate::session;

use response::{AuthorizationResponse, Delivery};
use validators::{ValidationState, default_chain, run_chain};

/// A request that survived the validator chain.
#[derive(Debug)]
pub struct ValidAuthorizationRequest {
    pub client: ClientInfo,
    pub parameters: AuthorizationParameters,
    pub response_type: ResponseTypeSet,
    pub flow: Flow,
    pub response_mode: ResponseMode,
    pub redirect_uri: Url,
    pub claims: Option<RequestedClaims>,
}

/// What the adapter does next.
#[derive(Debug)]
pub enum AuthorizationResult {
    /// 303 to the interaction UI.
    Interaction(Url),
    /// Artifacts delivered through the response mode.
    Success(Delivery),
    /// A validator error delivered through the validated redirect.
    Error(Delivery),
}

/// The endpoint handler.
pub struct AuthorizationHandler {
    ctx: Ctx,
}

impl AuthorizationHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Process one authorization request.
    ///
    /// # Errors
    ///
    /// A [`ProtocolError`] is returned only while no redirect URI is
    /// trusted; from then on errors travel inside
    /// [`AuthorizationResult::Error`].
    pub async fn handle(
        &self,
        params: AuthorizationParameters,
    ) -> Result<AuthorizationResult, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let (client, params) = fetcher::resolve(&self.ctx, &issuer, params).await?;

        let mut state = ValidationState::new(client, params);
        if let Err(err) = run_chain(&default_chain(), &mut state) {
            // Deliver through the redirect when one has been validated.
            return match (&state.redirect_uri, state.response_mode) {
                (Some(redirect), Some(mode)) => Ok(AuthorizationResult::Error(
                    AuthorizationResponse::error(redirect.clone(), mode, &err).deliver(),
                )),
                _ => Err(err),
            };
        }

        let valid = ValidAuthorizationRequest {
            redirect_uri: state.redirect_uri.expect("chain validated"),
            response_type: state.response_type.expect("chain validated"),
            flow: state.flow.expect("chain validated"),
            response_mode: state.response_mode.expect("chain validated"),
            claims: state.claims,
            client: state.client,
            parameters: state.params,
        };

        // The request is persisted before the interaction drive so every
        // outcome can resume it by handle.
        let pending = self.persist_request(&valid).await?;
        match self.ctx.interaction.drive(&pending).await? {
            InteractionOutcome::Approved(approval) => {
                let response = self.issue(&issuer, &valid, approval).await?;
                Ok(AuthorizationResult::Success(response.deliver()))
            }
            other => {
                // prompt=none promised no interaction; the outcome becomes
                // the matching OIDC error instead of a redirect.
                if valid.parameters.prompts().contains(&"none") {
                    let err = interaction_error(&other)
                        .with_state(valid.parameters.state.clone());
                    return Ok(AuthorizationResult::Error(
                        AuthorizationResponse::error(
                            valid.redirect_uri.clone(),
                            valid.response_mode,
                            &err,
                        )
                        .deliver(),
                    ));
                }
                let target = self.interaction_redirect(&valid, &pending, other)?;
                Ok(AuthorizationResult::Interaction(target))
            }
        }
    }

    /// Persist the request under a fresh handle so the interaction UI can
    /// re-enter the endpoint with `request_uri=urn:...`.
    async fn persist_request(
        &self,
        valid: &ValidAuthorizationRequest,
    ) -> Result<PendingAuthorization, ProtocolError> {
        let now = Utc::now();
        let ttl = TimeDelta::from_std(self.ctx.options.authorization.pushed_request_expires_in)
            .map_err(|_| ProtocolError::server_error("pushed request TTL out of range"))?;
        let pending = PendingAuthorization {
            id: random::urlsafe(32),
            client_id: valid.client.client_id.clone(),
            parameters: valid.parameters.clone(),
            created_at: now,
            expires_at: now + ttl,
        };
        self.ctx.pushed.put(pending.clone()).await?;
        Ok(pending)
    }

    fn interaction_redirect(
        &self,
        valid: &ValidAuthorizationRequest,
        pending: &PendingAuthorization,
        outcome: InteractionOutcome,
    ) -> Result<Url, ProtocolError> {
        let (mut target, kind) = match outcome {
            InteractionOutcome::LoginRequired(uri) => (uri, "login"),
            InteractionOutcome::ConsentRequired(uri) => (uri, "consent"),
            InteractionOutcome::AccountSelectionRequired(uri) => (uri, "account_selection"),
            InteractionOutcome::InteractionRequired(uri) => (uri, "interaction"),
            InteractionOutcome::Approved(_) => unreachable!("approved handled by the caller"),
        };
        // The persisted handle lets the UI resume the exact request.
        target.query_pairs_mut().append_pair(
            &self.ctx.options.authorization.request_uri_parameter_name,
            &pending.request_uri(),
        );
        debug!(
            client_id = %valid.client.client_id,
            interaction = kind,
            "authorization suspended for interaction"
        );
        Ok(target)
    }

    /// Issue artifacts for an approved request.
    async fn issue(
        &self,
        issuer: &str,
        valid: &ValidAuthorizationRequest,
        approval: Approval,
    ) -> Result<AuthorizationResponse, ProtocolError> {
        let mut session = approval.session;
        issuance::record_affected_client(&self.ctx, &mut session, &valid.client.client_id)
            .await?;
        let subject = TokenSubject {
            subject: session.subject.clone(),
            session_id: Some(session.session_id.clone()),
            auth_time: Some(session.auth_time),
            acr: session.acr.clone(),
        };
        let scopes = approval.granted_scopes;
        let claims = approval.granted_claims.or_else(|| valid.claims.clone());

        let mut response =
            AuthorizationResponse::new(valid.redirect_uri.clone(), valid.response_mode)
                .param("iss", issuer)
                .param_opt("state", valid.parameters.state.clone());

        let code = if valid.response_type.code {
            let code = self
                .store_code(issuer, valid, &session.session_id, &subject, &scopes, &claims)
                .await?;
            response = response.param("code", code.clone());
            Some(code)
        } else {
            None
        };

        let access_token = if valid.response_type.token {
            let chain_key = code.as_deref().map(|c| {
                issuance::code_chain_key(&issuance::hash_code(c))
            });
            let minted = issuance::mint_access_token(
                &self.ctx,
                issuer,
                &valid.client,
                Some(&subject),
                &scopes,
                &valid.parameters.resource,
                claims.as_ref(),
                chain_key.as_deref(),
            )
            .await?;
            let expires_in = (minted.expires_at - Utc::now()).num_seconds().max(0);
            response = response
                .param("access_token", minted.token.clone())
                .param("token_type", "Bearer")
                .param("expires_in", expires_in.to_string())
                .param("scope", scopes.join(" "));
            Some(minted.token)
        } else {
            None
        };

        if valid.response_type.id_token {
            let minted = issuance::mint_identity_token(
                &self.ctx,
                issuer,
                &valid.client,
                &subject,
                valid.parameters.nonce.as_deref(),
                claims.as_ref(),
                access_token.as_deref(),
                code.as_deref(),
            )
            .await?;
            response = response.param("id_token", minted.token);
        }

        let origin = origin_of(&valid.redirect_uri);
        response = response.param(
            "session_state",
            session::session_state(&valid.client.client_id, &origin, &session.session_id),
        );

        info!(
            client_id = %valid.client.client_id,
            flow = ?valid.flow,
            "authorization issued"
        );
        Ok(response)
    }

    /// Mint and persist one authorization code.
    async fn store_code(
        &self,
        _issuer: &str,
        valid: &ValidAuthorizationRequest,
        session_id: &str,
        subject: &TokenSubject,
        scopes: &[String],
        claims: &Option<RequestedClaims>,
    ) -> Result<String, ProtocolError> {
        let lifetime = valid
            .client
            .lifetimes
            .authorization_code
            .min(self.ctx.options.authorization.authorization_code_expires_in);
        let now = Utc::now();
        let code = random::urlsafe(32);
        let hash = issuance::hash_code(&code);

        let context = AuthorizationContext {
            client_id: valid.client.client_id.clone(),
            // The raw request value: redemption compares byte-for-byte.
            redirect_uri: valid.parameters.redirect_uri.clone(),
            scopes: scopes.to_vec(),
            claims: claims.clone(),
            nonce: valid.parameters.nonce.clone(),
            code_challenge: valid.parameters.code_challenge.clone(),
            code_challenge_method: valid.parameters.code_challenge_method.clone(),
            resources: valid.parameters.resource.clone(),
            response_type: valid.response_type,
            response_mode: valid.response_mode,
            subject: subject.subject.clone(),
            session_id: session_id.to_owned(),
            acr: subject.acr.clone(),
            auth_time: subject.auth_time.unwrap_or(now),
            issued_at: now,
            expires_at: now
                + TimeDelta::from_std(lifetime)
                    .map_err(|_| ProtocolError::server_error("code lifetime out of range"))?,
        };
        self.ctx.contexts.put(&hash, context).await?;
        // Registered for replay detection: redemption consumes this record
        // and a second attempt revokes everything derived from the code.
        // The record outlives the code by the access-token window so a
        // late replay still burns the derived tokens.
        self.ctx
            .registry
            .set_status(
                &issuance::code_chain_key(&hash),
                TokenStatus::Active,
                lifetime + valid.client.lifetimes.access_token + Duration::from_secs(60),
            )
            .await?;
        Ok(code)
    }
}

fn interaction_error(outcome: &InteractionOutcome) -> ProtocolError {
    let code = match outcome {
        InteractionOutcome::LoginRequired(_) => ErrorCode::LoginRequired,
        InteractionOutcome::ConsentRequired(_) => ErrorCode::ConsentRequired,
        InteractionOutcome::AccountSelectionRequired(_) => ErrorCode::AccountSelectionRequired,
        InteractionOutcome::InteractionRequired(_) | InteractionOutcome::Approved(_) => {
            ErrorCode::InteractionRequired
        }
    };
    ProtocolError::new(code, "interaction is required but prompt=none was requested")
}

fn origin_of(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}
