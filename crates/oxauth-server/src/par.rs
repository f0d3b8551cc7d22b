//! Pushed Authorization Requests (RFC 9126)
//!
//! An authenticated client POSTs the full parameter set and receives an
//! opaque `urn:ietf:params:oauth:request_uri:...` handle. The handle is
//! single-use and short-lived; the authorization endpoint resumes from it.

use chrono::{TimeDelta, Utc};
use oxauth_core::error::ProtocolError;
use oxauth_core::params::AuthorizationParameters;
use oxauth_core::random;
use oxauth_core::records::PendingAuthorization;
use tracing::info;

use crate::authorize::fetcher;
use crate::authorize::validators::{ValidationState, default_chain, run_chain};
use crate::client_auth::ClientAuthEvidence;
use crate::issuance::Ctx;
use crate::messages::PushedAuthorizationResponse;

pub struct PushedAuthorizationHandler {
    ctx: Ctx,
}

impl PushedAuthorizationHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Validate and persist one pushed request.
    ///
    /// # Errors
    ///
    /// `invalid_client` for failed authentication, otherwise the first
    /// validator error. PAR errors always travel as a JSON envelope -
    /// there is no redirect to prefer.
    pub async fn handle(
        &self,
        mut params: AuthorizationParameters,
        evidence: &ClientAuthEvidence,
    ) -> Result<PushedAuthorizationResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let audiences = self.ctx.client_assertion_audiences(&issuer);
        let client = self.ctx.authenticator.authenticate(evidence, &audiences).await?;

        // A pushed request is itself the referent; nesting is ambiguous.
        if params.request_uri.is_some() {
            return Err(ProtocolError::invalid_request(
                "request_uri cannot be used inside a pushed authorization request",
            ));
        }
        match &params.client_id {
            Some(id) if *id != client.client_id => {
                return Err(ProtocolError::invalid_request(
                    "client_id does not match the authenticated client",
                ));
            }
            _ => params.client_id = Some(client.client_id.clone()),
        }

        if let Some(object) = params.request.take() {
            if !self.ctx.options.authorization.request_parameter_supported {
                return Err(ProtocolError::new(
                    oxauth_core::error::ErrorCode::RequestNotSupported,
                    "request objects are disabled",
                ));
            }
            params =
                fetcher::apply_request_object(&self.ctx, &issuer, &client, &object, params)
                    .await?;
        }

        let mut state = ValidationState::new(client, params);
        run_chain(&default_chain(), &mut state)?;

        let now = Utc::now();
        let ttl = self.ctx.options.authorization.pushed_request_expires_in;
        let pending = PendingAuthorization {
            id: random::urlsafe(32),
            client_id: state.client.client_id.clone(),
            parameters: state.params,
            created_at: now,
            expires_at: now
                + TimeDelta::from_std(ttl)
                    .map_err(|_| ProtocolError::server_error("pushed request TTL out of range"))?,
        };
        self.ctx.pushed.put(pending.clone()).await?;
        info!(client_id = %pending.client_id, handle = %pending.id, "authorization request pushed");

        Ok(PushedAuthorizationResponse {
            request_uri: pending.request_uri(),
            expires_in: ttl.as_secs(),
        })
    }
}
