//! Client-Initiated Backchannel Authentication engine
//!
//! The endpoint issues an `auth_req_id` and the request parks in
//! `Pending`. The host's interaction subsystem calls
//! [`BackchannelAuthHandler::complete`] when the user decides on their
//! authentication device; that transition wakes long-pollers and, for
//! ping/push clients, fires the notification POST.
//!
//! State machine: `Pending -> Authorized | Denied | Expired`.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use oxauth_core::client::BackchannelTokenDeliveryMode;
use oxauth_core::error::ProtocolError;
use oxauth_core::random;
use oxauth_core::records::{CibaRequest, CibaStatus};
use oxauth_jose::token::{Expectations, TokenKind};
use rand::Rng;
use tracing::{info, warn};
use url::Url;

use crate::client_auth::ClientAuthEvidence;
use crate::issuance::{self, Ctx, TokenSubject};
use crate::messages::{BackchannelAuthenticationRequest, BackchannelAuthenticationResponse};

/// The user's decision, delivered by the interaction subsystem.
#[derive(Debug, Clone)]
pub enum CibaOutcome {
    Approved {
        subject: String,
        session_id: Option<String>,
    },
    Denied,
}

pub struct BackchannelAuthHandler {
    ctx: Ctx,
}

impl BackchannelAuthHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Open one backchannel authentication request.
    ///
    /// # Errors
    ///
    /// `invalid_client`, `invalid_request` for hint violations,
    /// `invalid_scope` without `openid`, `missing_user_code` when the
    /// client declared the parameter and omitted it.
    pub async fn handle(
        &self,
        request: &BackchannelAuthenticationRequest,
        evidence: &ClientAuthEvidence,
    ) -> Result<BackchannelAuthenticationResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let audiences = self.ctx.client_assertion_audiences(&issuer);
        let client = self
            .ctx
            .authenticator
            .authenticate(evidence, &audiences)
            .await?;

        let scopes: Vec<String> = request
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_owned)
            .collect();
        if !scopes.iter().any(|s| s == "openid") {
            return Err(ProtocolError::invalid_scope(
                "backchannel requests require the openid scope",
            ));
        }
        for scope in &scopes {
            if !client.allows_scope(scope) {
                return Err(ProtocolError::invalid_scope(format!(
                    "scope {scope} is not allowed for this client"
                )));
            }
        }

        let hint_count = usize::from(request.login_hint.is_some())
            + usize::from(request.login_hint_token.is_some())
            + usize::from(request.id_token_hint.is_some());
        if hint_count != 1 {
            return Err(ProtocolError::invalid_request(
                "exactly one of login_hint, login_hint_token, id_token_hint is required",
            ));
        }
        let subject_hint = self.resolve_hint(&issuer, request).await?;

        if client.backchannel_user_code_parameter
            && self.ctx.options.ciba.user_code_parameter_supported
            && request.user_code.is_none()
        {
            return Err(ProtocolError::missing_user_code());
        }

        let delivery_mode = client.backchannel_token_delivery_mode;
        if delivery_mode != BackchannelTokenDeliveryMode::Poll
            && request.client_notification_token.is_none()
        {
            return Err(ProtocolError::invalid_request(
                "client_notification_token is required for ping and push delivery",
            ));
        }

        let options = &self.ctx.options.ciba;
        let expiry = request
            .requested_expiry
            .map(Duration::from_secs)
            .unwrap_or(options.default_expiry)
            .min(options.max_expiry);
        let now = Utc::now();
        let auth_req_id = random::urlsafe(options.request_id_entropy_bytes);

        let record = CibaRequest {
            auth_req_id: auth_req_id.clone(),
            client_id: client.client_id.clone(),
            scopes,
            resources: request.resource.clone(),
            subject_hint,
            binding_message: request.binding_message.clone(),
            user_code: request.user_code.clone(),
            status: CibaStatus::Pending,
            subject: None,
            session_id: None,
            delivery_mode,
            client_notification_token: request.client_notification_token.clone(),
            expires_at: now
                + TimeDelta::from_std(expiry)
                    .map_err(|_| ProtocolError::server_error("expiry out of range"))?,
            next_poll_at: now,
            interval: options.polling_interval,
        };
        self.ctx.ciba.put(record).await?;
        info!(client_id = %client.client_id, delivery = delivery_mode.as_str(), "backchannel request opened");

        Ok(BackchannelAuthenticationResponse {
            auth_req_id,
            expires_in: expiry.as_secs(),
            interval: options.polling_interval.as_secs(),
        })
    }

    /// An `id_token_hint` is decoded against our own keys; plain
    /// `login_hint` / `login_hint_token` pass through for the interaction
    /// subsystem to interpret.
    async fn resolve_hint(
        &self,
        issuer: &str,
        request: &BackchannelAuthenticationRequest,
    ) -> Result<Option<String>, ProtocolError> {
        if let Some(hint) = &request.id_token_hint {
            let expect = Expectations {
                issuer: Some(issuer),
                kind: Some(TokenKind::Identity),
                // The hinted token may be long expired; its binding is
                // what matters.
                require_exp: false,
                leeway: self.ctx.options.assertions.clock_skew,
                ..Expectations::default()
            };
            let decoded = self.ctx.tokens.decode(hint, &expect).map_err(|_| {
                ProtocolError::invalid_request("id_token_hint verification failed")
            })?;
            return Ok(decoded.claims.sub);
        }
        Ok(request
            .login_hint
            .clone()
            .or_else(|| request.login_hint_token.clone()))
    }

    /// Drive the `Pending -> Authorized | Denied` transition.
    ///
    /// # Errors
    ///
    /// `invalid_grant` for unknown or already-settled requests,
    /// `expired_token` past the expiry.
    pub async fn complete(
        &self,
        auth_req_id: &str,
        outcome: CibaOutcome,
    ) -> Result<(), ProtocolError> {
        let mut request = self
            .ctx
            .ciba
            .get(auth_req_id)
            .await?
            .ok_or_else(|| ProtocolError::invalid_grant("auth_req_id is unknown"))?;
        if request.status != CibaStatus::Pending {
            return Err(ProtocolError::invalid_grant(
                "the request has already been decided",
            ));
        }
        if request.is_expired(Utc::now()) {
            request.status = CibaStatus::Expired;
            self.ctx.ciba.update(request).await?;
            return Err(ProtocolError::expired_token("the request has expired"));
        }

        match outcome {
            CibaOutcome::Approved {
                subject,
                session_id,
            } => {
                request.status = CibaStatus::Authorized;
                request.subject = Some(subject);
                request.session_id = session_id;
            }
            CibaOutcome::Denied => request.status = CibaStatus::Denied,
        }
        self.ctx.ciba.update(request.clone()).await?;
        info!(auth_req_id = %auth_req_id, status = ?request.status, "backchannel request decided");

        match request.delivery_mode {
            BackchannelTokenDeliveryMode::Poll => Ok(()),
            BackchannelTokenDeliveryMode::Ping => self.notify_ping(&request).await,
            BackchannelTokenDeliveryMode::Push => self.notify_push(&request).await,
        }
    }

    async fn notify_ping(&self, request: &CibaRequest) -> Result<(), ProtocolError> {
        let client = self.ctx.catalogue.require(&request.client_id).await?;
        let Some(endpoint) = &client.backchannel_client_notification_endpoint else {
            return Ok(());
        };
        let body = serde_json::json!({ "auth_req_id": request.auth_req_id });
        self.post_with_retry(endpoint, &body, request.client_notification_token.as_deref())
            .await;
        Ok(())
    }

    /// Push delivery: the full token response lands at the notification
    /// endpoint and the stored request is consumed.
    async fn notify_push(&self, request: &CibaRequest) -> Result<(), ProtocolError> {
        if request.status != CibaStatus::Authorized {
            // Denials still notify, with the error envelope.
            let client = self.ctx.catalogue.require(&request.client_id).await?;
            if let Some(endpoint) = &client.backchannel_client_notification_endpoint {
                let body = serde_json::json!({
                    "auth_req_id": request.auth_req_id,
                    "error": "access_denied",
                    "error_description": "the user denied the request",
                });
                self.post_with_retry(
                    endpoint,
                    &body,
                    request.client_notification_token.as_deref(),
                )
                .await;
            }
            return Ok(());
        }

        let issuer = self.ctx.issuer_id().await?;
        let client = self.ctx.catalogue.require(&request.client_id).await?;
        let Some(endpoint) = client.backchannel_client_notification_endpoint.clone() else {
            return Ok(());
        };
        let subject = TokenSubject {
            subject: request
                .subject
                .clone()
                .ok_or_else(|| ProtocolError::server_error("authorized request lost its subject"))?,
            session_id: request.session_id.clone(),
            auth_time: Some(Utc::now()),
            acr: None,
        };

        let access = issuance::mint_access_token(
            &self.ctx,
            &issuer,
            &client,
            Some(&subject),
            &request.scopes,
            &request.resources,
            None,
            None,
        )
        .await?;
        let id_token = issuance::mint_identity_token(
            &self.ctx,
            &issuer,
            &client,
            &subject,
            None,
            None,
            Some(&access.token),
            None,
        )
        .await?;

        let body = serde_json::json!({
            "auth_req_id": request.auth_req_id,
            "access_token": access.token,
            "token_type": "Bearer",
            "expires_in": (access.expires_at - Utc::now()).num_seconds().max(0),
            "id_token": id_token.token,
        });
        self.post_with_retry(&endpoint, &body, request.client_notification_token.as_deref())
            .await;
        self.ctx.ciba.remove(&request.auth_req_id).await?;
        Ok(())
    }

    /// One retry with jittered backoff; permanent failure is logged and
    /// swallowed so one client's endpoint cannot wedge the transition.
    async fn post_with_retry(
        &self,
        endpoint: &Url,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) {
        if self.ctx.fetcher.post_json(endpoint, body, bearer).await.is_ok() {
            return;
        }
        let jitter = rand::rng().random_range(100..600);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        if let Err(e) = self.ctx.fetcher.post_json(endpoint, body, bearer).await {
            warn!(endpoint = %endpoint, error = %e, "backchannel notification dropped after retry");
        }
    }
}

/// Convenience used by interaction UIs that only hold the context.
pub async fn complete(
    ctx: &Ctx,
    auth_req_id: &str,
    outcome: CibaOutcome,
) -> Result<(), ProtocolError> {
    BackchannelAuthHandler::new(ctx.clone())
        .complete(auth_req_id, outcome)
        .await
}

/// Sanity guard used by tests and the discovery document: the configured
/// delivery modes must all be understood.
pub fn supported_delivery_modes(modes: &[String]) -> Vec<BackchannelTokenDeliveryMode> {
    modes
        .iter()
        .filter_map(|raw| match raw.as_str() {
            "poll" => Some(BackchannelTokenDeliveryMode::Poll),
            "ping" => Some(BackchannelTokenDeliveryMode::Ping),
            "push" => Some(BackchannelTokenDeliveryMode::Push),
            _ => None,
        })
        .collect()
}
