//! End-session endpoint and logout fanout
//!
//! Validates the `id_token_hint` / `post_logout_redirect_uri` pair, signs
//! the session out, then notifies every client that received tokens under
//! it: back-channel clients get a `logout_token` POST (one retry with
//! jitter, failures logged and skipped), front-channel clients are
//! collected into the iframe URI list the adapter renders.

use std::time::Duration;

use oxauth_core::error::ProtocolError;
use oxauth_core::records::AuthSession;
use oxauth_jose::token::{Expectations, JwtClaims, TokenKind};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::issuance::Ctx;
use crate::messages::{EndSessionRequest, EndSessionResponse};
use crate::pairwise;

const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";
const LOGOUT_TOKEN_TTL: Duration = Duration::from_secs(120);

pub struct EndSessionHandler {
    ctx: Ctx,
}

impl EndSessionHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Process one logout request.
    ///
    /// # Errors
    ///
    /// `invalid_request` for a broken hint or an unregistered post-logout
    /// redirect.
    pub async fn handle(
        &self,
        request: &EndSessionRequest,
    ) -> Result<EndSessionResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;

        // A hint that does not verify is an error, not a shrug: the
        // redirect decision below depends on it.
        let hinted_client_id = match &request.id_token_hint {
            Some(hint) => {
                let expect = Expectations {
                    issuer: Some(&issuer),
                    kind: Some(TokenKind::Identity),
                    require_exp: false,
                    ..Expectations::default()
                };
                let decoded = self.ctx.tokens.decode(hint, &expect).map_err(|e| {
                    debug!(error = %e, "id_token_hint rejected");
                    ProtocolError::invalid_request("id_token_hint verification failed")
                })?;
                decoded.claims.aud.first().cloned()
            }
            None => None,
        };
        if let (Some(hinted), Some(param)) = (&hinted_client_id, &request.client_id)
            && hinted != param
        {
            return Err(ProtocolError::invalid_request(
                "client_id contradicts the id_token_hint",
            ));
        }
        let client_id = hinted_client_id.or_else(|| request.client_id.clone());

        let post_logout_redirect = match &request.post_logout_redirect_uri {
            None => None,
            Some(raw) => {
                let client_id = client_id.as_deref().ok_or_else(|| {
                    ProtocolError::invalid_request(
                        "post_logout_redirect_uri requires an id_token_hint or client_id",
                    )
                })?;
                let client = self.ctx.catalogue.require(client_id).await?;
                if !client
                    .post_logout_redirect_uris
                    .iter()
                    .any(|u| u.as_str() == raw)
                {
                    return Err(ProtocolError::invalid_request(
                        "post_logout_redirect_uri is not registered for this client",
                    ));
                }
                let mut url = Url::parse(raw).map_err(|_| {
                    ProtocolError::invalid_request("post_logout_redirect_uri is not a valid URL")
                })?;
                if let Some(state) = &request.state {
                    url.query_pairs_mut().append_pair("state", state);
                }
                Some(url.to_string())
            }
        };

        let session = match self.ctx.sessions.authenticate().await? {
            Some(session) => {
                self.ctx.sessions.sign_out(&session.session_id).await?;
                Some(session)
            }
            None => None,
        };

        let frontchannel = match &session {
            Some(session) => self.fan_out(&issuer, session).await?,
            None => Vec::new(),
        };

        info!(
            clients = frontchannel.len(),
            signed_out = session.is_some(),
            "end-session processed"
        );
        Ok(EndSessionResponse {
            post_logout_redirect,
            frontchannel_logout_uris: frontchannel,
        })
    }

    /// Notify every affected client; back-channel failures skip, never
    /// abort the remaining fanout.
    async fn fan_out(
        &self,
        issuer: &str,
        session: &AuthSession,
    ) -> Result<Vec<String>, ProtocolError> {
        let mut frontchannel = Vec::new();
        for client_id in &session.affected_client_ids {
            let Some(client) = self.ctx.catalogue.lookup(client_id).await? else {
                debug!(client_id = %client_id, "affected client vanished, skipping");
                continue;
            };

            if let Some(endpoint) = &client.backchannel_logout_uri {
                match self.mint_logout_token(issuer, &client, session).await {
                    Ok(token) => self.post_logout_token(endpoint, &token).await,
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "logout token minting failed, skipping client");
                    }
                }
            }

            if let Some(uri) = &client.frontchannel_logout_uri {
                let mut uri = uri.clone();
                if client.frontchannel_logout_session_required {
                    uri.query_pairs_mut()
                        .append_pair("iss", issuer)
                        .append_pair("sid", &session.session_id);
                }
                let rendered = uri.to_string();
                if !frontchannel.contains(&rendered) {
                    frontchannel.push(rendered);
                }
            }
        }
        Ok(frontchannel)
    }

    /// The OIDC Back-Channel Logout 1.0 token: `events` marks the type,
    /// `sub` and/or `sid` per the client's registration.
    async fn mint_logout_token(
        &self,
        issuer: &str,
        client: &oxauth_core::client::ClientInfo,
        session: &AuthSession,
    ) -> Result<String, ProtocolError> {
        let mut claims = JwtClaims {
            iss: Some(issuer.to_owned()),
            aud: vec![client.client_id.clone()],
            ..Default::default()
        };
        claims.set_extra("events", json!({ BACKCHANNEL_LOGOUT_EVENT: {} }));
        claims.set_extra("client_id", client.client_id.clone());
        if client.backchannel_logout_session_required {
            claims.set_extra("sid", session.session_id.clone());
        }
        claims.sub = Some(pairwise::subject_for(
            client,
            &session.subject,
            &self.ctx.options.pairwise_salt,
        ));

        Ok(self
            .ctx
            .tokens
            .issue(TokenKind::Logout, claims, LOGOUT_TOKEN_TTL, None)
            .await?
            .token)
    }

    async fn post_logout_token(&self, endpoint: &Url, token: &str) {
        let form = [("logout_token", token)];
        if self.ctx.fetcher.post_form(endpoint, &form, None).await.is_ok() {
            return;
        }
        let jitter = rand::rng().random_range(100..600);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        if let Err(e) = self.ctx.fetcher.post_form(endpoint, &form, None).await {
            warn!(endpoint = %endpoint, error = %e, "back-channel logout dropped after retry");
        }
    }
}
