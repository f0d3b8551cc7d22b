//! Token introspection (RFC 7662)
//!
//! Discretion over detail: the metadata comes back only when the token is
//! alive *and* its audience names the asking client. Everything else -
//! malformed, expired, revoked, foreign audience - is `{"active": false}`.

use oxauth_core::error::ProtocolError;
use oxauth_core::records::TokenStatus;
use oxauth_jose::token::Expectations;
use tracing::debug;

use crate::client_auth::ClientAuthEvidence;
use crate::issuance::Ctx;
use crate::messages::{IntrospectionRequest, IntrospectionResponse};

pub struct IntrospectionHandler {
    ctx: Ctx,
}

impl IntrospectionHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Introspect one token.
    ///
    /// # Errors
    ///
    /// Only `invalid_client`; every token-side failure is the inactive
    /// response.
    pub async fn handle(
        &self,
        request: &IntrospectionRequest,
        evidence: &ClientAuthEvidence,
    ) -> Result<IntrospectionResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let audiences = self.ctx.client_assertion_audiences(&issuer);
        let client = self
            .ctx
            .authenticator
            .authenticate(evidence, &audiences)
            .await?;

        let expect = Expectations {
            issuer: Some(&issuer),
            require_exp: true,
            ..Expectations::default()
        };
        let decoded = match self.ctx.tokens.decode(&request.token, &expect) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "introspection of an invalid token");
                return Ok(IntrospectionResponse::inactive());
            }
        };
        let claims = decoded.claims;

        let Some(jti) = claims.jti.as_deref() else {
            return Ok(IntrospectionResponse::inactive());
        };
        if self.ctx.registry.get_status(jti).await? != TokenStatus::Active {
            return Ok(IntrospectionResponse::inactive());
        }

        // The caller must appear in the audience (or own the token);
        // otherwise it learns nothing.
        let caller_in_audience = claims.aud.iter().any(|aud| aud == &client.client_id)
            || claims.client_id() == Some(client.client_id.as_str());
        if !caller_in_audience {
            debug!(
                client_id = %client.client_id,
                "introspection by a non-audience client, answering inactive"
            );
            return Ok(IntrospectionResponse::inactive());
        }

        Ok(IntrospectionResponse {
            active: true,
            scope: claims.extra_str("scope").map(str::to_owned),
            client_id: claims.client_id().map(str::to_owned),
            sub: claims.sub.clone(),
            aud: (!claims.aud.is_empty()).then(|| claims.aud.clone()),
            iss: claims.iss.clone(),
            exp: claims.exp,
            iat: claims.iat,
            jti: Some(jti.to_owned()),
            token_type: Some("Bearer".to_owned()),
        })
    }
}
