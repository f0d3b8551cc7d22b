//! Token revocation (RFC 7009)
//!
//! Revocation is deliberately uninformative: malformed tokens, unknown
//! tokens and tokens minted for a different client all return success, so
//! the endpoint cannot be used to probe another client's tokens.

use chrono::Utc;
use oxauth_core::error::ProtocolError;
use oxauth_core::records::TokenStatus;
use oxauth_jose::token::Expectations;
use std::time::Duration;
use tracing::{debug, info};

use crate::client_auth::ClientAuthEvidence;
use crate::issuance::Ctx;
use crate::messages::RevocationRequest;

pub struct RevocationHandler {
    ctx: Ctx,
}

impl RevocationHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Revoke one token.
    ///
    /// # Errors
    ///
    /// Only `invalid_client`; everything after authentication succeeds.
    pub async fn handle(
        &self,
        request: &RevocationRequest,
        evidence: &ClientAuthEvidence,
    ) -> Result<(), ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let audiences = self.ctx.client_assertion_audiences(&issuer);
        let client = self
            .ctx
            .authenticator
            .authenticate(evidence, &audiences)
            .await?;

        let expect = Expectations {
            issuer: Some(&issuer),
            // An expired token is fine to "revoke".
            require_exp: false,
            ..Expectations::default()
        };
        let decoded = match self.ctx.tokens.decode(&request.token, &expect) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "revocation of an undecodable token, succeeding silently");
                return Ok(());
            }
        };

        // Cross-client revocation silently succeeds without any effect.
        if decoded.claims.client_id() != Some(client.client_id.as_str()) {
            debug!(
                client_id = %client.client_id,
                "revocation of a foreign token, succeeding silently"
            );
            return Ok(());
        }

        let Some(jti) = decoded.claims.jti.as_deref() else {
            return Ok(());
        };
        let ttl = decoded
            .claims
            .exp
            .map(|exp| (exp - Utc::now().timestamp()).max(1) as u64)
            .unwrap_or(3600);
        self.ctx
            .registry
            .set_status(jti, TokenStatus::Revoked, Duration::from_secs(ttl))
            .await?;

        // Revoking one refresh link kills the whole chain and everything
        // derived from it.
        if decoded.header.typ.as_deref() == Some("refresh+jwt")
            && let Some(chain_id) = decoded.claims.chain_id()
        {
            self.ctx.registry.revoke_chain(chain_id).await?;
        }

        info!(client_id = %client.client_id, jti = %jti, "token revoked");
        Ok(())
    }
}
