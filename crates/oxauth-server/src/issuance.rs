//! Token issuance shared by the authorization and token pipelines
//!
//! Both endpoints mint through these helpers so claim layout, pairwise
//! subject handling and registry bookkeeping stay identical regardless of
//! which pipeline produced the grant.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use oxauth_core::claims::RequestedClaims;
use oxauth_core::client::ClientInfo;
use oxauth_core::error::ProtocolError;
use oxauth_core::records::AuthSession;
use oxauth_jose::alg::SigningAlgorithm;
use oxauth_jose::token::{JwtClaims, MintedToken, TokenKind};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::warn;

use crate::context::ServerContext;
use crate::pairwise;

/// The authenticated end-user a token speaks for.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    /// Internal identifier; pairwise transformation happens at mint time.
    pub subject: String,
    pub session_id: Option<String>,
    pub auth_time: Option<DateTime<Utc>>,
    pub acr: Option<String>,
}

impl TokenSubject {
    fn as_session(&self) -> AuthSession {
        AuthSession {
            subject: self.subject.clone(),
            session_id: self.session_id.clone().unwrap_or_default(),
            auth_time: self.auth_time.unwrap_or_else(Utc::now),
            identity_provider: None,
            acr: self.acr.clone(),
            affected_client_ids: Default::default(),
        }
    }
}

fn base_claims(
    issuer: &str,
    client: &ClientInfo,
    subject: Option<&TokenSubject>,
    salt: &str,
) -> JwtClaims {
    let mut claims = JwtClaims {
        iss: Some(issuer.to_owned()),
        aud: vec![client.client_id.clone()],
        ..Default::default()
    };
    claims.set_extra("client_id", client.client_id.clone());
    if let Some(subject) = subject {
        claims.sub = Some(pairwise::subject_for(client, &subject.subject, salt));
        if let Some(sid) = &subject.session_id {
            claims.set_extra("sid", sid.clone());
        }
    }
    claims
}

/// Mint the access token for one grant.
///
/// `aud` is the requested resource set when present, else the client id.
/// `chain_key` binds the `jti` to a revocation chain (authorization code
/// or refresh chain) so replay detection can revoke derived tokens.
///
/// # Errors
///
/// `server_error` for signing or registry failures.
pub async fn mint_access_token(
    ctx: &ServerContext,
    issuer: &str,
    client: &ClientInfo,
    subject: Option<&TokenSubject>,
    scopes: &[String],
    resources: &[String],
    requested: Option<&RequestedClaims>,
    chain_key: Option<&str>,
) -> Result<MintedToken, ProtocolError> {
    let mut claims = base_claims(issuer, client, subject, &ctx.options.pairwise_salt);
    if !resources.is_empty() {
        claims.aud = resources.to_vec();
    }
    if !scopes.is_empty() {
        claims.set_extra("scope", scopes.join(" "));
    }
    // Userinfo reads the granted claim names back out of the token.
    if let Some(requested) = requested {
        let names: Vec<String> = requested
            .userinfo_claim_names()
            .map(str::to_owned)
            .collect();
        if !names.is_empty() {
            claims.set_extra("userinfo_claims", names);
        }
    }
    let minted = ctx
        .tokens
        .issue(
            TokenKind::Access,
            claims,
            client.lifetimes.access_token,
            None,
        )
        .await?;
    if let Some(chain) = chain_key {
        ctx.registry.bind_chain(&minted.jti, chain).await?;
    }
    Ok(minted)
}

/// Mint the identity token for one grant.
///
/// `access_token` / `code` drive the `at_hash` / `c_hash` claims the
/// hybrid and implicit flows require. Requested `id_token` claims are
/// resolved through the injected [`oxauth_core::collaborators::UserInfoProvider`].
///
/// # Errors
///
/// `server_error` for signing failures or a claims-provider breakdown.
pub async fn mint_identity_token(
    ctx: &ServerContext,
    issuer: &str,
    client: &ClientInfo,
    subject: &TokenSubject,
    nonce: Option<&str>,
    requested: Option<&RequestedClaims>,
    access_token: Option<&str>,
    code: Option<&str>,
) -> Result<MintedToken, ProtocolError> {
    let algorithm = identity_algorithm(client)?;
    let mut claims = base_claims(issuer, client, Some(subject), &ctx.options.pairwise_salt);
    if let Some(nonce) = nonce {
        claims.set_extra("nonce", nonce.to_owned());
    }
    if let Some(auth_time) = subject.auth_time {
        claims.set_extra("auth_time", auth_time.timestamp());
    }
    if let Some(acr) = &subject.acr {
        claims.set_extra("acr", acr.clone());
    }
    if let Some(at) = access_token {
        claims.set_extra("at_hash", half_hash(algorithm, at));
    }
    if let Some(code) = code {
        claims.set_extra("c_hash", half_hash(algorithm, code));
    }

    if let Some(requested) = requested {
        let names: Vec<String> = requested
            .id_token_claim_names()
            .map(str::to_owned)
            .collect();
        if !names.is_empty() {
            let resolved = ctx
                .users
                .get_claims(&subject.as_session(), &names)
                .await?;
            for (name, value) in resolved {
                // Registered claims stay under the service's control.
                if !matches!(name.as_str(), "iss" | "aud" | "exp" | "iat" | "nbf" | "jti" | "sub")
                {
                    claims.extra.insert(name, value);
                }
            }
        }
    }

    ctx.tokens
        .issue(
            TokenKind::Identity,
            claims,
            client.lifetimes.identity_token,
            Some(algorithm),
        )
        .await
}

/// Start a refresh chain for one grant.
///
/// # Errors
///
/// `server_error` for signing or registry failures.
pub async fn mint_refresh_chain(
    ctx: &ServerContext,
    issuer: &str,
    client: &ClientInfo,
    subject: &TokenSubject,
    scopes: &[String],
    resources: &[String],
    chain_key: Option<&str>,
) -> Result<MintedToken, ProtocolError> {
    let mut claims = base_claims(issuer, client, None, &ctx.options.pairwise_salt);
    // Refresh tokens carry the internal subject: every re-mint derives the
    // client-facing sub again, keeping pairwise derivation in one place.
    claims.sub = Some(subject.subject.clone());
    if let Some(sid) = &subject.session_id {
        claims.set_extra("sid", sid.clone());
    }
    if let Some(auth_time) = subject.auth_time {
        claims.set_extra("auth_time", auth_time.timestamp());
    }
    if let Some(acr) = &subject.acr {
        claims.set_extra("acr", acr.clone());
    }
    claims.set_extra("scope", scopes.join(" "));
    if !resources.is_empty() {
        claims.set_extra("resources", resources.to_vec());
    }
    let minted = ctx.tokens.issue_refresh(claims, &client.refresh_token).await?;
    if let Some(chain) = chain_key {
        ctx.registry.bind_chain(&minted.jti, chain).await?;
    }
    Ok(minted)
}

/// The signing algorithm for a client's identity tokens.
///
/// # Errors
///
/// `server_error` when the registered algorithm is outside the JWS set.
fn identity_algorithm(client: &ClientInfo) -> Result<SigningAlgorithm, ProtocolError> {
    match &client.id_token_signed_response_alg {
        None => Ok(SigningAlgorithm::Rs256),
        Some(raw) => SigningAlgorithm::parse(raw).map_err(|e| {
            warn!(client_id = %client.client_id, error = %e, "bad registered id_token alg");
            ProtocolError::server_error("registered id_token algorithm is unusable")
        }),
    }
}

/// OIDC Core §3.3.2.11: left half of the token's hash, base64url.
pub fn half_hash(algorithm: SigningAlgorithm, value: &str) -> String {
    let digest: Vec<u8> = match algorithm.as_str() {
        alg if alg.ends_with("384") => Sha384::digest(value.as_bytes()).to_vec(),
        alg if alg.ends_with("512") => Sha512::digest(value.as_bytes()).to_vec(),
        _ => Sha256::digest(value.as_bytes()).to_vec(),
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// Record that a client received tokens under a session, for logout
/// fanout.
pub async fn record_affected_client(
    ctx: &ServerContext,
    session: &mut AuthSession,
    client_id: &str,
) -> Result<(), ProtocolError> {
    if session.affected_client_ids.insert(client_id.to_owned()) {
        ctx.sessions.update(session.clone()).await?;
    }
    Ok(())
}

/// Authorization codes are stored and registered under their digest, so a
/// storage dump cannot be replayed directly.
pub fn hash_code(code: &str) -> Vec<u8> {
    Sha256::digest(code.as_bytes()).to_vec()
}

/// Revocation-chain key for everything derived from one authorization code.
pub fn code_chain_key(code_hash: &[u8]) -> String {
    format!("code:{}", URL_SAFE_NO_PAD.encode(code_hash))
}

/// `Arc<ServerContext>` convenience used by the handlers.
pub type Ctx = Arc<ServerContext>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_hash_is_left_half_base64url() {
        let hash = half_hash(SigningAlgorithm::Rs256, "token-value");
        let raw = URL_SAFE_NO_PAD.decode(hash).unwrap();
        assert_eq!(raw.len(), 16);
        let hash384 = half_hash(SigningAlgorithm::Es384, "token-value");
        assert_eq!(URL_SAFE_NO_PAD.decode(hash384).unwrap().len(), 24);
    }
}
