//! Userinfo endpoint
//!
//! Decodes the bearer access token, checks its registry status, and
//! returns the claims the grant allows: scope-implied claim names plus
//! whatever the `claims` parameter's userinfo bucket granted (carried in
//! the access token). The response is plain JSON or a signed JWT per the
//! client's `userinfo_signed_response_alg`.

use oxauth_core::error::ProtocolError;
use oxauth_core::records::{AuthSession, TokenStatus};
use oxauth_jose::alg::SigningAlgorithm;
use oxauth_jose::token::{Expectations, JwtClaims, TokenKind};
use tracing::debug;

use crate::issuance::Ctx;

/// Plain or signed, per client registration.
#[derive(Debug, Clone)]
pub enum UserinfoResponse {
    Json(serde_json::Map<String, serde_json::Value>),
    Jwt(String),
}

/// OIDC Core §5.4 scope-to-claims mapping.
fn scope_implied_claims(scopes: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for scope in scopes {
        let implied: &[&str] = match scope.as_str() {
            "profile" => &[
                "name",
                "family_name",
                "given_name",
                "middle_name",
                "nickname",
                "preferred_username",
                "profile",
                "picture",
                "website",
                "gender",
                "birthdate",
                "zoneinfo",
                "locale",
                "updated_at",
            ],
            "email" => &["email", "email_verified"],
            "address" => &["address"],
            "phone" => &["phone_number", "phone_number_verified"],
            _ => &[],
        };
        names.extend(implied.iter().map(|s| (*s).to_owned()));
    }
    names
}

pub struct UserinfoHandler {
    ctx: Ctx,
}

impl UserinfoHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Answer one userinfo request.
    ///
    /// # Errors
    ///
    /// `invalid_token` for a broken, expired or revoked access token.
    pub async fn handle(&self, bearer: &str) -> Result<UserinfoResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let expect = Expectations::for_kind(TokenKind::Access).issued_by(&issuer);
        let decoded = self.ctx.tokens.decode(bearer, &expect).map_err(|e| {
            debug!(error = %e, "userinfo bearer rejected");
            ProtocolError::invalid_token("access token is invalid or expired")
        })?;
        let token = decoded.claims;

        let jti = token
            .jti
            .as_deref()
            .ok_or_else(|| ProtocolError::invalid_token("access token carries no jti"))?;
        if self.ctx.registry.get_status(jti).await? != TokenStatus::Active {
            return Err(ProtocolError::invalid_token("access token is not active"));
        }
        let subject = token
            .sub
            .clone()
            .ok_or_else(|| ProtocolError::invalid_token("access token carries no subject"))?;
        let scopes = token.scope();
        if !scopes.iter().any(|s| s == "openid") {
            return Err(ProtocolError::invalid_token(
                "access token was not granted the openid scope",
            ));
        }

        let mut names = scope_implied_claims(&scopes);
        if let Some(granted) = token.extra.get("userinfo_claims").and_then(|v| v.as_array()) {
            names.extend(
                granted
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned)),
            );
        }
        names.sort();
        names.dedup();

        // The provider receives the subject exactly as issued; pairwise
        // hosts must be able to map their own derived identifiers.
        let session = AuthSession {
            subject: subject.clone(),
            session_id: token.session_id().unwrap_or_default().to_owned(),
            auth_time: chrono::Utc::now(),
            identity_provider: None,
            acr: None,
            affected_client_ids: Default::default(),
        };
        let mut claims = if names.is_empty() {
            serde_json::Map::new()
        } else {
            self.ctx.users.get_claims(&session, &names).await?
        };
        claims.insert("sub".to_owned(), serde_json::Value::String(subject.clone()));

        let client_id = token
            .client_id()
            .ok_or_else(|| ProtocolError::invalid_token("access token carries no client"))?;
        let client = self.ctx.catalogue.require(client_id).await?;
        match &client.userinfo_signed_response_alg {
            None => Ok(UserinfoResponse::Json(claims)),
            Some(raw) => {
                let algorithm = SigningAlgorithm::parse(raw).map_err(|_| {
                    ProtocolError::server_error("registered userinfo algorithm is unusable")
                })?;
                // `sub` lives in the typed field; a copy in the flattened
                // map would serialize the key twice.
                claims.remove("sub");
                let jwt_claims = JwtClaims {
                    iss: Some(issuer),
                    sub: Some(subject),
                    aud: vec![client.client_id.clone()],
                    extra: claims,
                    ..Default::default()
                };
                let signed = self
                    .ctx
                    .tokens
                    .sign(TokenKind::Identity, &jwt_claims, Some(algorithm))
                    .map_err(|_| ProtocolError::server_error("userinfo signing failed"))?;
                Ok(UserinfoResponse::Jwt(signed))
            }
        }
    }
}
