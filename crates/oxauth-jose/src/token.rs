//! Token service
//!
//! Mints and decodes the seven JWT flavours the server issues, registers
//! every `jti` before a token leaves the process, and owns the
//! refresh-token rotation contract. External material (client assertions,
//! request objects, trusted-issuer assertions) is verified through the
//! standalone helpers at the bottom; those never accept `none` and never
//! touch the service ring.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Header, TokenData, Validation, decode, decode_header, encode};
use oxauth_core::client::RefreshTokenPolicy;
use oxauth_core::error::ProtocolError;
use oxauth_core::records::TokenStatus;
use oxauth_core::storage::TokenRegistry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alg::SigningAlgorithm;
use crate::error::JoseError;
use crate::keys::KeyRing;

/// The seven token flavours, distinguished by their `typ` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Identity,
    Refresh,
    Logout,
    RequestObject,
    ClientAssertion,
    RegistrationAccess,
}

impl TokenKind {
    pub fn typ(self) -> &'static str {
        match self {
            Self::Access => "at+jwt",
            Self::Identity => "JWT",
            Self::Refresh => "refresh+jwt",
            Self::Logout => "logout+jwt",
            Self::RequestObject => "oauth-authz-req+jwt",
            Self::ClientAssertion => "JWT",
            Self::RegistrationAccess => "rat+jwt",
        }
    }

    /// Whether a presented `typ` header is acceptable for this flavour.
    /// Absent and the generic `JWT` are tolerated for compatibility.
    pub fn accepts_typ(self, typ: Option<&str>) -> bool {
        match typ {
            None => true,
            Some(t) => t.eq_ignore_ascii_case(self.typ()) || t.eq_ignore_ascii_case("JWT"),
        }
    }
}

/// Registered + private claims of one token.
///
/// Flavour-specific members live in `extra`; the typed accessors cover the
/// ones the pipelines read.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JwtClaims {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sub: Option<String>,
    #[serde(with = "aud_serde", skip_serializing_if = "Vec::is_empty", default)]
    pub aud: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jti: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `aud` is one string or an array of strings on the wire.
mod aud_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(aud: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        match aud {
            [single] => single.serialize(serializer),
            many => many.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<String>, D::Error> {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        })
    }
}

impl JwtClaims {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.extra.insert(key.to_owned(), value.into());
    }

    pub fn client_id(&self) -> Option<&str> {
        self.extra_str("client_id")
    }

    pub fn scope(&self) -> Vec<String> {
        self.extra_str("scope")
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_owned)
            .collect()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.extra_str("sid")
    }

    /// Identifier shared by every link of a refresh chain; the first
    /// link's `jti` when never set.
    pub fn chain_id(&self) -> Option<&str> {
        self.extra_str("chain_id").or(self.jti.as_deref())
    }

    /// Absolute expiry of a refresh chain, epoch seconds.
    pub fn chain_expires_at(&self) -> Option<i64> {
        self.extra.get("chain_exp").and_then(|v| v.as_i64())
    }
}

/// A decoded, signature-verified token.
#[derive(Debug, Clone)]
pub struct DecodedJwt {
    pub header: Header,
    pub claims: JwtClaims,
}

/// What a decode must enforce beyond the signature.
#[derive(Debug, Clone, Default)]
pub struct Expectations<'a> {
    pub issuer: Option<&'a str>,
    pub audience: Option<&'a str>,
    pub kind: Option<TokenKind>,
    pub leeway: Duration,
    /// Off only for flavours without expiry (registration access tokens).
    pub require_exp: bool,
}

impl<'a> Expectations<'a> {
    pub fn for_kind(kind: TokenKind) -> Self {
        Self {
            kind: Some(kind),
            require_exp: !matches!(kind, TokenKind::RegistrationAccess),
            leeway: Duration::from_secs(60),
            ..Self::default()
        }
    }

    pub fn issued_by(mut self, issuer: &'a str) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn for_audience(mut self, audience: &'a str) -> Self {
        self.audience = Some(audience);
        self
    }
}

/// A freshly minted, registered token.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// The service every token is minted through.
pub struct TokenService {
    keyring: Arc<KeyRing>,
    registry: Arc<dyn TokenRegistry>,
    max_jwt_size: usize,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("max_jwt_size", &self.max_jwt_size)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(keyring: Arc<KeyRing>, registry: Arc<dyn TokenRegistry>) -> Self {
        Self {
            keyring,
            registry,
            max_jwt_size: 8 * 1024,
        }
    }

    pub fn with_max_jwt_size(mut self, limit: usize) -> Self {
        self.max_jwt_size = limit;
        self
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    pub fn registry(&self) -> &Arc<dyn TokenRegistry> {
        &self.registry
    }

    /// Sign without touching the registry (request objects, logout tokens).
    ///
    /// # Errors
    ///
    /// [`JoseError`] when no ring key supports the requested algorithm.
    pub fn sign(
        &self,
        kind: TokenKind,
        claims: &JwtClaims,
        algorithm: Option<SigningAlgorithm>,
    ) -> Result<String, JoseError> {
        let key = self.keyring.signing_key(algorithm)?;
        let jwt_alg = key
            .signing_algorithm
            .ok_or(JoseError::NoUsableKey("sign"))?
            .to_jwt()?;
        let mut header = Header::new(jwt_alg);
        header.typ = Some(kind.typ().to_owned());
        header.kid = Some(key.kid.clone());
        Ok(encode(&header, claims, &key.encoding_key())?)
    }

    /// Mint, register, and return one token.
    ///
    /// The `jti` is recorded as `Active` with the token's own TTL before
    /// the string is returned; nothing leaves the process unregistered.
    ///
    /// # Errors
    ///
    /// `server_error` for signing or registry failures.
    pub async fn issue(
        &self,
        kind: TokenKind,
        mut claims: JwtClaims,
        ttl: Duration,
        algorithm: Option<SigningAlgorithm>,
    ) -> Result<MintedToken, ProtocolError> {
        let now = Utc::now();
        let expires_at = now
            + TimeDelta::from_std(ttl)
                .map_err(|_| ProtocolError::server_error("token TTL out of range"))?;
        let jti = Uuid::new_v4().to_string();
        claims.iat = Some(now.timestamp());
        claims.nbf = Some(now.timestamp());
        claims.exp = Some(expires_at.timestamp());
        claims.jti = Some(jti.clone());

        let token = self.sign(kind, &claims, algorithm).map_err(|e| {
            warn!(error = %e, kind = ?kind, "token signing failed");
            ProtocolError::server_error("token signing failed")
        })?;

        self.registry.set_status(&jti, TokenStatus::Active, ttl).await?;
        if let Some(client_id) = claims.client_id() {
            self.registry.bind_client(&jti, client_id).await?;
        }
        debug!(kind = ?kind, jti = %jti, "token issued");
        Ok(MintedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Decode and verify a token signed by this service.
    ///
    /// # Errors
    ///
    /// [`JoseError`] for size, structure, signature or claim failures.
    pub fn decode(&self, token: &str, expect: &Expectations<'_>) -> Result<DecodedJwt, JoseError> {
        if token.len() > self.max_jwt_size {
            return Err(JoseError::Oversized {
                size: token.len(),
                limit: self.max_jwt_size,
            });
        }
        let header = decode_header(token)?;
        if let Some(kind) = expect.kind
            && !kind.accepts_typ(header.typ.as_deref())
        {
            return Err(JoseError::Malformed(format!(
                "unexpected typ {:?}",
                header.typ
            )));
        }

        let validation = build_validation(header.alg, expect);
        let mut last_error = JoseError::SignatureInvalid;
        for key in self.keyring.verification_keys(header.kid.as_deref()) {
            let Some(key_alg) = key.signing_algorithm else {
                continue;
            };
            if key_alg.to_jwt().ok() != Some(header.alg) {
                continue;
            }
            match decode::<JwtClaims>(token, &key.decoding_key(), &validation) {
                Ok(data) => return Ok(into_decoded(data)),
                Err(e) => last_error = e.into(),
            }
        }
        Err(last_error)
    }

    /// Rotate a verified refresh token.
    ///
    /// The old `jti` is consumed atomically; replay revokes the whole
    /// chain. The new link keeps the chain's absolute expiry and resets
    /// the sliding window.
    ///
    /// # Errors
    ///
    /// `invalid_grant` for replay, revocation or chain expiry;
    /// `server_error` for registry failures.
    pub async fn rotate_refresh(
        &self,
        presented: &JwtClaims,
        policy: &RefreshTokenPolicy,
    ) -> Result<(MintedToken, JwtClaims), ProtocolError> {
        let jti = presented
            .jti
            .as_deref()
            .ok_or_else(|| ProtocolError::invalid_grant("refresh token carries no jti"))?;
        let chain_id = presented
            .chain_id()
            .ok_or_else(|| ProtocolError::invalid_grant("refresh token carries no chain"))?
            .to_owned();

        if policy.allow_reuse {
            if self.registry.get_status(jti).await? == TokenStatus::Revoked {
                return Err(ProtocolError::invalid_grant("refresh token is revoked"));
            }
        } else if !self.registry.try_consume(jti).await? {
            warn!(chain_id = %chain_id, "refresh token replay detected, revoking chain");
            self.registry.revoke_chain(&chain_id).await?;
            return Err(ProtocolError::invalid_grant(
                "refresh token already used or revoked",
            ));
        }

        let now = Utc::now();
        let chain_expires_at = presented
            .chain_expires_at()
            .or(presented.exp)
            .ok_or_else(|| ProtocolError::invalid_grant("refresh token carries no expiry"))?;
        if now.timestamp() >= chain_expires_at {
            return Err(ProtocolError::invalid_grant("refresh chain expired"));
        }

        // The absolute ceiling is inherited, never extended; the sliding
        // window restarts from now.
        let remaining = (chain_expires_at - now.timestamp()).max(1) as u64;
        let ttl_secs = match policy.sliding_expiry {
            Some(sliding) => sliding.as_secs().min(remaining),
            None => remaining,
        };

        let mut claims = presented.clone();
        claims.set_extra("chain_id", chain_id.clone());
        claims.set_extra("chain_exp", chain_expires_at);
        let minted = self
            .issue(
                TokenKind::Refresh,
                claims.clone(),
                Duration::from_secs(ttl_secs),
                None,
            )
            .await?;
        self.registry.bind_chain(&minted.jti, &chain_id).await?;
        claims.jti = Some(minted.jti.clone());
        claims.iat = Some(now.timestamp());
        claims.nbf = Some(now.timestamp());
        claims.exp = Some(minted.expires_at.timestamp());
        Ok((minted, claims))
    }

    /// Start a refresh chain for a newly granted `offline_access`.
    ///
    /// # Errors
    ///
    /// `server_error` for signing or registry failures.
    pub async fn issue_refresh(
        &self,
        mut claims: JwtClaims,
        policy: &RefreshTokenPolicy,
    ) -> Result<MintedToken, ProtocolError> {
        let now = Utc::now();
        let absolute = now.timestamp() + policy.absolute_expiry.as_secs() as i64;
        let ttl_secs = policy
            .sliding_expiry
            .map_or(policy.absolute_expiry.as_secs(), |s| {
                s.as_secs().min(policy.absolute_expiry.as_secs())
            });
        claims.set_extra("chain_exp", absolute);
        let minted = self
            .issue(TokenKind::Refresh, claims, Duration::from_secs(ttl_secs), None)
            .await?;
        // The first link names the chain after its own jti.
        self.registry.bind_chain(&minted.jti, &minted.jti).await?;
        Ok(minted)
    }
}

fn into_decoded(data: TokenData<JwtClaims>) -> DecodedJwt {
    DecodedJwt {
        header: data.header,
        claims: data.claims,
    }
}

fn build_validation(alg: jsonwebtoken::Algorithm, expect: &Expectations<'_>) -> Validation {
    let mut validation = Validation::new(alg);
    validation.leeway = expect.leeway.as_secs();
    validation.validate_exp = expect.require_exp;
    validation.validate_nbf = true;
    validation.required_spec_claims.clear();
    if expect.require_exp {
        validation.required_spec_claims.insert("exp".to_owned());
    }
    match expect.audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }
    if let Some(iss) = expect.issuer {
        validation.set_issuer(&[iss]);
    }
    validation
}

/// Verify an externally signed JWT against a JWK set.
///
/// `none` and symmetric algorithms are rejected unconditionally; this path
/// protects trust decisions (client assertions, request objects, bearer
/// grants).
///
/// # Errors
///
/// [`JoseError`] for size, algorithm, signature or claim failures.
pub fn verify_with_jwks(
    token: &str,
    jwks: &JwkSet,
    allowed: &[SigningAlgorithm],
    expect: &Expectations<'_>,
    max_size: usize,
) -> Result<DecodedJwt, JoseError> {
    if token.len() > max_size {
        return Err(JoseError::Oversized {
            size: token.len(),
            limit: max_size,
        });
    }
    let header = decode_header(token)?;
    let header_alg = SigningAlgorithm::parse(&alg_name(header.alg))?;
    if header_alg == SigningAlgorithm::None || header_alg.is_symmetric() {
        return Err(JoseError::UnsupportedAlgorithm(header_alg.as_str().into()));
    }
    if !allowed.is_empty() && !allowed.contains(&header_alg) {
        return Err(JoseError::UnsupportedAlgorithm(header_alg.as_str().into()));
    }

    let validation = build_validation(header.alg, expect);
    let candidates: Vec<&jsonwebtoken::jwk::Jwk> =
        match header.kid.as_deref().and_then(|kid| jwks.find(kid)) {
            Some(jwk) => vec![jwk],
            None => jwks.keys.iter().collect(),
        };
    let mut last_error = JoseError::SignatureInvalid;
    for jwk in candidates {
        let Ok(key) = DecodingKey::from_jwk(jwk) else {
            continue;
        };
        match decode::<JwtClaims>(token, &key, &validation) {
            Ok(data) => return Ok(into_decoded(data)),
            Err(e) => last_error = e.into(),
        }
    }
    Err(last_error)
}

/// Verify an HMAC-signed JWT against a shared secret (`client_secret_jwt`).
///
/// # Errors
///
/// [`JoseError`] for size, algorithm, signature or claim failures.
pub fn verify_with_secret(
    token: &str,
    secret: &[u8],
    expect: &Expectations<'_>,
    max_size: usize,
) -> Result<DecodedJwt, JoseError> {
    if token.len() > max_size {
        return Err(JoseError::Oversized {
            size: token.len(),
            limit: max_size,
        });
    }
    let header = decode_header(token)?;
    let header_alg = SigningAlgorithm::parse(&alg_name(header.alg))?;
    if !header_alg.is_symmetric() {
        return Err(JoseError::UnsupportedAlgorithm(header_alg.as_str().into()));
    }
    let validation = build_validation(header.alg, expect);
    let data = decode::<JwtClaims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(into_decoded(data))
}

/// Read the payload without verification.
///
/// Only for routing decisions (finding the issuer before key selection);
/// nothing read here may be trusted.
///
/// # Errors
///
/// `Malformed` when the compact structure or JSON is broken.
pub fn peek_claims(token: &str) -> Result<JwtClaims, JoseError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| JoseError::Malformed("not a compact JWS".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| JoseError::Malformed(format!("payload encoding: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| JoseError::Malformed(format!("payload JSON: {e}")))
}

fn alg_name(alg: jsonwebtoken::Algorithm) -> String {
    format!("{alg:?}")
}
