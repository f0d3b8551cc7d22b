//! Client authentication
//!
//! One dispatcher keyed by the client's registered
//! `token_endpoint_auth_method`. The adapter extracts raw evidence from
//! the HTTP request ([`ClientAuthEvidence`]); the dispatcher decides which
//! verifier runs. Presenting credentials through more than one channel
//! fails outright, and every failure collapses to `invalid_client` - the
//! actual reason is only logged.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use oxauth_core::client::{ClientInfo, ClientType, TokenEndpointAuthMethod};
use oxauth_core::error::ProtocolError;
use oxauth_core::storage::TokenRegistry;
use oxauth_jose::token::{Expectations, JwtClaims, peek_claims, verify_with_jwks,
    verify_with_secret};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::catalogue::{ClientCatalogue, ClientKeyResolver};

pub const JWT_BEARER_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Peer-certificate attributes the TLS terminator hands through.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate {
    pub subject_dn: Option<String>,
    pub san_dns: Vec<String>,
    pub san_uri: Vec<String>,
    pub san_ip: Vec<String>,
    pub san_email: Vec<String>,
    /// base64url SHA-256 of the DER certificate (`x5t#S256`).
    pub thumbprint_sha256: Option<String>,
}

/// Raw credential material extracted from one request.
#[derive(Debug, Clone, Default)]
pub struct ClientAuthEvidence {
    /// The `Authorization` header, verbatim.
    pub authorization_header: Option<String>,
    /// `client_id` body parameter.
    pub client_id: Option<String>,
    /// `client_secret` body parameter.
    pub client_secret: Option<String>,
    /// `client_assertion` body parameter.
    pub client_assertion: Option<String>,
    /// `client_assertion_type` body parameter.
    pub client_assertion_type: Option<String>,
    pub peer_certificate: Option<PeerCertificate>,
}

impl ClientAuthEvidence {
    pub fn basic(client_id: &str, client_secret: &str) -> Self {
        let raw = format!("{client_id}:{client_secret}");
        Self {
            authorization_header: Some(format!("Basic {}", STANDARD.encode(raw))),
            ..Self::default()
        }
    }

    pub fn post(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: Some(client_id.to_owned()),
            client_secret: Some(client_secret.to_owned()),
            ..Self::default()
        }
    }

    pub fn assertion(assertion: &str) -> Self {
        Self {
            client_assertion: Some(assertion.to_owned()),
            client_assertion_type: Some(JWT_BEARER_ASSERTION_TYPE.to_owned()),
            ..Self::default()
        }
    }

    /// `client_id` only, for public clients.
    pub fn public(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_owned()),
            ..Self::default()
        }
    }
}

struct BasicCredentials {
    client_id: String,
    client_secret: String,
}

fn parse_basic(header: &str) -> Option<BasicCredentials> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    // RFC 6749 §2.3.1: both halves are form-urlencoded.
    Some(BasicCredentials {
        client_id: percent_decode_str(user).decode_utf8().ok()?.into_owned(),
        client_secret: percent_decode_str(pass).decode_utf8().ok()?.into_owned(),
    })
}

/// Settings the authenticator needs from the option surface.
#[derive(Debug, Clone)]
pub struct AuthenticatorOptions {
    pub clock_skew: Duration,
    pub max_jwt_size: usize,
}

impl Default for AuthenticatorOptions {
    fn default() -> Self {
        Self {
            clock_skew: Duration::from_secs(300),
            max_jwt_size: 8 * 1024,
        }
    }
}

/// The dispatcher.
pub struct ClientAuthenticator {
    catalogue: Arc<ClientCatalogue>,
    keys: Arc<ClientKeyResolver>,
    registry: Arc<dyn TokenRegistry>,
    options: AuthenticatorOptions,
}

impl ClientAuthenticator {
    pub fn new(
        catalogue: Arc<ClientCatalogue>,
        keys: Arc<ClientKeyResolver>,
        registry: Arc<dyn TokenRegistry>,
        options: AuthenticatorOptions,
    ) -> Self {
        Self {
            catalogue,
            keys,
            registry,
            options,
        }
    }

    /// Authenticate one request.
    ///
    /// `accepted_audiences` is the set a client assertion's `aud` may name
    /// (the token endpoint URL and the issuer identifier).
    ///
    /// # Errors
    ///
    /// Always `invalid_client`; the reason is logged, never returned.
    pub async fn authenticate(
        &self,
        evidence: &ClientAuthEvidence,
        accepted_audiences: &[String],
    ) -> Result<ClientInfo, ProtocolError> {
        match self.authenticate_inner(evidence, accepted_audiences).await {
            Ok(client) => Ok(client),
            Err(reason) => {
                debug!(reason, "client authentication failed");
                // Burn a digest so the missing-client path costs roughly
                // the same as a failed secret comparison.
                let _ = Sha256::digest(b"equalize");
                Err(ProtocolError::invalid_client())
            }
        }
    }

    async fn authenticate_inner(
        &self,
        evidence: &ClientAuthEvidence,
        accepted_audiences: &[String],
    ) -> Result<ClientInfo, &'static str> {
        let basic = evidence
            .authorization_header
            .as_deref()
            .filter(|h| h.starts_with("Basic "))
            .map(|h| parse_basic(h).ok_or("malformed Basic authorization header"))
            .transpose()?;

        let mut presented = 0;
        presented += usize::from(basic.is_some());
        presented += usize::from(evidence.client_secret.is_some());
        presented += usize::from(evidence.client_assertion.is_some());
        if presented > 1 {
            return Err("credentials presented through more than one method");
        }

        let claimed_id = if let Some(basic) = &basic {
            basic.client_id.clone()
        } else if let Some(id) = &evidence.client_id {
            id.clone()
        } else if let Some(assertion) = &evidence.client_assertion {
            // Untrusted peek; the signature check below binds it.
            peek_claims(assertion)
                .ok()
                .and_then(|c| c.iss)
                .ok_or("client assertion carries no issuer")?
        } else {
            return Err("no client identification presented");
        };

        let client = self
            .catalogue
            .lookup(&claimed_id)
            .await
            .map_err(|_| "client catalogue failure")?
            .ok_or("unknown client")?;

        match client.token_endpoint_auth_method {
            TokenEndpointAuthMethod::None => {
                if client.client_type != ClientType::Public {
                    return Err("confidential client registered with method none");
                }
                if presented != 0 || evidence.peer_certificate.is_some() {
                    return Err("credentials presented for a public client");
                }
                Ok(client)
            }
            TokenEndpointAuthMethod::ClientSecretBasic => {
                let basic = basic.ok_or("Basic credentials required")?;
                self.check_secret(&client, &basic.client_secret)?;
                Ok(client)
            }
            TokenEndpointAuthMethod::ClientSecretPost => {
                let secret = evidence
                    .client_secret
                    .as_deref()
                    .ok_or("client_secret body parameter required")?;
                self.check_secret(&client, secret)?;
                Ok(client)
            }
            TokenEndpointAuthMethod::ClientSecretJwt => {
                let assertion = self.require_assertion(evidence)?;
                self.verify_secret_assertion(&client, assertion, accepted_audiences)
                    .await?;
                Ok(client)
            }
            TokenEndpointAuthMethod::PrivateKeyJwt => {
                let assertion = self.require_assertion(evidence)?;
                self.verify_key_assertion(&client, assertion, accepted_audiences)
                    .await?;
                Ok(client)
            }
            TokenEndpointAuthMethod::TlsClientAuth => {
                let cert = evidence
                    .peer_certificate
                    .as_ref()
                    .ok_or("peer certificate required")?;
                self.check_tls_attributes(&client, cert)?;
                Ok(client)
            }
            TokenEndpointAuthMethod::SelfSignedTlsClientAuth => {
                let cert = evidence
                    .peer_certificate
                    .as_ref()
                    .ok_or("peer certificate required")?;
                self.check_pinned_thumbprint(&client, cert).await?;
                Ok(client)
            }
        }
    }

    fn check_secret(&self, client: &ClientInfo, presented: &str) -> Result<(), &'static str> {
        let now = Utc::now();
        let digest = Sha256::digest(presented.as_bytes());
        let mut matched = false;
        for secret in &client.secrets {
            if secret.is_expired(now) {
                continue;
            }
            // Fold with |= so every secret is compared.
            matched |= bool::from(digest.as_slice().ct_eq(&secret.sha256));
        }
        if matched {
            Ok(())
        } else {
            Err("secret mismatch or expired")
        }
    }

    fn require_assertion<'a>(
        &self,
        evidence: &'a ClientAuthEvidence,
    ) -> Result<&'a str, &'static str> {
        if evidence.client_assertion_type.as_deref() != Some(JWT_BEARER_ASSERTION_TYPE) {
            return Err("unsupported client_assertion_type");
        }
        evidence
            .client_assertion
            .as_deref()
            .ok_or("client_assertion missing")
    }

    async fn verify_secret_assertion(
        &self,
        client: &ClientInfo,
        assertion: &str,
        accepted_audiences: &[String],
    ) -> Result<(), &'static str> {
        let expect = Expectations {
            leeway: self.options.clock_skew,
            require_exp: true,
            ..Expectations::default()
        };
        let now = Utc::now();
        let mut verified = None;
        for secret in &client.secrets {
            if secret.is_expired(now) {
                continue;
            }
            let Some(raw) = secret.raw_value() else {
                continue;
            };
            if let Ok(decoded) =
                verify_with_secret(assertion, raw.as_bytes(), &expect, self.options.max_jwt_size)
            {
                verified = Some(decoded);
                break;
            }
        }
        let decoded = verified.ok_or("HMAC assertion verification failed")?;
        self.check_assertion_claims(&decoded.claims, client, accepted_audiences)
            .await
    }

    async fn verify_key_assertion(
        &self,
        client: &ClientInfo,
        assertion: &str,
        accepted_audiences: &[String],
    ) -> Result<(), &'static str> {
        let jwks = self
            .keys
            .resolve(client)
            .await
            .map_err(|_| "client key material unavailable")?;
        let expect = Expectations {
            leeway: self.options.clock_skew,
            require_exp: true,
            ..Expectations::default()
        };
        let decoded = verify_with_jwks(assertion, &jwks, &[], &expect, self.options.max_jwt_size)
            .map_err(|_| "assertion signature verification failed")?;
        self.check_assertion_claims(&decoded.claims, client, accepted_audiences)
            .await
    }

    /// RFC 7523 §3 claim checks shared by both assertion methods.
    async fn check_assertion_claims(
        &self,
        claims: &JwtClaims,
        client: &ClientInfo,
        accepted_audiences: &[String],
    ) -> Result<(), &'static str> {
        if claims.iss.as_deref() != Some(client.client_id.as_str()) {
            return Err("assertion iss is not the client");
        }
        if claims.sub.as_deref() != Some(client.client_id.as_str()) {
            return Err("assertion sub is not the client");
        }
        if !claims
            .aud
            .iter()
            .any(|aud| accepted_audiences.iter().any(|a| a == aud))
        {
            return Err("assertion audience does not name this server");
        }
        let now = Utc::now().timestamp();
        let skew = self.options.clock_skew.as_secs() as i64;
        if let Some(iat) = claims.iat
            && (iat - now).abs() > skew
        {
            return Err("assertion iat outside the clock skew window");
        }
        if let Some(nbf) = claims.nbf
            && nbf - now > skew
        {
            return Err("assertion not yet valid");
        }
        let jti = claims.jti.as_deref().ok_or("assertion carries no jti")?;
        let fresh = self
            .registry
            .try_consume(jti)
            .await
            .map_err(|_| "registry failure")?;
        if !fresh {
            warn!(client_id = %client.client_id, "client assertion replay detected");
            return Err("assertion replayed");
        }
        Ok(())
    }

    fn check_tls_attributes(
        &self,
        client: &ClientInfo,
        cert: &PeerCertificate,
    ) -> Result<(), &'static str> {
        let expected = &client.tls_client_auth;
        if expected.is_empty() {
            return Err("no tls_client_auth attributes registered");
        }
        if let Some(dn) = &expected.subject_dn {
            return if cert.subject_dn.as_deref() == Some(dn.as_str()) {
                Ok(())
            } else {
                Err("subject DN mismatch")
            };
        }
        if let Some(dns) = &expected.san_dns {
            return if cert.san_dns.iter().any(|v| v == dns) {
                Ok(())
            } else {
                Err("SAN dNSName mismatch")
            };
        }
        if let Some(uri) = &expected.san_uri {
            return if cert.san_uri.iter().any(|v| v == uri) {
                Ok(())
            } else {
                Err("SAN URI mismatch")
            };
        }
        if let Some(ip) = &expected.san_ip {
            return if cert.san_ip.iter().any(|v| v == ip) {
                Ok(())
            } else {
                Err("SAN iPAddress mismatch")
            };
        }
        if let Some(email) = &expected.san_email {
            return if cert.san_email.iter().any(|v| v == email) {
                Ok(())
            } else {
                Err("SAN rfc822Name mismatch")
            };
        }
        Err("no tls_client_auth attributes registered")
    }

    async fn check_pinned_thumbprint(
        &self,
        client: &ClientInfo,
        cert: &PeerCertificate,
    ) -> Result<(), &'static str> {
        let presented = cert
            .thumbprint_sha256
            .as_deref()
            .ok_or("certificate thumbprint unavailable")?;
        let jwks = self
            .keys
            .resolve(client)
            .await
            .map_err(|_| "client key material unavailable")?;
        let pinned = jwks.keys.iter().any(|jwk| {
            jwk.common
                .x509_sha256_fingerprint
                .as_deref()
                .is_some_and(|fp| bool::from(fp.as_bytes().ct_eq(presented.as_bytes())))
        });
        if pinned {
            Ok(())
        } else {
            Err("certificate thumbprint not pinned in client JWKS")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxauth_core::client::{ClientSecret, TlsClientAuthOptions};
    use oxauth_core::memory::{InMemoryClientCatalogue, InMemoryTokenRegistry};
    use oxauth_jose::alg::SigningAlgorithm;
    use oxauth_jose::keys::ServiceKey;

    use crate::ssrf::{SafeHttpFetcher, SsrfPolicy};

    const RSA_PEM: &str = include_str!("../../oxauth-jose/testdata/rsa2048.pem");

    fn authenticator(clients: Vec<ClientInfo>) -> ClientAuthenticator {
        let catalogue = Arc::new(ClientCatalogue::new(Arc::new(
            InMemoryClientCatalogue::with_clients(clients),
        )));
        let keys = Arc::new(ClientKeyResolver::new(
            Arc::new(SafeHttpFetcher::new(SsrfPolicy::permissive())),
            Duration::from_secs(3600),
        ));
        ClientAuthenticator::new(
            catalogue,
            keys,
            Arc::new(InMemoryTokenRegistry::new()),
            AuthenticatorOptions::default(),
        )
    }

    fn secret_client(method: TokenEndpointAuthMethod) -> ClientInfo {
        let mut client = ClientInfo::confidential("c1");
        client.token_endpoint_auth_method = method;
        client.secrets = vec![ClientSecret::from_plain(
            "s3cret",
            method == TokenEndpointAuthMethod::ClientSecretJwt,
            None,
        )];
        client
    }

    fn audiences() -> Vec<String> {
        vec!["https://op.example/connect/token".into()]
    }

    #[tokio::test]
    async fn basic_authentication_happy_path() {
        let auth = authenticator(vec![secret_client(TokenEndpointAuthMethod::ClientSecretBasic)]);
        let client = auth
            .authenticate(&ClientAuthEvidence::basic("c1", "s3cret"), &audiences())
            .await
            .unwrap();
        assert_eq!(client.client_id, "c1");
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid_client() {
        let auth = authenticator(vec![secret_client(TokenEndpointAuthMethod::ClientSecretBasic)]);
        let err = auth
            .authenticate(&ClientAuthEvidence::basic("c1", "wrong"), &audiences())
            .await
            .unwrap_err();
        assert_eq!(err.code, oxauth_core::error::ErrorCode::InvalidClient);
        // The reason must not leak.
        assert_eq!(err.description, "client authentication failed");
    }

    #[tokio::test]
    async fn two_methods_at_once_fail() {
        let auth = authenticator(vec![secret_client(TokenEndpointAuthMethod::ClientSecretBasic)]);
        let mut evidence = ClientAuthEvidence::basic("c1", "s3cret");
        evidence.client_secret = Some("s3cret".into());
        assert!(auth.authenticate(&evidence, &audiences()).await.is_err());
    }

    #[tokio::test]
    async fn public_client_with_no_credentials_passes() {
        let auth = authenticator(vec![ClientInfo::public("pub")]);
        let client = auth
            .authenticate(&ClientAuthEvidence::public("pub"), &audiences())
            .await
            .unwrap();
        assert_eq!(client.client_id, "pub");
    }

    #[tokio::test]
    async fn public_client_presenting_a_secret_fails() {
        let auth = authenticator(vec![ClientInfo::public("pub")]);
        assert!(
            auth.authenticate(&ClientAuthEvidence::post("pub", "x"), &audiences())
                .await
                .is_err()
        );
    }

    fn hmac_assertion(secret: &str, iss: &str, aud: &str, jti: &str) -> String {
        let mut claims = JwtClaims {
            iss: Some(iss.into()),
            sub: Some(iss.into()),
            aud: vec![aud.into()],
            exp: Some(Utc::now().timestamp() + 120),
            iat: Some(Utc::now().timestamp()),
            jti: Some(jti.into()),
            ..Default::default()
        };
        claims.nbf = claims.iat;
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn client_secret_jwt_happy_path_and_replay() {
        let auth = authenticator(vec![secret_client(TokenEndpointAuthMethod::ClientSecretJwt)]);
        let assertion = hmac_assertion(
            "s3cret",
            "c1",
            "https://op.example/connect/token",
            "jti-1",
        );
        auth.authenticate(&ClientAuthEvidence::assertion(&assertion), &audiences())
            .await
            .unwrap();
        // Same jti again: replay.
        let err = auth
            .authenticate(&ClientAuthEvidence::assertion(&assertion), &audiences())
            .await
            .unwrap_err();
        assert_eq!(err.code, oxauth_core::error::ErrorCode::InvalidClient);
    }

    #[tokio::test]
    async fn assertion_audience_must_name_the_server() {
        let auth = authenticator(vec![secret_client(TokenEndpointAuthMethod::ClientSecretJwt)]);
        let assertion = hmac_assertion("s3cret", "c1", "https://other.example", "jti-2");
        assert!(
            auth.authenticate(&ClientAuthEvidence::assertion(&assertion), &audiences())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn private_key_jwt_round_trip() {
        let service_key =
            ServiceKey::rsa_signing("ck1", SigningAlgorithm::Rs256, RSA_PEM).unwrap();
        let jwk = service_key.public_jwk.clone().unwrap();
        let mut client = ClientInfo::confidential("c1");
        client.token_endpoint_auth_method = TokenEndpointAuthMethod::PrivateKeyJwt;
        client.keys.jwks = Some(serde_json::json!({ "keys": [jwk] }));

        let auth = authenticator(vec![client]);
        let mut claims = JwtClaims {
            iss: Some("c1".into()),
            sub: Some("c1".into()),
            aud: vec!["https://op.example/connect/token".into()],
            exp: Some(Utc::now().timestamp() + 120),
            iat: Some(Utc::now().timestamp()),
            jti: Some("pk-jti-1".into()),
            ..Default::default()
        };
        claims.nbf = claims.iat;
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some("ck1".into());
        let assertion = jsonwebtoken::encode(
            &header,
            &claims,
            &jsonwebtoken::EncodingKey::from_rsa_pem(RSA_PEM.as_bytes()).unwrap(),
        )
        .unwrap();

        auth.authenticate(&ClientAuthEvidence::assertion(&assertion), &audiences())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tls_client_auth_matches_registered_dn() {
        let mut client = ClientInfo::confidential("c1");
        client.token_endpoint_auth_method = TokenEndpointAuthMethod::TlsClientAuth;
        client.tls_client_auth = TlsClientAuthOptions {
            subject_dn: Some("CN=c1,O=Example".into()),
            ..TlsClientAuthOptions::default()
        };
        let auth = authenticator(vec![client]);

        let mut evidence = ClientAuthEvidence::public("c1");
        evidence.peer_certificate = Some(PeerCertificate {
            subject_dn: Some("CN=c1,O=Example".into()),
            ..PeerCertificate::default()
        });
        auth.authenticate(&evidence, &audiences()).await.unwrap();

        let mut wrong = ClientAuthEvidence::public("c1");
        wrong.peer_certificate = Some(PeerCertificate {
            subject_dn: Some("CN=mallory".into()),
            ..PeerCertificate::default()
        });
        assert!(auth.authenticate(&wrong, &audiences()).await.is_err());
    }

    #[tokio::test]
    async fn self_signed_tls_requires_a_pinned_thumbprint() {
        let mut client = ClientInfo::confidential("c1");
        client.token_endpoint_auth_method = TokenEndpointAuthMethod::SelfSignedTlsClientAuth;
        client.keys.jwks = Some(serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": "pin",
                "n": "sXchTnjCmH4wZFcZDq4W1H4f4fai9X7PbTFjMaoGLeSwAn0Wog_t3yuSNYhhPJMafSHsuZWVyOxRiqyyBMTy1g",
                "e": "AQAB",
                "x5t#S256": "expected-thumbprint"
            }]
        }));
        let auth = authenticator(vec![client]);

        let mut evidence = ClientAuthEvidence::public("c1");
        evidence.peer_certificate = Some(PeerCertificate {
            thumbprint_sha256: Some("expected-thumbprint".into()),
            ..PeerCertificate::default()
        });
        auth.authenticate(&evidence, &audiences()).await.unwrap();

        let mut wrong = ClientAuthEvidence::public("c1");
        wrong.peer_certificate = Some(PeerCertificate {
            thumbprint_sha256: Some("other".into()),
            ..PeerCertificate::default()
        });
        assert!(auth.authenticate(&wrong, &audiences()).await.is_err());
    }
}
