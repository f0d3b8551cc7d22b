//! Shared fixtures for the endpoint integration suites
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use oxauth_core::claims::RequestedClaims;
use oxauth_core::client::ClientInfo;
use oxauth_core::collaborators::{
    Approval, InteractionOutcome, StaticIssuer, UserInfoProvider, UserInteraction,
};
use oxauth_core::config::OidcOptions;
use oxauth_core::error::StorageError;
use oxauth_core::memory::{InMemoryClientCatalogue, InMemorySessionService};
use oxauth_core::records::{AuthSession, PendingAuthorization};
use oxauth_jose::alg::SigningAlgorithm;
use oxauth_jose::keys::{KeyRing, ServiceKey};
use oxauth_server::context::ServerContext;
use oxauth_server::ssrf::{SafeHttpFetcher, SsrfPolicy};
use url::Url;

pub const RSA_PEM: &str = include_str!("../../../oxauth-jose/testdata/rsa2048.pem");
pub const ISSUER: &str = "https://op.example";

/// Auto-approves every request as subject `u1`, granting exactly the
/// requested scopes.
pub struct ApprovingInteraction {
    pub subject: String,
    pub session_id: String,
}

impl Default for ApprovingInteraction {
    fn default() -> Self {
        Self {
            subject: "u1".into(),
            session_id: "s1".into(),
        }
    }
}

#[async_trait]
impl UserInteraction for ApprovingInteraction {
    async fn drive(
        &self,
        request: &PendingAuthorization,
    ) -> Result<InteractionOutcome, StorageError> {
        let scopes = request
            .parameters
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_owned)
            .collect();
        let claims = request
            .parameters
            .claims
            .as_deref()
            .and_then(|raw| RequestedClaims::parse(raw).ok());
        Ok(InteractionOutcome::Approved(Approval {
            session: AuthSession::new(self.subject.clone(), self.session_id.clone()),
            granted_scopes: scopes,
            granted_claims: claims,
        }))
    }
}

/// Always demands login at a fixed URI.
pub struct LoginRequiredInteraction;

#[async_trait]
impl UserInteraction for LoginRequiredInteraction {
    async fn drive(
        &self,
        _request: &PendingAuthorization,
    ) -> Result<InteractionOutcome, StorageError> {
        Ok(InteractionOutcome::LoginRequired(
            Url::parse("https://op.example/login").unwrap(),
        ))
    }
}

/// Fixed profile claims for `u1`.
pub struct StaticUserInfo;

#[async_trait]
impl UserInfoProvider for StaticUserInfo {
    async fn get_claims(
        &self,
        _session: &AuthSession,
        claim_names: &[String],
    ) -> Result<serde_json::Map<String, serde_json::Value>, StorageError> {
        let all = serde_json::json!({
            "name": "Uni Tester",
            "email": "u1@example.org",
            "email_verified": true,
        });
        let mut out = serde_json::Map::new();
        for name in claim_names {
            if let Some(value) = all.get(name) {
                out.insert(name.clone(), value.clone());
            }
        }
        Ok(out)
    }
}

pub fn keyring() -> Arc<KeyRing> {
    Arc::new(
        KeyRing::new(vec![
            ServiceKey::rsa_signing("test-key", SigningAlgorithm::Rs256, RSA_PEM).unwrap(),
        ])
        .unwrap(),
    )
}

pub fn options() -> OidcOptions {
    OidcOptions {
        pairwise_salt: "integration-test-salt".into(),
        ..OidcOptions::default()
    }
}

pub struct TestServer {
    pub ctx: Arc<ServerContext>,
    pub catalogue: Arc<InMemoryClientCatalogue>,
    pub sessions: Arc<InMemorySessionService>,
}

/// A full context over in-memory stores, auto-approving interaction, and
/// a permissive fetcher (suites talk to wiremock on localhost).
pub fn server_with(
    options: OidcOptions,
    clients: Vec<ClientInfo>,
    interaction: Arc<dyn UserInteraction>,
) -> TestServer {
    let catalogue = Arc::new(InMemoryClientCatalogue::with_clients(clients));
    let sessions = Arc::new(InMemorySessionService::new());
    let ctx = ServerContext::new(
        options,
        Arc::new(StaticIssuer(ISSUER.into())),
        keyring(),
        catalogue.clone(),
        sessions.clone(),
        interaction,
        Arc::new(StaticUserInfo),
    )
    .unwrap()
    .with_fetcher(Arc::new(SafeHttpFetcher::new(SsrfPolicy::permissive())))
    .with_client_manager(catalogue.clone());
    TestServer {
        ctx: Arc::new(ctx),
        catalogue,
        sessions,
    }
}

pub fn server(clients: Vec<ClientInfo>) -> TestServer {
    server_with(options(), clients, Arc::new(ApprovingInteraction::default()))
}

/// The RFC 7636 example verifier / challenge pair.
pub const PKCE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const PKCE_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

/// A public code-flow client with PKCE required.
pub fn public_client(client_id: &str) -> ClientInfo {
    let mut client = ClientInfo::public(client_id);
    client.redirect_uris = vec![Url::parse("https://a.example/cb").unwrap()];
    client.response_types = vec!["code".into(), "id_token".into(), "code id_token".into()];
    client.grant_types = vec![
        "authorization_code".into(),
        "refresh_token".into(),
        "urn:ietf:params:oauth:grant-type:device_code".into(),
        "urn:openid:params:grant-type:ciba".into(),
    ];
    client
}

/// Pull one query parameter out of a redirect URL.
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
