//! Pushed authorization requests and the JWT-bearer assertion grant

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::*;
use oxauth_core::config::TrustedIssuer;
use oxauth_core::error::ErrorCode;
use oxauth_core::params::AuthorizationParameters;
use oxauth_jose::alg::SigningAlgorithm;
use oxauth_jose::keys::ServiceKey;
use oxauth_jose::token::JwtClaims;
use oxauth_server::authorize::response::Delivery;
use oxauth_server::client_auth::ClientAuthEvidence;
use oxauth_server::messages::TokenRequestParameters;
use oxauth_server::{
    AuthorizationHandler, AuthorizationResult, PushedAuthorizationHandler, TokenHandler,
};

fn authorization_params() -> AuthorizationParameters {
    AuthorizationParameters {
        client_id: Some("c1".into()),
        response_type: Some("code".into()),
        redirect_uri: Some("https://a.example/cb".into()),
        scope: Some("openid".into()),
        state: Some("par-state".into()),
        code_challenge: Some(PKCE_CHALLENGE.into()),
        code_challenge_method: Some("S256".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn pushed_request_round_trip() {
    let server = server(vec![public_client("c1")]);
    let par = PushedAuthorizationHandler::new(server.ctx.clone());

    let pushed = par
        .handle(authorization_params(), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(pushed.request_uri.starts_with("urn:ietf:params:oauth:request_uri:"));
    assert_eq!(pushed.expires_in, 60);

    // The front-channel request carries only the handle.
    let resume = AuthorizationParameters {
        client_id: Some("c1".into()),
        request_uri: Some(pushed.request_uri.clone()),
        ..Default::default()
    };
    let url = match AuthorizationHandler::new(server.ctx.clone())
        .handle(resume)
        .await
        .unwrap()
    {
        AuthorizationResult::Success(Delivery::Redirect(url)) => url,
        other => panic!("expected redirect, got {other:?}"),
    };
    assert_eq!(query_param(&url, "state").as_deref(), Some("par-state"));
    assert!(query_param(&url, "code").is_some());

    // Handles are single-use.
    let resume_again = AuthorizationParameters {
        client_id: Some("c1".into()),
        request_uri: Some(pushed.request_uri),
        ..Default::default()
    };
    let err = AuthorizationHandler::new(server.ctx.clone())
        .handle(resume_again)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn par_rejects_validator_failures_inline() {
    let server = server(vec![public_client("c1")]);
    let par = PushedAuthorizationHandler::new(server.ctx.clone());

    let mut params = authorization_params();
    params.redirect_uri = Some("https://not-registered.example/cb".into());
    let err = par
        .handle(params, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let mut nested = authorization_params();
    nested.request_uri = Some("urn:ietf:params:oauth:request_uri:nested".into());
    let err = par
        .handle(nested, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

fn issuer_key() -> ServiceKey {
    ServiceKey::rsa_signing("ext-1", SigningAlgorithm::Rs256, RSA_PEM).unwrap()
}

fn bearer_assertion(jti: &str, subject: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = JwtClaims {
        iss: Some("https://partner.example".into()),
        sub: Some(subject.into()),
        aud: vec![format!("{ISSUER}/connect/token")],
        exp: Some(now + 120),
        nbf: Some(now),
        iat: Some(now),
        jti: Some(jti.into()),
        ..Default::default()
    };
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some("ext-1".into());
    jsonwebtoken::encode(
        &header,
        &claims,
        &jsonwebtoken::EncodingKey::from_rsa_pem(RSA_PEM.as_bytes()).unwrap(),
    )
    .unwrap()
}

fn trusted_issuer_options() -> oxauth_core::config::OidcOptions {
    let mut options = options();
    options.assertions.trusted_issuers = vec![TrustedIssuer {
        issuer: "https://partner.example".into(),
        jwks: Some(serde_json::json!({
            "keys": [issuer_key().public_jwk.unwrap()]
        })),
        jwks_uri: None,
        allowed_algorithms: vec!["RS256".into()],
        allowed_subjects: vec![],
    }];
    options
}

fn bearer_client() -> oxauth_core::client::ClientInfo {
    let mut client = public_client("c1");
    client
        .grant_types
        .push("urn:ietf:params:oauth:grant-type:jwt-bearer".into());
    client
}

#[tokio::test]
async fn jwt_bearer_grant_happy_path_and_replay() {
    let server = server_with(
        trusted_issuer_options(),
        vec![bearer_client()],
        Arc::new(ApprovingInteraction::default()),
    );
    let tokens = TokenHandler::new(server.ctx.clone());
    let assertion = bearer_assertion("bearer-jti-1", "partner-user-7");

    let request = TokenRequestParameters {
        grant_type: "urn:ietf:params:oauth:grant-type:jwt-bearer".into(),
        assertion: Some(assertion.clone()),
        scope: Some("api".into()),
        ..Default::default()
    };
    let response = tokens
        .handle(&request, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(!response.access_token.is_empty());
    assert!(response.refresh_token.is_none());

    // Replaying the same jti inside the window fails.
    let err = tokens
        .handle(&request, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn jwt_bearer_rejects_untrusted_issuers_and_wrong_audience() {
    let server = server_with(
        trusted_issuer_options(),
        vec![bearer_client()],
        Arc::new(ApprovingInteraction::default()),
    );
    let tokens = TokenHandler::new(server.ctx.clone());

    // Unknown issuer.
    let now = Utc::now().timestamp();
    let foreign = JwtClaims {
        iss: Some("https://unknown.example".into()),
        sub: Some("x".into()),
        aud: vec![format!("{ISSUER}/connect/token")],
        exp: Some(now + 120),
        iat: Some(now),
        jti: Some("f-1".into()),
        ..Default::default()
    };
    let assertion = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        &foreign,
        &jsonwebtoken::EncodingKey::from_rsa_pem(RSA_PEM.as_bytes()).unwrap(),
    )
    .unwrap();
    let err = tokens
        .handle(
            &TokenRequestParameters {
                grant_type: "urn:ietf:params:oauth:grant-type:jwt-bearer".into(),
                assertion: Some(assertion),
                ..Default::default()
            },
            &ClientAuthEvidence::public("c1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);

    // Trusted issuer, wrong audience.
    let mut wrong_aud_claims = JwtClaims {
        iss: Some("https://partner.example".into()),
        sub: Some("x".into()),
        aud: vec!["https://other.example".into()],
        exp: Some(now + 120),
        iat: Some(now),
        jti: Some("f-2".into()),
        ..Default::default()
    };
    wrong_aud_claims.nbf = wrong_aud_claims.iat;
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some("ext-1".into());
    let assertion = jsonwebtoken::encode(
        &header,
        &wrong_aud_claims,
        &jsonwebtoken::EncodingKey::from_rsa_pem(RSA_PEM.as_bytes()).unwrap(),
    )
    .unwrap();
    let err = tokens
        .handle(
            &TokenRequestParameters {
                grant_type: "urn:ietf:params:oauth:grant-type:jwt-bearer".into(),
                assertion: Some(assertion),
                ..Default::default()
            },
            &ClientAuthEvidence::public("c1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}
