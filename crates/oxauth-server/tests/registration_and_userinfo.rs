//! Dynamic registration CRUD, registration token binding, userinfo claims

mod common;

use common::*;
use oxauth_core::error::ErrorCode;
use oxauth_core::params::AuthorizationParameters;
use oxauth_server::authorize::response::Delivery;
use oxauth_server::client_auth::ClientAuthEvidence;
use oxauth_server::messages::TokenRequestParameters;
use oxauth_server::registration::ClientMetadata;
use oxauth_server::{
    AuthorizationHandler, AuthorizationResult, RegistrationHandler, TokenHandler,
    UserinfoHandler, UserinfoResponse,
};

fn metadata() -> ClientMetadata {
    ClientMetadata {
        redirect_uris: vec!["https://rp.example/cb".into()],
        token_endpoint_auth_method: Some("client_secret_basic".into()),
        grant_types: Some(vec!["authorization_code".into()]),
        response_types: Some(vec!["code".into()]),
        client_name: Some("Example RP".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn register_read_update_delete_lifecycle() {
    let server = server(vec![]);
    let registration = RegistrationHandler::new(server.ctx.clone());

    let created = registration.register(metadata()).await.unwrap();
    let client_id = created.client_id.clone();
    let bearer = created.registration_access_token.clone().unwrap();
    assert!(created.client_secret.is_some());
    assert!(
        created
            .registration_client_uri
            .as_deref()
            .unwrap()
            .ends_with(&client_id)
    );

    let read = registration.read(&client_id, &bearer).await.unwrap();
    assert_eq!(
        read.metadata.redirect_uris,
        vec!["https://rp.example/cb".to_owned()]
    );
    // Secrets never come back on reads.
    assert!(read.client_secret.is_none());

    let mut update = metadata();
    update.client_id = Some(client_id.clone());
    update.redirect_uris = vec!["https://rp.example/cb2".into()];
    let updated = registration
        .update(&client_id, &bearer, update)
        .await
        .unwrap();
    assert_eq!(
        updated.metadata.redirect_uris,
        vec!["https://rp.example/cb2".to_owned()]
    );

    registration.delete(&client_id, &bearer).await.unwrap();
    assert!(
        server
            .ctx
            .catalogue
            .lookup(&client_id)
            .await
            .unwrap()
            .is_none()
    );
    let err = registration.read(&client_id, &bearer).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidToken);
}

#[tokio::test]
async fn registration_token_is_bound_to_its_client() {
    let server = server(vec![]);
    let registration = RegistrationHandler::new(server.ctx.clone());

    let first = registration.register(metadata()).await.unwrap();
    let second = registration.register(metadata()).await.unwrap();

    // One client's token against the other's record.
    let err = registration
        .read(
            &first.client_id,
            second.registration_access_token.as_deref().unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidToken);
}

#[tokio::test]
async fn update_body_must_name_the_path_client() {
    let server = server(vec![]);
    let registration = RegistrationHandler::new(server.ctx.clone());
    let created = registration.register(metadata()).await.unwrap();
    let bearer = created.registration_access_token.unwrap();

    let mut update = metadata();
    update.client_id = Some("someone-else".into());
    let err = registration
        .update(&created.client_id, &bearer, update)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn rejected_metadata_surfaces_the_rfc7591_codes() {
    let server = server(vec![]);
    let registration = RegistrationHandler::new(server.ctx.clone());

    let mut bad_redirect = metadata();
    bad_redirect.redirect_uris = vec!["ftp://rp.example/cb".into()];
    let err = registration.register(bad_redirect).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRedirectUri);

    let mut pairwise_without_sector = metadata();
    pairwise_without_sector.subject_type = Some("pairwise".into());
    let err = registration
        .register(pairwise_without_sector)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidClientMetadata);

    let mut bad_alg = metadata();
    bad_alg.id_token_signed_response_alg = Some("XS256".into());
    let err = registration.register(bad_alg).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidClientMetadata);
}

async fn obtain_access_token(server: &TestServer, claims: Option<&str>) -> String {
    let handler = AuthorizationHandler::new(server.ctx.clone());
    let params = AuthorizationParameters {
        client_id: Some("c1".into()),
        response_type: Some("code".into()),
        redirect_uri: Some("https://a.example/cb".into()),
        scope: Some("openid email".into()),
        code_challenge: Some(PKCE_CHALLENGE.into()),
        code_challenge_method: Some("S256".into()),
        claims: claims.map(str::to_owned),
        ..Default::default()
    };
    let url = match handler.handle(params).await.unwrap() {
        AuthorizationResult::Success(Delivery::Redirect(url)) => url,
        other => panic!("expected redirect, got {other:?}"),
    };
    let code = query_param(&url, "code").unwrap();
    TokenHandler::new(server.ctx.clone())
        .handle(
            &TokenRequestParameters {
                grant_type: "authorization_code".into(),
                code: Some(code),
                redirect_uri: Some("https://a.example/cb".into()),
                code_verifier: Some(PKCE_VERIFIER.into()),
                ..Default::default()
            },
            &ClientAuthEvidence::public("c1"),
        )
        .await
        .unwrap()
        .access_token
}

#[tokio::test]
async fn userinfo_returns_scope_and_requested_claims() {
    let server = server(vec![public_client("c1")]);
    let access = obtain_access_token(
        &server,
        Some(r#"{"userinfo":{"name":{"essential":true}}}"#),
    )
    .await;

    let response = UserinfoHandler::new(server.ctx.clone())
        .handle(&access)
        .await
        .unwrap();
    let claims = match response {
        UserinfoResponse::Json(map) => map,
        UserinfoResponse::Jwt(_) => panic!("client registered no userinfo signing"),
    };
    assert_eq!(claims["sub"], "u1");
    // email scope implies both email claims.
    assert_eq!(claims["email"], "u1@example.org");
    assert_eq!(claims["email_verified"], true);
    // The claims-parameter grant rides in the access token.
    assert_eq!(claims["name"], "Uni Tester");
}

#[tokio::test]
async fn userinfo_rejects_revoked_and_foreign_tokens() {
    let server = server(vec![public_client("c1")]);
    let access = obtain_access_token(&server, None).await;

    let userinfo = UserinfoHandler::new(server.ctx.clone());
    userinfo.handle(&access).await.unwrap();

    // Revoke and try again.
    let jti = oxauth_jose::token::peek_claims(&access)
        .unwrap()
        .jti
        .unwrap();
    server
        .ctx
        .registry
        .set_status(
            &jti,
            oxauth_core::records::TokenStatus::Revoked,
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();
    let err = userinfo.handle(&access).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidToken);

    let err = userinfo.handle("garbage").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidToken);
}

#[tokio::test]
async fn pairwise_clients_see_a_masked_deterministic_subject() {
    let mut client = public_client("c1");
    client.subject_type = oxauth_core::client::SubjectType::Pairwise;
    client.sector_identifier = Some("sector.example".into());
    let server = server(vec![client]);

    let first = obtain_access_token(&server, None).await;
    let second = obtain_access_token(&server, None).await;
    let sub_a = oxauth_jose::token::peek_claims(&first).unwrap().sub.unwrap();
    let sub_b = oxauth_jose::token::peek_claims(&second).unwrap().sub.unwrap();
    assert_eq!(sub_a, sub_b, "pairwise derivation is deterministic");
    assert_ne!(sub_a, "u1", "the internal subject never leaks");
}
