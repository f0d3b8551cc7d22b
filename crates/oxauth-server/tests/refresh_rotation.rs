//! Refresh token rotation and replay handling

mod common;

use common::*;
use oxauth_core::error::ErrorCode;
use oxauth_core::params::AuthorizationParameters;
use oxauth_server::authorize::response::Delivery;
use oxauth_server::client_auth::ClientAuthEvidence;
use oxauth_server::messages::TokenRequestParameters;
use oxauth_server::{AuthorizationHandler, AuthorizationResult, TokenHandler};

async fn obtain_refresh_token(server: &TestServer) -> String {
    let handler = AuthorizationHandler::new(server.ctx.clone());
    let params = AuthorizationParameters {
        client_id: Some("c1".into()),
        response_type: Some("code".into()),
        redirect_uri: Some("https://a.example/cb".into()),
        scope: Some("openid profile offline_access".into()),
        code_challenge: Some(PKCE_CHALLENGE.into()),
        code_challenge_method: Some("S256".into()),
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
        .refresh_token
        .expect("offline_access grants a refresh token")
}

fn refresh_request(token: &str) -> TokenRequestParameters {
    TokenRequestParameters {
        grant_type: "refresh_token".into(),
        refresh_token: Some(token.to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn rotation_replaces_the_token_and_replay_kills_the_chain() {
    let server = server(vec![public_client("c1")]);
    let r1 = obtain_refresh_token(&server).await;

    let tokens = TokenHandler::new(server.ctx.clone());
    let rotated = tokens
        .handle(&refresh_request(&r1), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    let r2 = rotated.refresh_token.expect("rotation returns a new link");
    assert_ne!(r1, r2);

    // Replaying r1 fails and poisons the chain.
    let err = tokens
        .handle(&refresh_request(&r1), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);

    let err = tokens
        .handle(&refresh_request(&r2), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn scopes_narrow_to_the_chain_intersection() {
    let server = server(vec![public_client("c1")]);
    let r1 = obtain_refresh_token(&server).await;

    let tokens = TokenHandler::new(server.ctx.clone());
    let mut request = refresh_request(&r1);
    request.scope = Some("openid profile".into());
    let response = tokens
        .handle(&request, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert_eq!(response.scope.as_deref(), Some("openid profile"));

    // A scope outside the chain never comes back.
    let r2 = response.refresh_token.unwrap();
    let mut widened = refresh_request(&r2);
    widened.scope = Some("admin".into());
    let err = tokens
        .handle(&widened, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidScope);
}

#[tokio::test]
async fn foreign_client_cannot_redeem_the_chain() {
    let server = server(vec![public_client("c1"), public_client("c2")]);
    let r1 = obtain_refresh_token(&server).await;

    let err = TokenHandler::new(server.ctx.clone())
        .handle(&refresh_request(&r1), &ClientAuthEvidence::public("c2"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn identity_token_is_reissued_when_openid_survives() {
    let server = server(vec![public_client("c1")]);
    let r1 = obtain_refresh_token(&server).await;
    let response = TokenHandler::new(server.ctx.clone())
        .handle(&refresh_request(&r1), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(response.id_token.is_some());
}
