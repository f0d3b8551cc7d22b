//! End-session fanout, revocation scoping, introspection discretion

mod common;

use common::*;
use oxauth_core::client::{ClientInfo, ClientSecret, TokenEndpointAuthMethod};
use oxauth_core::records::AuthSession;
use oxauth_jose::token::peek_claims;
use oxauth_server::client_auth::ClientAuthEvidence;
use oxauth_server::messages::{
    EndSessionRequest, IntrospectionRequest, RevocationRequest, TokenRequestParameters,
};
use oxauth_server::{EndSessionHandler, IntrospectionHandler, RevocationHandler, TokenHandler};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn confidential(client_id: &str, secret: &str) -> ClientInfo {
    let mut client = ClientInfo::confidential(client_id);
    client.token_endpoint_auth_method = TokenEndpointAuthMethod::ClientSecretBasic;
    client.secrets = vec![ClientSecret::from_plain(secret, false, None)];
    client.grant_types = vec!["client_credentials".into()];
    client
}

async fn client_credentials_token(server: &TestServer, id: &str, secret: &str) -> String {
    TokenHandler::new(server.ctx.clone())
        .handle(
            &TokenRequestParameters {
                grant_type: "client_credentials".into(),
                scope: Some("api".into()),
                ..Default::default()
            },
            &ClientAuthEvidence::basic(id, secret),
        )
        .await
        .unwrap()
        .access_token
}

#[tokio::test]
async fn backchannel_and_frontchannel_fanout() {
    let backchannel = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bc-logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backchannel)
        .await;

    let mut c1 = public_client("c1");
    c1.backchannel_logout_uri =
        Some(Url::parse(&format!("{}/bc-logout", backchannel.uri())).unwrap());
    c1.backchannel_logout_session_required = true;
    c1.post_logout_redirect_uris = vec![Url::parse("https://a.example/bye").unwrap()];
    let mut c2 = public_client("c2");
    c2.frontchannel_logout_uri = Some(Url::parse("https://b.example/fc-logout").unwrap());

    let server = server(vec![c1, c2]);

    // A session that handed tokens to both clients.
    let mut session = AuthSession::new("u1", "s1");
    session.affected_client_ids.insert("c1".into());
    session.affected_client_ids.insert("c2".into());
    server.sessions.sign_in(session).await;

    let response = EndSessionHandler::new(server.ctx.clone())
        .handle(&EndSessionRequest {
            client_id: Some("c1".into()),
            post_logout_redirect_uri: Some("https://a.example/bye".into()),
            state: Some("st".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        response.post_logout_redirect.as_deref(),
        Some("https://a.example/bye?state=st")
    );
    assert_eq!(
        response.frontchannel_logout_uris,
        vec!["https://b.example/fc-logout".to_owned()]
    );

    // The back-channel POST carried a logout_token with the session id.
    let received = backchannel.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let form: Vec<(String, String)> =
        serde_urlencoded::from_bytes(&received[0].body).unwrap();
    let token = &form
        .iter()
        .find(|(k, _)| k == "logout_token")
        .expect("logout_token field")
        .1;
    let claims = peek_claims(token).unwrap();
    assert_eq!(claims.aud, vec!["c1"]);
    assert_eq!(claims.extra_str("sid"), Some("s1"));
    assert!(claims.extra.get("events").is_some());
}

#[tokio::test]
async fn unregistered_post_logout_redirect_is_refused() {
    let server = server(vec![public_client("c1")]);
    let err = EndSessionHandler::new(server.ctx.clone())
        .handle(&EndSessionRequest {
            client_id: Some("c1".into()),
            post_logout_redirect_uri: Some("https://evil.example/bye".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, oxauth_core::error::ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn revocation_is_scoped_to_the_owning_client() {
    let server = server(vec![
        confidential("c1", "secret-one"),
        confidential("c2", "secret-two"),
    ]);
    let token = client_credentials_token(&server, "c1", "secret-one").await;

    let revocation = RevocationHandler::new(server.ctx.clone());
    let introspection = IntrospectionHandler::new(server.ctx.clone());

    // c2 revoking c1's token: 200, no effect.
    revocation
        .handle(
            &RevocationRequest {
                token: token.clone(),
                token_type_hint: None,
            },
            &ClientAuthEvidence::basic("c2", "secret-two"),
        )
        .await
        .unwrap();
    let still_active = introspection
        .handle(
            &IntrospectionRequest {
                token: token.clone(),
                token_type_hint: None,
            },
            &ClientAuthEvidence::basic("c1", "secret-one"),
        )
        .await
        .unwrap();
    assert!(still_active.active);

    // The owner's revocation sticks.
    revocation
        .handle(
            &RevocationRequest {
                token: token.clone(),
                token_type_hint: None,
            },
            &ClientAuthEvidence::basic("c1", "secret-one"),
        )
        .await
        .unwrap();
    let after = introspection
        .handle(
            &IntrospectionRequest {
                token,
                token_type_hint: None,
            },
            &ClientAuthEvidence::basic("c1", "secret-one"),
        )
        .await
        .unwrap();
    assert!(!after.active);
}

#[tokio::test]
async fn malformed_tokens_revoke_silently() {
    let server = server(vec![confidential("c1", "secret-one")]);
    RevocationHandler::new(server.ctx.clone())
        .handle(
            &RevocationRequest {
                token: "not-a-jwt".into(),
                token_type_hint: None,
            },
            &ClientAuthEvidence::basic("c1", "secret-one"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn introspection_answers_inactive_outside_the_audience() {
    let server = server(vec![
        confidential("c1", "secret-one"),
        confidential("c2", "secret-two"),
    ]);
    let token = client_credentials_token(&server, "c1", "secret-one").await;

    let response = IntrospectionHandler::new(server.ctx.clone())
        .handle(
            &IntrospectionRequest {
                token,
                token_type_hint: None,
            },
            &ClientAuthEvidence::basic("c2", "secret-two"),
        )
        .await
        .unwrap();
    assert!(!response.active);
    assert!(response.sub.is_none());
    assert!(response.scope.is_none());
}
