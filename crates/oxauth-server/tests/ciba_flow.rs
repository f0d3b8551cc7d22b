//! CIBA: poll and long-poll delivery, interval doubling, ping notification

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use oxauth_core::client::BackchannelTokenDeliveryMode;
use oxauth_core::error::ErrorCode;
use oxauth_server::client_auth::ClientAuthEvidence;
use oxauth_server::messages::{BackchannelAuthenticationRequest, TokenRequestParameters};
use oxauth_server::{BackchannelAuthHandler, CibaOutcome, TokenHandler};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ciba_request() -> BackchannelAuthenticationRequest {
    BackchannelAuthenticationRequest {
        scope: Some("openid".into()),
        login_hint: Some("u1@example.org".into()),
        ..Default::default()
    }
}

fn poll(auth_req_id: &str) -> TokenRequestParameters {
    TokenRequestParameters {
        grant_type: "urn:openid:params:grant-type:ciba".into(),
        auth_req_id: Some(auth_req_id.to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn poll_mode_pending_then_tokens_exactly_once() {
    let server = server(vec![public_client("c1")]);
    let handler = BackchannelAuthHandler::new(server.ctx.clone());
    let opened = handler
        .handle(&ciba_request(), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert_eq!(opened.interval, 5);
    assert!(opened.auth_req_id.len() >= 43);

    let tokens = TokenHandler::new(server.ctx.clone());
    let err = tokens
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthorizationPending);

    // Premature re-poll doubles the interval.
    let err = tokens
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SlowDown);

    handler
        .complete(
            &opened.auth_req_id,
            CibaOutcome::Approved {
                subject: "u1".into(),
                session_id: None,
            },
        )
        .await
        .unwrap();

    let response = tokens
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(response.id_token.is_some());

    // Redeemed exactly once.
    let err = tokens
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn long_poll_returns_promptly_on_approval() {
    let mut options = options();
    options.ciba.use_long_polling = true;
    options.ciba.long_polling_timeout = Duration::from_secs(5);
    let server = server_with(
        options,
        vec![public_client("c1")],
        Arc::new(ApprovingInteraction::default()),
    );

    let handler = BackchannelAuthHandler::new(server.ctx.clone());
    let opened = handler
        .handle(&ciba_request(), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();

    // Approve while the poll is blocked.
    let approve_ctx = server.ctx.clone();
    let auth_req_id = opened.auth_req_id.clone();
    let approver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        BackchannelAuthHandler::new(approve_ctx)
            .complete(
                &auth_req_id,
                CibaOutcome::Approved {
                    subject: "u1".into(),
                    session_id: None,
                },
            )
            .await
            .unwrap();
    });

    let started = std::time::Instant::now();
    let response = TokenHandler::new(server.ctx.clone())
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(response.id_token.is_some());
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "long poll should wake on the transition, not the timeout"
    );
    approver.await.unwrap();
}

#[tokio::test]
async fn long_poll_times_out_to_authorization_pending() {
    let mut options = options();
    options.ciba.use_long_polling = true;
    options.ciba.long_polling_timeout = Duration::from_millis(200);
    let server = server_with(
        options,
        vec![public_client("c1")],
        Arc::new(ApprovingInteraction::default()),
    );

    let handler = BackchannelAuthHandler::new(server.ctx.clone());
    let opened = handler
        .handle(&ciba_request(), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();

    let err = TokenHandler::new(server.ctx.clone())
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthorizationPending);
}

#[tokio::test]
async fn hint_rules_are_enforced() {
    let server = server(vec![public_client("c1")]);
    let handler = BackchannelAuthHandler::new(server.ctx.clone());

    let mut no_hint = ciba_request();
    no_hint.login_hint = None;
    let err = handler
        .handle(&no_hint, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let mut two_hints = ciba_request();
    two_hints.id_token_hint = Some("x".into());
    let err = handler
        .handle(&two_hints, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let mut no_openid = ciba_request();
    no_openid.scope = Some("profile".into());
    let err = handler
        .handle(&no_openid, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidScope);
}

#[tokio::test]
async fn user_code_requirement_surfaces_missing_user_code() {
    let mut client = public_client("c1");
    client.backchannel_user_code_parameter = true;
    let server = server(vec![client]);

    let err = BackchannelAuthHandler::new(server.ctx.clone())
        .handle(&ciba_request(), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingUserCode);
}

#[tokio::test]
async fn ping_mode_notifies_the_client_endpoint() {
    let notify = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&notify)
        .await;

    let mut client = public_client("c1");
    client.backchannel_token_delivery_mode = BackchannelTokenDeliveryMode::Ping;
    client.backchannel_client_notification_endpoint =
        Some(Url::parse(&format!("{}/notify", notify.uri())).unwrap());
    let server = server(vec![client]);

    let handler = BackchannelAuthHandler::new(server.ctx.clone());
    let mut request = ciba_request();
    request.client_notification_token = Some("notif-token".into());
    let opened = handler
        .handle(&request, &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();

    handler
        .complete(
            &opened.auth_req_id,
            CibaOutcome::Approved {
                subject: "u1".into(),
                session_id: None,
            },
        )
        .await
        .unwrap();

    let received = notify.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["auth_req_id"], opened.auth_req_id.as_str());
    assert_eq!(
        received[0]
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok()),
        Some("Bearer notif-token")
    );

    // Ping clients still poll for the tokens afterwards.
    let response = TokenHandler::new(server.ctx.clone())
        .handle(&poll(&opened.auth_req_id), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(response.id_token.is_some());
}
