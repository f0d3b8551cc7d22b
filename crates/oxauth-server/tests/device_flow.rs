//! Device authorization grant: polling, slow_down, verification backoff

mod common;

use common::*;
use oxauth_core::error::ErrorCode;
use oxauth_server::client_auth::ClientAuthEvidence;
use oxauth_server::messages::{DeviceAuthorizationRequest, TokenRequestParameters};
use oxauth_server::{DeviceAuthorizationHandler, DeviceDecision, TokenHandler};

fn poll(device_code: &str) -> TokenRequestParameters {
    TokenRequestParameters {
        grant_type: "urn:ietf:params:oauth:grant-type:device_code".into(),
        device_code: Some(device_code.to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn pending_then_slow_down_then_tokens() {
    let server = server(vec![public_client("c1")]);
    let device = DeviceAuthorizationHandler::new(server.ctx.clone());
    let opened = device
        .handle(
            &DeviceAuthorizationRequest {
                scope: Some("openid".into()),
            },
            &ClientAuthEvidence::public("c1"),
        )
        .await
        .unwrap();
    assert_eq!(opened.interval, 5);
    assert!(opened.verification_uri.starts_with("https://"));
    assert!(opened.verification_uri_complete.contains("user_code="));

    let tokens = TokenHandler::new(server.ctx.clone());

    // First poll: the user has not decided yet.
    let err = tokens
        .handle(&poll(&opened.device_code), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthorizationPending);

    // Immediate second poll: inside interval - 2s.
    let err = tokens
        .handle(&poll(&opened.device_code), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SlowDown);

    // The user approves on the second device.
    device
        .submit_user_code(
            &opened.user_code,
            "198.51.100.7",
            DeviceDecision::Approve {
                subject: "u1".into(),
                session_id: None,
            },
        )
        .await
        .unwrap();

    // Approval bypasses the polling clock; tokens come back exactly once.
    let response = tokens
        .handle(&poll(&opened.device_code), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap();
    assert!(response.id_token.is_some());

    let err = tokens
        .handle(&poll(&opened.device_code), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn denial_surfaces_access_denied() {
    let server = server(vec![public_client("c1")]);
    let device = DeviceAuthorizationHandler::new(server.ctx.clone());
    let opened = device
        .handle(
            &DeviceAuthorizationRequest { scope: None },
            &ClientAuthEvidence::public("c1"),
        )
        .await
        .unwrap();

    device
        .submit_user_code(&opened.user_code, "198.51.100.7", DeviceDecision::Deny)
        .await
        .unwrap();

    let err = TokenHandler::new(server.ctx.clone())
        .handle(&poll(&opened.device_code), &ClientAuthEvidence::public("c1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AccessDenied);
}

#[tokio::test]
async fn wrong_user_codes_arm_backoff_per_code() {
    let server = server(vec![public_client("c1")]);
    let device = DeviceAuthorizationHandler::new(server.ctx.clone());

    // Three failures on the same guessed code trip the per-code budget.
    for _ in 0..3 {
        let err = device
            .submit_user_code(
                "00000000",
                "203.0.113.9",
                DeviceDecision::Approve {
                    subject: "u1".into(),
                    session_id: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGrant);
    }
    let err = device
        .submit_user_code(
            "00000000",
            "203.0.113.9",
            DeviceDecision::Approve {
                subject: "u1".into(),
                session_id: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SlowDown);
}

#[tokio::test]
async fn per_ip_budget_blocks_code_scanning() {
    let server = server(vec![public_client("c1")]);
    let device = DeviceAuthorizationHandler::new(server.ctx.clone());

    // Distinct wrong codes from one address until the window budget is
    // exhausted (the budget is 10/min; the 11th failure arms backoff).
    for i in 0..11 {
        let _ = device
            .submit_user_code(
                &format!("guess-{i:03}"),
                "203.0.113.50",
                DeviceDecision::Deny,
            )
            .await;
    }
    let err = device
        .submit_user_code("guess-999", "203.0.113.50", DeviceDecision::Deny)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SlowDown);

    // A different address is unaffected.
    let err = device
        .submit_user_code("guess-999", "203.0.113.51", DeviceDecision::Deny)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGrant);
}
