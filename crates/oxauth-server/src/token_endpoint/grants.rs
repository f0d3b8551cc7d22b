//! Per-grant validators
//!
//! Each function turns raw parameters into a [`ValidTokenRequest`] or the
//! grant's protocol error. Nothing here mints; the shared processor does.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use oxauth_core::client::{BackchannelTokenDeliveryMode, ClientInfo, ClientType};
use oxauth_core::config::TrustedIssuer;
use oxauth_core::error::ProtocolError;
use oxauth_core::records::{CibaStatus, DeviceGrantStatus, TokenStatus};
use oxauth_jose::alg::SigningAlgorithm;
use oxauth_jose::token::{Expectations, TokenKind, peek_claims, verify_with_jwks};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::context::ServerContext;
use crate::issuance::{TokenSubject, code_chain_key, hash_code};
use crate::messages::TokenRequestParameters;

use super::ValidTokenRequest;

fn has_scope(scopes: &[String], wanted: &str) -> bool {
    scopes.iter().any(|s| s == wanted)
}

fn subject_from_parts(
    subject: String,
    session_id: Option<String>,
    auth_time: Option<DateTime<Utc>>,
    acr: Option<String>,
) -> TokenSubject {
    TokenSubject {
        subject,
        session_id,
        auth_time,
        acr,
    }
}

/// `authorization_code`: consume the code atomically, re-check the
/// redirect binding, verify PKCE.
pub async fn authorization_code(
    ctx: &ServerContext,
    client: ClientInfo,
    params: &TokenRequestParameters,
) -> Result<ValidTokenRequest, ProtocolError> {
    let code = params
        .code
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_request("code is required"))?;
    let hash = hash_code(code);
    let chain_key = code_chain_key(&hash);

    // The CAS is the single-use guarantee; the context read only carries
    // the payload. A second redemption burns everything derived from the
    // first.
    let fresh = ctx.registry.try_consume(&chain_key).await?;
    let context = ctx.contexts.take(&hash).await?;
    if !fresh {
        warn!(client_id = %client.client_id, "authorization code replay, revoking derived tokens");
        ctx.registry.revoke_chain(&chain_key).await?;
        return Err(ProtocolError::invalid_grant(
            "authorization code has already been redeemed",
        ));
    }
    let context = context.ok_or_else(|| {
        ProtocolError::invalid_grant("authorization code is invalid or expired")
    })?;
    if context.expires_at < Utc::now() {
        return Err(ProtocolError::invalid_grant("authorization code is expired"));
    }
    if context.client_id != client.client_id {
        return Err(ProtocolError::invalid_grant(
            "authorization code was issued to a different client",
        ));
    }

    // Byte equality; trailing slashes, case and percent-encoding all count.
    if context.redirect_uri.as_deref() != params.redirect_uri.as_deref() {
        return Err(ProtocolError::invalid_grant(
            "redirect_uri does not match the authorization request",
        ));
    }

    if let Some(challenge) = context.code_challenge.as_deref() {
        let verifier = params.code_verifier.as_deref().ok_or_else(|| {
            ProtocolError::invalid_grant("code_verifier is required for this code")
        })?;
        let ok = match context.code_challenge_method.as_deref() {
            Some("plain") => {
                client.pkce.plain_allowed
                    && bool::from(verifier.as_bytes().ct_eq(challenge.as_bytes()))
            }
            // S256 is the default method.
            _ => {
                let derived = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
                bool::from(derived.as_bytes().ct_eq(challenge.as_bytes()))
            }
        };
        if !ok {
            return Err(ProtocolError::invalid_grant("PKCE verification failed"));
        }
    }

    let include_identity = has_scope(&context.scopes, "openid");
    let issue_refresh =
        has_scope(&context.scopes, "offline_access") && client.offline_access_allowed;
    Ok(ValidTokenRequest {
        subject: Some(subject_from_parts(
            context.subject,
            Some(context.session_id),
            Some(context.auth_time),
            context.acr,
        )),
        scopes: context.scopes,
        resources: context.resources,
        claims: context.claims,
        nonce: context.nonce,
        issue_refresh,
        refresh_presented: None,
        chain_key: Some(chain_key),
        include_identity,
        client,
    })
}

/// `refresh_token`: verify the presented link, narrow scopes to the
/// intersection, hand the claims to the rotation path.
pub async fn refresh_token(
    ctx: &ServerContext,
    issuer: &str,
    client: ClientInfo,
    params: &TokenRequestParameters,
) -> Result<ValidTokenRequest, ProtocolError> {
    let raw = params
        .refresh_token
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_request("refresh_token is required"))?;
    let expect = Expectations::for_kind(TokenKind::Refresh).issued_by(issuer);
    let decoded = ctx.tokens.decode(raw, &expect).map_err(|e| {
        debug!(error = %e, "refresh token rejected");
        ProtocolError::invalid_grant("refresh token is invalid or expired")
    })?;
    let claims = decoded.claims;

    if claims.client_id() != Some(client.client_id.as_str()) {
        return Err(ProtocolError::invalid_grant(
            "refresh token was issued to a different client",
        ));
    }

    let chain_scopes = claims.scope();
    let requested = params.scopes();
    let scopes: Vec<String> = if requested.is_empty() {
        chain_scopes
    } else {
        let narrowed: Vec<String> = requested
            .into_iter()
            .filter(|s| has_scope(&chain_scopes, s))
            .collect();
        if narrowed.is_empty() {
            return Err(ProtocolError::invalid_scope(
                "requested scope is outside the refresh chain",
            ));
        }
        narrowed
    };

    let subject = claims
        .sub
        .clone()
        .ok_or_else(|| ProtocolError::invalid_grant("refresh token carries no subject"))?;
    let auth_time = claims
        .extra
        .get("auth_time")
        .and_then(|v| v.as_i64())
        .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0));
    let resources = claims
        .extra
        .get("resources")
        .and_then(|v| v.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();

    let include_identity = has_scope(&scopes, "openid");
    Ok(ValidTokenRequest {
        subject: Some(subject_from_parts(
            subject,
            claims.session_id().map(str::to_owned),
            auth_time,
            claims.extra_str("acr").map(str::to_owned),
        )),
        scopes,
        resources,
        claims: None,
        nonce: None,
        issue_refresh: false,
        refresh_presented: Some(claims),
        chain_key: None,
        include_identity,
        client,
    })
}

/// `client_credentials`: confidential clients only, never `openid`.
pub fn client_credentials(
    client: ClientInfo,
    params: &TokenRequestParameters,
) -> Result<ValidTokenRequest, ProtocolError> {
    if client.client_type != ClientType::Confidential {
        return Err(ProtocolError::unauthorized_client(
            "client_credentials requires a confidential client",
        ));
    }
    let scopes = params.scopes();
    if has_scope(&scopes, "openid") {
        return Err(ProtocolError::invalid_scope(
            "openid has no meaning without an end-user",
        ));
    }
    if has_scope(&scopes, "offline_access") {
        return Err(ProtocolError::invalid_scope(
            "offline_access has no meaning without an end-user",
        ));
    }
    for scope in &scopes {
        if !client.allows_scope(scope) {
            return Err(ProtocolError::invalid_scope(format!(
                "scope {scope} is not allowed for this client"
            )));
        }
    }
    let resources = params.resource.clone();
    Ok(ValidTokenRequest {
        scopes,
        resources,
        ..ValidTokenRequest::bare(client)
    })
}

/// `urn:ietf:params:oauth:grant-type:device_code` polling.
pub async fn device_code(
    ctx: &ServerContext,
    client: ClientInfo,
    params: &TokenRequestParameters,
) -> Result<ValidTokenRequest, ProtocolError> {
    let device_code = params
        .device_code
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_request("device_code is required"))?;
    let mut grant = ctx
        .devices
        .get_by_device_code(device_code)
        .await?
        .ok_or_else(|| ProtocolError::invalid_grant("device_code is unknown"))?;
    if grant.client_id != client.client_id {
        return Err(ProtocolError::invalid_grant(
            "device_code was issued to a different client",
        ));
    }

    let now = Utc::now();
    if grant.is_expired(now) && grant.status == DeviceGrantStatus::Pending {
        grant.status = DeviceGrantStatus::Expired;
        ctx.devices.update(grant.clone()).await?;
    }

    match grant.status {
        DeviceGrantStatus::Denied => Err(ProtocolError::access_denied("the user denied the request")),
        DeviceGrantStatus::Expired => {
            Err(ProtocolError::expired_token("device_code is expired"))
        }
        DeviceGrantStatus::Consumed => Err(ProtocolError::invalid_grant(
            "device_code has already been redeemed",
        )),
        DeviceGrantStatus::Pending => {
            // Two-second grace below the declared interval.
            let premature =
                now < grant.next_poll_at - TimeDelta::seconds(2);
            grant.next_poll_at = now
                + TimeDelta::from_std(grant.interval)
                    .unwrap_or_else(|_| TimeDelta::seconds(5));
            ctx.devices.update(grant).await?;
            if premature {
                Err(ProtocolError::slow_down())
            } else {
                Err(ProtocolError::authorization_pending())
            }
        }
        DeviceGrantStatus::Approved => {
            // One redemption per grant, even under concurrent polls.
            let fresh = ctx
                .registry
                .try_consume(&format!("device:{device_code}"))
                .await?;
            if !fresh {
                return Err(ProtocolError::invalid_grant(
                    "device_code has already been redeemed",
                ));
            }
            grant.status = DeviceGrantStatus::Consumed;
            ctx.devices.update(grant.clone()).await?;

            let subject = grant.subject.ok_or_else(|| {
                ProtocolError::server_error("approved device grant lost its subject")
            })?;
            let include_identity = has_scope(&grant.scopes, "openid");
            let issue_refresh =
                has_scope(&grant.scopes, "offline_access") && client.offline_access_allowed;
            Ok(ValidTokenRequest {
                subject: Some(subject_from_parts(
                    subject,
                    grant.session_id,
                    Some(now),
                    None,
                )),
                scopes: grant.scopes,
                issue_refresh,
                include_identity,
                ..ValidTokenRequest::bare(client)
            })
        }
    }
}

/// `urn:openid:params:grant-type:ciba` polling, with cooperative
/// long-polling when the deployment enables it.
pub async fn ciba(
    ctx: &ServerContext,
    client: ClientInfo,
    params: &TokenRequestParameters,
) -> Result<ValidTokenRequest, ProtocolError> {
    let auth_req_id = params
        .auth_req_id
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_request("auth_req_id is required"))?;
    let mut request = ctx
        .ciba
        .get(auth_req_id)
        .await?
        .ok_or_else(|| ProtocolError::invalid_grant("auth_req_id is unknown"))?;
    if request.client_id != client.client_id {
        return Err(ProtocolError::invalid_grant(
            "auth_req_id was issued to a different client",
        ));
    }
    if request.delivery_mode == BackchannelTokenDeliveryMode::Push {
        return Err(ProtocolError::invalid_request(
            "push delivery clients receive tokens at their notification endpoint",
        ));
    }

    let now = Utc::now();
    if request.is_expired(now) && request.status == CibaStatus::Pending {
        request.status = CibaStatus::Expired;
        ctx.ciba.update(request.clone()).await?;
    }

    if request.status == CibaStatus::Pending {
        if ctx.options.ciba.use_long_polling {
            request = long_poll(ctx, auth_req_id, request).await?;
        } else {
            // Premature polls double the interval up to the cap.
            if now < request.next_poll_at {
                let doubled = (request.interval * 2)
                    .min(ctx.options.ciba.max_polling_interval);
                request.interval = doubled;
                request.next_poll_at = now
                    + TimeDelta::from_std(doubled)
                        .unwrap_or_else(|_| TimeDelta::seconds(5));
                ctx.ciba.update(request).await?;
                return Err(ProtocolError::slow_down());
            }
            request.next_poll_at = now
                + TimeDelta::from_std(request.interval)
                    .unwrap_or_else(|_| TimeDelta::seconds(5));
            ctx.ciba.update(request.clone()).await?;
        }
    }

    match request.status {
        CibaStatus::Pending => Err(ProtocolError::authorization_pending()),
        CibaStatus::Denied => Err(ProtocolError::access_denied("the user denied the request")),
        CibaStatus::Expired => Err(ProtocolError::expired_token("auth_req_id is expired")),
        CibaStatus::Authorized => {
            let fresh = ctx
                .registry
                .try_consume(&format!("ciba:{auth_req_id}"))
                .await?;
            if !fresh {
                return Err(ProtocolError::invalid_grant(
                    "auth_req_id has already been redeemed",
                ));
            }
            // Redeemed exactly once; the record is gone afterwards.
            ctx.ciba.remove(auth_req_id).await?;

            let subject = request.subject.ok_or_else(|| {
                ProtocolError::server_error("authorized request lost its subject")
            })?;
            let include_identity = has_scope(&request.scopes, "openid");
            Ok(ValidTokenRequest {
                subject: Some(subject_from_parts(
                    subject,
                    request.session_id,
                    Some(now),
                    None,
                )),
                scopes: request.scopes,
                resources: request.resources,
                include_identity,
                ..ValidTokenRequest::bare(client)
            })
        }
    }
}

/// Block until the request leaves `Pending` or the long-poll window
/// closes. Cancellation simply drops the future; the pending state is
/// re-read on every wakeup, so spurious wakeups cost one read.
async fn long_poll(
    ctx: &ServerContext,
    auth_req_id: &str,
    mut request: oxauth_core::records::CibaRequest,
) -> Result<oxauth_core::records::CibaRequest, ProtocolError> {
    let deadline = tokio::time::Instant::now() + ctx.options.ciba.long_polling_timeout;
    while request.status == CibaStatus::Pending {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        if tokio::time::timeout(remaining, ctx.ciba.changed(auth_req_id))
            .await
            .is_err()
        {
            break;
        }
        request = match ctx.ciba.get(auth_req_id).await? {
            Some(updated) => updated,
            None => break,
        };
        if request.is_expired(Utc::now()) && request.status == CibaStatus::Pending {
            request.status = CibaStatus::Expired;
            ctx.ciba.update(request.clone()).await?;
        }
    }
    Ok(request)
}

/// `urn:ietf:params:oauth:grant-type:jwt-bearer` against the configured
/// trusted issuers.
pub async fn jwt_bearer(
    ctx: &ServerContext,
    issuer: &str,
    client: ClientInfo,
    params: &TokenRequestParameters,
) -> Result<ValidTokenRequest, ProtocolError> {
    let assertion = params
        .assertion
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_request("assertion is required"))?;
    let options = &ctx.options.assertions;

    let peeked = peek_claims(assertion)
        .map_err(|_| ProtocolError::invalid_grant("assertion is not a valid JWT"))?;
    let assertion_issuer = peeked
        .iss
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_grant("assertion carries no issuer"))?;
    let trusted: &TrustedIssuer = options
        .trusted_issuers
        .iter()
        .find(|t| t.issuer == assertion_issuer)
        .ok_or_else(|| ProtocolError::invalid_grant("assertion issuer is not trusted"))?;

    let jwks = match (&trusted.jwks, &trusted.jwks_uri) {
        (Some(embedded), _) => serde_json::from_value(embedded.clone())
            .map_err(|_| ProtocolError::server_error("trusted issuer JWKS is malformed"))?,
        (None, Some(uri)) => ctx.client_keys.fetch_cached(uri).await.map_err(|e| {
            warn!(issuer = %trusted.issuer, error = %e, "trusted issuer JWKS fetch failed");
            ProtocolError::server_error("trusted issuer keys unavailable")
        })?,
        (None, None) => {
            return Err(ProtocolError::server_error(
                "trusted issuer has no key material configured",
            ));
        }
    };

    let allowed: Vec<SigningAlgorithm> = trusted
        .allowed_algorithms
        .iter()
        .filter_map(|raw| SigningAlgorithm::parse(raw).ok())
        .collect();
    let token_endpoint = ctx.endpoint_url(issuer, &ctx.options.paths.token);
    let mut expect = Expectations {
        issuer: Some(&trusted.issuer),
        leeway: options.clock_skew,
        require_exp: true,
        ..Expectations::default()
    };
    if options.strict_audience {
        expect.audience = Some(&token_endpoint);
    }
    let decoded = verify_with_jwks(assertion, &jwks, &allowed, &expect, options.max_jwt_size)
        .map_err(|e| {
            debug!(error = %e, "bearer assertion rejected");
            ProtocolError::invalid_grant("assertion verification failed")
        })?;

    if !options.allowed_types.is_empty() {
        let typ = decoded.header.typ.as_deref().unwrap_or("JWT");
        if !options.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(typ)) {
            return Err(ProtocolError::invalid_grant("assertion typ is not accepted"));
        }
    }
    if !options.strict_audience
        && !decoded
            .claims
            .aud
            .iter()
            .any(|aud| aud == &token_endpoint || aud == issuer)
    {
        return Err(ProtocolError::invalid_grant(
            "assertion audience does not name this server",
        ));
    }

    let now = Utc::now().timestamp();
    let iat = decoded
        .claims
        .iat
        .ok_or_else(|| ProtocolError::invalid_grant("assertion carries no iat"))?;
    if now - iat > options.max_jwt_age.as_secs() as i64 {
        return Err(ProtocolError::invalid_grant("assertion is too old"));
    }

    if options.require_jti {
        let jti = decoded
            .claims
            .jti
            .as_deref()
            .ok_or_else(|| ProtocolError::invalid_grant("assertion carries no jti"))?;
        let ttl = options.clock_skew + options.max_jwt_age;
        let replay_key = format!("assert:{}:{}", trusted.issuer, jti);
        let fresh = ctx.registry.try_consume(&replay_key).await?;
        // Keep the consumed marker around for the whole replay window.
        ctx.registry
            .set_status(&replay_key, TokenStatus::Used, ttl.max(Duration::from_secs(1)))
            .await?;
        if !fresh {
            warn!(issuer = %trusted.issuer, "bearer assertion replay detected");
            return Err(ProtocolError::invalid_grant("assertion has already been used"));
        }
    }

    let subject = decoded
        .claims
        .sub
        .clone()
        .ok_or_else(|| ProtocolError::invalid_grant("assertion carries no subject"))?;
    if !trusted.allowed_subjects.is_empty()
        && !trusted.allowed_subjects.iter().any(|s| s == &subject)
    {
        return Err(ProtocolError::invalid_grant(
            "assertion subject is not allowed for this issuer",
        ));
    }

    let scopes: Vec<String> = params
        .scopes()
        .into_iter()
        .filter(|s| client.allows_scope(s))
        .collect();
    let include_identity = has_scope(&scopes, "openid");
    Ok(ValidTokenRequest {
        subject: Some(subject_from_parts(subject, None, None, None)),
        scopes,
        resources: params.resource.clone(),
        include_identity,
        ..ValidTokenRequest::bare(client)
    })
}
