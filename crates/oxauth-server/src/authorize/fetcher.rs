//! Authorization request reference resolution
//!
//! Resolves the three ways parameters can arrive indirectly - an inline
//! `request` object, a remote `request_uri`, or a pushed-request handle
//! (`urn:ietf:params:oauth:request_uri:...`) - and folds the result back
//! into plain [`AuthorizationParameters`] before validation runs.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use oxauth_core::client::ClientInfo;
use oxauth_core::error::{ErrorCode, ProtocolError};
use oxauth_core::params::AuthorizationParameters;
use oxauth_core::records::PendingAuthorization;
use oxauth_jose::alg::SigningAlgorithm;
use oxauth_jose::token::{Expectations, peek_claims, verify_with_jwks};
use tracing::debug;
use url::Url;

use crate::context::ServerContext;

/// Resolve references and return the effective parameters.
///
/// # Errors
///
/// `invalid_request` for unknown clients, expired handles or reference
/// conflicts; `request_not_supported` / `request_uri_not_supported` when
/// the feature is disabled.
pub async fn resolve(
    ctx: &ServerContext,
    issuer: &str,
    mut params: AuthorizationParameters,
) -> Result<(ClientInfo, AuthorizationParameters), ProtocolError> {
    let client_id = params
        .client_id
        .clone()
        .ok_or_else(|| ProtocolError::invalid_request("client_id is required"))?;
    let client = ctx.catalogue.require(&client_id).await?;

    if params.request.is_some() && params.request_uri.is_some() {
        return Err(ProtocolError::invalid_request(
            "request and request_uri cannot both be present",
        ));
    }

    if let Some(request_uri) = params.request_uri.clone() {
        if let Some(id) = PendingAuthorization::id_from_request_uri(&request_uri) {
            params = take_pushed(ctx, &client, id).await?;
        } else {
            if !ctx.options.authorization.request_uri_parameter_supported {
                return Err(ProtocolError::new(
                    ErrorCode::RequestUriNotSupported,
                    "request_uri references are disabled",
                ));
            }
            let object = fetch_remote_object(ctx, &request_uri).await?;
            params = apply_request_object(ctx, issuer, &client, &object, params).await?;
        }
    } else if let Some(object) = params.request.take() {
        if !ctx.options.authorization.request_parameter_supported {
            return Err(ProtocolError::new(
                ErrorCode::RequestNotSupported,
                "request objects are disabled",
            ));
        }
        params = apply_request_object(ctx, issuer, &client, &object, params).await?;
    }

    Ok((client, params))
}

async fn take_pushed(
    ctx: &ServerContext,
    client: &ClientInfo,
    id: &str,
) -> Result<AuthorizationParameters, ProtocolError> {
    let pending = ctx
        .pushed
        .take(id)
        .await?
        .filter(|p| !p.is_expired(Utc::now()))
        .ok_or_else(|| {
            ProtocolError::invalid_request("request_uri is unknown, expired or already used")
        })?;
    if pending.client_id != client.client_id {
        return Err(ProtocolError::invalid_request(
            "request_uri belongs to a different client",
        ));
    }
    debug!(client_id = %client.client_id, handle = %id, "pushed request resumed");
    let mut params = pending.parameters;
    params.client_id = Some(client.client_id.clone());
    Ok(params)
}

async fn fetch_remote_object(
    ctx: &ServerContext,
    request_uri: &str,
) -> Result<String, ProtocolError> {
    let url = Url::parse(request_uri)
        .map_err(|_| ProtocolError::invalid_request("request_uri is not a valid URL"))?;
    let body = ctx.fetcher.get_bytes(&url).await.map_err(|e| {
        debug!(url = %url, error = %e, "request_uri dereference failed");
        ProtocolError::invalid_request("request_uri could not be dereferenced")
    })?;
    if body.len() > ctx.options.assertions.max_jwt_size {
        return Err(ProtocolError::invalid_request("request object is too large"));
    }
    String::from_utf8(body)
        .map(|s| s.trim().to_owned())
        .map_err(|_| ProtocolError::invalid_request("request object is not valid UTF-8"))
}

/// Header `alg` of a compact JOSE object, without full parsing.
fn header_alg(jwt: &str) -> Result<String, ProtocolError> {
    let header_b64 = jwt
        .split('.')
        .next()
        .ok_or_else(|| ProtocolError::invalid_request("request object is not a JWT"))?;
    let header: serde_json::Value = URL_SAFE_NO_PAD
        .decode(header_b64)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| ProtocolError::invalid_request("request object header is malformed"))?;
    header["alg"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::invalid_request("request object header carries no alg"))
}

pub(crate) async fn apply_request_object(
    ctx: &ServerContext,
    issuer: &str,
    client: &ClientInfo,
    object: &str,
    mut outer: AuthorizationParameters,
) -> Result<AuthorizationParameters, ProtocolError> {
    let registered = client.request_object_signing_alg.as_deref();
    let alg = header_alg(object)?;

    let claims = if alg == "none" {
        // Unsigned objects only for clients that registered exactly that.
        if registered != Some("none") {
            return Err(ProtocolError::invalid_request(
                "unsigned request objects are not allowed for this client",
            ));
        }
        peek_claims(object)
            .map_err(|_| ProtocolError::invalid_request("request object payload is malformed"))?
    } else {
        let expected = match registered {
            Some("none") | None => {
                // No registered algorithm: accept any server-supported
                // asymmetric one.
                Vec::new()
            }
            Some(raw) => {
                let parsed = SigningAlgorithm::parse(raw).map_err(|_| {
                    ProtocolError::server_error("registered request_object alg is unusable")
                })?;
                vec![parsed]
            }
        };
        verify_object_signature(ctx, client, object, &expected).await?
    };

    if let Some(iss) = &claims.iss
        && iss != &client.client_id
    {
        return Err(ProtocolError::invalid_request(
            "request object issuer is not the client",
        ));
    }
    if !claims.aud.is_empty() && !claims.aud.iter().any(|aud| aud == issuer) {
        return Err(ProtocolError::invalid_request(
            "request object audience does not name this server",
        ));
    }

    let value = serde_json::to_value(&claims)
        .map_err(|_| ProtocolError::invalid_request("request object payload is malformed"))?;
    let inner: AuthorizationParameters = serde_json::from_value(value)
        .map_err(|_| ProtocolError::invalid_request("request object payload is malformed"))?;
    if let Some(inner_client) = &inner.client_id
        && inner_client != &client.client_id
    {
        return Err(ProtocolError::invalid_request(
            "request object names a different client",
        ));
    }
    outer.merge_request_object(inner);
    Ok(outer)
}

async fn verify_object_signature(
    ctx: &ServerContext,
    client: &ClientInfo,
    object: &str,
    allowed: &[SigningAlgorithm],
) -> Result<oxauth_jose::token::JwtClaims, ProtocolError> {
    // Verified with the client's registered keys; resolution is
    // embedded-first and never mixes sources.
    let jwks = ctx.client_keys.resolve(client).await.map_err(|e| {
        debug!(client_id = %client.client_id, error = %e, "client keys unavailable");
        ProtocolError::invalid_request("client has no usable keys for request objects")
    })?;
    let expect = Expectations {
        leeway: ctx.options.assertions.clock_skew,
        require_exp: false,
        ..Expectations::default()
    };
    verify_with_jwks(
        object,
        &jwks,
        allowed,
        &expect,
        ctx.options.assertions.max_jwt_size,
    )
    .map(|decoded| decoded.claims)
    .map_err(|e| {
        debug!(client_id = %client.client_id, error = %e, "request object rejected");
        ProtocolError::invalid_request("request object signature verification failed")
    })
}
