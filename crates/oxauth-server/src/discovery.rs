//! Discovery document (RFC 8414 / OIDC Discovery 1.0) and JWKS publication

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use oxauth_core::error::ProtocolError;

use crate::issuance::Ctx;

/// The provider metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub registration_endpoint: String,
    pub revocation_endpoint: String,
    pub introspection_endpoint: String,
    pub end_session_endpoint: String,
    pub check_session_iframe: String,
    pub backchannel_authentication_endpoint: String,
    pub device_authorization_endpoint: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub response_modes_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    /// `none` appears here and only here: an RP may register for unsigned
    /// identity tokens, but nothing that protects trust accepts it.
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub userinfo_signing_alg_values_supported: Vec<String>,
    pub request_object_signing_alg_values_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub claims_parameter_supported: bool,
    pub request_parameter_supported: bool,
    pub request_uri_parameter_supported: bool,
    pub backchannel_token_delivery_modes_supported: Vec<String>,
    pub backchannel_user_code_parameter_supported: bool,
    pub frontchannel_logout_supported: bool,
    pub frontchannel_logout_session_supported: bool,
    pub backchannel_logout_supported: bool,
    pub backchannel_logout_session_supported: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mtls_endpoint_aliases: Option<BTreeMap<String, String>>,
}

/// Build the document for the current issuer, honoring hidden endpoints
/// and the mTLS alias configuration.
///
/// # Errors
///
/// `server_error` when the issuer provider fails.
pub async fn document(ctx: &Ctx) -> Result<serde_json::Value, ProtocolError> {
    let issuer = ctx.issuer_id().await?;
    let paths = &ctx.options.paths;
    let at = |path: &str| ctx.endpoint_url(&issuer, path);

    let mtls_endpoint_aliases = ctx.options.discovery.mtls_base_uri.as_ref().map(|base| {
        let base = base.as_str().trim_end_matches('/').to_owned();
        ctx.options
            .discovery
            .mtls_aliases
            .iter()
            .filter_map(|name| {
                endpoint_path(ctx, name).map(|path| (name.clone(), format!("{base}{path}")))
            })
            .collect::<BTreeMap<_, _>>()
    });

    let mut signing = ctx.options.supported_signing_algorithms.clone();
    let mut id_token_signing = signing.clone();
    id_token_signing.push("none".to_owned());
    signing.retain(|alg| alg != "none");

    let doc = DiscoveryDocument {
        issuer: issuer.clone(),
        authorization_endpoint: at(&paths.authorization),
        pushed_authorization_request_endpoint: at(&paths.pushed_authorization),
        token_endpoint: at(&paths.token),
        userinfo_endpoint: at(&paths.userinfo),
        jwks_uri: at(&paths.jwks),
        registration_endpoint: at(&paths.registration),
        revocation_endpoint: at(&paths.revocation),
        introspection_endpoint: at(&paths.introspection),
        end_session_endpoint: at(&paths.end_session),
        check_session_iframe: at(&paths.check_session),
        backchannel_authentication_endpoint: at(&paths.backchannel_authentication),
        device_authorization_endpoint: at(&paths.device_authorization),
        scopes_supported: ctx.options.supported_scopes.clone(),
        response_types_supported: vec![
            "code".into(),
            "id_token".into(),
            "token".into(),
            "code id_token".into(),
            "code token".into(),
            "id_token token".into(),
            "code id_token token".into(),
        ],
        response_modes_supported: vec!["query".into(), "fragment".into(), "form_post".into()],
        grant_types_supported: vec![
            "authorization_code".into(),
            "refresh_token".into(),
            "client_credentials".into(),
            "urn:ietf:params:oauth:grant-type:device_code".into(),
            "urn:openid:params:grant-type:ciba".into(),
            "urn:ietf:params:oauth:grant-type:jwt-bearer".into(),
        ],
        subject_types_supported: vec!["public".into(), "pairwise".into()],
        id_token_signing_alg_values_supported: id_token_signing,
        userinfo_signing_alg_values_supported: signing.clone(),
        request_object_signing_alg_values_supported: signing,
        token_endpoint_auth_methods_supported: vec![
            "none".into(),
            "client_secret_basic".into(),
            "client_secret_post".into(),
            "client_secret_jwt".into(),
            "private_key_jwt".into(),
            "tls_client_auth".into(),
            "self_signed_tls_client_auth".into(),
        ],
        code_challenge_methods_supported: vec!["S256".into(), "plain".into()],
        claims_parameter_supported: true,
        request_parameter_supported: ctx.options.authorization.request_parameter_supported,
        request_uri_parameter_supported: ctx
            .options
            .authorization
            .request_uri_parameter_supported,
        backchannel_token_delivery_modes_supported: ctx
            .options
            .ciba
            .delivery_modes_supported
            .clone(),
        backchannel_user_code_parameter_supported: ctx
            .options
            .ciba
            .user_code_parameter_supported,
        frontchannel_logout_supported: true,
        frontchannel_logout_session_supported: true,
        backchannel_logout_supported: true,
        backchannel_logout_session_supported: true,
        mtls_endpoint_aliases,
    };

    let mut value = serde_json::to_value(&doc)
        .map_err(|_| ProtocolError::server_error("discovery document serialization failed"))?;
    if let Some(object) = value.as_object_mut() {
        for hidden in &ctx.options.discovery.hidden_endpoints {
            object.remove(hidden);
        }
    }
    Ok(value)
}

fn endpoint_path(ctx: &Ctx, name: &str) -> Option<String> {
    let paths = &ctx.options.paths;
    let path = match name {
        "token_endpoint" => &paths.token,
        "revocation_endpoint" => &paths.revocation,
        "introspection_endpoint" => &paths.introspection,
        "device_authorization_endpoint" => &paths.device_authorization,
        "backchannel_authentication_endpoint" => &paths.backchannel_authentication,
        "pushed_authorization_request_endpoint" => &paths.pushed_authorization,
        _ => return None,
    };
    Some(path.clone())
}

/// The published key set for `/.well-known/jwks`.
pub fn jwks(ctx: &Ctx) -> serde_json::Value {
    ctx.tokens.keyring().jwks()
}
