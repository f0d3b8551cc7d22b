//! The authorization validator chain
//!
//! An ordered list of single-purpose validators; the first failure wins
//! and the pipeline stops. Order matters twice over: earlier validators
//! establish state later ones read (flow before response-mode before
//! redirect), and everything before redirect-URI validation must surface
//! errors as a plain response because no redirect is trusted yet.

use oxauth_core::claims::RequestedClaims;
use oxauth_core::client::ClientInfo;
use oxauth_core::error::ProtocolError;
use oxauth_core::params::{AuthorizationParameters, Flow, ResponseMode, ResponseTypeSet};
use url::Url;

/// Mutable state threaded through the chain.
#[derive(Debug)]
pub struct ValidationState {
    pub client: ClientInfo,
    pub params: AuthorizationParameters,
    pub response_type: Option<ResponseTypeSet>,
    pub flow: Option<Flow>,
    pub response_mode: Option<ResponseMode>,
    pub redirect_uri: Option<Url>,
    pub claims: Option<RequestedClaims>,
}

impl ValidationState {
    pub fn new(client: ClientInfo, params: AuthorizationParameters) -> Self {
        Self {
            client,
            params,
            response_type: None,
            flow: None,
            response_mode: None,
            redirect_uri: None,
            claims: None,
        }
    }

    fn response_type(&self) -> ResponseTypeSet {
        self.response_type.expect("flow detection runs first")
    }

    fn flow(&self) -> Flow {
        self.flow.expect("flow detection runs first")
    }
}

/// One verb of the chain.
pub trait AuthorizationValidator: Send + Sync {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError>;
}

/// The chain, in the declared order.
pub fn default_chain() -> Vec<Box<dyn AuthorizationValidator>> {
    vec![
        Box::new(FlowDetection),
        Box::new(ResponseModeCompatibility),
        Box::new(RedirectUriMatch),
        Box::new(PkcePolicy),
        Box::new(NonceRequired),
        Box::new(ScopeAllowed),
        Box::new(OfflineAccessRestriction),
        Box::new(PromptSupported),
        Box::new(MaxAgeAndAcr),
        Box::new(ResourceIndicators),
        Box::new(ClaimsParameter),
    ]
}

/// Run the chain; first failure short-circuits.
///
/// # Errors
///
/// The first validator's error, with the request's `state` attached.
pub fn run_chain(
    chain: &[Box<dyn AuthorizationValidator>],
    state: &mut ValidationState,
) -> Result<(), ProtocolError> {
    for validator in chain {
        validator
            .validate(state)
            .map_err(|e| e.with_state(state.params.state.clone()))?;
    }
    Ok(())
}

/// Parse `response_type`, match it against the registration, detect the
/// flow.
pub struct FlowDetection;

impl AuthorizationValidator for FlowDetection {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        let raw = state
            .params
            .response_type
            .as_deref()
            .ok_or_else(|| ProtocolError::invalid_request("response_type is required"))?;
        let set = ResponseTypeSet::parse(raw)?;
        if !state.client.allows_response_type(&set.members()) {
            return Err(ProtocolError::unauthorized_client(
                "response_type is not registered for this client",
            ));
        }
        state.flow = Some(set.flow());
        state.response_type = Some(set);
        Ok(())
    }
}

/// `response_mode` must fit the flow: token-bearing flows never use query.
pub struct ResponseModeCompatibility;

impl AuthorizationValidator for ResponseModeCompatibility {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        let flow = state.flow();
        let mode = match state.params.response_mode.as_deref() {
            Some(raw) => {
                let mode = ResponseMode::parse(raw)?;
                if !mode.allowed_for(flow) {
                    return Err(ProtocolError::invalid_request(
                        "response_mode is not allowed for this response_type",
                    ));
                }
                mode
            }
            None => ResponseMode::default_for(flow),
        };
        state.response_mode = Some(mode);
        Ok(())
    }
}

/// Byte-equal match against the registered redirect URIs.
pub struct RedirectUriMatch;

impl AuthorizationValidator for RedirectUriMatch {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        let raw = state
            .params
            .redirect_uri
            .as_deref()
            .ok_or_else(|| ProtocolError::invalid_request("redirect_uri is required"))?;
        if !state.client.has_redirect_uri(raw) {
            return Err(ProtocolError::invalid_request(
                "redirect_uri is not registered for this client",
            ));
        }
        let url = Url::parse(raw)
            .map_err(|_| ProtocolError::invalid_request("redirect_uri is not a valid URL"))?;
        state.redirect_uri = Some(url);
        Ok(())
    }
}

/// Enforce the client's PKCE policy on code-bearing requests.
pub struct PkcePolicy;

impl AuthorizationValidator for PkcePolicy {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        if !state.response_type().code {
            return Ok(());
        }
        match state.params.code_challenge.as_deref() {
            None => {
                if state.client.pkce.required {
                    return Err(ProtocolError::invalid_request(
                        "code_challenge is required for this client",
                    ));
                }
            }
            Some(challenge) => {
                if challenge.len() < 43 || challenge.len() > 128 {
                    return Err(ProtocolError::invalid_request(
                        "code_challenge length is out of range",
                    ));
                }
                match state.params.code_challenge_method.as_deref() {
                    Some("S256") | None => {}
                    Some("plain") => {
                        if !state.client.pkce.plain_allowed {
                            return Err(ProtocolError::invalid_request(
                                "plain code_challenge_method is not allowed for this client",
                            ));
                        }
                    }
                    Some(other) => {
                        return Err(ProtocolError::invalid_request(format!(
                            "unsupported code_challenge_method {other}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// `nonce` is mandatory whenever an identity token comes back through the
/// front channel.
pub struct NonceRequired;

impl AuthorizationValidator for NonceRequired {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        if state.response_type().includes_id_token() && state.params.nonce.is_none() {
            return Err(ProtocolError::invalid_request(
                "nonce is required when response_type includes id_token",
            ));
        }
        Ok(())
    }
}

/// Every requested scope must pass the client's scope policy, and
/// `id_token` responses require `openid`.
pub struct ScopeAllowed;

impl AuthorizationValidator for ScopeAllowed {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        let scopes = state.params.scopes();
        for scope in &scopes {
            if !state.client.allows_scope(scope) {
                return Err(ProtocolError::invalid_scope(format!(
                    "scope {scope} is not allowed for this client"
                )));
            }
        }
        if state.response_type().includes_id_token() && !scopes.iter().any(|s| s == "openid") {
            return Err(ProtocolError::invalid_scope(
                "id_token responses require the openid scope",
            ));
        }
        Ok(())
    }
}

/// `offline_access` needs a code-bearing flow and a client allowed to hold
/// refresh tokens.
pub struct OfflineAccessRestriction;

impl AuthorizationValidator for OfflineAccessRestriction {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        if !state.params.scopes().iter().any(|s| s == "offline_access") {
            return Ok(());
        }
        if state.flow() == Flow::Implicit {
            return Err(ProtocolError::invalid_scope(
                "offline_access cannot be granted through the implicit flow",
            ));
        }
        if !state.client.offline_access_allowed {
            return Err(ProtocolError::invalid_scope(
                "offline_access is not allowed for this client",
            ));
        }
        Ok(())
    }
}

const SUPPORTED_PROMPTS: &[&str] = &["none", "login", "consent", "select_account"];

/// `prompt` values must be known, and `none` tolerates no companions.
pub struct PromptSupported;

impl AuthorizationValidator for PromptSupported {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        let prompts = state.params.prompts();
        for prompt in &prompts {
            if !SUPPORTED_PROMPTS.contains(prompt) {
                return Err(ProtocolError::invalid_request(format!(
                    "unsupported prompt value {prompt}"
                )));
            }
        }
        if prompts.contains(&"none") && prompts.len() > 1 {
            return Err(ProtocolError::invalid_request(
                "prompt=none cannot be combined with other values",
            ));
        }
        Ok(())
    }
}

/// `max_age` and `acr_values` must be well-formed when present.
pub struct MaxAgeAndAcr;

impl AuthorizationValidator for MaxAgeAndAcr {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        if let Some(acr_values) = state.params.acr_values.as_deref()
            && acr_values.split_ascii_whitespace().next().is_none()
        {
            return Err(ProtocolError::invalid_request("acr_values is empty"));
        }
        // max_age arrives through serde as u64; nothing further to check
        // beyond presence, which the type already guarantees.
        Ok(())
    }
}

/// RFC 8707 resource indicators: absolute, fragment-free, and inside the
/// client's allowed set when one is registered.
pub struct ResourceIndicators;

impl AuthorizationValidator for ResourceIndicators {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        for raw in &state.params.resource {
            let url = Url::parse(raw).map_err(|_| {
                ProtocolError::invalid_request(format!("resource {raw} is not an absolute URI"))
            })?;
            if url.fragment().is_some() {
                return Err(ProtocolError::invalid_request(format!(
                    "resource {raw} must not carry a fragment"
                )));
            }
            if !state.client.allowed_resources.is_empty()
                && !state
                    .client
                    .allowed_resources
                    .iter()
                    .any(|allowed| allowed.as_str() == raw)
            {
                return Err(ProtocolError::invalid_request(format!(
                    "resource {raw} is not allowed for this client"
                )));
            }
        }
        Ok(())
    }
}

/// The `claims` parameter must parse into the two-bucket shape.
pub struct ClaimsParameter;

impl AuthorizationValidator for ClaimsParameter {
    fn validate(&self, state: &mut ValidationState) -> Result<(), ProtocolError> {
        if let Some(raw) = state.params.claims.as_deref() {
            let parsed = RequestedClaims::parse(raw)
                .map_err(|_| ProtocolError::invalid_request("claims parameter is malformed"))?;
            state.claims = Some(parsed);
        }
        Ok(())
    }
}
