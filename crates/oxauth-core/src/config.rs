//! Server configuration surface
//!
//! Plain option structs with conservative defaults. `OidcOptions::validate`
//! runs once at startup; anything that would weaken a protocol guarantee
//! (plaintext verification URI, low-entropy user codes) fails fast there
//! instead of at request time.

use std::time::Duration;

use url::Url;

use crate::error::ProtocolError;

/// Paths the discovery document advertises, relative to the issuer.
#[derive(Debug, Clone)]
pub struct EndpointPaths {
    pub authorization: String,
    pub pushed_authorization: String,
    pub token: String,
    pub userinfo: String,
    pub revocation: String,
    pub introspection: String,
    pub end_session: String,
    pub check_session: String,
    pub backchannel_authentication: String,
    pub device_authorization: String,
    pub registration: String,
    pub jwks: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            authorization: "/connect/authorize".into(),
            pushed_authorization: "/connect/par".into(),
            token: "/connect/token".into(),
            userinfo: "/connect/userinfo".into(),
            revocation: "/connect/revocation".into(),
            introspection: "/connect/introspection".into(),
            end_session: "/connect/endsession".into(),
            check_session: "/connect/checksession".into(),
            backchannel_authentication: "/connect/ciba".into(),
            device_authorization: "/connect/device_authorization".into(),
            registration: "/connect/register".into(),
            jwks: "/.well-known/jwks".into(),
        }
    }
}

/// Discovery document controls.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Endpoints omitted from the document are still served; hosts that
    /// front only part of the surface can hide the rest.
    pub hidden_endpoints: Vec<String>,
    /// Base URI for the mTLS endpoint aliases (RFC 8705 §5).
    pub mtls_base_uri: Option<Url>,
    /// Endpoints that get an mTLS alias when `mtls_base_uri` is set.
    pub mtls_aliases: Vec<String>,
}

/// Backchannel authentication (CIBA) engine options.
#[derive(Debug, Clone)]
pub struct CibaOptions {
    pub default_expiry: Duration,
    pub max_expiry: Duration,
    pub polling_interval: Duration,
    /// Cap for the interval-doubling applied on premature polls.
    pub max_polling_interval: Duration,
    pub use_long_polling: bool,
    pub long_polling_timeout: Duration,
    /// Entropy of `auth_req_id` in bytes; floor of 16 (128 bits).
    pub request_id_entropy_bytes: usize,
    pub user_code_parameter_supported: bool,
    /// Delivery modes advertised in discovery.
    pub delivery_modes_supported: Vec<String>,
}

impl Default for CibaOptions {
    fn default() -> Self {
        Self {
            default_expiry: Duration::from_secs(300),
            max_expiry: Duration::from_secs(1800),
            polling_interval: Duration::from_secs(5),
            max_polling_interval: Duration::from_secs(60),
            use_long_polling: false,
            long_polling_timeout: Duration::from_secs(30),
            request_id_entropy_bytes: 64,
            user_code_parameter_supported: true,
            delivery_modes_supported: vec!["poll".into(), "ping".into(), "push".into()],
        }
    }
}

/// Device authorization grant options.
#[derive(Debug, Clone)]
pub struct DeviceFlowOptions {
    pub code_lifetime: Duration,
    pub polling_interval: Duration,
    /// Entropy of the opaque `device_code` in bytes.
    pub device_code_entropy_bytes: usize,
    pub user_code_length: usize,
    /// Alphabet the `user_code` is drawn from. The default is decimal
    /// digits; a consonant-only set avoids accidental words.
    pub user_code_alphabet: Vec<char>,
    pub verification_uri: Url,
    /// Failures on one user code before backoff engages.
    pub max_failures_before_backoff: u32,
    /// Per-IP failure budget inside `rate_limit_window`.
    pub max_ip_failures_per_window: u32,
    pub rate_limit_window: Duration,
    pub max_backoff: Duration,
}

impl Default for DeviceFlowOptions {
    fn default() -> Self {
        Self {
            code_lifetime: Duration::from_secs(300),
            polling_interval: Duration::from_secs(5),
            device_code_entropy_bytes: 32,
            user_code_length: 8,
            user_code_alphabet: ('0'..='9').collect(),
            verification_uri: Url::parse("https://localhost/device")
                .expect("static URL parses"),
            max_failures_before_backoff: 3,
            max_ip_failures_per_window: 10,
            rate_limit_window: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl DeviceFlowOptions {
    /// Effective user-code entropy in bits.
    pub fn user_code_entropy_bits(&self) -> f64 {
        (self.user_code_alphabet.len() as f64).log2() * self.user_code_length as f64
    }
}

/// One externally trusted issuer for the JWT-bearer grant.
#[derive(Debug, Clone)]
pub struct TrustedIssuer {
    pub issuer: String,
    /// Direct key material; when empty the `jwks_uri` is fetched.
    pub jwks: Option<serde_json::Value>,
    pub jwks_uri: Option<Url>,
    /// Allowed signing algorithms for assertions from this issuer.
    pub allowed_algorithms: Vec<String>,
    /// Subjects this issuer may assert; empty means any.
    pub allowed_subjects: Vec<String>,
}

/// Assertion validation options (client assertions and JWT-bearer grants).
#[derive(Debug, Clone)]
pub struct AssertionOptions {
    pub trusted_issuers: Vec<TrustedIssuer>,
    pub clock_skew: Duration,
    pub require_jti: bool,
    pub jwks_cache_duration: Duration,
    /// Upper bound applied before any JWT parsing.
    pub max_jwt_size: usize,
    pub strict_audience: bool,
    pub max_jwt_age: Duration,
    /// Acceptable `typ` header values; empty accepts the JWT defaults.
    pub allowed_types: Vec<String>,
}

impl Default for AssertionOptions {
    fn default() -> Self {
        Self {
            trusted_issuers: Vec::new(),
            clock_skew: Duration::from_secs(300),
            require_jti: true,
            jwks_cache_duration: Duration::from_secs(3600),
            max_jwt_size: 8 * 1024,
            strict_audience: true,
            max_jwt_age: Duration::from_secs(600),
            allowed_types: Vec::new(),
        }
    }
}

/// Session cookie surface for the check-session iframe contract.
#[derive(Debug, Clone)]
pub struct SessionCookieOptions {
    pub name: String,
    pub domain: Option<String>,
    pub path: String,
    pub same_site: String,
}

impl Default for SessionCookieOptions {
    fn default() -> Self {
        Self {
            name: "Abblix.SessionId".into(),
            domain: None,
            path: "/".into(),
            same_site: "None".into(),
        }
    }
}

/// Authorization endpoint options.
#[derive(Debug, Clone)]
pub struct AuthorizationOptions {
    /// Ceiling for client-configured code lifetimes.
    pub authorization_code_expires_in: Duration,
    /// TTL of pushed and interaction-suspended requests.
    pub pushed_request_expires_in: Duration,
    /// Name of the parameter appended to interaction redirects.
    pub request_uri_parameter_name: String,
    /// Whether `request_uri` references to remote objects are accepted.
    pub request_uri_parameter_supported: bool,
    /// Whether inline `request` objects are accepted.
    pub request_parameter_supported: bool,
}

impl Default for AuthorizationOptions {
    fn default() -> Self {
        Self {
            authorization_code_expires_in: Duration::from_secs(60),
            pushed_request_expires_in: Duration::from_secs(60),
            request_uri_parameter_name: "request_uri".into(),
            request_uri_parameter_supported: true,
            request_parameter_supported: true,
        }
    }
}

/// Refresh token issuance defaults applied when a client carries none.
#[derive(Debug, Clone)]
pub struct RefreshTokenOptions {
    pub absolute_expiry: Duration,
    pub sliding_expiry: Option<Duration>,
    pub allow_reuse: bool,
}

impl Default for RefreshTokenOptions {
    fn default() -> Self {
        Self {
            absolute_expiry: Duration::from_secs(30 * 24 * 3600),
            sliding_expiry: None,
            allow_reuse: false,
        }
    }
}

/// The aggregate configuration handed to the endpoint pipelines.
#[derive(Debug, Clone)]
pub struct OidcOptions {
    pub paths: EndpointPaths,
    pub discovery: DiscoveryOptions,
    pub ciba: CibaOptions,
    pub device: DeviceFlowOptions,
    pub refresh_tokens: RefreshTokenOptions,
    pub assertions: AssertionOptions,
    pub session_cookie: SessionCookieOptions,
    pub authorization: AuthorizationOptions,
    /// JWS algorithms this deployment signs and accepts.
    pub supported_signing_algorithms: Vec<String>,
    /// Scopes advertised in discovery.
    pub supported_scopes: Vec<String>,
    /// Salt mixed into pairwise subject derivation and session-state hashes.
    pub pairwise_salt: String,
}

impl Default for OidcOptions {
    fn default() -> Self {
        Self {
            paths: EndpointPaths::default(),
            discovery: DiscoveryOptions::default(),
            ciba: CibaOptions::default(),
            device: DeviceFlowOptions::default(),
            refresh_tokens: RefreshTokenOptions::default(),
            assertions: AssertionOptions::default(),
            session_cookie: SessionCookieOptions::default(),
            authorization: AuthorizationOptions::default(),
            supported_signing_algorithms: vec![
                "RS256".into(),
                "RS384".into(),
                "RS512".into(),
                "PS256".into(),
                "PS384".into(),
                "PS512".into(),
                "ES256".into(),
                "ES384".into(),
                "ES512".into(),
                "HS256".into(),
                "HS384".into(),
                "HS512".into(),
            ],
            supported_scopes: vec![
                "openid".into(),
                "profile".into(),
                "email".into(),
                "offline_access".into(),
            ],
            pairwise_salt: String::new(),
        }
    }
}

impl OidcOptions {
    /// Fail-fast startup validation.
    ///
    /// # Errors
    ///
    /// `server_error` describing the first misconfiguration found.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.device.verification_uri.scheme() != "https" {
            return Err(ProtocolError::server_error(
                "device verification_uri must use https",
            ));
        }
        if self.device.user_code_entropy_bits() < 20.0 {
            return Err(ProtocolError::server_error(format!(
                "user_code space of {} bits is guessable; lengthen the code or alphabet",
                self.device.user_code_entropy_bits() as u64
            )));
        }
        if self.device.device_code_entropy_bytes < 16 {
            return Err(ProtocolError::server_error(
                "device_code entropy below 128 bits",
            ));
        }
        if self.ciba.request_id_entropy_bytes < 16 {
            return Err(ProtocolError::server_error(
                "auth_req_id entropy below 128 bits",
            ));
        }
        if self.pairwise_salt.is_empty() {
            return Err(ProtocolError::server_error(
                "pairwise_salt must be configured",
            ));
        }
        Ok(())
    }
}
