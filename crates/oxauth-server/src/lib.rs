//! # oxauth-server
//!
//! Endpoint pipelines, protocol engines and client authentication for the
//! oxauth OpenID Connect / OAuth 2.x authorization server core.
//!
//! The host application supplies the HTTP adapter, the interaction UI and
//! persistence through the `oxauth-core` traits; this crate supplies the
//! protocol machinery:
//!
//! - `context` - [`context::ServerContext`], the wiring point
//! - `authorize` - authorization endpoint pipeline (validate / interact / issue)
//! - `par` - pushed authorization requests
//! - `token_endpoint` - grant dispatch and the shared processor
//! - `ciba` - backchannel authentication engine
//! - `device` - device authorization grant engine
//! - `revocation`, `introspection` - RFC 7009 / RFC 7662
//! - `endsession`, `session` - logout fanout and the check-session contract
//! - `registration` - RFC 7591 / 7592 dynamic client management
//! - `discovery` - provider metadata and JWKS publication
//! - `userinfo` - the claims endpoint
//! - `client_auth` - the eight-way client authenticator
//! - `catalogue` - client lookup and key resolution
//! - `ssrf` - the policy-enforcing outbound HTTP fetcher
//!
//! Every handler follows the same two-step contract: validate the raw
//! request into a typed `Valid*` value, then process it. Failures are
//! [`oxauth_core::error::ProtocolError`] values throughout.

pub mod authorize;
pub mod catalogue;
pub mod ciba;
pub mod client_auth;
pub mod context;
pub mod device;
pub mod discovery;
pub mod endsession;
pub mod introspection;
pub mod issuance;
pub mod messages;
pub mod pairwise;
pub mod par;
pub mod registration;
pub mod revocation;
pub mod session;
pub mod ssrf;
pub mod token_endpoint;
pub mod userinfo;

pub use authorize::{AuthorizationHandler, AuthorizationResult};
pub use authorize::response::Delivery;
pub use catalogue::{ClientCatalogue, ClientKeyResolver};
pub use ciba::{BackchannelAuthHandler, CibaOutcome};
pub use client_auth::{ClientAuthEvidence, ClientAuthenticator, PeerCertificate};
pub use context::ServerContext;
pub use device::{DeviceAuthorizationHandler, DeviceDecision};
pub use endsession::EndSessionHandler;
pub use introspection::IntrospectionHandler;
pub use par::PushedAuthorizationHandler;
pub use registration::RegistrationHandler;
pub use revocation::RevocationHandler;
pub use ssrf::{SafeHttpFetcher, SsrfPolicy};
pub use token_endpoint::TokenHandler;
pub use userinfo::{UserinfoHandler, UserinfoResponse};
