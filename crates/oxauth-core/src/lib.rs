//! # oxauth-core
//!
//! Protocol types, error model, configuration and capability traits for the
//! oxauth OpenID Connect / OAuth 2.x authorization server core.
//!
//! This crate holds everything the other oxauth crates agree on:
//!
//! - `error` - the typed protocol error envelope and storage error kinds
//! - `client` - the registered client model and its invariants
//! - `params` - raw authorization parameters, response types, flows, grants
//! - `claims` - the two-bucket `claims` request parameter
//! - `records` - runtime records owned by the storage layer
//! - `config` - the option surface with fail-fast validation
//! - `collaborators` - traits the host injects (sessions, interaction, users)
//! - `storage` - storage and registry capability traits
//! - `memory` - in-memory reference implementations
//! - `random` - randomness helpers for codes and handles
//!
//! No module here performs I/O of its own beyond the in-memory stores;
//! signing lives in `oxauth-jose` and the endpoint pipelines in
//! `oxauth-server`.

pub mod claims;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod memory;
pub mod params;
pub mod random;
pub mod records;
pub mod storage;

pub use claims::{ClaimRule, RequestedClaims};
pub use client::{
    BackchannelTokenDeliveryMode, ClientInfo, ClientSecret, ClientType, PkcePolicy,
    RefreshTokenPolicy, SubjectType, TokenEndpointAuthMethod,
};
pub use collaborators::{
    Approval, AuthSessionService, ClientInfoManager, ClientInfoProvider, InteractionOutcome,
    IssuerProvider, StaticIssuer, UserInfoProvider, UserInteraction,
};
pub use config::OidcOptions;
pub use error::{ErrorCode, ProtocolError, StorageError};
pub use params::{AuthorizationParameters, Flow, GrantType, ResponseMode, ResponseTypeSet};
pub use records::{
    AuthSession, AuthorizationContext, CibaRequest, CibaStatus, DeviceGrant, DeviceGrantStatus,
    PendingAuthorization, RegisteredClientHandle, TokenRecord, TokenStatus,
};
pub use storage::{
    AuthorizationContextStore, CibaStore, DeviceGrantStore, PushedRequestStore, RateCounterStore,
    RegistrationHandleStore, TokenRegistry,
};
